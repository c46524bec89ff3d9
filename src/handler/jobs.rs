// handler/jobs.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::jobdtos::*,
    error::HttpError,
    middleware::JWTAuthMiddeware,
    utils::currency::peso_to_centavos,
    AppState,
};

pub fn jobs_handler() -> Router {
    Router::new()
        .route("/", post(create_job))
        .route("/hire", post(hire_directly))
        .route("/:job_id", get(get_job))
        .route("/:job_id/publish", post(publish_job))
        .route("/:job_id/accept-worker", post(accept_worker))
        .route("/:job_id/invitations/:invitation_id/accept", post(accept_invitation))
        .route("/:job_id/invitations/:invitation_id/reject", post(reject_invitation))
        .route("/:job_id/mark-complete", post(mark_complete))
        .route("/:job_id/approve-completion", post(approve_completion))
        .route("/:job_id/cancel", post(cancel_job))
        .route("/:job_id/dispute", post(dispute_job))
        .route("/:job_id/review", post(submit_review))
        .route("/:job_id/escrow", get(get_job_escrow))
}

pub fn reviews_handler() -> Router {
    Router::new().route("/pending", get(get_pending_review))
}

pub async fn create_job(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<CreateJobDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let job = app_state
        .job_service
        .create_job(auth.account.id, &body.title, peso_to_centavos(body.budget), body.job_type)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Job created", job)),
    ))
}

pub async fn hire_directly(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<HireDirectlyDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let snapshot = app_state
        .job_service
        .hire_directly(
            auth.account.id,
            body.worker_id,
            &body.title,
            peso_to_centavos(body.budget),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Invitation sent and downpayment held", snapshot)),
    ))
}

pub async fn get_job(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let snapshot = app_state.job_service.get_job(job_id, auth.account.id).await?;
    Ok(Json(ApiResponse::success("Job retrieved", snapshot)))
}

pub async fn publish_job(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let snapshot = app_state.job_service.publish(job_id, auth.account.id).await?;
    Ok(Json(ApiResponse::success("Job published", snapshot)))
}

pub async fn accept_worker(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<AcceptWorkerDto>,
) -> Result<impl IntoResponse, HttpError> {
    let snapshot = app_state
        .job_service
        .accept_worker(job_id, auth.account.id, body.worker_id)
        .await?;

    Ok(Json(ApiResponse::success("Worker hired", snapshot)))
}

pub async fn accept_invitation(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path((job_id, invitation_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, HttpError> {
    app_state
        .invitation_service
        .get_invitation(invitation_id, Some(job_id))
        .await?;

    let snapshot = app_state
        .invitation_service
        .accept(invitation_id, auth.account.id)
        .await?;

    Ok(Json(ApiResponse::success("Invitation accepted", snapshot)))
}

pub async fn reject_invitation(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path((job_id, invitation_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<RejectInvitationDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    app_state
        .invitation_service
        .get_invitation(invitation_id, Some(job_id))
        .await?;

    let snapshot = app_state
        .invitation_service
        .reject(invitation_id, auth.account.id, &body.reason)
        .await?;

    Ok(Json(ApiResponse::success("Invitation rejected", snapshot)))
}

pub async fn mark_complete(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let snapshot = app_state
        .job_service
        .mark_complete(job_id, auth.account.id)
        .await?;

    Ok(Json(ApiResponse::success("Completion recorded", snapshot)))
}

pub async fn approve_completion(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let snapshot = app_state
        .job_service
        .approve_completion(job_id, auth.account.id)
        .await?;

    Ok(Json(ApiResponse::success("Completion approved", snapshot)))
}

pub async fn cancel_job(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
    body: Option<Json<CancelJobDto>>,
) -> Result<impl IntoResponse, HttpError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let snapshot = app_state
        .job_service
        .cancel(job_id, auth.account.id, body.reason)
        .await?;

    Ok(Json(ApiResponse::success("Job cancelled", snapshot)))
}

pub async fn dispute_job(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<DisputeJobDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let snapshot = app_state
        .job_service
        .dispute(job_id, auth.account.id, body.reason)
        .await?;

    Ok(Json(ApiResponse::success("Dispute recorded, job cancelled", snapshot)))
}

pub async fn submit_review(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<CreateReviewDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let review = app_state
        .review_service
        .submit(job_id, auth.account.id, body.rating, body.message)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Review submitted", review)),
    ))
}

pub async fn get_job_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let snapshot = app_state.job_service.get_job(job_id, auth.account.id).await?;
    let movements = app_state.escrow_service.get_movements(job_id).await?;

    Ok(Json(ApiResponse::success(
        "Escrow retrieved",
        EscrowResponseDto::new(snapshot.escrow, movements),
    )))
}

pub async fn get_pending_review(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
) -> Result<impl IntoResponse, HttpError> {
    let pending = app_state
        .review_service
        .compute_pending_review(auth.account.id)
        .await?;

    Ok(Json(ApiResponse::success("Pending review computed", pending)))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::{routes::create_router, test_support::TestApp};

    use super::*;

    async fn call(app: &TestApp, method: Method, uri: &str, token: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token));
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = create_router(app.state.clone())
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn invitation_flow_over_http() {
        let app = TestApp::new();
        let (_, client_token) = app.account("Carla Client");
        let (worker, worker_token) = app.account("Wendell Worker");

        let (status, body) = call(
            &app,
            Method::POST,
            "/jobs/hire",
            &client_token,
            Some(json!({ "worker_id": worker, "title": "Fix faucet", "budget": 1000.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["job"]["status"], "INVITE_PENDING");
        assert_eq!(body["data"]["escrow"]["downpayment_amount"], 50_000);
        let job_id = body["data"]["job"]["id"].as_str().unwrap().to_string();
        let invitation_id = body["data"]["invitation"]["id"].as_str().unwrap().to_string();

        let reject_uri = format!("/jobs/{}/invitations/{}/reject", job_id, invitation_id);
        let (status, _) = call(&app, Method::POST, &reject_uri, &worker_token, Some(json!({ "reason": "too short" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let accept_uri = format!("/jobs/{}/invitations/{}/accept", job_id, invitation_id);
        let (status, body) = call(&app, Method::POST, &accept_uri, &worker_token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["job"]["status"], "IN_PROGRESS");

        let (status, body) = call(&app, Method::POST, &accept_uri, &worker_token, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "fail");

        let review_uri = format!("/jobs/{}/review", job_id);
        let (status, _) = call(&app, Method::POST, &review_uri, &client_token, Some(json!({ "rating": 5 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, Method::POST, &format!("/jobs/{}/mark-complete", job_id), &worker_token, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::POST, &format!("/jobs/{}/approve-completion", job_id), &client_token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["job"]["status"], "COMPLETED");

        let (_, body) = call(&app, Method::GET, "/reviews/pending", &client_token, None).await;
        assert_eq!(body["data"]["job_id"], job_id.as_str());

        let (status, _) = call(&app, Method::POST, &review_uri, &client_token, Some(json!({ "rating": 5, "message": "Quick and tidy" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, Method::POST, &review_uri, &client_token, Some(json!({ "rating": 4 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&app, Method::GET, &format!("/jobs/{}/escrow", job_id), &client_token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["escrow"]["remaining_state"], "PAID");
        assert_eq!(body["data"]["remaining_display"], "₱500.00");
    }

    #[tokio::test]
    async fn oversized_budgets_are_rejected_before_any_money_moves() {
        let app = TestApp::new();
        let (_, client_token) = app.account("Carla Client");
        let (worker, _) = app.account("Wendell Worker");

        let (status, _) = call(
            &app,
            Method::POST,
            "/jobs",
            &client_token,
            Some(json!({ "title": "Build a mall", "budget": 1e17, "job_type": "LISTING" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::POST,
            "/jobs/hire",
            &client_token,
            Some(json!({ "worker_id": worker, "title": "Build a mall", "budget": 1e17 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requests_without_a_token_are_rejected() {
        let app = TestApp::new();
        let response = create_router(app.state.clone())
            .oneshot(Request::builder().uri("/reviews/pending").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn conversations_can_be_filtered_and_archived() {
        let app = TestApp::new();
        let (_, client_token) = app.account("Carla Client");
        let (worker, worker_token) = app.account("Wendell Worker");

        let (_, body) = call(
            &app,
            Method::POST,
            "/jobs/hire",
            &client_token,
            Some(json!({ "worker_id": worker, "title": "Trim hedge", "budget": 800.0 })),
        )
        .await;
        assert_eq!(body["data"]["escrow"]["downpayment_amount"], 40_000);

        let (status, body) = call(&app, Method::GET, "/conversations?filter=unread", &worker_token, None).await;
        assert_eq!(status, StatusCode::OK);
        let conversations = body["data"].as_array().unwrap();
        assert_eq!(conversations.len(), 1);
        let conversation_id = conversations[0]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/conversations/{}/toggle-archive", conversation_id),
            &worker_token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["archived"], true);

        let (_, body) = call(&app, Method::GET, "/conversations?filter=all", &worker_token, None).await;
        assert!(body["data"].as_array().unwrap().is_empty());
        let (_, body) = call(&app, Method::GET, "/conversations", &client_token, None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/conversations/{}/messages?after=0", conversation_id),
            &client_token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["message_type"], "SYSTEM");

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/conversations/{}/messages", conversation_id),
            &app.account("Nosy Neighbor").1,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
