// routes.rs
use std::sync::Arc;

use axum::{middleware, routing::get, Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::{
        chat::chat_handler,
        jobs::{jobs_handler, reviews_handler},
        ws::ws_handler,
    },
    middleware::auth,
    AppState,
};

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running"
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_route = Router::new()
        .nest("/jobs", jobs_handler())
        .nest("/reviews", reviews_handler())
        .nest("/conversations", chat_handler())
        .nest("/ws", ws_handler())
        .layer(middleware::from_fn(auth))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app_state));

    Router::new()
        .route("/health", get(health_check))
        .merge(api_route)
}
