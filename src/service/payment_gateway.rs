// service/payment_gateway.rs
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    models::escrowmodel::EscrowMovement,
    service::error::ServiceError,
};

/// External money-moving capability. Implementations must treat
/// `movement.idempotency_key` as the deduplication key so that a retried
/// settlement never moves money twice.
#[async_trait]
pub trait PaymentGateway: std::fmt::Debug + Send + Sync {
    /// Returns the gateway's reference for the executed movement.
    async fn execute(&self, movement: &EscrowMovement) -> Result<String, ServiceError>;
}

/// Records movements without talking to a provider. Used when no gateway is configured.
#[derive(Debug, Default)]
pub struct LedgerOnlyGateway;

#[async_trait]
impl PaymentGateway for LedgerOnlyGateway {
    async fn execute(&self, movement: &EscrowMovement) -> Result<String, ServiceError> {
        tracing::info!(
            job_id = %movement.job_id,
            kind = movement.kind.to_str(),
            amount = movement.amount,
            "Ledger-only settlement"
        );
        Ok(format!("ledger:{}", movement.idempotency_key))
    }
}

#[derive(Debug, Serialize)]
struct MovementRequest<'a> {
    job_id: String,
    kind: &'a str,
    amount: i64,
    currency: &'a str,
    reference: &'a str,
}

#[derive(Debug, Deserialize)]
struct MovementResponse {
    status: bool,
    message: Option<String>,
    data: Option<MovementResponseData>,
}

#[derive(Debug, Deserialize)]
struct MovementResponseData {
    reference: String,
}

#[derive(Debug)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpPaymentGateway {
    /// `timeout` bounds each provider call end to end.
    pub fn new(base_url: String, secret_key: String, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Gateway(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn execute(&self, movement: &EscrowMovement) -> Result<String, ServiceError> {
        let payload = MovementRequest {
            job_id: movement.job_id.to_string(),
            kind: movement.kind.to_str(),
            amount: movement.amount,
            currency: "PHP",
            reference: &movement.idempotency_key,
        };

        let response = self
            .client
            .post(format!("{}/escrow/movements", self.base_url))
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .header("Idempotency-Key", &movement.idempotency_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServiceError::Gateway(e.to_string()))?;

        let body: MovementResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Gateway(e.to_string()))?;

        match (body.status, body.data) {
            (true, Some(data)) => Ok(data.reference),
            _ => Err(ServiceError::Gateway(
                body.message.unwrap_or_else(|| "Escrow movement was not accepted".to_string()),
            )),
        }
    }
}

/// Picks the gateway from configuration.
pub fn gateway_from_config(config: &Config) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
    match &config.payment_gateway_url {
        Some(url) => Ok(Arc::new(HttpPaymentGateway::new(
            url.clone(),
            config.payment_gateway_secret.clone(),
            Duration::from_secs(config.payment_gateway_timeout_secs.max(1)),
        )?)),
        None => Ok(Arc::new(LedgerOnlyGateway)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::escrowmodel::MovementKind;
    use axum::{routing::post, Json, Router};
    use serde_json::json;
    use uuid::Uuid;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn movement() -> EscrowMovement {
        EscrowMovement::new(Uuid::new_v4(), MovementKind::Capture, 50_000)
    }

    #[tokio::test]
    async fn accepted_movement_returns_provider_reference() {
        let app = Router::new().route(
            "/escrow/movements",
            post(|| async { Json(json!({ "status": true, "data": { "reference": "psp-1" } })) }),
        );
        let gateway =
            HttpPaymentGateway::new(serve(app).await, "sk".to_string(), Duration::from_secs(5)).unwrap();

        assert_eq!(gateway.execute(&movement()).await.unwrap(), "psp-1");
    }

    #[tokio::test]
    async fn unresponsive_provider_times_out() {
        let app = Router::new().route(
            "/escrow/movements",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({ "status": true }))
            }),
        );
        let gateway = HttpPaymentGateway::new(
            serve(app).await,
            "sk".to_string(),
            Duration::from_millis(200),
        )
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), gateway.execute(&movement()))
            .await
            .expect("gateway call should be bounded by its own timeout");
        assert!(matches!(result, Err(ServiceError::Gateway(_))));
    }
}
