// models/escrowmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "downpayment_state", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownpaymentState {
    Held,
    Released,
    Refunded,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "remaining_state", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemainingState {
    Unpaid,
    Paid,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "movement_kind", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Capture,
    Release,
    Refund,
    RemainingPayment,
}

impl MovementKind {
    pub fn to_str(&self) -> &str {
        match self {
            MovementKind::Capture => "capture",
            MovementKind::Release => "release",
            MovementKind::Refund => "refund",
            MovementKind::RemainingPayment => "remaining_payment",
        }
    }
}

/// Escrow record for one job. Amounts are centavos and always sum to the budget.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct EscrowTransaction {
    pub job_id: Uuid,
    pub budget: i64,
    pub downpayment_amount: i64,
    pub remaining_amount: i64,
    pub downpayment_state: DownpaymentState,
    pub remaining_state: RemainingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One real money movement, journaled in the same write as the state change
/// that caused it and later pushed to the payment gateway.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct EscrowMovement {
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: MovementKind,
    pub amount: i64,
    pub idempotency_key: String,
    pub gateway_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl EscrowMovement {
    pub fn new(job_id: Uuid, kind: MovementKind, amount: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            kind,
            amount,
            idempotency_key: format!("{}:{}", job_id, kind.to_str()),
            gateway_reference: None,
            created_at: Utc::now(),
            settled_at: None,
        }
    }
}
