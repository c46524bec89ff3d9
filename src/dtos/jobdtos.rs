use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    models::{
        escrowmodel::{EscrowMovement, EscrowTransaction},
        jobmodel::JobType,
    },
    utils::currency::format_centavos,
};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateJobDto {
    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    pub title: String,

    /// Budget in pesos.
    #[validate(range(min = 1.0, max = 10000000000.0, message = "Budget must be between ₱1.00 and ₱10,000,000,000.00"))]
    pub budget: f64,

    pub job_type: JobType,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct HireDirectlyDto {
    pub worker_id: Uuid,

    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    pub title: String,

    #[validate(range(min = 1.0, max = 10000000000.0, message = "Budget must be between ₱1.00 and ₱10,000,000,000.00"))]
    pub budget: f64,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct AcceptWorkerDto {
    pub worker_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RejectInvitationDto {
    #[validate(length(min = 20, max = 1000, message = "Reason must be between 20 and 1000 characters"))]
    pub reason: String,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct CancelJobDto {
    #[validate(length(max = 1000, message = "Reason cannot exceed 1000 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DisputeJobDto {
    #[validate(length(min = 20, max = 1000, message = "Reason must be between 20 and 1000 characters"))]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateReviewDto {
    #[validate(range(min = 1, max = 5, message = "Rating must be between 1 and 5"))]
    pub rating: i32,

    #[validate(length(max = 2000, message = "Review cannot exceed 2000 characters"))]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: &str, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            data: Some(data),
        }
    }
}

/// Escrow record with display amounts and the movement journal.
#[derive(Debug, Serialize)]
pub struct EscrowResponseDto {
    pub escrow: Option<EscrowTransaction>,
    pub downpayment_display: Option<String>,
    pub remaining_display: Option<String>,
    pub movements: Vec<EscrowMovement>,
}

impl EscrowResponseDto {
    pub fn new(escrow: Option<EscrowTransaction>, movements: Vec<EscrowMovement>) -> Self {
        Self {
            downpayment_display: escrow.as_ref().map(|e| format_centavos(e.downpayment_amount)),
            remaining_display: escrow.as_ref().map(|e| format_centavos(e.remaining_amount)),
            escrow,
            movements,
        }
    }
}
