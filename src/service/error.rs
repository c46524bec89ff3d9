use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    db::StoreError,
    error::{ErrorMessage, HttpError},
    models::jobmodel::{JobStatus, PartyRole},
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job {job_id} cannot handle '{event}' while {status:?}")]
    InvalidTransition {
        job_id: Uuid,
        status: JobStatus,
        event: &'static str,
    },

    #[error("Invitation {0} has already been resolved")]
    AlreadyResolved(Uuid),

    #[error("A {1:?} review for job {0} already exists")]
    DuplicateReview(Uuid, PartyRole),

    #[error("Job {0} is not completed")]
    JobNotComplete(Uuid),

    #[error("Escrow for job {job_id} is inconsistent: {detail}")]
    EscrowInconsistent { job_id: Uuid, detail: String },

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Invitation {0} not found")]
    InvitationNotFound(Uuid),

    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("Account {0} is not a participant of {1}")]
    NotParticipant(Uuid, Uuid),

    #[error("Job {0} kept changing underneath the update, try again")]
    Contention(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Payment gateway error: {0}")]
    Gateway(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,

            ServiceError::InvalidTransition { .. }
            | ServiceError::AlreadyResolved(_)
            | ServiceError::DuplicateReview(_, _)
            | ServiceError::JobNotComplete(_)
            | ServiceError::Contention(_) => StatusCode::CONFLICT,

            ServiceError::JobNotFound(_)
            | ServiceError::InvitationNotFound(_)
            | ServiceError::ConversationNotFound(_) => StatusCode::NOT_FOUND,

            ServiceError::NotParticipant(_, _) => StatusCode::FORBIDDEN,

            ServiceError::EscrowInconsistent { .. }
            | ServiceError::Store(_)
            | ServiceError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        if status.is_server_error() {
            // Ledger and storage internals stay in the logs.
            tracing::error!(error = %error, "Request failed with an internal error");
            return HttpError::new(ErrorMessage::InternalError.to_string(), status);
        }

        HttpError::new(error.to_string(), status)
    }
}
