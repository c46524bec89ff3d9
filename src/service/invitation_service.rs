// service/invitation_service.rs
use std::sync::Arc;

use uuid::Uuid;

use crate::{
    db::Store,
    models::jobmodel::Invitation,
    service::{
        error::ServiceError,
        job_service::{validate_reason, JobEvent, JobService, JobSnapshot},
    },
};

/// Direct-hire invitations. Resolution goes through the job state machine so
/// the invitation, job and escrow change in one write.
#[derive(Debug, Clone)]
pub struct InvitationService {
    db_client: Arc<dyn Store>,
    job_service: Arc<JobService>,
}

impl InvitationService {
    pub fn new(db_client: Arc<dyn Store>, job_service: Arc<JobService>) -> Self {
        Self {
            db_client,
            job_service,
        }
    }

    /// Looks up an invitation, optionally checking it belongs to `job_id`.
    pub async fn get_invitation(
        &self,
        invitation_id: Uuid,
        job_id: Option<Uuid>,
    ) -> Result<Invitation, ServiceError> {
        let invitation = self
            .db_client
            .get_invitation_by_id(invitation_id)
            .await?
            .filter(|inv| job_id.map_or(true, |job_id| inv.job_id == job_id))
            .ok_or(ServiceError::InvitationNotFound(invitation_id))?;

        Ok(invitation)
    }

    pub async fn accept(&self, invitation_id: Uuid, actor: Uuid) -> Result<JobSnapshot, ServiceError> {
        let invitation = self.get_invitation(invitation_id, None).await?;

        let snapshot = self
            .job_service
            .apply(invitation.job_id, actor, JobEvent::AcceptInvitation { invitation_id })
            .await?;

        tracing::info!(
            invitation_id = %invitation_id,
            job_id = %invitation.job_id,
            worker_id = %actor,
            "Invitation accepted"
        );
        Ok(snapshot)
    }

    /// Declines the invitation and refunds the held downpayment to the client.
    pub async fn reject(
        &self,
        invitation_id: Uuid,
        actor: Uuid,
        reason: &str,
    ) -> Result<JobSnapshot, ServiceError> {
        validate_reason(reason)?;
        let invitation = self.get_invitation(invitation_id, None).await?;

        let snapshot = self
            .job_service
            .apply(
                invitation.job_id,
                actor,
                JobEvent::RejectInvitation {
                    invitation_id,
                    reason: reason.to_string(),
                },
            )
            .await?;

        tracing::info!(
            invitation_id = %invitation_id,
            job_id = %invitation.job_id,
            worker_id = %actor,
            "Invitation rejected"
        );
        Ok(snapshot)
    }
}
