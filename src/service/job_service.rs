// service/job_service.rs
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{JobChange, Store, StoreError},
    models::{
        escrowmodel::{DownpaymentState, EscrowTransaction},
        jobmodel::*,
    },
    service::{
        chat_service::ChatService,
        error::ServiceError,
        escrow_service::{EscrowService, LedgerStep, MAX_BUDGET},
        review_service::PendingReviewCache,
    },
    utils::currency::format_centavos,
};

/// Bounded re-read and re-plan attempts when another writer bumped the job version.
const MAX_CAS_ATTEMPTS: usize = 5;
pub const MIN_REASON_LEN: usize = 20;
const MAX_TITLE_LEN: usize = 200;

/// Job, escrow and invitation as of one job version.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSnapshot {
    pub job: Job,
    pub escrow: Option<EscrowTransaction>,
    pub invitation: Option<Invitation>,
}

/// Lifecycle events. Each one is planned against a fresh snapshot and
/// committed as a single versioned write.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Publish,
    Invite { worker_id: Uuid },
    AcceptWorker { worker_id: Uuid },
    AcceptInvitation { invitation_id: Uuid },
    RejectInvitation { invitation_id: Uuid, reason: String },
    MarkComplete { expected_role: Option<PartyRole> },
    Cancel { reason: Option<String> },
    Dispute { reason: String },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Publish => "publish",
            JobEvent::Invite { .. } => "invite",
            JobEvent::AcceptWorker { .. } => "accept_worker",
            JobEvent::AcceptInvitation { .. } => "accept_invitation",
            JobEvent::RejectInvitation { .. } => "reject_invitation",
            JobEvent::MarkComplete { .. } => "mark_complete",
            JobEvent::Cancel { .. } => "cancel",
            JobEvent::Dispute { .. } => "dispute",
        }
    }
}

#[derive(Debug)]
enum Plan {
    Commit {
        change: JobChange,
        notice: Option<String>,
    },
    Unchanged,
}

/// Change under construction for one event.
struct Draft {
    job: Job,
    escrow: Option<EscrowTransaction>,
    steps: Vec<LedgerStep>,
    invitation: Option<Invitation>,
}

impl Draft {
    fn start(snapshot: &JobSnapshot) -> Self {
        Self {
            job: snapshot.job.clone(),
            escrow: snapshot.escrow.clone(),
            steps: Vec::new(),
            invitation: None,
        }
    }

    fn ledger(&mut self, step: LedgerStep) -> bool {
        let moved = !step.is_noop();
        self.escrow = Some(step.escrow.clone());
        self.steps.push(step);
        moved
    }

    fn into_plan(self, expected_version: i64, notice: Option<String>) -> Plan {
        let escrow_changed = self.steps.iter().any(|s| !s.is_noop());
        let movements = self
            .steps
            .into_iter()
            .filter_map(|s| s.movement)
            .collect();

        Plan::Commit {
            change: JobChange {
                expected_version,
                job: self.job,
                escrow: if escrow_changed { self.escrow } else { None },
                movements,
                invitation: self.invitation,
            },
            notice,
        }
    }
}

/// The Job State Machine.
#[derive(Debug, Clone)]
pub struct JobService {
    db_client: Arc<dyn Store>,
    escrow_service: Arc<EscrowService>,
    chat_service: Arc<ChatService>,
    pending_reviews: Arc<PendingReviewCache>,
}

impl JobService {
    pub fn new(
        db_client: Arc<dyn Store>,
        escrow_service: Arc<EscrowService>,
        chat_service: Arc<ChatService>,
        pending_reviews: Arc<PendingReviewCache>,
    ) -> Self {
        Self {
            db_client,
            escrow_service,
            chat_service,
            pending_reviews,
        }
    }

    pub async fn create_job(
        &self,
        client_id: Uuid,
        title: &str,
        budget: i64,
        job_type: JobType,
    ) -> Result<Job, ServiceError> {
        let title = title.trim();
        if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
            return Err(ServiceError::Validation(format!(
                "Title must be between 1 and {} characters",
                MAX_TITLE_LEN
            )));
        }
        if budget > MAX_BUDGET {
            return Err(ServiceError::Validation(format!(
                "Budget cannot exceed {}",
                format_centavos(MAX_BUDGET)
            )));
        }
        if budget <= 0 || self.escrow_service.downpayment_for(budget) <= 0 {
            return Err(ServiceError::Validation(
                "Budget is too small to hold a downpayment".to_string(),
            ));
        }

        let job = self
            .db_client
            .create_job(&Job::new_draft(client_id, title.to_string(), budget, job_type))
            .await?;

        tracing::info!(job_id = %job.id, client_id = %client_id, budget, "Job drafted");
        Ok(job)
    }

    pub async fn publish(&self, job_id: Uuid, actor: Uuid) -> Result<JobSnapshot, ServiceError> {
        self.apply(job_id, actor, JobEvent::Publish).await
    }

    /// Creates an INVITE job addressed to one worker and captures the downpayment.
    pub async fn hire_directly(
        &self,
        client_id: Uuid,
        worker_id: Uuid,
        title: &str,
        budget: i64,
    ) -> Result<JobSnapshot, ServiceError> {
        if worker_id == client_id {
            return Err(ServiceError::Validation("You cannot hire yourself".to_string()));
        }

        let job = self.create_job(client_id, title, budget, JobType::Invite).await?;
        self.apply(job.id, client_id, JobEvent::Invite { worker_id }).await
    }

    pub async fn accept_worker(
        &self,
        job_id: Uuid,
        actor: Uuid,
        worker_id: Uuid,
    ) -> Result<JobSnapshot, ServiceError> {
        self.apply(job_id, actor, JobEvent::AcceptWorker { worker_id }).await
    }

    /// Sets the caller's completion flag; the second flag completes the job.
    pub async fn mark_complete(&self, job_id: Uuid, actor: Uuid) -> Result<JobSnapshot, ServiceError> {
        self.apply(job_id, actor, JobEvent::MarkComplete { expected_role: None })
            .await
    }

    /// Client-side confirmation of completion.
    pub async fn approve_completion(&self, job_id: Uuid, actor: Uuid) -> Result<JobSnapshot, ServiceError> {
        self.apply(
            job_id,
            actor,
            JobEvent::MarkComplete {
                expected_role: Some(PartyRole::Client),
            },
        )
        .await
    }

    pub async fn cancel(
        &self,
        job_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<JobSnapshot, ServiceError> {
        self.apply(job_id, actor, JobEvent::Cancel { reason }).await
    }

    pub async fn dispute(&self, job_id: Uuid, actor: Uuid, reason: String) -> Result<JobSnapshot, ServiceError> {
        self.apply(job_id, actor, JobEvent::Dispute { reason }).await
    }

    pub async fn get_job(&self, job_id: Uuid, account_id: Uuid) -> Result<JobSnapshot, ServiceError> {
        let snapshot = self.load(job_id).await?;
        if snapshot.job.role_of(account_id).is_none() {
            return Err(ServiceError::NotParticipant(account_id, job_id));
        }
        Ok(snapshot)
    }

    async fn load(&self, job_id: Uuid) -> Result<JobSnapshot, ServiceError> {
        let job = self
            .db_client
            .get_job_by_id(job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))?;
        let escrow = self.db_client.get_escrow_by_job_id(job_id).await?;
        let invitation = self.db_client.get_invitation_by_job(job_id).await?;

        Ok(JobSnapshot { job, escrow, invitation })
    }

    /// Plans `event` against the current snapshot and commits it with a
    /// compare-and-set on the job version, re-planning after a lost race.
    pub async fn apply(&self, job_id: Uuid, actor: Uuid, event: JobEvent) -> Result<JobSnapshot, ServiceError> {
        validate_event(&event)?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let snapshot = self.load(job_id).await?;
            let from = snapshot.job.status;

            let (change, notice) = match self.plan(&snapshot, actor, &event)? {
                Plan::Unchanged => {
                    tracing::debug!(job_id = %job_id, event = event.name(), "Transition is a no-op");
                    return Ok(snapshot);
                }
                Plan::Commit { change, notice } => (change, notice),
            };

            let escrow = change.escrow.clone().or(snapshot.escrow);
            let invitation = change.invitation.clone().or(snapshot.invitation);

            match self.db_client.commit_transition(change).await {
                Ok(job) => {
                    tracing::info!(
                        job_id = %job.id,
                        event = event.name(),
                        from = from.to_str(),
                        to = job.status.to_str(),
                        version = job.version,
                        "Job transition committed"
                    );

                    let committed = JobSnapshot { job, escrow, invitation };
                    self.after_commit(&committed, notice).await;
                    return Ok(committed);
                }
                Err(StoreError::VersionConflict) => {
                    tracing::debug!(job_id = %job_id, attempt, event = event.name(), "Version conflict, re-planning");
                    continue;
                }
                Err(StoreError::Duplicate) => {
                    tracing::error!(job_id = %job_id, event = event.name(), "Escrow movement already journaled");
                    return Err(ServiceError::EscrowInconsistent {
                        job_id,
                        detail: "movement already journaled".to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(job_id = %job_id, event = event.name(), "Gave up after repeated version conflicts");
        Err(ServiceError::Contention(job_id))
    }

    fn plan(&self, snapshot: &JobSnapshot, actor: Uuid, event: &JobEvent) -> Result<Plan, ServiceError> {
        let job = &snapshot.job;
        let version = job.version;
        let invalid = || ServiceError::InvalidTransition {
            job_id: job.id,
            status: job.status,
            event: event.name(),
        };
        let mut draft = Draft::start(snapshot);

        match event {
            JobEvent::Publish => {
                require_role(job, actor, PartyRole::Client)?;
                if job.status != JobStatus::Draft || job.job_type != JobType::Listing {
                    return Err(invalid());
                }
                draft.job.status = JobStatus::Active;
                Ok(draft.into_plan(version, None))
            }

            JobEvent::Invite { worker_id } => {
                require_role(job, actor, PartyRole::Client)?;
                if job.status != JobStatus::Draft || job.job_type != JobType::Invite {
                    return Err(invalid());
                }
                let amount = self.escrow_service.downpayment_for(job.budget);
                draft.ledger(self.escrow_service.capture(
                    snapshot.escrow.as_ref(),
                    job.id,
                    job.budget,
                    amount,
                )?);
                draft.job.status = JobStatus::InvitePending;
                draft.job.worker_id = Some(*worker_id);
                draft.invitation = Some(Invitation::new(job, *worker_id));

                let notice = format!(
                    "A worker was invited to \"{}\". Downpayment of {} is held in escrow.",
                    job.title,
                    format_centavos(amount)
                );
                Ok(draft.into_plan(version, Some(notice)))
            }

            JobEvent::AcceptWorker { worker_id } => {
                require_role(job, actor, PartyRole::Client)?;
                if *worker_id == job.client_id {
                    return Err(ServiceError::Validation("You cannot hire yourself".to_string()));
                }
                if job.status != JobStatus::Active {
                    return Err(invalid());
                }
                let amount = self.escrow_service.downpayment_for(job.budget);
                let captured = self.escrow_service.capture(
                    snapshot.escrow.as_ref(),
                    job.id,
                    job.budget,
                    amount,
                )?;
                let released = self
                    .escrow_service
                    .release(Some(&captured.escrow), job.id, amount)?;
                draft.ledger(captured);
                draft.ledger(released);
                draft.job.status = JobStatus::InProgress;
                draft.job.worker_id = Some(*worker_id);

                let notice = format!(
                    "Worker hired. Downpayment of {} was released to the worker. The job is now in progress.",
                    format_centavos(amount)
                );
                Ok(draft.into_plan(version, Some(notice)))
            }

            JobEvent::AcceptInvitation { invitation_id } => {
                let invitation = pending_invitation(snapshot, *invitation_id)?;
                if invitation.worker_id != actor {
                    return Err(ServiceError::NotParticipant(actor, job.id));
                }
                if job.status != JobStatus::InvitePending {
                    return Err(invalid());
                }
                let escrow = snapshot.escrow.as_ref();
                let amount = escrow.map(|e| e.downpayment_amount).unwrap_or_default();
                draft.ledger(self.escrow_service.release(escrow, job.id, amount)?);
                draft.job.status = JobStatus::InProgress;

                let mut accepted = invitation.clone();
                accepted.status = InvitationStatus::Accepted;
                accepted.resolved_at = Some(Utc::now());
                draft.invitation = Some(accepted);

                let notice = format!(
                    "Invitation accepted. Downpayment of {} was released to the worker. The job is now in progress.",
                    format_centavos(amount)
                );
                Ok(draft.into_plan(version, Some(notice)))
            }

            JobEvent::RejectInvitation { invitation_id, reason } => {
                let invitation = pending_invitation(snapshot, *invitation_id)?;
                if invitation.worker_id != actor {
                    return Err(ServiceError::NotParticipant(actor, job.id));
                }
                if job.status != JobStatus::InvitePending {
                    return Err(invalid());
                }
                let escrow = snapshot.escrow.as_ref();
                let amount = escrow.map(|e| e.downpayment_amount).unwrap_or_default();
                draft.ledger(self.escrow_service.refund(escrow, job.id, amount)?);
                draft.job.status = JobStatus::Cancelled;

                let mut rejected = invitation.clone();
                rejected.status = InvitationStatus::Rejected;
                rejected.rejection_reason = Some(reason.trim().to_string());
                rejected.resolved_at = Some(Utc::now());
                draft.invitation = Some(rejected);

                let notice = format!(
                    "Invitation declined: {}. Downpayment of {} was refunded to the client.",
                    reason.trim(),
                    format_centavos(amount)
                );
                Ok(draft.into_plan(version, Some(notice)))
            }

            JobEvent::MarkComplete { expected_role } => {
                let role = job
                    .role_of(actor)
                    .ok_or(ServiceError::NotParticipant(actor, job.id))?;
                if let Some(expected) = expected_role {
                    if *expected != role {
                        return Err(ServiceError::NotParticipant(actor, job.id));
                    }
                }

                match job.status {
                    JobStatus::Completed if job.marked_complete(role) => return Ok(Plan::Unchanged),
                    JobStatus::InProgress if job.marked_complete(role) => return Ok(Plan::Unchanged),
                    JobStatus::InProgress => {}
                    _ => return Err(invalid()),
                }

                match role {
                    PartyRole::Client => draft.job.client_marked_complete = true,
                    PartyRole::Worker => draft.job.worker_marked_complete = true,
                }

                if draft.job.client_marked_complete && draft.job.worker_marked_complete {
                    let step = self
                        .escrow_service
                        .mark_remaining_paid(snapshot.escrow.as_ref(), job.id)?;
                    let amount = step.escrow.remaining_amount;
                    draft.ledger(step);
                    draft.job.remaining_payment_paid = true;
                    draft.job.status = JobStatus::Completed;
                    draft.job.completed_at = Some(Utc::now());

                    let notice = format!(
                        "Both parties confirmed completion. Remaining payment of {} was released. The job is completed.",
                        format_centavos(amount)
                    );
                    return Ok(draft.into_plan(version, Some(notice)));
                }

                let notice = match role {
                    PartyRole::Worker => "The worker marked the job as complete. Waiting for the client's approval.",
                    PartyRole::Client => "The client marked the job as complete. Waiting for the worker's confirmation.",
                };
                Ok(draft.into_plan(version, Some(notice.to_string())))
            }

            JobEvent::Cancel { reason } => {
                let role = job
                    .role_of(actor)
                    .ok_or(ServiceError::NotParticipant(actor, job.id))?;
                if job.status != JobStatus::InProgress {
                    return Err(invalid());
                }
                let refunded = self.refund_unreleased(snapshot, &mut draft)?;
                draft.job.status = JobStatus::Cancelled;

                let mut notice = format!("The job was cancelled by the {}.", role.to_str());
                if let Some(reason) = reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                    notice.push_str(&format!(" Reason: {}.", reason));
                }
                if let Some(amount) = refunded {
                    notice.push_str(&format!(" {} was refunded to the client.", format_centavos(amount)));
                }
                Ok(draft.into_plan(version, Some(notice)))
            }

            JobEvent::Dispute { reason } => {
                let role = job
                    .role_of(actor)
                    .ok_or(ServiceError::NotParticipant(actor, job.id))?;
                if job.status != JobStatus::InProgress {
                    return Err(invalid());
                }
                let refunded = self.refund_unreleased(snapshot, &mut draft)?;
                draft.job.status = JobStatus::Cancelled;

                let mut notice = format!(
                    "The {} disputed the job: {}. The job was cancelled.",
                    role.to_str(),
                    reason.trim()
                );
                if let Some(amount) = refunded {
                    notice.push_str(&format!(" {} was refunded to the client.", format_centavos(amount)));
                }
                Ok(draft.into_plan(version, Some(notice)))
            }
        }
    }

    /// Refunds the downpayment if it is still held. Returns the refunded amount.
    fn refund_unreleased(&self, snapshot: &JobSnapshot, draft: &mut Draft) -> Result<Option<i64>, ServiceError> {
        match &snapshot.escrow {
            Some(escrow) if escrow.downpayment_state == DownpaymentState::Held => {
                let amount = escrow.downpayment_amount;
                let moved = draft.ledger(self.escrow_service.refund(Some(escrow), snapshot.job.id, amount)?);
                Ok(moved.then_some(amount))
            }
            _ => Ok(None),
        }
    }

    // Side effects after a committed transition never undo it; failures are logged.
    async fn after_commit(&self, snapshot: &JobSnapshot, notice: Option<String>) {
        let job = &snapshot.job;

        if job.status == JobStatus::Completed {
            self.pending_reviews.invalidate_job(job);
        }

        if matches!(job.status, JobStatus::InvitePending | JobStatus::InProgress) && job.worker_id.is_some() {
            if let Err(e) = self.chat_service.open_conversation(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to open job conversation");
            }
        }

        if let Some(notice) = notice {
            if let Err(e) = self.chat_service.notify_job(job.id, &notice).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to append lifecycle notice");
            }
        }

        if snapshot.escrow.is_some() {
            let escrow_service = self.escrow_service.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(e) = escrow_service.settle_job(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Escrow settlement deferred to background job");
                }
            });
        }
    }
}

fn validate_event(event: &JobEvent) -> Result<(), ServiceError> {
    match event {
        JobEvent::RejectInvitation { reason, .. } | JobEvent::Dispute { reason } => {
            validate_reason(reason)
        }
        _ => Ok(()),
    }
}

pub fn validate_reason(reason: &str) -> Result<(), ServiceError> {
    if reason.trim().chars().count() < MIN_REASON_LEN {
        return Err(ServiceError::Validation(format!(
            "Reason must be at least {} characters",
            MIN_REASON_LEN
        )));
    }
    Ok(())
}

fn require_role(job: &Job, actor: Uuid, role: PartyRole) -> Result<(), ServiceError> {
    if job.role_of(actor) != Some(role) {
        return Err(ServiceError::NotParticipant(actor, job.id));
    }
    Ok(())
}

fn pending_invitation(snapshot: &JobSnapshot, invitation_id: Uuid) -> Result<&Invitation, ServiceError> {
    let invitation = snapshot
        .invitation
        .as_ref()
        .filter(|inv| inv.id == invitation_id)
        .ok_or(ServiceError::InvitationNotFound(invitation_id))?;

    if invitation.status != InvitationStatus::Pending {
        return Err(ServiceError::AlreadyResolved(invitation_id));
    }
    Ok(invitation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::escrowmodel::{MovementKind, RemainingState},
        service::test_support::{StalledGateway, TestServices},
        utils::currency::peso_to_centavos,
    };
    use proptest::prelude::*;
    use std::time::Duration;

    const PESO_1000: i64 = 100_000;

    #[tokio::test]
    async fn invite_job_settles_fully_on_dual_confirmation() {
        let s = TestServices::new();
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());

        let hired = s.jobs.hire_directly(client, worker, "Paint fence", PESO_1000).await.unwrap();
        assert_eq!(hired.job.status, JobStatus::InvitePending);
        let escrow = hired.escrow.clone().unwrap();
        assert_eq!((escrow.downpayment_amount, escrow.remaining_amount), (50_000, 50_000));
        assert_eq!(escrow.downpayment_state, DownpaymentState::Held);
        assert_eq!(escrow.remaining_state, RemainingState::Unpaid);

        let invitation = hired.invitation.unwrap();
        let accepted = s.invitations.accept(invitation.id, worker).await.unwrap();
        assert_eq!(accepted.job.status, JobStatus::InProgress);
        assert_eq!(accepted.escrow.as_ref().unwrap().downpayment_state, DownpaymentState::Released);

        let worker_done = s.jobs.mark_complete(accepted.job.id, worker).await.unwrap();
        assert_eq!(worker_done.job.status, JobStatus::InProgress);
        assert!(worker_done.job.worker_marked_complete);

        let completed = s.jobs.approve_completion(accepted.job.id, client).await.unwrap();
        assert_eq!(completed.job.status, JobStatus::Completed);
        assert!(completed.job.remaining_payment_paid);
        assert!(completed.job.completed_at.is_some());
        let escrow = completed.escrow.unwrap();
        assert_eq!(escrow.downpayment_state, DownpaymentState::Released);
        assert_eq!(escrow.remaining_state, RemainingState::Paid);

        let kinds: Vec<MovementKind> = s
            .escrow
            .get_movements(accepted.job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![MovementKind::Capture, MovementKind::Release, MovementKind::RemainingPayment]
        );
    }

    #[tokio::test]
    async fn every_transition_posts_a_system_message() {
        let s = TestServices::new();
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());
        let hired = s.jobs.hire_directly(client, worker, "Fix roof", PESO_1000).await.unwrap();
        s.invitations
            .accept(hired.invitation.unwrap().id, worker)
            .await
            .unwrap();

        let conversations = s
            .chat
            .list_conversations(client, Default::default())
            .await
            .unwrap();
        assert_eq!(conversations.len(), 1);

        let messages = s
            .chat
            .get_messages(conversations[0].id, client, 0, None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.sender_id.is_none()));
        assert!(messages[1].body.contains("₱500.00"));
    }

    #[tokio::test]
    async fn listing_job_captures_and_releases_on_hire() {
        let s = TestServices::new();
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());

        let job = s.jobs.create_job(client, "Clean gutters", PESO_1000, JobType::Listing).await.unwrap();
        let published = s.jobs.publish(job.id, client).await.unwrap();
        assert_eq!(published.job.status, JobStatus::Active);
        assert!(published.escrow.is_none());

        let hired = s.jobs.accept_worker(job.id, client, worker).await.unwrap();
        assert_eq!(hired.job.status, JobStatus::InProgress);
        assert_eq!(hired.job.worker_id, Some(worker));
        assert_eq!(hired.escrow.unwrap().downpayment_state, DownpaymentState::Released);

        let again = s.jobs.accept_worker(job.id, client, Uuid::new_v4()).await;
        assert!(matches!(again, Err(ServiceError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn invalid_transitions_have_no_side_effects() {
        let s = TestServices::new();
        let client = Uuid::new_v4();
        let job = s.jobs.create_job(client, "Move sofa", PESO_1000, JobType::Listing).await.unwrap();

        let result = s.jobs.mark_complete(job.id, client).await;
        assert!(matches!(result, Err(ServiceError::InvalidTransition { .. })));
        let cancel = s.jobs.cancel(job.id, client, None).await;
        assert!(matches!(cancel, Err(ServiceError::InvalidTransition { .. })));

        let snapshot = s.jobs.get_job(job.id, client).await.unwrap();
        assert_eq!(snapshot.job.version, job.version);
        assert_eq!(snapshot.job.status, JobStatus::Draft);
        assert!(snapshot.escrow.is_none());
        assert!(s.escrow.get_movements(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn marking_complete_twice_is_a_noop() {
        let s = TestServices::new();
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());
        let job = s.in_progress_listing(client, worker, PESO_1000).await;

        let first = s.jobs.mark_complete(job.id, worker).await.unwrap();
        let second = s.jobs.mark_complete(job.id, worker).await.unwrap();
        assert_eq!(first.job.version, second.job.version);
        assert_eq!(second.job.status, JobStatus::InProgress);

        s.jobs.mark_complete(job.id, client).await.unwrap();
        let after = s.jobs.mark_complete(job.id, client).await.unwrap();
        assert_eq!(after.job.status, JobStatus::Completed);

        let worker_approve = s.jobs.approve_completion(job.id, worker).await;
        assert!(matches!(worker_approve, Err(ServiceError::NotParticipant(_, _))));
    }

    #[tokio::test]
    async fn simultaneous_confirmations_always_complete() {
        for _ in 0..25 {
            let s = TestServices::new();
            let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());
            let job = s.in_progress_listing(client, worker, PESO_1000).await;

            let (a, b) = tokio::join!(
                {
                    let jobs = s.jobs.clone();
                    tokio::spawn(async move { jobs.mark_complete(job.id, worker).await })
                },
                {
                    let jobs = s.jobs.clone();
                    tokio::spawn(async move { jobs.approve_completion(job.id, client).await })
                }
            );
            a.unwrap().unwrap();
            b.unwrap().unwrap();

            let snapshot = s.jobs.get_job(job.id, client).await.unwrap();
            assert_eq!(snapshot.job.status, JobStatus::Completed);
            assert_eq!(snapshot.escrow.unwrap().remaining_state, RemainingState::Paid);

            let payments = s
                .escrow
                .get_movements(job.id)
                .await
                .unwrap()
                .into_iter()
                .filter(|m| m.kind == MovementKind::RemainingPayment)
                .count();
            assert_eq!(payments, 1);
        }
    }

    #[tokio::test]
    async fn cancel_and_dispute_close_an_in_progress_job() {
        let s = TestServices::new();
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());

        let job = s.in_progress_listing(client, worker, PESO_1000).await;
        let cancelled = s.jobs.cancel(job.id, worker, Some("Sick".into())).await.unwrap();
        assert_eq!(cancelled.job.status, JobStatus::Cancelled);
        // Downpayment was already released on hire, so nothing is refunded.
        assert_eq!(cancelled.escrow.unwrap().downpayment_state, DownpaymentState::Released);

        let job = s.in_progress_listing(client, worker, PESO_1000).await;
        let short = s.jobs.dispute(job.id, client, "bad work".into()).await;
        assert!(matches!(short, Err(ServiceError::Validation(_))));

        let disputed = s
            .jobs
            .dispute(job.id, client, "The worker never showed up at all".into())
            .await
            .unwrap();
        assert_eq!(disputed.job.status, JobStatus::Cancelled);

        let outsider = s.jobs.get_job(job.id, Uuid::new_v4()).await;
        assert!(matches!(outsider, Err(ServiceError::NotParticipant(_, _))));
    }

    #[tokio::test]
    async fn budgets_beyond_the_ceiling_are_rejected() {
        let s = TestServices::new();
        let client = Uuid::new_v4();

        let huge = s
            .jobs
            .create_job(client, "Build a mall", peso_to_centavos(1e17), JobType::Listing)
            .await;
        assert!(matches!(huge, Err(ServiceError::Validation(_))));

        let hired = s.jobs.hire_directly(client, Uuid::new_v4(), "Build a mall", i64::MAX).await;
        assert!(matches!(hired, Err(ServiceError::Validation(_))));

        let ceiling = s
            .jobs
            .create_job(client, "Build a tower", MAX_BUDGET, JobType::Listing)
            .await
            .unwrap();
        assert_eq!(ceiling.budget, MAX_BUDGET);
    }

    #[tokio::test]
    async fn stalled_gateway_does_not_hold_up_transitions() {
        let s = TestServices::with_gateway(Arc::new(StalledGateway));
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());

        let flow = async {
            let hired = s.jobs.hire_directly(client, worker, "Paint fence", PESO_1000).await.unwrap();
            let accepted = s.invitations.accept(hired.invitation.unwrap().id, worker).await.unwrap();
            s.complete(accepted.job.id, client, worker).await;
            accepted.job.id
        };
        let job_id = tokio::time::timeout(Duration::from_secs(5), flow)
            .await
            .expect("transitions must not wait on the payment gateway");

        let movements = s.escrow.get_movements(job_id).await.unwrap();
        assert_eq!(movements.len(), 3);
        assert!(movements.iter().all(|m| m.settled_at.is_none()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn completed_iff_both_parties_marked(marks in proptest::collection::vec(any::<bool>(), 0..6)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let s = TestServices::new();
                let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());
                let job = s.in_progress_listing(client, worker, PESO_1000).await;

                for by_worker in marks {
                    let actor = if by_worker { worker } else { client };
                    let snapshot = s.jobs.mark_complete(job.id, actor).await.unwrap();
                    let both = snapshot.job.worker_marked_complete && snapshot.job.client_marked_complete;
                    prop_assert_eq!(snapshot.job.status == JobStatus::Completed, both);

                    let escrow = snapshot.escrow.unwrap();
                    prop_assert_eq!(escrow.downpayment_amount + escrow.remaining_amount, PESO_1000);
                }
                Ok(())
            })?;
        }
    }
}
