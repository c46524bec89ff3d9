// models/jobmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Draft,
    Active,
    InvitePending,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn to_str(&self) -> &str {
        match self {
            JobStatus::Draft => "DRAFT",
            JobStatus::Active => "ACTIVE",
            JobStatus::InvitePending => "INVITE_PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Listing,
    Invite,
}

/// Which side of a job an account is on.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "party_role", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyRole {
    Client,
    Worker,
}

impl PartyRole {
    pub fn to_str(&self) -> &str {
        match self {
            PartyRole::Client => "client",
            PartyRole::Worker => "worker",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "invitation_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub client_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub title: String,
    /// Fixed budget in centavos.
    pub budget: i64,
    pub status: JobStatus,
    pub job_type: JobType,
    pub worker_marked_complete: bool,
    pub client_marked_complete: bool,
    pub worker_reviewed: bool,
    pub client_reviewed: bool,
    pub remaining_payment_paid: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new_draft(client_id: Uuid, title: String, budget: i64, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_id,
            worker_id: None,
            title,
            budget,
            status: JobStatus::Draft,
            job_type,
            worker_marked_complete: false,
            client_marked_complete: false,
            worker_reviewed: false,
            client_reviewed: false,
            remaining_payment_paid: false,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Role of `account_id` on this job, if any.
    pub fn role_of(&self, account_id: Uuid) -> Option<PartyRole> {
        if self.client_id == account_id {
            Some(PartyRole::Client)
        } else if self.worker_id == Some(account_id) {
            Some(PartyRole::Worker)
        } else {
            None
        }
    }

    pub fn marked_complete(&self, role: PartyRole) -> bool {
        match role {
            PartyRole::Client => self.client_marked_complete,
            PartyRole::Worker => self.worker_marked_complete,
        }
    }

    pub fn reviewed(&self, role: PartyRole) -> bool {
        match role {
            PartyRole::Client => self.client_reviewed,
            PartyRole::Worker => self.worker_reviewed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Invitation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub worker_id: Uuid,
    pub client_id: Uuid,
    pub status: InvitationStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Invitation {
    pub fn new(job: &Job, worker_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            worker_id,
            client_id: job.client_id,
            status: InvitationStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Review {
    pub id: Uuid,
    pub job_id: Uuid,
    pub author_id: Uuid,
    pub author_role: PartyRole,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Derived view: a completed job the account still owes a review on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingReview {
    pub job_id: Uuid,
    pub job_title: String,
    pub role: PartyRole,
    pub conversation_id: Option<Uuid>,
    pub completed_at: Option<DateTime<Utc>>,
}
