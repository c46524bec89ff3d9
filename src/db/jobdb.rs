// db/jobdb.rs
use async_trait::async_trait;
use uuid::Uuid;

use super::{db::DBClient, JobChange, StoreError};
use crate::models::{
    escrowmodel::{EscrowMovement, EscrowTransaction},
    jobmodel::{Invitation, Job, JobStatus, PartyRole, Review},
};

#[async_trait]
pub trait JobExt {
    async fn create_job(&self, job: &Job) -> Result<Job, StoreError>;

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Jobs where the account is either the client or the assigned worker.
    async fn get_account_jobs(
        &self,
        account_id: Uuid,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn commit_transition(&self, change: JobChange) -> Result<Job, StoreError>;

    async fn get_invitation_by_id(&self, invitation_id: Uuid) -> Result<Option<Invitation>, StoreError>;

    async fn get_invitation_by_job(&self, job_id: Uuid) -> Result<Option<Invitation>, StoreError>;
}

#[async_trait]
pub trait EscrowExt {
    async fn get_escrow_by_job_id(&self, job_id: Uuid) -> Result<Option<EscrowTransaction>, StoreError>;

    async fn get_job_movements(&self, job_id: Uuid) -> Result<Vec<EscrowMovement>, StoreError>;

    async fn get_unsettled_movements(&self, limit: i64) -> Result<Vec<EscrowMovement>, StoreError>;

    async fn mark_movement_settled(
        &self,
        movement_id: Uuid,
        gateway_reference: String,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReviewExt {
    /// Inserts the review and sets the author's `*_reviewed` flag on the job
    /// in one write. A second review for the same (job, role) is `Duplicate`.
    async fn create_review(&self, review: &Review) -> Result<Review, StoreError>;

    async fn get_review(&self, job_id: Uuid, role: PartyRole) -> Result<Option<Review>, StoreError>;
}

fn map_unique(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Duplicate,
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl JobExt for DBClient {
    async fn create_job(&self, job: &Job) -> Result<Job, StoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, client_id, worker_id, title, budget, status, job_type, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#
        )
        .bind(job.id)
        .bind(job.client_id)
        .bind(job.worker_id)
        .bind(&job.title)
        .bind(job.budget)
        .bind(job.status)
        .bind(job.job_type)
        .bind(job.version)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_unique)?;

        Ok(job)
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn get_account_jobs(
        &self,
        account_id: Uuid,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE (client_id = $1 OR worker_id = $1)
              AND ($2::job_status IS NULL OR status = $2)
            ORDER BY created_at ASC
            "#
        )
        .bind(account_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn commit_transition(&self, change: JobChange) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET worker_id = $3,
                status = $4,
                worker_marked_complete = $5,
                client_marked_complete = $6,
                worker_reviewed = $7,
                client_reviewed = $8,
                remaining_payment_paid = $9,
                completed_at = $10,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING *
            "#
        )
        .bind(change.job.id)
        .bind(change.expected_version)
        .bind(change.job.worker_id)
        .bind(change.job.status)
        .bind(change.job.worker_marked_complete)
        .bind(change.job.client_marked_complete)
        .bind(change.job.worker_reviewed)
        .bind(change.job.client_reviewed)
        .bind(change.job.remaining_payment_paid)
        .bind(change.job.completed_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::VersionConflict)?;

        if let Some(escrow) = &change.escrow {
            sqlx::query(
                r#"
                INSERT INTO escrow_transactions
                    (job_id, budget, downpayment_amount, remaining_amount, downpayment_state, remaining_state, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                ON CONFLICT (job_id) DO UPDATE
                SET downpayment_state = EXCLUDED.downpayment_state,
                    remaining_state = EXCLUDED.remaining_state,
                    updated_at = NOW()
                "#
            )
            .bind(escrow.job_id)
            .bind(escrow.budget)
            .bind(escrow.downpayment_amount)
            .bind(escrow.remaining_amount)
            .bind(escrow.downpayment_state)
            .bind(escrow.remaining_state)
            .bind(escrow.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for movement in &change.movements {
            sqlx::query(
                r#"
                INSERT INTO escrow_movements (id, job_id, kind, amount, idempotency_key, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#
            )
            .bind(movement.id)
            .bind(movement.job_id)
            .bind(movement.kind)
            .bind(movement.amount)
            .bind(&movement.idempotency_key)
            .bind(movement.created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_unique)?;
        }

        if let Some(invitation) = &change.invitation {
            sqlx::query(
                r#"
                INSERT INTO invitations (id, job_id, worker_id, client_id, status, rejection_reason, created_at, resolved_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status,
                    rejection_reason = EXCLUDED.rejection_reason,
                    resolved_at = EXCLUDED.resolved_at
                "#
            )
            .bind(invitation.id)
            .bind(invitation.job_id)
            .bind(invitation.worker_id)
            .bind(invitation.client_id)
            .bind(invitation.status)
            .bind(&invitation.rejection_reason)
            .bind(invitation.created_at)
            .bind(invitation.resolved_at)
            .execute(&mut *tx)
            .await
            .map_err(map_unique)?;
        }

        tx.commit().await?;
        Ok(job)
    }

    async fn get_invitation_by_id(&self, invitation_id: Uuid) -> Result<Option<Invitation>, StoreError> {
        let invitation = sqlx::query_as::<_, Invitation>("SELECT * FROM invitations WHERE id = $1")
            .bind(invitation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(invitation)
    }

    async fn get_invitation_by_job(&self, job_id: Uuid) -> Result<Option<Invitation>, StoreError> {
        let invitation = sqlx::query_as::<_, Invitation>("SELECT * FROM invitations WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(invitation)
    }
}

#[async_trait]
impl EscrowExt for DBClient {
    async fn get_escrow_by_job_id(&self, job_id: Uuid) -> Result<Option<EscrowTransaction>, StoreError> {
        let escrow = sqlx::query_as::<_, EscrowTransaction>(
            "SELECT * FROM escrow_transactions WHERE job_id = $1"
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn get_job_movements(&self, job_id: Uuid) -> Result<Vec<EscrowMovement>, StoreError> {
        let movements = sqlx::query_as::<_, EscrowMovement>(
            "SELECT * FROM escrow_movements WHERE job_id = $1 ORDER BY created_at ASC"
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(movements)
    }

    async fn get_unsettled_movements(&self, limit: i64) -> Result<Vec<EscrowMovement>, StoreError> {
        let movements = sqlx::query_as::<_, EscrowMovement>(
            r#"
            SELECT * FROM escrow_movements
            WHERE settled_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(movements)
    }

    async fn mark_movement_settled(
        &self,
        movement_id: Uuid,
        gateway_reference: String,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE escrow_movements
            SET settled_at = NOW(), gateway_reference = $2
            WHERE id = $1 AND settled_at IS NULL
            "#
        )
        .bind(movement_id)
        .bind(gateway_reference)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ReviewExt for DBClient {
    async fn create_review(&self, review: &Review) -> Result<Review, StoreError> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Review>(
            r#"
            INSERT INTO reviews (id, job_id, author_id, author_role, rating, comment, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#
        )
        .bind(review.id)
        .bind(review.job_id)
        .bind(review.author_id)
        .bind(review.author_role)
        .bind(review.rating)
        .bind(&review.comment)
        .bind(review.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_unique)?;

        let flag_query = match review.author_role {
            PartyRole::Client => {
                "UPDATE jobs SET client_reviewed = TRUE, version = version + 1, updated_at = NOW() WHERE id = $1"
            }
            PartyRole::Worker => {
                "UPDATE jobs SET worker_reviewed = TRUE, version = version + 1, updated_at = NOW() WHERE id = $1"
            }
        };

        let result = sqlx::query(flag_query)
            .bind(review.job_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_review(&self, job_id: Uuid, role: PartyRole) -> Result<Option<Review>, StoreError> {
        let review = sqlx::query_as::<_, Review>(
            "SELECT * FROM reviews WHERE job_id = $1 AND author_role = $2"
        )
        .bind(job_id)
        .bind(role)
        .fetch_optional(&self.pool)
        .await?;

        Ok(review)
    }
}
