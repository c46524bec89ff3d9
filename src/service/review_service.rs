// service/review_service.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    db::{Store, StoreError},
    models::jobmodel::*,
    service::error::ServiceError,
};

const PENDING_REVIEW_TTL: Duration = Duration::from_secs(300);
const MAX_COMMENT_LEN: usize = 2_000;

#[derive(Debug, Clone)]
struct CachedPending {
    value: Option<PendingReview>,
    cached_at: Instant,
}

/// Per-account cache of the pending-review lookup, which runs on every
/// session resume. Entries are dropped whenever a job completes or a review
/// is filed for one of the account's jobs.
#[derive(Debug, Default)]
pub struct PendingReviewCache {
    state: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Uuid, CachedPending>,
    /// Bumped by every invalidation. A lookup that started under an older
    /// generation must not be cached.
    generation: u64,
}

impl PendingReviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn get(&self, account_id: Uuid) -> Option<Option<PendingReview>> {
        self.lock()
            .entries
            .get(&account_id)
            .filter(|entry| entry.cached_at.elapsed() < PENDING_REVIEW_TTL)
            .map(|entry| entry.value.clone())
    }

    fn put(&self, account_id: Uuid, value: Option<PendingReview>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.entries.insert(
            account_id,
            CachedPending {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_job(&self, job: &Job) {
        let mut state = self.lock();
        state.generation += 1;
        state.entries.remove(&job.client_id);
        if let Some(worker_id) = job.worker_id {
            state.entries.remove(&worker_id);
        }
    }
}

/// The Review Gate.
#[derive(Debug, Clone)]
pub struct ReviewService {
    db_client: Arc<dyn Store>,
    cache: Arc<PendingReviewCache>,
}

impl ReviewService {
    pub fn new(db_client: Arc<dyn Store>, cache: Arc<PendingReviewCache>) -> Self {
        Self { db_client, cache }
    }

    pub async fn is_review_required(&self, job_id: Uuid, role: PartyRole) -> Result<bool, ServiceError> {
        let job = self
            .db_client
            .get_job_by_id(job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))?;

        if job.status != JobStatus::Completed {
            return Ok(false);
        }

        Ok(self.db_client.get_review(job_id, role).await?.is_none())
    }

    /// Files the caller's review. The caller's role is taken from the job.
    pub async fn submit(
        &self,
        job_id: Uuid,
        author_id: Uuid,
        rating: i32,
        comment: Option<String>,
    ) -> Result<Review, ServiceError> {
        if !(1..=5).contains(&rating) {
            return Err(ServiceError::Validation("Rating must be between 1 and 5".to_string()));
        }
        let comment = comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if comment.as_ref().is_some_and(|c| c.chars().count() > MAX_COMMENT_LEN) {
            return Err(ServiceError::Validation(format!(
                "Comment cannot exceed {} characters",
                MAX_COMMENT_LEN
            )));
        }

        let job = self
            .db_client
            .get_job_by_id(job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))?;
        let role = job
            .role_of(author_id)
            .ok_or(ServiceError::NotParticipant(author_id, job_id))?;

        if job.status != JobStatus::Completed {
            return Err(ServiceError::JobNotComplete(job_id));
        }
        if job.reviewed(role) || self.db_client.get_review(job_id, role).await?.is_some() {
            return Err(ServiceError::DuplicateReview(job_id, role));
        }

        let review = Review {
            id: Uuid::new_v4(),
            job_id,
            author_id,
            author_role: role,
            rating,
            comment,
            created_at: Utc::now(),
        };

        let created = self.db_client.create_review(&review).await.map_err(|e| match e {
            StoreError::Duplicate => ServiceError::DuplicateReview(job_id, role),
            other => other.into(),
        })?;

        self.cache.invalidate_job(&job);
        tracing::info!(job_id = %job_id, role = role.to_str(), rating, "Review submitted");
        Ok(created)
    }

    /// The oldest completed job the account still owes a review on.
    pub async fn compute_pending_review(&self, account_id: Uuid) -> Result<Option<PendingReview>, ServiceError> {
        if let Some(cached) = self.cache.get(account_id) {
            return Ok(cached);
        }
        let generation = self.cache.generation();

        let completed = self
            .db_client
            .get_account_jobs(account_id, Some(JobStatus::Completed))
            .await?;

        let oldest = completed
            .into_iter()
            .filter_map(|job| {
                let role = job.role_of(account_id)?;
                (!job.reviewed(role)).then_some((job, role))
            })
            .min_by_key(|(job, _)| (job.completed_at.unwrap_or(job.updated_at), job.created_at));

        let pending = match oldest {
            Some((job, role)) => {
                let conversation_id = self
                    .db_client
                    .get_conversation_by_job(job.id)
                    .await?
                    .map(|c| c.id);

                Some(PendingReview {
                    job_id: job.id,
                    job_title: job.title,
                    role,
                    conversation_id,
                    completed_at: job.completed_at,
                })
            }
            None => None,
        };

        self.cache.put(account_id, pending.clone(), generation);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::TestServices;

    #[tokio::test]
    async fn review_requires_completion_and_is_filed_once() {
        let s = TestServices::new();
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());
        let job = s.in_progress_listing(client, worker, 100_000).await;

        let early = s.reviews.submit(job.id, client, 5, None).await;
        assert!(matches!(early, Err(ServiceError::JobNotComplete(_))));
        assert!(!s.reviews.is_review_required(job.id, PartyRole::Client).await.unwrap());

        s.complete(job.id, client, worker).await;
        assert!(s.reviews.is_review_required(job.id, PartyRole::Client).await.unwrap());

        let review = s
            .reviews
            .submit(job.id, client, 5, Some("  Great work  ".into()))
            .await
            .unwrap();
        assert_eq!(review.author_role, PartyRole::Client);
        assert_eq!(review.comment.as_deref(), Some("Great work"));
        assert!(!s.reviews.is_review_required(job.id, PartyRole::Client).await.unwrap());
        assert!(s.reviews.is_review_required(job.id, PartyRole::Worker).await.unwrap());

        let second = s.reviews.submit(job.id, client, 4, None).await;
        assert!(matches!(second, Err(ServiceError::DuplicateReview(_, PartyRole::Client))));

        let bad_rating = s.reviews.submit(job.id, worker, 6, None).await;
        assert!(matches!(bad_rating, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn lookup_overtaken_by_invalidation_is_not_cached() {
        let cache = PendingReviewCache::new();
        let client = Uuid::new_v4();
        let job = Job::new_draft(client, "Fix sink".into(), 100_000, JobType::Listing);

        let generation = cache.generation();
        cache.invalidate_job(&job);
        cache.put(client, None, generation);
        assert!(cache.get(client).is_none());

        let generation = cache.generation();
        cache.put(client, None, generation);
        assert!(matches!(cache.get(client), Some(None)));
    }

    #[tokio::test]
    async fn pending_review_is_oldest_first_and_refreshes() {
        let s = TestServices::new();
        let (client, worker) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(s.reviews.compute_pending_review(client).await.unwrap().is_none());

        let first = s.in_progress_listing(client, worker, 100_000).await;
        let second = s.in_progress_listing(client, worker, 200_000).await;
        s.complete(first.id, client, worker).await;
        s.complete(second.id, client, worker).await;

        let pending = s.reviews.compute_pending_review(client).await.unwrap().unwrap();
        assert_eq!(pending.job_id, first.id);
        assert_eq!(pending.role, PartyRole::Client);
        assert!(pending.conversation_id.is_some());

        s.reviews.submit(first.id, client, 4, None).await.unwrap();
        let pending = s.reviews.compute_pending_review(client).await.unwrap().unwrap();
        assert_eq!(pending.job_id, second.id);

        s.reviews.submit(second.id, client, 4, None).await.unwrap();
        assert!(s.reviews.compute_pending_review(client).await.unwrap().is_none());

        let worker_pending = s.reviews.compute_pending_review(worker).await.unwrap().unwrap();
        assert_eq!(worker_pending.role, PartyRole::Worker);
    }
}
