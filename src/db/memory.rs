// db/memory.rs
//! Process-local store with the same write semantics as the Postgres client.
//!
//! Each job (with its escrow, movements, invitation and reviews) sits behind
//! its own mutex, and so does each conversation. The outer maps are only
//! locked long enough to find or insert a record, so work on one job never
//! waits on another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{ChatExt, EscrowExt, JobChange, JobExt, ReviewExt, StoreError};
use crate::models::{
    chatmodels::*,
    escrowmodel::{EscrowMovement, EscrowTransaction},
    jobmodel::{Invitation, Job, JobStatus, PartyRole, Review},
};

#[derive(Debug)]
struct JobRecord {
    job: Job,
    escrow: Option<EscrowTransaction>,
    movements: Vec<EscrowMovement>,
    invitation: Option<Invitation>,
    reviews: Vec<Review>,
}

#[derive(Debug)]
struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<Message>,
}

#[derive(Debug, Default)]
pub struct MemoryDb {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<JobRecord>>>>,
    invitations: RwLock<HashMap<Uuid, Uuid>>,
    conversations: RwLock<HashMap<Uuid, Arc<Mutex<ConversationRecord>>>>,
    conversations_by_job: RwLock<HashMap<Uuid, Uuid>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn job_record(&self, job_id: Uuid) -> Option<Arc<Mutex<JobRecord>>> {
        read(&self.jobs).get(&job_id).cloned()
    }

    fn all_job_records(&self) -> Vec<Arc<Mutex<JobRecord>>> {
        read(&self.jobs).values().cloned().collect()
    }

    fn conversation_record(&self, conversation_id: Uuid) -> Option<Arc<Mutex<ConversationRecord>>> {
        read(&self.conversations).get(&conversation_id).cloned()
    }
}

#[async_trait]
impl JobExt for MemoryDb {
    async fn create_job(&self, job: &Job) -> Result<Job, StoreError> {
        let mut jobs = write(&self.jobs);
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate);
        }

        jobs.insert(
            job.id,
            Arc::new(Mutex::new(JobRecord {
                job: job.clone(),
                escrow: None,
                movements: Vec::new(),
                invitation: None,
                reviews: Vec::new(),
            })),
        );

        Ok(job.clone())
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.job_record(job_id).map(|record| lock(&record).job.clone()))
    }

    async fn get_account_jobs(
        &self,
        account_id: Uuid,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .all_job_records()
            .iter()
            .map(|record| lock(record).job.clone())
            .filter(|job| job.role_of(account_id).is_some())
            .filter(|job| status.map_or(true, |wanted| job.status == wanted))
            .collect();

        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn commit_transition(&self, change: JobChange) -> Result<Job, StoreError> {
        let record = self
            .job_record(change.job.id)
            .ok_or(StoreError::VersionConflict)?;
        let mut record = lock(&record);

        if record.job.version != change.expected_version {
            return Err(StoreError::VersionConflict);
        }

        let duplicate_movement = change.movements.iter().any(|incoming| {
            record
                .movements
                .iter()
                .any(|existing| existing.idempotency_key == incoming.idempotency_key)
        });
        if duplicate_movement {
            return Err(StoreError::Duplicate);
        }

        if let (Some(existing), Some(incoming)) = (&record.invitation, &change.invitation) {
            if existing.id != incoming.id {
                return Err(StoreError::Duplicate);
            }
        }

        let now = Utc::now();
        let mut job = change.job;
        job.version = change.expected_version + 1;
        job.updated_at = now;
        record.job = job.clone();

        if let Some(mut escrow) = change.escrow {
            escrow.updated_at = now;
            record.escrow = Some(escrow);
        }

        record.movements.extend(change.movements);

        if let Some(invitation) = change.invitation {
            write(&self.invitations).insert(invitation.id, invitation.job_id);
            record.invitation = Some(invitation);
        }

        Ok(job)
    }

    async fn get_invitation_by_id(&self, invitation_id: Uuid) -> Result<Option<Invitation>, StoreError> {
        let job_id = read(&self.invitations).get(&invitation_id).copied();
        Ok(job_id
            .and_then(|job_id| self.job_record(job_id))
            .and_then(|record| lock(&record).invitation.clone()))
    }

    async fn get_invitation_by_job(&self, job_id: Uuid) -> Result<Option<Invitation>, StoreError> {
        Ok(self
            .job_record(job_id)
            .and_then(|record| lock(&record).invitation.clone()))
    }
}

#[async_trait]
impl EscrowExt for MemoryDb {
    async fn get_escrow_by_job_id(&self, job_id: Uuid) -> Result<Option<EscrowTransaction>, StoreError> {
        Ok(self
            .job_record(job_id)
            .and_then(|record| lock(&record).escrow.clone()))
    }

    async fn get_job_movements(&self, job_id: Uuid) -> Result<Vec<EscrowMovement>, StoreError> {
        Ok(self
            .job_record(job_id)
            .map(|record| lock(&record).movements.clone())
            .unwrap_or_default())
    }

    async fn get_unsettled_movements(&self, limit: i64) -> Result<Vec<EscrowMovement>, StoreError> {
        let mut movements: Vec<EscrowMovement> = self
            .all_job_records()
            .iter()
            .flat_map(|record| {
                lock(record)
                    .movements
                    .iter()
                    .filter(|movement| movement.settled_at.is_none())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        movements.sort_by_key(|movement| movement.created_at);
        movements.truncate(limit.max(0) as usize);
        Ok(movements)
    }

    async fn mark_movement_settled(
        &self,
        movement_id: Uuid,
        gateway_reference: String,
    ) -> Result<(), StoreError> {
        for record in self.all_job_records() {
            let mut record = lock(&record);
            if let Some(movement) = record
                .movements
                .iter_mut()
                .find(|movement| movement.id == movement_id)
            {
                if movement.settled_at.is_none() {
                    movement.settled_at = Some(Utc::now());
                    movement.gateway_reference = Some(gateway_reference);
                }
                return Ok(());
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ReviewExt for MemoryDb {
    async fn create_review(&self, review: &Review) -> Result<Review, StoreError> {
        let record = self.job_record(review.job_id).ok_or(StoreError::NotFound)?;
        let mut record = lock(&record);

        if record
            .reviews
            .iter()
            .any(|existing| existing.author_role == review.author_role)
        {
            return Err(StoreError::Duplicate);
        }

        record.reviews.push(review.clone());
        match review.author_role {
            PartyRole::Client => record.job.client_reviewed = true,
            PartyRole::Worker => record.job.worker_reviewed = true,
        }
        record.job.version += 1;
        record.job.updated_at = Utc::now();

        Ok(review.clone())
    }

    async fn get_review(&self, job_id: Uuid, role: PartyRole) -> Result<Option<Review>, StoreError> {
        Ok(self.job_record(job_id).and_then(|record| {
            lock(&record)
                .reviews
                .iter()
                .find(|review| review.author_role == role)
                .cloned()
        }))
    }
}

#[async_trait]
impl ChatExt for MemoryDb {
    async fn create_or_get_conversation(
        &self,
        job_id: Uuid,
        client_id: Uuid,
        worker_id: Uuid,
    ) -> Result<Conversation, StoreError> {
        let mut by_job = write(&self.conversations_by_job);

        if let Some(existing) = by_job
            .get(&job_id)
            .and_then(|conversation_id| self.conversation_record(*conversation_id))
        {
            return Ok(lock(&existing).conversation.clone());
        }

        let conversation = Conversation::new(job_id, client_id, worker_id);
        write(&self.conversations).insert(
            conversation.id,
            Arc::new(Mutex::new(ConversationRecord {
                conversation: conversation.clone(),
                messages: Vec::new(),
            })),
        );
        by_job.insert(job_id, conversation.id);

        Ok(conversation)
    }

    async fn get_conversation_by_id(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .conversation_record(conversation_id)
            .map(|record| lock(&record).conversation.clone()))
    }

    async fn get_conversation_by_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let conversation_id = read(&self.conversations_by_job).get(&job_id).copied();
        Ok(conversation_id
            .and_then(|id| self.conversation_record(id))
            .map(|record| lock(&record).conversation.clone()))
    }

    async fn get_account_conversations(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Conversation>, StoreError> {
        let records: Vec<_> = read(&self.conversations).values().cloned().collect();
        let mut conversations: Vec<Conversation> = records
            .iter()
            .map(|record| lock(record).conversation.clone())
            .filter(|conversation| conversation.is_participant(account_id))
            .collect();

        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(conversations)
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let record = self
            .conversation_record(message.conversation_id)
            .ok_or(StoreError::NotFound)?;
        let mut record = lock(&record);

        let now = Utc::now();
        let conversation = &mut record.conversation;
        conversation.last_sequence += 1;
        conversation.last_message = Some(message.body.clone());
        conversation.last_message_at = Some(now);
        if message.sender_id != Some(conversation.client_id) {
            conversation.client_unread += 1;
        }
        if message.sender_id != Some(conversation.worker_id) {
            conversation.worker_unread += 1;
        }

        let stored = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            sequence: conversation.last_sequence,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            message_type: message.message_type,
            body: message.body,
            created_at: now,
            read_at: None,
        };
        record.messages.push(stored.clone());

        Ok(stored)
    }

    async fn get_messages(
        &self,
        conversation_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let record = self
            .conversation_record(conversation_id)
            .ok_or(StoreError::NotFound)?;
        let record = lock(&record);

        Ok(record
            .messages
            .iter()
            .filter(|message| message.sequence > after_sequence)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
        upto_sequence: i64,
    ) -> Result<Conversation, StoreError> {
        let record = self
            .conversation_record(conversation_id)
            .ok_or(StoreError::NotFound)?;
        let mut record = lock(&record);

        let role = record
            .conversation
            .role_of(account_id)
            .ok_or(StoreError::NotFound)?;
        let last_read = record
            .conversation
            .last_read_for(role)
            .max(upto_sequence.min(record.conversation.last_sequence));

        let now = Utc::now();
        let mut unread = 0;
        for message in record
            .messages
            .iter_mut()
            .filter(|message| message.sender_id != Some(account_id))
        {
            if message.sequence <= last_read {
                message.read_at.get_or_insert(now);
            } else {
                unread += 1;
            }
        }

        let conversation = &mut record.conversation;
        match role {
            PartyRole::Client => {
                conversation.client_last_read = last_read;
                conversation.client_unread = unread;
            }
            PartyRole::Worker => {
                conversation.worker_last_read = last_read;
                conversation.worker_unread = unread;
            }
        }

        Ok(conversation.clone())
    }

    async fn toggle_archive(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
    ) -> Result<Conversation, StoreError> {
        let record = self
            .conversation_record(conversation_id)
            .ok_or(StoreError::NotFound)?;
        let mut record = lock(&record);

        let conversation = &mut record.conversation;
        match conversation.role_of(account_id).ok_or(StoreError::NotFound)? {
            PartyRole::Client => conversation.client_archived = !conversation.client_archived,
            PartyRole::Worker => conversation.worker_archived = !conversation.worker_archived,
        }

        Ok(conversation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::jobmodel::JobType;

    #[tokio::test]
    async fn stale_version_is_rejected_without_writing() {
        let db = MemoryDb::new();
        let job = db
            .create_job(&Job::new_draft(Uuid::new_v4(), "Fix sink".into(), 100_000, JobType::Listing))
            .await
            .unwrap();

        let mut published = job.clone();
        published.status = JobStatus::Active;
        let committed = db
            .commit_transition(JobChange {
                expected_version: 0,
                job: published.clone(),
                escrow: None,
                movements: vec![],
                invitation: None,
            })
            .await
            .unwrap();
        assert_eq!(committed.version, 1);

        let mut stale = job.clone();
        stale.status = JobStatus::Cancelled;
        let err = db
            .commit_transition(JobChange {
                expected_version: 0,
                job: stale,
                escrow: None,
                movements: vec![],
                invitation: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));

        let current = db.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn sequences_and_unread_counts_track_appends() {
        let db = MemoryDb::new();
        let client = Uuid::new_v4();
        let worker = Uuid::new_v4();
        let conversation = db
            .create_or_get_conversation(Uuid::new_v4(), client, worker)
            .await
            .unwrap();

        for body in ["hello", "are you free tomorrow?"] {
            db.append_message(NewMessage::text(conversation.id, client, "Client".into(), body.into()))
                .await
                .unwrap();
        }
        let system = db
            .append_message(NewMessage::system(conversation.id, "Job started".into()))
            .await
            .unwrap();
        assert_eq!(system.sequence, 3);

        let current = db.get_conversation_by_id(conversation.id).await.unwrap().unwrap();
        assert_eq!(current.worker_unread, 3);
        assert_eq!(current.client_unread, 1);

        let after_read = db.mark_read(conversation.id, worker, 2).await.unwrap();
        assert_eq!(after_read.worker_unread, 1);

        // Idempotent and never moves the cursor backwards.
        let again = db.mark_read(conversation.id, worker, 1).await.unwrap();
        assert_eq!(again.worker_last_read, 2);
        assert_eq!(again.worker_unread, 1);
    }
}
