// service/chat_service.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    db::{StoreError, Store},
    models::{chatmodels::*, jobmodel::Job},
    service::error::ServiceError,
};

const CHANNEL_CAPACITY: usize = 256;
const MAX_MESSAGE_LEN: usize = 4_000;
pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug)]
struct ConversationChannel {
    sender: broadcast::Sender<Message>,
    append_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Fan-out of appended messages to live websocket sessions, one broadcast
/// channel per conversation.
#[derive(Debug, Default)]
pub struct ChatHub {
    channels: Mutex<HashMap<Uuid, ConversationChannel>>,
}

impl ChatHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ConversationChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_channel<R>(&self, conversation_id: Uuid, f: impl FnOnce(&ConversationChannel) -> R) -> R {
        let mut channels = self.lock_channels();
        let channel = channels.entry(conversation_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            ConversationChannel {
                sender,
                append_lock: Arc::new(tokio::sync::Mutex::new(())),
            }
        });
        f(channel)
    }

    pub fn subscribe(&self, conversation_id: Uuid) -> broadcast::Receiver<Message> {
        self.with_channel(conversation_id, |channel| channel.sender.subscribe())
    }

    fn append_lock(&self, conversation_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.with_channel(conversation_id, |channel| channel.append_lock.clone())
    }

    fn publish(&self, message: &Message) {
        // No receivers is fine: nobody has the conversation open.
        let _ = self.with_channel(message.conversation_id, |channel| {
            channel.sender.send(message.clone())
        });
    }

    /// Drops the conversation's channel once nobody listens or appends.
    pub fn prune(&self, conversation_id: Uuid) {
        let mut channels = self.lock_channels();
        let idle = channels.get(&conversation_id).map_or(false, |channel| {
            channel.sender.receiver_count() == 0 && Arc::strong_count(&channel.append_lock) == 1
        });
        if idle {
            channels.remove(&conversation_id);
        }
    }

    #[cfg(test)]
    fn open_channels(&self) -> usize {
        self.lock_channels().len()
    }
}

/// The Conversation Store plus live delivery.
#[derive(Debug, Clone)]
pub struct ChatService {
    db_client: Arc<dyn Store>,
    hub: Arc<ChatHub>,
}

impl ChatService {
    pub fn new(db_client: Arc<dyn Store>, hub: Arc<ChatHub>) -> Self {
        Self { db_client, hub }
    }

    /// One conversation per job, between the client and the assigned worker.
    pub async fn open_conversation(&self, job: &Job) -> Result<Conversation, ServiceError> {
        let worker_id = job.worker_id.ok_or_else(|| {
            ServiceError::Validation(format!("Job {} has no counterparty yet", job.id))
        })?;

        let conversation = self
            .db_client
            .create_or_get_conversation(job.id, job.client_id, worker_id)
            .await?;

        Ok(conversation)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
    ) -> Result<Conversation, ServiceError> {
        let conversation = self
            .db_client
            .get_conversation_by_id(conversation_id)
            .await?
            .ok_or(ServiceError::ConversationNotFound(conversation_id))?;

        if !conversation.is_participant(account_id) {
            return Err(ServiceError::NotParticipant(account_id, conversation_id));
        }

        Ok(conversation)
    }

    pub async fn append_text(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        sender_name: &str,
        body: &str,
    ) -> Result<Message, ServiceError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ServiceError::Validation("Message cannot be empty".to_string()));
        }
        if body.chars().count() > MAX_MESSAGE_LEN {
            return Err(ServiceError::Validation(format!(
                "Message cannot exceed {} characters",
                MAX_MESSAGE_LEN
            )));
        }

        self.get_conversation(conversation_id, sender_id).await?;

        self.append(NewMessage::text(
            conversation_id,
            sender_id,
            sender_name.to_string(),
            body.to_string(),
        ))
        .await
    }

    pub async fn append_system(&self, conversation_id: Uuid, body: &str) -> Result<Message, ServiceError> {
        self.append(NewMessage::system(conversation_id, body.to_string())).await
    }

    /// Appends a lifecycle notice to the job's conversation, if it has one yet.
    pub async fn notify_job(&self, job_id: Uuid, body: &str) -> Result<Option<Message>, ServiceError> {
        match self.db_client.get_conversation_by_job(job_id).await? {
            Some(conversation) => Ok(Some(self.append_system(conversation.id, body).await?)),
            None => Ok(None),
        }
    }

    // Store append and broadcast run under the same lock so live order equals sequence order.
    async fn append(&self, message: NewMessage) -> Result<Message, ServiceError> {
        let conversation_id = message.conversation_id;
        let lock = self.hub.append_lock(conversation_id);
        let appended = {
            let _guard = lock.lock().await;
            let appended = self.db_client.append_message(message).await;
            if let Ok(stored) = &appended {
                self.hub.publish(stored);
            }
            appended
        };
        drop(lock);
        self.hub.prune(conversation_id);

        appended.map_err(|e| match e {
            StoreError::NotFound => ServiceError::ConversationNotFound(conversation_id),
            other => other.into(),
        })
    }

    pub fn subscribe(&self, conversation_id: Uuid) -> broadcast::Receiver<Message> {
        self.hub.subscribe(conversation_id)
    }

    /// Called after a subscriber's receiver is dropped.
    pub fn release(&self, conversation_id: Uuid) {
        self.hub.prune(conversation_id);
    }

    pub async fn list_conversations(
        &self,
        account_id: Uuid,
        filter: ConversationFilter,
    ) -> Result<Vec<ConversationSummary>, ServiceError> {
        let conversations = self.db_client.get_account_conversations(account_id).await?;

        Ok(conversations
            .iter()
            .filter(|c| c.matches(account_id, filter))
            .filter_map(|c| ConversationSummary::for_account(c, account_id))
            .collect())
    }

    pub async fn get_messages(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
        after_sequence: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, ServiceError> {
        self.get_conversation(conversation_id, account_id).await?;

        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let messages = self
            .db_client
            .get_messages(conversation_id, after_sequence.max(0), limit)
            .await?;

        Ok(messages)
    }

    /// Moves the caller's read cursor forward. Never moves it backwards.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
        upto_sequence: Option<i64>,
    ) -> Result<ConversationSummary, ServiceError> {
        let conversation = self.get_conversation(conversation_id, account_id).await?;
        let upto = upto_sequence.unwrap_or(conversation.last_sequence);

        let updated = self
            .db_client
            .mark_read(conversation_id, account_id, upto)
            .await?;

        ConversationSummary::for_account(&updated, account_id)
            .ok_or(ServiceError::NotParticipant(account_id, conversation_id))
    }

    pub async fn toggle_archive(
        &self,
        conversation_id: Uuid,
        account_id: Uuid,
    ) -> Result<ConversationSummary, ServiceError> {
        self.get_conversation(conversation_id, account_id).await?;

        let updated = self
            .db_client
            .toggle_archive(conversation_id, account_id)
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            account_id = %account_id,
            "Conversation archive flag toggled"
        );

        ConversationSummary::for_account(&updated, account_id)
            .ok_or(ServiceError::NotParticipant(account_id, conversation_id))
    }
}
