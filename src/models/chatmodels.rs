// models/chatmodels.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::jobmodel::PartyRole;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "message_type", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationFilter {
    #[default]
    All,
    Unread,
    Archived,
}

/// One conversation per job. Participant state is kept per side so that
/// archiving and read cursors never leak into the other participant's view.
#[derive(Debug, Serialize, Clone, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub client_id: Uuid,
    pub worker_id: Uuid,
    pub client_archived: bool,
    pub worker_archived: bool,
    pub client_unread: i64,
    pub worker_unread: i64,
    pub client_last_read: i64,
    pub worker_last_read: i64,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sequence: i64,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(job_id: Uuid, client_id: Uuid, worker_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            client_id,
            worker_id,
            client_archived: false,
            worker_archived: false,
            client_unread: 0,
            worker_unread: 0,
            client_last_read: 0,
            worker_last_read: 0,
            last_message: None,
            last_message_at: None,
            last_sequence: 0,
            created_at: Utc::now(),
        }
    }

    pub fn role_of(&self, account_id: Uuid) -> Option<PartyRole> {
        if self.client_id == account_id {
            Some(PartyRole::Client)
        } else if self.worker_id == account_id {
            Some(PartyRole::Worker)
        } else {
            None
        }
    }

    pub fn is_participant(&self, account_id: Uuid) -> bool {
        self.role_of(account_id).is_some()
    }

    pub fn other_participant(&self, account_id: Uuid) -> Uuid {
        if self.client_id == account_id {
            self.worker_id
        } else {
            self.client_id
        }
    }

    pub fn archived_for(&self, role: PartyRole) -> bool {
        match role {
            PartyRole::Client => self.client_archived,
            PartyRole::Worker => self.worker_archived,
        }
    }

    pub fn unread_for(&self, role: PartyRole) -> i64 {
        match role {
            PartyRole::Client => self.client_unread,
            PartyRole::Worker => self.worker_unread,
        }
    }

    pub fn last_read_for(&self, role: PartyRole) -> i64 {
        match role {
            PartyRole::Client => self.client_last_read,
            PartyRole::Worker => self.worker_last_read,
        }
    }

    pub fn matches(&self, account_id: Uuid, filter: ConversationFilter) -> bool {
        let Some(role) = self.role_of(account_id) else {
            return false;
        };
        match filter {
            ConversationFilter::All => !self.archived_for(role),
            ConversationFilter::Unread => !self.archived_for(role) && self.unread_for(role) > 0,
            ConversationFilter::Archived => self.archived_for(role),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Position in the conversation, starting at 1. Ordering is by this, never by clock.
    pub sequence: i64,
    /// `None` for system messages.
    pub sender_id: Option<Uuid>,
    pub sender_name: String,
    pub message_type: MessageType,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// A message before the store assigns its id and sequence.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub sender_name: String,
    pub message_type: MessageType,
    pub body: String,
}

impl NewMessage {
    pub fn text(conversation_id: Uuid, sender_id: Uuid, sender_name: String, body: String) -> Self {
        Self {
            conversation_id,
            sender_id: Some(sender_id),
            sender_name,
            message_type: MessageType::Text,
            body,
        }
    }

    pub fn system(conversation_id: Uuid, body: String) -> Self {
        Self {
            conversation_id,
            sender_id: None,
            sender_name: "System".to_string(),
            message_type: MessageType::System,
            body,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub job_id: Uuid,
    pub other_participant_id: Uuid,
    pub archived: bool,
    pub unread_count: i64,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
}

impl ConversationSummary {
    pub fn for_account(conversation: &Conversation, account_id: Uuid) -> Option<Self> {
        let role = conversation.role_of(account_id)?;
        Some(Self {
            id: conversation.id,
            job_id: conversation.job_id,
            other_participant_id: conversation.other_participant(account_id),
            archived: conversation.archived_for(role),
            unread_count: conversation.unread_for(role),
            last_message: conversation.last_message.clone(),
            last_message_time: conversation.last_message_at,
        })
    }
}
