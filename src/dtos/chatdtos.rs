use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::chatmodels::{ConversationFilter, Message, MessageType};

#[derive(Debug, Default, Deserialize)]
pub struct ConversationQuery {
    #[serde(default)]
    pub filter: ConversationFilter,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    pub after: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct MarkReadDto {
    #[validate(range(min = 0, message = "Sequence cannot be negative"))]
    pub upto_sequence: Option<i64>,
}

/// Query of the websocket upgrade: replay everything after `after`.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub after: Option<i64>,
}

/// Client to server frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub frame_type: MessageType,
    pub message: String,
}

impl ClientFrame {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            frame_type: MessageType::Text,
            message: message.into(),
        }
    }
}

/// Server to client frame. `type` tells chat text apart from lifecycle notices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: MessageType,
    pub message: String,
    pub sender_id: Option<Uuid>,
    pub sender_name: String,
    pub created_at: DateTime<Utc>,
    pub message_id: Uuid,
    pub sequence: i64,
}

impl From<&Message> for ServerFrame {
    fn from(message: &Message) -> Self {
        Self {
            frame_type: message.message_type,
            message: message.body.clone(),
            sender_id: message.sender_id,
            sender_name: message.sender_name.clone(),
            created_at: message.created_at,
            message_id: message.id,
            sequence: message.sequence,
        }
    }
}
