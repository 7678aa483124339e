use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
};

/// Client-generated identifier attached to an outgoing send so the eventual
/// server-confirmed record can be matched back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Authoritative message record as the server emits it. `message_id` is
/// globally unique and monotonically creation-ordered; `correlation_id` is
/// present only when the server echoes the sender's client id back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientAction {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        body: String,
    },
    MarkRead {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: ChatMessage,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_id: MessageId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    ConversationUpdated {
        summary: crate::domain::ConversationSummary,
    },
    TypingStarted {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    TypingStopped {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    PresenceOnline {
        user_id: UserId,
    },
    PresenceOffline {
        user_id: UserId,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Rejected,
}

/// Result of an acknowledged outbound action. `message` carries the
/// confirmed record for sends; `error` carries the refusal reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok(message: Option<ChatMessage>) -> Self {
        Self {
            status: AckStatus::Ok,
            message,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Rejected,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Opaque page boundary owned by the reconciler; advanced only by
/// successful pull fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<PageCursor>,
    pub has_more: bool,
}
