use std::sync::Arc;

use shared::{domain::ConversationId, protocol::AckStatus, protocol::ClientAction};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::transport::Transport;

/// Outcome of a join attempt. Join failure is a state, not an error: the
/// caller keeps rendering pull-based history and simply goes without
/// realtime delivery for that conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinState {
    pub joined: bool,
}

/// Join/leave acknowledgement protocol, scoped to the one conversation the
/// viewer currently has open.
pub struct RoomMembership {
    transport: Arc<dyn Transport>,
    active: Mutex<Option<ConversationId>>,
}

impl RoomMembership {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            active: Mutex::new(None),
        }
    }

    pub async fn active_room(&self) -> Option<ConversationId> {
        *self.active.lock().await
    }

    /// Joins a conversation room, leaving any previously joined room first.
    /// Resolves `joined = true` only on a positive acknowledgement.
    pub async fn join(&self, conversation_id: ConversationId) -> JoinState {
        self.leave_active().await;

        let ack = self
            .transport
            .request(ClientAction::JoinConversation { conversation_id })
            .await;

        match ack {
            Ok(ack) if ack.status == AckStatus::Ok => {
                info!(conversation_id = conversation_id.0, "room: join acknowledged");
                *self.active.lock().await = Some(conversation_id);
                JoinState { joined: true }
            }
            Ok(ack) => {
                warn!(
                    conversation_id = conversation_id.0,
                    "room: join rejected: {}",
                    ack.error.as_deref().unwrap_or("unspecified")
                );
                JoinState { joined: false }
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    "room: join unavailable: {err}"
                );
                JoinState { joined: false }
            }
        }
    }

    /// Fire-and-forget leave for whichever room is currently joined.
    pub async fn leave_active(&self) {
        let previous = self.active.lock().await.take();
        if let Some(conversation_id) = previous {
            if let Err(err) = self
                .transport
                .fire(ClientAction::LeaveConversation { conversation_id })
                .await
            {
                warn!(
                    conversation_id = conversation_id.0,
                    "room: leave not delivered: {err}"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
