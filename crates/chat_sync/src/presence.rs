use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::domain::{ConversationId, UserId};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::info;

use crate::ClientEvent;

pub(crate) const TYPING_IDLE_EXPIRY: Duration = Duration::from_secs(6);
pub(crate) const PRESENCE_IDLE_EXPIRY: Duration = Duration::from_secs(45);

const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone, Copy)]
struct EphemeralEntry {
    typing_until: Option<Instant>,
    online_until: Option<Instant>,
}

impl EphemeralEntry {
    fn is_dead(&self, now: Instant) -> bool {
        !active(self.typing_until, now) && !active(self.online_until, now)
    }
}

fn active(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|until| until > now)
}

/// Single arena for all ephemeral typing/presence state, keyed by
/// (conversation, user). Each push event of the matching kind restarts that
/// user's idle countdown; with no refresh the flag flips inactive exactly
/// at the deadline. Memory only: never persisted, never reconciled with
/// pull data (the pull path carries no presence), cleared when the viewer
/// switches conversations.
pub struct PresenceTracker {
    entries: Mutex<HashMap<(ConversationId, UserId), EphemeralEntry>>,
    viewer: Mutex<Option<UserId>>,
    typing_expiry: Duration,
    presence_expiry: Duration,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_expiry(TYPING_IDLE_EXPIRY, PRESENCE_IDLE_EXPIRY)
    }

    pub fn with_expiry(typing_expiry: Duration, presence_expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            viewer: Mutex::new(None),
            typing_expiry,
            presence_expiry,
        }
    }

    /// The viewer's own user id never populates the sets.
    pub async fn set_viewer(&self, viewer: Option<UserId>) {
        *self.viewer.lock().await = viewer;
    }

    async fn is_viewer(&self, user_id: UserId) -> bool {
        *self.viewer.lock().await == Some(user_id)
    }

    pub async fn note_typing_started(&self, conversation_id: ConversationId, user_id: UserId) {
        if self.is_viewer(user_id).await {
            return;
        }
        let mut entries = self.entries.lock().await;
        let entry = entries.entry((conversation_id, user_id)).or_default();
        entry.typing_until = Some(Instant::now() + self.typing_expiry);
    }

    pub async fn note_typing_stopped(&self, conversation_id: ConversationId, user_id: UserId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&(conversation_id, user_id)) {
            entry.typing_until = None;
            if entry.is_dead(Instant::now()) {
                entries.remove(&(conversation_id, user_id));
            }
        }
    }

    pub async fn note_online(&self, conversation_id: ConversationId, user_id: UserId) {
        if self.is_viewer(user_id).await {
            return;
        }
        let mut entries = self.entries.lock().await;
        let entry = entries.entry((conversation_id, user_id)).or_default();
        entry.online_until = Some(Instant::now() + self.presence_expiry);
    }

    pub async fn note_offline(&self, conversation_id: ConversationId, user_id: UserId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&(conversation_id, user_id)) {
            entry.online_until = None;
            if entry.is_dead(Instant::now()) {
                entries.remove(&(conversation_id, user_id));
            }
        }
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .iter()
            .filter(|((conversation, _), entry)| {
                *conversation == conversation_id && active(entry.typing_until, now)
            })
            .map(|((_, user_id), _)| *user_id)
            .collect()
    }

    pub async fn online_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .iter()
            .filter(|((conversation, _), entry)| {
                *conversation == conversation_id && active(entry.online_until, now)
            })
            .map(|((_, user_id), _)| *user_id)
            .collect()
    }

    /// Drops everything scoped to a conversation when the viewer leaves it.
    pub async fn clear_conversation(&self, conversation_id: ConversationId) {
        self.entries
            .lock()
            .await
            .retain(|(conversation, _), _| *conversation != conversation_id);
    }

    /// Prunes entries past their deadlines and announces the conversations
    /// whose visible state changed. Reads stay exact regardless; the sweep
    /// exists so subscribers hear about expiry without polling.
    pub(crate) fn spawn_sweeper(
        self: &Arc<Self>,
        events: broadcast::Sender<ClientEvent>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut typing_changed = Vec::new();
                let mut presence_changed = Vec::new();
                {
                    let mut entries = tracker.entries.lock().await;
                    entries.retain(|(conversation_id, _), entry| {
                        if entry.typing_until.is_some() && !active(entry.typing_until, now) {
                            entry.typing_until = None;
                            typing_changed.push(*conversation_id);
                        }
                        if entry.online_until.is_some() && !active(entry.online_until, now) {
                            entry.online_until = None;
                            presence_changed.push(*conversation_id);
                        }
                        !entry.is_dead(now)
                    });
                }
                typing_changed.dedup();
                presence_changed.dedup();
                for conversation_id in typing_changed {
                    info!(conversation_id = conversation_id.0, "presence: typing expired");
                    let _ = events.send(ClientEvent::TypingChanged { conversation_id });
                }
                for conversation_id in presence_changed {
                    let _ = events.send(ClientEvent::PresenceChanged { conversation_id });
                }
            }
        })
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
