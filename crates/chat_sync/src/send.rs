use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::{
    domain::ConversationId,
    protocol::{AckStatus, ChatMessage, ClientAction, CorrelationId},
};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::transport::Transport;

pub(crate) const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// What the acknowledgement race resolved to, before the registry decides
/// whether the outcome still applies.
#[derive(Debug)]
pub(crate) enum AckOutcome {
    Confirmed(ChatMessage),
    Rejected(String),
    TimedOut,
    Cancelled,
    ChannelLost,
}

struct PendingSend {
    conversation_id: ConversationId,
    cancel_tx: oneshot::Sender<()>,
}

/// Registry of in-flight sends keyed by correlation id. Removing an entry
/// is the linearization point: exactly one of confirm, rollback-on-timeout
/// or rollback-on-teardown wins per correlation id, and a late
/// acknowledgement that finds its entry gone is a no-op.
pub struct SendPipeline {
    registry: Mutex<HashMap<CorrelationId, PendingSend>>,
    ack_timeout: Duration,
}

impl SendPipeline {
    pub fn new() -> Self {
        Self::with_timeout(SEND_ACK_TIMEOUT)
    }

    pub fn with_timeout(ack_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            ack_timeout,
        }
    }

    pub(crate) async fn register(
        &self,
        correlation_id: CorrelationId,
        conversation_id: ConversationId,
    ) -> oneshot::Receiver<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.registry.lock().await.insert(
            correlation_id,
            PendingSend {
                conversation_id,
                cancel_tx,
            },
        );
        cancel_rx
    }

    /// Removes the registry entry, claiming the right to commit the
    /// outcome. Returns false when someone else (teardown) already did.
    pub(crate) async fn claim(&self, correlation_id: CorrelationId) -> bool {
        self.registry.lock().await.remove(&correlation_id).is_some()
    }

    pub(crate) async fn outstanding(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Rolls back every in-flight send: each waiter is woken and rejects
    /// with `Cancelled`. Returns the affected (correlation, conversation)
    /// pairs so the caller can drop the placeholders from the timelines.
    pub(crate) async fn shutdown(&self) -> Vec<(CorrelationId, ConversationId)> {
        let drained: Vec<(CorrelationId, PendingSend)> =
            self.registry.lock().await.drain().collect();
        let mut rolled_back = Vec::with_capacity(drained.len());
        for (correlation_id, entry) in drained {
            let _ = entry.cancel_tx.send(());
            rolled_back.push((correlation_id, entry.conversation_id));
        }
        if !rolled_back.is_empty() {
            info!(count = rolled_back.len(), "send: rolled back in-flight sends on teardown");
        }
        rolled_back
    }

    /// Races the transport acknowledgement against the bounded timer and
    /// the cancellation signal. Does not touch the registry or any
    /// timeline; the caller claims the entry and commits the result.
    pub(crate) async fn await_ack(
        &self,
        transport: &Arc<dyn Transport>,
        action: ClientAction,
        cancel_rx: oneshot::Receiver<()>,
    ) -> AckOutcome {
        tokio::select! {
            ack = transport.request(action) => match ack {
                Ok(ack) if ack.status == AckStatus::Ok => match ack.message {
                    Some(confirmed) => AckOutcome::Confirmed(confirmed),
                    None => AckOutcome::Rejected(
                        "acknowledgement missing confirmed message".to_string(),
                    ),
                },
                Ok(ack) => AckOutcome::Rejected(
                    ack.error.unwrap_or_else(|| "unspecified".to_string()),
                ),
                Err(err) => {
                    warn!("send: channel failed before acknowledgement: {err}");
                    AckOutcome::ChannelLost
                }
            },
            _ = tokio::time::sleep(self.ack_timeout) => AckOutcome::TimedOut,
            _ = cancel_rx => AckOutcome::Cancelled,
        }
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.ack_timeout.as_millis() as u64
    }
}

impl Default for SendPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
