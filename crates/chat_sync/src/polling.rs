use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tracing::info;

pub(crate) const MESSAGE_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub(crate) const CONVERSATION_POLL_INTERVAL: Duration = Duration::from_secs(15);

const TICK_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTick {
    /// Re-fetch the active conversation's newest message page.
    Messages,
    /// Re-fetch the conversation list.
    Conversations,
}

/// Pure timing source for the pull path. It never fetches or merges; it
/// only tells the reconciler's pull path when to run. Ticks flow only while
/// the host view is foregrounded; message ticks additionally require a
/// conversation to be selected.
pub struct PollScheduler {
    foreground_tx: watch::Sender<bool>,
    enabled_tx: watch::Sender<bool>,
    message_interval: Duration,
    conversation_interval: Duration,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::with_intervals(MESSAGE_POLL_INTERVAL, CONVERSATION_POLL_INTERVAL)
    }

    pub fn with_intervals(message_interval: Duration, conversation_interval: Duration) -> Self {
        let (foreground_tx, _) = watch::channel(true);
        let (enabled_tx, _) = watch::channel(false);
        Self {
            foreground_tx,
            enabled_tx,
            message_interval,
            conversation_interval,
        }
    }

    /// Visibility signal. Backgrounding suspends all polling within one
    /// tick; foregrounding resumes immediately with a leading tick.
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground_tx.send_replace(foreground);
    }

    /// Whether a conversation is selected and its page should be polled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled_tx.send_replace(enabled);
    }

    /// Spawns the tick loop. Dropping the receiver stops it.
    pub fn run(&self) -> (mpsc::Receiver<PollTick>, JoinHandle<()>) {
        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let mut foreground = self.foreground_tx.subscribe();
        let mut enabled = self.enabled_tx.subscribe();
        let message_interval = self.message_interval;
        let conversation_interval = self.conversation_interval;

        let task = tokio::spawn(async move {
            loop {
                while !*foreground.borrow() {
                    if foreground.changed().await.is_err() {
                        return;
                    }
                }

                // Leading ticks: returning to foreground must not wait for
                // the next interval boundary.
                if tick_tx.send(PollTick::Conversations).await.is_err() {
                    return;
                }
                if *enabled.borrow() && tick_tx.send(PollTick::Messages).await.is_err() {
                    return;
                }

                let start = Instant::now();
                let mut messages = interval_at(start + message_interval, message_interval);
                let mut conversations =
                    interval_at(start + conversation_interval, conversation_interval);

                loop {
                    tokio::select! {
                        _ = messages.tick() => {
                            if *enabled.borrow()
                                && tick_tx.send(PollTick::Messages).await.is_err()
                            {
                                return;
                            }
                        }
                        _ = conversations.tick() => {
                            if tick_tx.send(PollTick::Conversations).await.is_err() {
                                return;
                            }
                        }
                        changed = foreground.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if !*foreground.borrow() {
                                info!("polling: suspended while backgrounded");
                                break;
                            }
                        }
                        changed = enabled.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        (tick_rx, task)
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/polling_tests.rs"]
mod tests;
