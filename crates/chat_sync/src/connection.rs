use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::transport::Transport;

pub(crate) const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
pub(crate) const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub(crate) const MAX_RECONNECT_ATTEMPTS: u32 = 6;

/// Connectivity as dependents observe it. Transport failures never surface
/// as errors past this module; they collapse into one of these states so
/// the poll path can take over without delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Credential refused; terminal until a new credential is supplied.
    AuthFailed,
    /// Backoff attempts exceeded; treat as transport-unavailable.
    Exhausted,
}

struct ConnectionInner {
    credential: Option<String>,
    reconnect_task: Option<JoinHandle<()>>,
}

/// Owns the duplex channel lifecycle: authenticated connect, exponential
/// backoff reconnection and auth-failure short-circuiting.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    inner: Mutex<ConnectionInner>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_backoff(
            transport,
            RECONNECT_BASE_DELAY,
            RECONNECT_MAX_DELAY,
            MAX_RECONNECT_ATTEMPTS,
        )
    }

    pub fn with_backoff(
        transport: Arc<dyn Transport>,
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            state_tx,
            state_rx,
            inner: Mutex::new(ConnectionInner {
                credential: None,
                reconnect_task: None,
            }),
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connecting
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// State changes are published synchronously, before the call returns,
    /// so dependents switching between push and poll modes never lag.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Opens the channel. A repeat call with the credential already in use
    /// while connected is a no-op; a different credential tears the old
    /// channel down first. All outcomes are reported through the state
    /// watch, never as caller-visible errors.
    pub async fn connect(self: &Arc<Self>, credential: &str) {
        // Decide under the lock, do the channel I/O outside it.
        let teardown_first = {
            let mut inner = self.inner.lock().await;
            let same_credential = inner.credential.as_deref() == Some(credential);
            if same_credential && self.is_connected() {
                return;
            }
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            let teardown_first = !same_credential && inner.credential.is_some();
            inner.credential = Some(credential.to_string());
            teardown_first
        };
        if teardown_first {
            self.transport.close().await;
            self.set_state(ConnectionState::Disconnected);
        }

        self.set_state(ConnectionState::Connecting);
        match self.transport.open(credential).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
            }
            Err(err) if err.is_auth() => {
                // Terminal until a new credential is supplied; never retried.
                warn!("connection: credential rejected: {err}");
                self.transport.close().await;
                self.set_state(ConnectionState::AuthFailed);
            }
            Err(err) => {
                warn!("connection: open failed, scheduling reconnect: {err}");
                self.schedule_reconnect().await;
            }
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut delay = manager.base_delay;
            for attempt in 1..=manager.max_attempts {
                manager.set_state(ConnectionState::Connecting);
                tokio::time::sleep(delay).await;

                let credential = {
                    let inner = manager.inner.lock().await;
                    inner.credential.clone()
                };
                let Some(credential) = credential else {
                    return;
                };

                match manager.transport.open(&credential).await {
                    Ok(()) => {
                        info!(attempt, "connection: reconnected");
                        manager.set_state(ConnectionState::Connected);
                        return;
                    }
                    Err(err) if err.is_auth() => {
                        warn!(attempt, "connection: credential rejected during reconnect: {err}");
                        manager.transport.close().await;
                        manager.set_state(ConnectionState::AuthFailed);
                        return;
                    }
                    Err(err) => {
                        warn!(
                            attempt,
                            max_attempts = manager.max_attempts,
                            "connection: reconnect attempt failed: {err}"
                        );
                    }
                }
                delay = (delay * 2).min(manager.max_delay);
            }
            warn!("connection: reconnect attempts exhausted");
            manager.set_state(ConnectionState::Exhausted);
        });
        self.inner.lock().await.reconnect_task = Some(task);
    }

    /// Idempotent and always safe.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.credential = None;
        }
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Entry point for the push pump when the channel drops out from under
    /// us: begins the same backoff cycle as a failed connect.
    pub async fn handle_channel_loss(self: &Arc<Self>) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        warn!("connection: channel lost, scheduling reconnect");
        self.schedule_reconnect().await;
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
