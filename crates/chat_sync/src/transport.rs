use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::protocol::{Ack, ClientAction, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::error::{is_auth_error_message, TransportError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The duplex channel capability the sync core depends on. One process-wide
/// instance is constructed at startup and injected; components never reach
/// for ambient connection state.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the channel with a bearer credential. The credential is carried
    /// in the handshake itself because cross-origin deployments may not
    /// forward cookies to the duplex channel.
    async fn open(&self, credential: &str) -> Result<(), TransportError>;

    /// Idempotent teardown.
    async fn close(&self);

    fn is_open(&self) -> bool;

    /// Dispatches an action that expects an acknowledgement.
    async fn request(&self, action: ClientAction) -> Result<Ack, TransportError>;

    /// Dispatches a fire-and-forget action.
    async fn fire(&self, action: ClientAction) -> Result<(), TransportError>;

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Fallback used when no real channel has been wired up. Every dispatch
/// reports [`TransportError::Unavailable`] so callers drop to the poll path.
pub struct MissingTransport {
    events: broadcast::Sender<ServerEvent>,
}

impl MissingTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MissingTransport {
    async fn open(&self, _credential: &str) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn close(&self) {}

    fn is_open(&self) -> bool {
        false
    }

    async fn request(&self, _action: ClientAction) -> Result<Ack, TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn fire(&self, _action: ClientAction) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ActionFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<u64>,
    #[serde(flatten)]
    action: ClientAction,
}

#[derive(Debug, Serialize, Deserialize)]
struct AckFrame {
    request_id: u64,
    #[serde(flatten)]
    ack: Ack,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Ack(AckFrame),
    Event(ServerEvent),
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct WsSession {
    writer: WsSink,
    reader_task: JoinHandle<()>,
}

/// Websocket rendition of [`Transport`]. Acknowledged actions carry a `u64`
/// request id; the reader task routes matching ack frames back to a pending
/// map and broadcasts everything else as typed server events.
pub struct WebSocketTransport {
    server_url: String,
    events: broadcast::Sender<ServerEvent>,
    session: Mutex<Option<WsSession>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Ack>>>>,
    open: Arc<AtomicBool>,
    next_request_id: AtomicU64,
}

impl WebSocketTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            server_url: server_url.into(),
            events,
            session: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            open: Arc::new(AtomicBool::new(false)),
            next_request_id: AtomicU64::new(1),
        }
    }

    fn ws_url(&self, credential: &str) -> Result<String, TransportError> {
        let base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(TransportError::Protocol(
                "server_url must start with http:// or https://".to_string(),
            ));
        };
        let mut url = url::Url::parse(&format!("{base}/ws"))
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        url.query_pairs_mut().append_pair("token", credential);
        Ok(url.into())
    }

    async fn dispatch(&self, frame: ActionFrame) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(&frame).map_err(|err| TransportError::Protocol(err.to_string()))?;
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(TransportError::Unavailable)?;
        session
            .writer
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn fail_pending(pending: &Mutex<HashMap<u64, oneshot::Sender<Ack>>>) {
        // Dropping the senders wakes every waiter with a channel error,
        // which the request path maps to TransportError::Closed.
        pending.lock().await.clear();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, credential: &str) -> Result<(), TransportError> {
        self.close().await;

        let ws_url = self.ws_url(credential)?;
        let (stream, _) = connect_async(&ws_url).await.map_err(|err| match &err {
            tungstenite::Error::Http(response)
                if response.status() == 401 || response.status() == 403 =>
            {
                TransportError::AuthRejected(response.status().to_string())
            }
            other if is_auth_error_message(&other.to_string()) => {
                TransportError::AuthRejected(other.to_string())
            }
            _ => TransportError::Io(err.to_string()),
        })?;
        let (writer, mut reader) = stream.split();

        let events = self.events.clone();
        let pending = Arc::clone(&self.pending);
        let open = Arc::clone(&self.open);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(&text) {
                        Ok(InboundFrame::Ack(ack_frame)) => {
                            let waiter = pending.lock().await.remove(&ack_frame.request_id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(ack_frame.ack);
                                }
                                // Late ack for a request that already timed
                                // out; the registry entry is gone, so drop it.
                                None => {
                                    info!(
                                        request_id = ack_frame.request_id,
                                        "transport: dropping unmatched ack"
                                    );
                                }
                            }
                        }
                        Ok(InboundFrame::Event(event)) => {
                            let _ = events.send(event);
                        }
                        Err(err) => {
                            warn!("transport: invalid inbound frame: {err}");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: receive failed: {err}");
                        break;
                    }
                }
            }
            open.store(false, Ordering::SeqCst);
            Self::fail_pending(&pending).await;
        });

        *self.session.lock().await = Some(WsSession {
            writer,
            reader_task,
        });
        self.open.store(true, Ordering::SeqCst);
        info!("transport: channel open");
        Ok(())
    }

    async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            let _ = session.writer.close().await;
            session.reader_task.abort();
        }
        self.open.store(false, Ordering::SeqCst);
        Self::fail_pending(&self.pending).await;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn request(&self, action: ClientAction) -> Result<Ack, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Unavailable);
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if let Err(err) = self
            .dispatch(ActionFrame {
                request_id: Some(request_id),
                action,
            })
            .await
        {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn fire(&self, action: ClientAction) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Unavailable);
        }
        self.dispatch(ActionFrame {
            request_id: None,
            action,
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
