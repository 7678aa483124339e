use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{ConversationId, ConversationSummary, MessageId, UserId},
    protocol::{ChatMessage, ClientAction, CorrelationId, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod connection;
pub mod error;
pub mod history;
pub mod polling;
pub mod presence;
pub mod reconcile;
pub mod rooms;
pub mod send;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use error::{SendError, TransportError};
pub use history::{HistoryApi, HttpHistoryApi, MissingHistoryApi};
pub use polling::{PollScheduler, PollTick};
pub use presence::PresenceTracker;
pub use reconcile::{merge, BatchSource, MessageKey, Timeline, TimelineMessage};
pub use rooms::{JoinState, RoomMembership};
pub use send::SendPipeline;
pub use transport::{MissingTransport, Transport, WebSocketTransport};

use connection::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY};
use history::DEFAULT_PAGE_SIZE;
use polling::{CONVERSATION_POLL_INTERVAL, MESSAGE_POLL_INTERVAL};
use presence::{PRESENCE_IDLE_EXPIRY, TYPING_IDLE_EXPIRY};
use reconcile::{PullKind, DEDUP_TOLERANCE_MS};
use send::{AckOutcome, SEND_ACK_TIMEOUT};

const CLIENT_EVENT_CAPACITY: usize = 1024;

/// Tunables for the sync engine. The defaults are the production values;
/// hosts override individual fields for their environment (tests shrink
/// the timeouts, embedded hosts stretch the poll cadence).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ack_timeout: Duration,
    pub message_poll_interval: Duration,
    pub conversation_poll_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub typing_idle_expiry: Duration,
    pub presence_idle_expiry: Duration,
    pub dedup_tolerance_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout: SEND_ACK_TIMEOUT,
            message_poll_interval: MESSAGE_POLL_INTERVAL,
            conversation_poll_interval: CONVERSATION_POLL_INTERVAL,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            reconnect_max_delay: RECONNECT_MAX_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            typing_idle_expiry: TYPING_IDLE_EXPIRY,
            presence_idle_expiry: PRESENCE_IDLE_EXPIRY,
            dedup_tolerance_ms: DEDUP_TOLERANCE_MS,
        }
    }
}

/// Notifications the host UI consumes. The UI only ever reads snapshots
/// through the client; these tell it when a snapshot went stale.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    TimelineUpdated { conversation_id: ConversationId },
    ConversationsUpdated,
    TypingChanged { conversation_id: ConversationId },
    PresenceChanged { conversation_id: ConversationId },
    Error(String),
}

struct ClientState {
    started: bool,
    viewer_id: Option<UserId>,
    active_conversation: Option<ConversationId>,
    timelines: HashMap<ConversationId, Timeline>,
    conversations: HashMap<ConversationId, ConversationSummary>,
    pump_tasks: Vec<JoinHandle<()>>,
}

/// The synchronization engine: one ordered, duplicate-free timeline per
/// conversation, fed by push events, poll pages and optimistic inserts,
/// with at-most-one-delivery send semantics and ephemeral typing/presence.
pub struct ChatSyncClient {
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryApi>,
    connection: Arc<ConnectionManager>,
    rooms: RoomMembership,
    scheduler: PollScheduler,
    sends: SendPipeline,
    presence: Arc<PresenceTracker>,
    config: SyncConfig,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatSyncClient {
    pub fn new(transport: Arc<dyn Transport>, history: Arc<dyn HistoryApi>) -> Arc<Self> {
        Self::with_config(transport, history, SyncConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryApi>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        Arc::new(Self {
            connection: Arc::new(ConnectionManager::with_backoff(
                Arc::clone(&transport),
                config.reconnect_base_delay,
                config.reconnect_max_delay,
                config.max_reconnect_attempts,
            )),
            rooms: RoomMembership::new(Arc::clone(&transport)),
            scheduler: PollScheduler::with_intervals(
                config.message_poll_interval,
                config.conversation_poll_interval,
            ),
            sends: SendPipeline::with_timeout(config.ack_timeout),
            presence: Arc::new(PresenceTracker::with_expiry(
                config.typing_idle_expiry,
                config.presence_idle_expiry,
            )),
            config,
            inner: Mutex::new(ClientState {
                started: false,
                viewer_id: None,
                active_conversation: None,
                timelines: HashMap::new(),
                conversations: HashMap::new(),
                pump_tasks: Vec::new(),
            }),
            events,
            transport,
            history,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Visibility signal from the host view; backgrounding suspends the
    /// poll fallback, foregrounding resumes it immediately.
    pub fn set_foreground(&self, foreground: bool) {
        self.scheduler.set_foreground(foreground);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Timelines are created lazily and inherit the configured dedup
    /// tolerance, so `or_default` would silently lose the override.
    fn timeline_slot<'a>(
        &self,
        inner: &'a mut ClientState,
        conversation_id: ConversationId,
    ) -> &'a mut Timeline {
        inner
            .timelines
            .entry(conversation_id)
            .or_insert_with(|| Timeline::with_tolerance(self.config.dedup_tolerance_ms))
    }

    /// Opens the push channel and primes the conversation list. Connection
    /// failures surface through the state watch, not as errors here.
    pub async fn connect(self: &Arc<Self>, credential: &str, viewer_id: UserId) {
        self.ensure_started().await;
        self.presence.set_viewer(Some(viewer_id)).await;
        {
            let mut inner = self.inner.lock().await;
            inner.viewer_id = Some(viewer_id);
        }
        self.connection.connect(credential).await;
        if let Err(err) = self.refresh_conversations().await {
            self.emit(ClientEvent::Error(format!(
                "initial conversation fetch failed: {err}"
            )));
        }
    }

    /// Tears down the session: every in-flight send is rolled back and its
    /// caller rejected, the active room is left, the channel closed.
    pub async fn disconnect(&self) {
        let rolled_back = self.sends.shutdown().await;
        {
            let mut inner = self.inner.lock().await;
            for (correlation_id, conversation_id) in &rolled_back {
                if let Some(timeline) = inner.timelines.get_mut(conversation_id) {
                    timeline.remove_pending(*correlation_id);
                }
            }
            inner.active_conversation = None;
            inner.viewer_id = None;
        }
        for (_, conversation_id) in rolled_back {
            self.emit(ClientEvent::TimelineUpdated { conversation_id });
        }
        self.rooms.leave_active().await;
        self.scheduler.set_enabled(false);
        self.presence.set_viewer(None).await;
        self.connection.disconnect().await;
    }

    /// Permanent teardown: disconnects and stops the background pumps. A
    /// client is not reusable afterwards; `disconnect` alone keeps it ready
    /// for a later `connect`.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        let mut inner = self.inner.lock().await;
        for task in inner.pump_tasks.drain(..) {
            task.abort();
        }
    }

    /// Switches the viewed conversation: leaves the previous room, clears
    /// its ephemeral state, joins the new room (join failure degrades to
    /// polling, it never blocks history) and primes the history page.
    pub async fn select_conversation(self: &Arc<Self>, next: Option<ConversationId>) {
        self.ensure_started().await;
        let previous = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut inner.active_conversation, next)
        };

        if let Some(previous) = previous {
            self.presence.clear_conversation(previous).await;
        }
        self.rooms.leave_active().await;
        self.scheduler.set_enabled(next.is_some());

        let Some(conversation_id) = next else {
            return;
        };

        if self.connection.is_connected() {
            let join = self.rooms.join(conversation_id).await;
            if !join.joined {
                info!(
                    conversation_id = conversation_id.0,
                    "sync: no realtime delivery for conversation, poll fallback active"
                );
            }
        }

        if let Err(err) = self.pull_messages(conversation_id, PullKind::Refresh).await {
            self.emit(ClientEvent::Error(format!(
                "history fetch failed for conversation {}: {err}",
                conversation_id.0
            )));
        }
    }

    /// Optimistic send with a bounded acknowledgement. Fails fast with
    /// `TransportUnavailable` before inserting anything when no channel is
    /// usable; the caller then takes the request/response fallback path.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        body: &str,
    ) -> Result<ChatMessage, SendError> {
        if !self.transport.is_open() {
            return Err(SendError::TransportUnavailable);
        }
        let sender_id = {
            let inner = self.inner.lock().await;
            inner.viewer_id.ok_or(SendError::TransportUnavailable)?
        };

        let correlation_id = CorrelationId::new();
        let pending = TimelineMessage::pending(
            conversation_id,
            sender_id,
            body,
            correlation_id,
            Utc::now(),
        );
        {
            let mut inner = self.inner.lock().await;
            self.timeline_slot(&mut inner, conversation_id)
                .insert_pending(pending);
        }
        self.emit(ClientEvent::TimelineUpdated { conversation_id });

        let cancel_rx = self.sends.register(correlation_id, conversation_id).await;
        let outcome = self
            .sends
            .await_ack(
                &self.transport,
                ClientAction::SendMessage {
                    conversation_id,
                    correlation_id,
                    body: body.to_string(),
                },
                cancel_rx,
            )
            .await;

        // Exactly one outcome per correlation id: whoever removes the
        // registry entry commits it. A lost claim means teardown already
        // rolled the placeholder back.
        if !self.sends.claim(correlation_id).await {
            return Err(SendError::Cancelled);
        }

        match outcome {
            AckOutcome::Confirmed(confirmed) => {
                {
                    let mut inner = self.inner.lock().await;
                    self.timeline_slot(&mut inner, conversation_id)
                        .promote_pending(correlation_id, &confirmed);
                    Self::update_summary(&mut inner, &confirmed);
                }
                self.emit(ClientEvent::TimelineUpdated { conversation_id });
                Ok(confirmed)
            }
            AckOutcome::Rejected(reason) => {
                self.rollback_pending(conversation_id, correlation_id).await;
                Err(SendError::AckRejected(reason))
            }
            AckOutcome::TimedOut => {
                warn!(
                    conversation_id = conversation_id.0,
                    correlation_id = %correlation_id,
                    "sync: send acknowledgement timed out, rolling back"
                );
                self.rollback_pending(conversation_id, correlation_id).await;
                Err(SendError::AckTimeout(self.sends.timeout_ms()))
            }
            AckOutcome::Cancelled => {
                self.rollback_pending(conversation_id, correlation_id).await;
                Err(SendError::Cancelled)
            }
            AckOutcome::ChannelLost => {
                self.rollback_pending(conversation_id, correlation_id).await;
                Err(SendError::TransportUnavailable)
            }
        }
    }

    async fn rollback_pending(&self, conversation_id: ConversationId, corr: CorrelationId) {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner
                .timelines
                .get_mut(&conversation_id)
                .map(|timeline| timeline.remove_pending(corr))
                .unwrap_or(false)
        };
        if removed {
            self.emit(ClientEvent::TimelineUpdated { conversation_id });
        }
    }

    /// Marks a message read: best-effort notification over the channel plus
    /// an immediate local commit.
    pub async fn mark_read(&self, conversation_id: ConversationId, message_id: MessageId) {
        if self.transport.is_open() {
            if let Err(err) = self
                .transport
                .fire(ClientAction::MarkRead {
                    conversation_id,
                    message_id,
                })
                .await
            {
                warn!(
                    conversation_id = conversation_id.0,
                    "sync: mark-read not delivered: {err}"
                );
            }
        }
        {
            let mut inner = self.inner.lock().await;
            if let Some(timeline) = inner.timelines.get_mut(&conversation_id) {
                timeline.mark_read(message_id, Utc::now());
            }
            if let Some(summary) = inner.conversations.get_mut(&conversation_id) {
                summary.unread_count = 0;
            }
        }
        self.emit(ClientEvent::TimelineUpdated { conversation_id });
        self.emit(ClientEvent::ConversationsUpdated);
    }

    pub async fn notify_typing(&self, conversation_id: ConversationId, typing: bool) {
        if !self.transport.is_open() {
            return;
        }
        let action = if typing {
            ClientAction::TypingStart { conversation_id }
        } else {
            ClientAction::TypingStop { conversation_id }
        };
        if let Err(err) = self.transport.fire(action).await {
            warn!(
                conversation_id = conversation_id.0,
                "sync: typing signal not delivered: {err}"
            );
        }
    }

    /// Pulls one older page at the stored cursor.
    pub async fn load_older(&self, conversation_id: ConversationId) -> anyhow::Result<()> {
        let has_more = {
            let inner = self.inner.lock().await;
            inner
                .timelines
                .get(&conversation_id)
                .map(|timeline| timeline.has_more)
                .unwrap_or(true)
        };
        if !has_more {
            return Ok(());
        }
        self.pull_messages(conversation_id, PullKind::Paginate).await
    }

    async fn pull_messages(
        &self,
        conversation_id: ConversationId,
        kind: PullKind,
    ) -> anyhow::Result<()> {
        let cursor = match kind {
            PullKind::Paginate => {
                let inner = self.inner.lock().await;
                inner
                    .timelines
                    .get(&conversation_id)
                    .and_then(|timeline| timeline.cursor.clone())
            }
            PullKind::Refresh => None,
        };
        let page = self
            .history
            .fetch_messages(conversation_id, cursor, DEFAULT_PAGE_SIZE)
            .await?;
        {
            let mut inner = self.inner.lock().await;
            self.timeline_slot(&mut inner, conversation_id)
                .apply_pull(&page, kind);
        }
        self.emit(ClientEvent::TimelineUpdated { conversation_id });
        Ok(())
    }

    pub async fn refresh_conversations(&self) -> anyhow::Result<()> {
        let summaries = self.history.list_conversations().await?;
        {
            let mut inner = self.inner.lock().await;
            inner.conversations.clear();
            for summary in summaries {
                inner.conversations.insert(summary.conversation_id, summary);
            }
        }
        self.emit(ClientEvent::ConversationsUpdated);
        Ok(())
    }

    pub async fn timeline(&self, conversation_id: ConversationId) -> Vec<TimelineMessage> {
        let inner = self.inner.lock().await;
        inner
            .timelines
            .get(&conversation_id)
            .map(|timeline| timeline.messages.clone())
            .unwrap_or_default()
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let inner = self.inner.lock().await;
        let mut summaries: Vec<ConversationSummary> =
            inner.conversations.values().cloned().collect();
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        summaries
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.presence.typing_users(conversation_id).await
    }

    pub async fn online_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.presence.online_users(conversation_id).await
    }

    async fn ensure_started(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return;
        }
        inner.started = true;
        let mut tasks = Vec::new();
        tasks.push(self.spawn_push_pump());
        tasks.extend(self.spawn_poll_pump());
        tasks.push(self.spawn_state_pump());
        tasks.push(self.presence.spawn_sweeper(self.events.clone()));
        inner.pump_tasks = tasks;
    }

    fn spawn_push_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut rx = self.transport.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => client.handle_server_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: push pump lagged, poll fallback will backfill");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_poll_pump(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let (mut ticks, scheduler_task) = self.scheduler.run();
        let client = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                client.run_pull(tick).await;
            }
        });
        vec![scheduler_task, pump]
    }

    fn spawn_state_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut state_rx = self.connection.watch_state();
        tokio::spawn(async move {
            let mut previous = *state_rx.borrow();
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                client.emit(ClientEvent::ConnectionChanged(state));
                // A reconnected channel carries no room membership; the
                // server forgot the join when the old channel died.
                if state == ConnectionState::Connected && previous != ConnectionState::Connected {
                    client.rejoin_active_room().await;
                }
                previous = state;
            }
        })
    }

    /// Re-establishes the room join and refreshes the visible history after
    /// the channel comes back. Join failure degrades to polling as usual.
    async fn rejoin_active_room(self: &Arc<Self>) {
        let active = {
            let inner = self.inner.lock().await;
            inner.active_conversation
        };
        let Some(conversation_id) = active else {
            return;
        };
        let join = self.rooms.join(conversation_id).await;
        if !join.joined {
            info!(
                conversation_id = conversation_id.0,
                "sync: rejoin after reconnect not confirmed, poll fallback active"
            );
        }
        if let Err(err) = self.pull_messages(conversation_id, PullKind::Refresh).await {
            warn!(
                conversation_id = conversation_id.0,
                "sync: backfill after reconnect failed: {err}"
            );
        }
    }

    async fn run_pull(self: &Arc<Self>, tick: PollTick) {
        // The reader task drops the open flag when the channel dies; the
        // poll cadence is where the connection manager finds out.
        if self.connection.is_connected() && !self.transport.is_open() {
            self.connection.handle_channel_loss().await;
        }

        match tick {
            PollTick::Messages => {
                let active = {
                    let inner = self.inner.lock().await;
                    inner.active_conversation
                };
                let Some(conversation_id) = active else {
                    return;
                };
                if let Err(err) = self.pull_messages(conversation_id, PullKind::Refresh).await {
                    warn!(
                        conversation_id = conversation_id.0,
                        "sync: message poll failed: {err}"
                    );
                }
            }
            PollTick::Conversations => {
                if let Err(err) = self.refresh_conversations().await {
                    warn!("sync: conversation poll failed: {err}");
                }
            }
        }
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message } => {
                let conversation_id = message.conversation_id;
                {
                    let mut inner = self.inner.lock().await;
                    self.timeline_slot(&mut inner, conversation_id)
                        .apply_push(&message);
                    Self::update_summary(&mut inner, &message);
                }
                self.emit(ClientEvent::TimelineUpdated { conversation_id });
                self.emit(ClientEvent::ConversationsUpdated);
            }
            ServerEvent::MessageRead {
                conversation_id,
                message_id,
                reader_id,
                read_at,
            } => {
                let changed = {
                    let mut inner = self.inner.lock().await;
                    inner
                        .timelines
                        .get_mut(&conversation_id)
                        .map(|timeline| timeline.mark_read(message_id, read_at))
                        .unwrap_or(false)
                };
                if changed {
                    info!(
                        conversation_id = conversation_id.0,
                        reader_id = reader_id.0,
                        "sync: read receipt applied"
                    );
                    self.emit(ClientEvent::TimelineUpdated { conversation_id });
                }
            }
            ServerEvent::ConversationUpdated { summary } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.conversations.insert(summary.conversation_id, summary);
                }
                self.emit(ClientEvent::ConversationsUpdated);
            }
            ServerEvent::TypingStarted {
                conversation_id,
                user_id,
            } => {
                self.presence.note_typing_started(conversation_id, user_id).await;
                self.emit(ClientEvent::TypingChanged { conversation_id });
            }
            ServerEvent::TypingStopped {
                conversation_id,
                user_id,
            } => {
                self.presence.note_typing_stopped(conversation_id, user_id).await;
                self.emit(ClientEvent::TypingChanged { conversation_id });
            }
            ServerEvent::PresenceOnline { user_id } => {
                // Presence arrives room-scoped; only one room is ever joined.
                let active = {
                    let inner = self.inner.lock().await;
                    inner.active_conversation
                };
                if let Some(conversation_id) = active {
                    self.presence.note_online(conversation_id, user_id).await;
                    self.emit(ClientEvent::PresenceChanged { conversation_id });
                }
            }
            ServerEvent::PresenceOffline { user_id } => {
                let active = {
                    let inner = self.inner.lock().await;
                    inner.active_conversation
                };
                if let Some(conversation_id) = active {
                    self.presence.note_offline(conversation_id, user_id).await;
                    self.emit(ClientEvent::PresenceChanged { conversation_id });
                }
            }
            ServerEvent::Error(api_error) => {
                self.emit(ClientEvent::Error(api_error.to_string()));
            }
        }
    }

    /// Derives the conversation summary fields this core owns. Summaries
    /// themselves come from the CRUD layer; a message for a conversation we
    /// have no summary for yet is left for the next list poll.
    fn update_summary(inner: &mut ClientState, message: &ChatMessage) {
        let viewer = inner.viewer_id;
        let active = inner.active_conversation;
        if let Some(summary) = inner.conversations.get_mut(&message.conversation_id) {
            summary.last_message_text = Some(message.body.clone());
            summary.last_message_at = Some(message.sent_at);
            let own_message = viewer == Some(message.sender_id);
            let viewing = active == Some(message.conversation_id);
            if !own_message && !viewing {
                summary.unread_count = summary.unread_count.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
