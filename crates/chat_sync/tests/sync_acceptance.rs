//! End-to-end exercises of the sync client against in-memory backends: a
//! send confirmed over the channel, echoed by push and re-delivered by a
//! poll page must still come out as exactly one timeline record.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chat_sync::{ChatSyncClient, ClientEvent, HistoryApi, SendError, Transport, TransportError};
use chrono::Utc;
use shared::{
    domain::{
        ConversationId, ConversationKind, ConversationSummary, MessageId, Participant,
        ParticipantRole, UserId,
    },
    protocol::{Ack, ChatMessage, ClientAction, MessagePage, PageCursor, ServerEvent},
};
use tokio::sync::{broadcast, Mutex};

const CONV: ConversationId = ConversationId(1);
const VIEWER: UserId = UserId(10);
const PEER: UserId = UserId(20);

struct LoopbackTransport {
    open: AtomicBool,
    confirm_sends: AtomicBool,
    events: broadcast::Sender<ServerEvent>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            open: AtomicBool::new(false),
            confirm_sends: AtomicBool::new(true),
            events,
        })
    }

    fn inject(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, _credential: &str) -> Result<(), TransportError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn request(&self, action: ClientAction) -> Result<Ack, TransportError> {
        match action {
            ClientAction::SendMessage {
                conversation_id,
                correlation_id,
                body,
            } => {
                if !self.confirm_sends.load(Ordering::SeqCst) {
                    return std::future::pending().await;
                }
                let message = ChatMessage {
                    message_id: MessageId(42),
                    conversation_id,
                    sender_id: VIEWER,
                    body,
                    sent_at: Utc::now(),
                    read: false,
                    read_at: None,
                    correlation_id: Some(correlation_id),
                };
                // The room broadcast fires before the ack reaches the
                // sender, like a real fan-out would.
                self.inject(ServerEvent::MessageReceived {
                    message: message.clone(),
                });
                Ok(Ack::ok(Some(message)))
            }
            _ => Ok(Ack::ok(None)),
        }
    }

    async fn fire(&self, _action: ClientAction) -> Result<(), TransportError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

struct ScriptedHistory {
    pages: Mutex<HashMap<ConversationId, MessagePage>>,
}

impl ScriptedHistory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
        })
    }

    async fn set_page(&self, conversation_id: ConversationId, page: MessagePage) {
        self.pages.lock().await.insert(conversation_id, page);
    }
}

#[async_trait]
impl HistoryApi for ScriptedHistory {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        _cursor: Option<PageCursor>,
        _page_size: u32,
    ) -> anyhow::Result<MessagePage> {
        Ok(self
            .pages
            .lock()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or(MessagePage {
                messages: Vec::new(),
                next_cursor: None,
                has_more: false,
            }))
    }

    async fn list_conversations(&self) -> anyhow::Result<Vec<ConversationSummary>> {
        Ok(vec![ConversationSummary {
            conversation_id: CONV,
            kind: ConversationKind::Listing,
            listing_id: None,
            archived: false,
            last_message_text: None,
            last_message_at: None,
            unread_count: 0,
            participants: vec![
                Participant {
                    user_id: VIEWER,
                    role: ParticipantRole::Buyer,
                },
                Participant {
                    user_id: PEER,
                    role: ParticipantRole::Seller,
                },
            ],
        }])
    }
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn peer_message(id: i64, body: &str) -> ChatMessage {
    ChatMessage {
        message_id: MessageId(id),
        conversation_id: CONV,
        sender_id: PEER,
        body: body.to_string(),
        // Well before anything minted during the test run.
        sent_at: Utc::now() - chrono::Duration::seconds(300),
        read: false,
        read_at: None,
        correlation_id: None,
    }
}

#[tokio::test(start_paused = true)]
async fn ack_push_echo_and_poll_page_converge_on_one_record() {
    let transport = LoopbackTransport::new();
    let history = ScriptedHistory::new();
    let client = ChatSyncClient::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&history) as Arc<dyn HistoryApi>,
    );

    client.connect("token", VIEWER).await;
    client.select_conversation(Some(CONV)).await;

    // The send is confirmed and simultaneously echoed by the broadcast.
    let confirmed = client
        .send_message(CONV, "triple delivery")
        .await
        .expect("confirmed send");
    settle().await;

    // The next poll page re-delivers the same record a third time.
    history
        .set_page(
            CONV,
            MessagePage {
                messages: vec![peer_message(7, "earlier"), confirmed.clone()],
                next_cursor: None,
                has_more: false,
            },
        )
        .await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;

    let timeline = client.timeline(CONV).await;
    assert_eq!(timeline.len(), 2, "one echo survives per identity");
    assert_eq!(timeline[0].server_id, Some(MessageId(7)));
    assert_eq!(timeline[1].server_id, Some(confirmed.message_id));
    assert!(timeline.iter().all(|record| !record.is_pending()));
}

#[tokio::test(start_paused = true)]
async fn poll_fallback_backfills_what_push_never_delivered() {
    let transport = LoopbackTransport::new();
    let history = ScriptedHistory::new();
    let client = ChatSyncClient::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&history) as Arc<dyn HistoryApi>,
    );

    client.connect("token", VIEWER).await;
    client.select_conversation(Some(CONV)).await;
    assert!(client.timeline(CONV).await.is_empty());

    history
        .set_page(
            CONV,
            MessagePage {
                messages: vec![peer_message(8, "arrived by poll")],
                next_cursor: None,
                has_more: false,
            },
        )
        .await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;

    let timeline = client.timeline(CONV).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].body, "arrived by poll");
}

#[tokio::test(start_paused = true)]
async fn offline_sends_fail_fast_for_the_caller_to_fall_back() {
    let transport = LoopbackTransport::new();
    let history = ScriptedHistory::new();
    let client = ChatSyncClient::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&history) as Arc<dyn HistoryApi>,
    );

    let err = client.send_message(CONV, "offline").await.unwrap_err();
    assert!(matches!(err, SendError::TransportUnavailable));
    assert!(client.timeline(CONV).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn subscribers_hear_about_timeline_and_connection_changes() {
    let transport = LoopbackTransport::new();
    let history = ScriptedHistory::new();
    let client = ChatSyncClient::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&history) as Arc<dyn HistoryApi>,
    );
    let mut events = client.subscribe_events();

    client.connect("token", VIEWER).await;
    client.select_conversation(Some(CONV)).await;
    transport.inject(ServerEvent::MessageReceived {
        message: peer_message(9, "hello"),
    });
    settle().await;

    let mut saw_connection_change = false;
    let mut saw_timeline_update = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::ConnectionChanged(_) => saw_connection_change = true,
            ClientEvent::TimelineUpdated { conversation_id } => {
                assert_eq!(conversation_id, CONV);
                saw_timeline_update = true;
            }
            _ => {}
        }
    }
    assert!(saw_connection_change);
    assert!(saw_timeline_update);
}
