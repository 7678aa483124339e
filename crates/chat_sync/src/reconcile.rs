use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ChatMessage, CorrelationId, MessagePage, PageCursor},
};

/// Window for the fallback de-duplication path that matches a confirmed
/// record against a pending one by (sender, body, timestamp proximity) when
/// the pull side delivered it without the original correlation id.
///
/// Deliberate trade-off carried over from the behavior this reimplements:
/// two genuinely distinct rapid-fire identical sends can coalesce on this
/// path. Correlation ids are always exact-matched first and never coalesce.
pub const DEDUP_TOLERANCE_MS: i64 = 3_000;

/// Where a batch came from. The merge rules are the same for all three;
/// the source matters to the caller (cursor handling, summary derivation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSource {
    Push,
    Pull,
    Optimistic,
}

/// Identity of a timeline record: the authoritative server id when one is
/// known, otherwise the provisional correlation id minted at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Pending(CorrelationId),
}

/// One record of the visible message sequence. `server_id` is `None` for an
/// optimistic insert that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineMessage {
    pub server_id: Option<MessageId>,
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl TimelineMessage {
    pub fn confirmed(message: &ChatMessage) -> Self {
        Self {
            server_id: Some(message.message_id),
            correlation_id: message.correlation_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body.clone(),
            sent_at: message.sent_at,
            read: message.read,
            read_at: message.read_at,
        }
    }

    pub fn pending(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: impl Into<String>,
        correlation_id: CorrelationId,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            server_id: None,
            correlation_id: Some(correlation_id),
            conversation_id,
            sender_id,
            body: body.into(),
            sent_at,
            read: false,
            read_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.server_id.is_none()
    }

    /// `None` only for a record with neither identity, which the
    /// constructors cannot produce; merge skips such records so it stays
    /// total over any well-typed input.
    pub fn key(&self) -> Option<MessageKey> {
        match (self.server_id, self.correlation_id) {
            (Some(id), _) => Some(MessageKey::Server(id)),
            (None, Some(corr)) => Some(MessageKey::Pending(corr)),
            (None, None) => None,
        }
    }
}

fn within_tolerance(a: DateTime<Utc>, b: DateTime<Utc>, tolerance_ms: i64) -> bool {
    (a - b).num_milliseconds().abs() <= tolerance_ms
}

/// Merges an incoming batch into an existing sequence at the default
/// tolerance. Pure and idempotent: merging the same batch twice produces
/// the same result as merging it once. The result is sorted
/// non-decreasingly by `sent_at`, ties keeping the order records were
/// first merged in, and contains at most one record per server id and per
/// correlation id.
pub fn merge(
    existing: &[TimelineMessage],
    incoming: &[TimelineMessage],
    source: BatchSource,
) -> Vec<TimelineMessage> {
    merge_with_tolerance(existing, incoming, source, DEDUP_TOLERANCE_MS)
}

pub fn merge_with_tolerance(
    existing: &[TimelineMessage],
    incoming: &[TimelineMessage],
    _source: BatchSource,
    tolerance_ms: i64,
) -> Vec<TimelineMessage> {
    let mut slots: Vec<Option<TimelineMessage>> =
        existing.iter().cloned().map(Some).collect();
    let mut by_key: HashMap<MessageKey, usize> = HashMap::new();
    let mut confirmed_correlations: HashSet<CorrelationId> = HashSet::new();

    for (index, message) in existing.iter().enumerate() {
        if let Some(key) = message.key() {
            by_key.entry(key).or_insert(index);
        }
        if !message.is_pending() {
            if let Some(corr) = message.correlation_id {
                confirmed_correlations.insert(corr);
            }
        }
    }

    for incoming_message in incoming {
        let Some(key) = incoming_message.key() else {
            continue;
        };

        // Identity collision: the existing record wins, and a re-delivered
        // record must change nothing at all — in particular it must not
        // reach the tolerance scan and consume another placeholder.
        if by_key.contains_key(&key) {
            continue;
        }

        if incoming_message.is_pending() {
            // An optimistic insert arriving after its confirmation has
            // already been merged must not resurrect the placeholder.
            if incoming_message
                .correlation_id
                .is_some_and(|corr| confirmed_correlations.contains(&corr))
            {
                continue;
            }
        } else {
            // A confirmed record supersedes its placeholder: exact
            // correlation match first, timestamp-proximity fallback second.
            match incoming_message.correlation_id {
                Some(corr) => {
                    if let Some(index) = by_key.remove(&MessageKey::Pending(corr)) {
                        slots[index] = None;
                    }
                    confirmed_correlations.insert(corr);
                }
                None => {
                    let victim = slots.iter().position(|slot| {
                        slot.as_ref().is_some_and(|candidate| {
                            candidate.is_pending()
                                && candidate.sender_id == incoming_message.sender_id
                                && candidate.body == incoming_message.body
                                && within_tolerance(
                                    candidate.sent_at,
                                    incoming_message.sent_at,
                                    tolerance_ms,
                                )
                        })
                    });
                    if let Some(index) = victim {
                        if let Some(victim_key) =
                            slots[index].as_ref().and_then(TimelineMessage::key)
                        {
                            by_key.remove(&victim_key);
                        }
                        slots[index] = None;
                    }
                }
            }
        }

        slots.push(Some(incoming_message.clone()));
        by_key.insert(key, slots.len() - 1);
    }

    let mut result: Vec<TimelineMessage> = slots.into_iter().flatten().collect();
    // Stable: ties keep merge order, so the display never reshuffles.
    result.sort_by_key(|message| message.sent_at);
    result
}

/// How a pull page relates to the cursor: paginating fetches ran at the
/// stored cursor and advance it; refresh fetches re-read the newest page
/// and must leave the oldest-loaded boundary alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullKind {
    Paginate,
    Refresh,
}

/// Per-conversation message cache. The reconciler is its only writer: push,
/// pull and optimistic producers all submit batches, and the owning client
/// commits the merged result under one lock.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub messages: Vec<TimelineMessage>,
    pub cursor: Option<PageCursor>,
    pub has_more: bool,
    dedup_tolerance_ms: i64,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::with_tolerance(DEDUP_TOLERANCE_MS)
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(dedup_tolerance_ms: i64) -> Self {
        Self {
            messages: Vec::new(),
            cursor: None,
            has_more: false,
            dedup_tolerance_ms,
        }
    }

    pub fn apply_push(&mut self, message: &ChatMessage) {
        self.messages = merge_with_tolerance(
            &self.messages,
            &[TimelineMessage::confirmed(message)],
            BatchSource::Push,
            self.dedup_tolerance_ms,
        );
    }

    pub fn apply_pull(&mut self, page: &MessagePage, kind: PullKind) {
        let batch: Vec<TimelineMessage> =
            page.messages.iter().map(TimelineMessage::confirmed).collect();
        self.messages = merge_with_tolerance(
            &self.messages,
            &batch,
            BatchSource::Pull,
            self.dedup_tolerance_ms,
        );
        // Push events only append; the cursor moves on pull fetches alone,
        // and a refresh never regresses the oldest-loaded boundary.
        if kind == PullKind::Paginate || self.cursor.is_none() {
            self.cursor = page.next_cursor.clone();
            self.has_more = page.has_more;
        }
    }

    pub fn insert_pending(&mut self, pending: TimelineMessage) {
        self.messages = merge_with_tolerance(
            &self.messages,
            &[pending],
            BatchSource::Optimistic,
            self.dedup_tolerance_ms,
        );
    }

    pub fn remove_pending(&mut self, correlation_id: CorrelationId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| {
            !(message.is_pending() && message.correlation_id == Some(correlation_id))
        });
        self.messages.len() != before
    }

    /// Replaces the placeholder with the confirmed record at the same
    /// timeline position.
    pub fn promote_pending(&mut self, correlation_id: CorrelationId, confirmed: &ChatMessage) {
        let slot = self.messages.iter_mut().find(|message| {
            message.is_pending() && message.correlation_id == Some(correlation_id)
        });
        match slot {
            Some(slot) => *slot = TimelineMessage::confirmed(confirmed),
            // Placeholder already superseded (e.g. the push echo landed
            // first); merging the confirmation is a no-op then.
            None => self.apply_push(confirmed),
        }
    }

    pub fn mark_read(&mut self, message_id: MessageId, read_at: DateTime<Utc>) -> bool {
        let slot = self
            .messages
            .iter_mut()
            .find(|message| message.server_id == Some(message_id));
        match slot {
            Some(message) => {
                message.read = true;
                message.read_at = Some(read_at);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
