use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use shared::{
    domain::{ConversationId, ConversationSummary},
    protocol::{MessagePage, PageCursor},
};

pub(crate) const DEFAULT_PAGE_SIZE: u32 = 50;

/// Cursor-paginated pull contract backing the poll fallback and history
/// pagination. Consumed only; the CRUD layer behind it has no further
/// obligations than returning typed payloads.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        cursor: Option<PageCursor>,
        page_size: u32,
    ) -> Result<MessagePage>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
}

pub struct MissingHistoryApi;

#[async_trait]
impl HistoryApi for MissingHistoryApi {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        _cursor: Option<PageCursor>,
        _page_size: u32,
    ) -> Result<MessagePage> {
        Err(anyhow!(
            "history backend unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("history backend unavailable"))
    }
}

#[derive(Serialize)]
struct FetchMessagesQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    page_size: u32,
}

/// HTTP rendition of the pull contract. Carries the bearer credential in a
/// header because the pull endpoint sits behind the same token the duplex
/// channel uses, not the CRUD layer's cookie session.
pub struct HttpHistoryApi {
    http: reqwest::Client,
    base_url: String,
    credential: String,
}

impl HttpHistoryApi {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credential: credential.into(),
        }
    }
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        cursor: Option<PageCursor>,
        page_size: u32,
    ) -> Result<MessagePage> {
        let page_size = page_size.clamp(1, 100);
        let page: MessagePage = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id.0
            ))
            .bearer_auth(&self.credential)
            .query(&FetchMessagesQuery {
                cursor: cursor.map(|cursor| cursor.0),
                page_size,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let summaries: Vec<ConversationSummary> = self
            .http
            .get(format!("{}/conversations", self.base_url))
            .bearer_auth(&self.credential)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(summaries)
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
