//! PostgREST-style gateway for a hosted Postgres store.
//!
//! Speaks the Supabase REST dialect: table endpoints under `/rest/v1/`,
//! `eq.`/`gte.` filters in the query string, `order=` and `limit=` for
//! shaping, and `Prefer: return=representation` when the inserted row is
//! needed back.

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::{debug, warn};
use url::Url;

use crate::core::agents::AgentTag;
use crate::core::config::PersistenceConfig;
use crate::core::ids::ConversationId;
use crate::core::message::{ChatMessage, ChatRole};

use super::gateway::{
    Conversation, PersistenceError, PersistenceGateway, PersistenceResult, StoreFuture,
};
use super::rows::{IdRow, MessageRow, NewConversationRow, NewMessageRow, TitlePatch, TouchPatch};

const CONVERSATIONS: &str = "conversations";
const MESSAGES: &str = "messages";

/// REST gateway over a PostgREST endpoint.
pub struct RestGateway {
    client: reqwest::Client,
    root: Url,
}

impl RestGateway {
    /// Build a gateway from persistence settings.
    ///
    /// # Errors
    /// Returns an error when the base URL or API key is missing or invalid,
    /// or when the HTTP client cannot be constructed.
    pub fn new(config: &PersistenceConfig) -> PersistenceResult<Self> {
        let base = config.base_url.as_deref().ok_or_else(|| {
            PersistenceError::Config("persistence.base_url is not set".to_string())
        })?;
        let api_key = config.api_key.as_deref().ok_or_else(|| {
            PersistenceError::Config("persistence.api_key is not set".to_string())
        })?;

        let trimmed = base.trim_end_matches('/');
        let root = Url::parse(&format!("{trimmed}/rest/v1/")).map_err(|e| {
            PersistenceError::Config(format!("invalid persistence.base_url: {e}"))
        })?;

        let mut headers = HeaderMap::new();
        let mut key_value = HeaderValue::from_str(api_key).map_err(|_| {
            PersistenceError::Config("persistence.api_key contains invalid characters".to_string())
        })?;
        key_value.set_sensitive(true);
        headers.insert("apikey", key_value);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            PersistenceError::Config("persistence.api_key contains invalid characters".to_string())
        })?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, root })
    }

    fn table_url(&self, table: &str) -> PersistenceResult<Url> {
        self.root
            .join(table)
            .map_err(|e| PersistenceError::Config(format!("invalid table url: {e}")))
    }

    fn list_url(&self, limit: usize) -> PersistenceResult<Url> {
        let mut url = self.table_url(CONVERSATIONS)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("order", "updated_at.desc")
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    fn conversation_filter_url(&self, table: &str, id: ConversationId) -> PersistenceResult<Url> {
        let mut url = self.table_url(table)?;
        let column = if table == CONVERSATIONS {
            "id"
        } else {
            "conversation_id"
        };
        url.query_pairs_mut()
            .append_pair(column, &format!("eq.{id}"));
        Ok(url)
    }

    fn history_url(&self, id: ConversationId) -> PersistenceResult<Url> {
        let mut url = self.conversation_filter_url(MESSAGES, id)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("order", "created_at.asc");
        Ok(url)
    }

    fn exists_url(
        &self,
        id: ConversationId,
        role: ChatRole,
        content: &str,
        since: DateTime<Utc>,
    ) -> PersistenceResult<Url> {
        let mut url = self.conversation_filter_url(MESSAGES, id)?;
        url.query_pairs_mut()
            .append_pair("select", "id")
            .append_pair("role", &format!("eq.{role}"))
            .append_pair("content", &format!("eq.{content}"))
            .append_pair("created_at", &format!("gte.{}", since.to_rfc3339()))
            .append_pair("limit", "1");
        Ok(url)
    }

    async fn conversation_known(&self, id: ConversationId) -> PersistenceResult<bool> {
        let mut url = self.conversation_filter_url(CONVERSATIONS, id)?;
        url.query_pairs_mut()
            .append_pair("select", "id")
            .append_pair("limit", "1");
        let response = check(self.client.get(url).send().await?).await?;
        let rows: Vec<IdRow> = response.json().await?;
        Ok(!rows.is_empty())
    }

    /// Bump the conversation's activity stamp so listings stay ordered.
    /// Failing to touch it is not worth failing the caller.
    async fn touch_conversation(&self, id: ConversationId) {
        let result = async {
            let url = self.conversation_filter_url(CONVERSATIONS, id)?;
            let response = self
                .client
                .patch(url)
                .json(&TouchPatch {
                    updated_at: Utc::now(),
                })
                .send()
                .await?;
            let _ = check(response).await?;
            Ok::<(), PersistenceError>(())
        }
        .await;
        if let Err(err) = result {
            warn!(conversation = %id, error = %err, "failed to touch updated_at");
        }
    }
}

impl PersistenceGateway for RestGateway {
    fn create_conversation(
        &self,
        title: &str,
    ) -> StoreFuture<'_, PersistenceResult<ConversationId>> {
        let title = title.to_string();
        Box::pin(async move {
            let url = self.table_url(CONVERSATIONS)?;
            let response = self
                .client
                .post(url)
                .header("Prefer", "return=representation")
                .json(&NewConversationRow { title: &title })
                .send()
                .await?;
            let response = check(response).await?;
            let rows: Vec<Conversation> = response.json().await?;
            let created = rows.into_iter().next().ok_or_else(|| {
                PersistenceError::InvalidResponse("insert returned no conversation row".to_string())
            })?;
            debug!(conversation = %created.id, "created conversation");
            Ok(created.id)
        })
    }

    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> StoreFuture<'_, PersistenceResult<()>> {
        let title = title.to_string();
        Box::pin(async move {
            let url = self.conversation_filter_url(CONVERSATIONS, id)?;
            let response = self
                .client
                .patch(url)
                .json(&TitlePatch {
                    title: &title,
                    updated_at: Utc::now(),
                })
                .send()
                .await?;
            let _ = check(response).await?;
            Ok(())
        })
    }

    fn list_conversations(
        &self,
        limit: usize,
    ) -> StoreFuture<'_, PersistenceResult<Vec<Conversation>>> {
        Box::pin(async move {
            let url = self.list_url(limit)?;
            let response = check(self.client.get(url).send().await?).await?;
            let rows: Vec<Conversation> = response.json().await?;
            Ok(rows)
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            // Messages first, so a failure cannot orphan them.
            let messages_url = self.conversation_filter_url(MESSAGES, id)?;
            let _ = check(self.client.delete(messages_url).send().await?).await?;

            let conversation_url = self.conversation_filter_url(CONVERSATIONS, id)?;
            let _ = check(self.client.delete(conversation_url).send().await?).await?;
            debug!(conversation = %id, "deleted conversation");
            Ok(())
        })
    }

    fn load_messages(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, PersistenceResult<Vec<ChatMessage>>> {
        Box::pin(async move {
            if !self.conversation_known(id).await? {
                return Err(PersistenceError::NotFound(id));
            }
            let url = self.history_url(id)?;
            let response = check(self.client.get(url).send().await?).await?;
            let rows: Vec<MessageRow> = response.json().await?;
            Ok(rows.into_iter().map(MessageRow::into_message).collect())
        })
    }

    fn message_exists(
        &self,
        id: ConversationId,
        role: ChatRole,
        content: &str,
        since: DateTime<Utc>,
    ) -> StoreFuture<'_, PersistenceResult<bool>> {
        let content = content.to_string();
        Box::pin(async move {
            let url = self.exists_url(id, role, &content, since)?;
            let response = check(self.client.get(url).send().await?).await?;
            let rows: Vec<IdRow> = response.json().await?;
            Ok(!rows.is_empty())
        })
    }

    fn insert_message(
        &self,
        message: &ChatMessage,
    ) -> StoreFuture<'_, PersistenceResult<ChatMessage>> {
        let conversation_id = message.conversation_id;
        let role = message.role;
        let content = message.content.storage_text();
        let agent = message.agent;
        Box::pin(async move {
            let conversation_id = conversation_id.ok_or(PersistenceError::Detached)?;
            let url = self.table_url(MESSAGES)?;
            let payload = NewMessageRow {
                conversation_id,
                role: role.as_str(),
                content,
                agent: agent.map(AgentTag::as_str),
            };
            let response = self
                .client
                .post(url)
                .header("Prefer", "return=representation")
                .json(&payload)
                .send()
                .await?;
            let response = check(response).await?;
            let rows: Vec<MessageRow> = response.json().await?;
            let stored = rows.into_iter().next().ok_or_else(|| {
                PersistenceError::InvalidResponse("insert returned no message row".to_string())
            })?;

            self.touch_conversation(conversation_id).await;

            Ok(stored.into_message())
        })
    }
}

async fn check(response: reqwest::Response) -> PersistenceResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PersistenceError::Remote {
        status: status.as_u16(),
        body,
    })
}
