//! In-process gateway for tests and offline runs.
//!
//! Mirrors the REST gateway's observable behavior: server-assigned ids and
//! timestamps, `updated_at` bumped on insert, `NotFound` for history reads of
//! unknown conversations.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::core::ids::ConversationId;
use crate::core::message::{ChatMessage, ChatRole};
use crate::realtime::{ChangeEvent, ChangeTable, FeedPublisher, RowChange};

use super::gateway::{
    Conversation, PersistenceError, PersistenceGateway, PersistenceResult, StoreFuture,
};
use super::rows::MessageRow;

/// Gateway backed by process-local maps.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    conversations: DashMap<ConversationId, Conversation>,
    messages: DashMap<ConversationId, Vec<MessageRow>>,
    publisher: Option<FeedPublisher>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit row changes to `publisher`, the way a hosted store's realtime
    /// side would.
    #[must_use]
    pub fn with_publisher(mut self, publisher: FeedPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn publish(&self, table: ChangeTable, event: ChangeEvent, row: &impl Serialize) {
        if let Some(publisher) = &self.publisher
            && let Ok(value) = serde_json::to_value(row)
        {
            publisher.publish(&RowChange {
                table,
                event,
                row: value,
            });
        }
    }
}

impl PersistenceGateway for MemoryGateway {
    fn create_conversation(
        &self,
        title: &str,
    ) -> StoreFuture<'_, PersistenceResult<ConversationId>> {
        let title = title.to_string();
        Box::pin(async move {
            let id = ConversationId::new();
            let now = Utc::now();
            let conversation = Conversation {
                id,
                title,
                created_at: now,
                updated_at: now,
            };
            self.conversations.insert(id, conversation.clone());
            self.messages.insert(id, Vec::new());
            self.publish(ChangeTable::Conversations, ChangeEvent::Insert, &conversation);
            Ok(id)
        })
    }

    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> StoreFuture<'_, PersistenceResult<()>> {
        let title = title.to_string();
        Box::pin(async move {
            // Renaming an unknown conversation matches zero rows; not an error.
            let updated = self.conversations.get_mut(&id).map(|mut conversation| {
                conversation.title = title;
                conversation.updated_at = Utc::now();
                conversation.clone()
            });
            if let Some(conversation) = updated {
                self.publish(ChangeTable::Conversations, ChangeEvent::Update, &conversation);
            }
            Ok(())
        })
    }

    fn list_conversations(
        &self,
        limit: usize,
    ) -> StoreFuture<'_, PersistenceResult<Vec<Conversation>>> {
        Box::pin(async move {
            let mut all: Vec<Conversation> = self
                .conversations
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            all.truncate(limit);
            Ok(all)
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            self.messages.remove(&id);
            if self.conversations.remove(&id).is_some() {
                self.publish(
                    ChangeTable::Conversations,
                    ChangeEvent::Delete,
                    &serde_json::json!({"id": id.to_string()}),
                );
            }
            Ok(())
        })
    }

    fn load_messages(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, PersistenceResult<Vec<ChatMessage>>> {
        Box::pin(async move {
            if !self.conversations.contains_key(&id) {
                return Err(PersistenceError::NotFound(id));
            }
            let mut rows: Vec<MessageRow> = self
                .messages
                .get(&id)
                .map(|entry| entry.value().clone())
                .unwrap_or_default();
            rows.sort_by_key(|row| row.created_at);
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
            let found = self.messages.get(&id).is_some_and(|rows| {
                rows.iter().any(|row| {
                    row.role == role.as_str() && row.content == content && row.created_at >= since
                })
            });
            Ok(found)
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
            if !self.conversations.contains_key(&conversation_id) {
                return Err(PersistenceError::NotFound(conversation_id));
            }

            let now = Utc::now();
            let row = MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id,
                role: role.as_str().to_string(),
                content,
                agent: agent.map(|tag| tag.as_str().to_string()),
                created_at: now,
            };
            self.messages
                .entry(conversation_id)
                .or_default()
                .push(row.clone());
            if let Some(mut conversation) = self.conversations.get_mut(&conversation_id) {
                conversation.updated_at = now;
            }
            self.publish(ChangeTable::Messages, ChangeEvent::Insert, &row);
            Ok(row.into_message())
        })
    }
}
