//! The conversation engine: send orchestration, history switching, and
//! realtime reconciliation over injected backends.
//!
//! One engine instance owns one visible conversation at a time. All mutable
//! state sits behind a single async mutex; the send phase is the only
//! serialization point (a busy flag, not a queue). Three async sources write
//! through the same identity-keyed merge: the send pipeline's optimistic
//! path, the history loader, and the realtime pump. An epoch counter fences
//! work that was started before a conversation switch.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::agents::AgentTag;
use crate::core::config::SyncConfig;
use crate::core::errors::{ChatError, ChatResult};
use crate::core::identity::IdentityKey;
use crate::core::ids::{ConversationId, MessageId};
use crate::core::message::ChatMessage;
use crate::persistence::{
    Conversation, MemoryGateway, PersistenceError, PersistenceGateway, RestGateway,
};
use crate::realtime::{
    ChangeFilter, ChannelFeed, FeedAction, FeedSubscription, RealtimeFeed, RowChange, decode,
};
use crate::responder::{
    DispatchRequest, HttpResponder, Responder, ResponderError, ResponderReply, ResponderResult,
};
use crate::state::{ConversationState, MergeOutcome, PendingStore};

use super::updates::{EngineSnapshot, EngineUpdate, SendPhase};

/// Buffered change notifications per subscriber before lagging.
const UPDATE_BUFFER: usize = 64;

/// Transcript notice when history cannot be loaded.
const HISTORY_LOAD_FAILED: &str =
    "Something went wrong while loading the conversation. Please start a new one.";

/// Backend trait objects the engine drives.
#[derive(Clone)]
pub struct ChatBackends {
    /// Durable store.
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Agent backend transport.
    pub responder: Arc<dyn Responder>,
    /// Remote change feed.
    pub feed: Arc<dyn RealtimeFeed>,
}

impl ChatBackends {
    /// REST store plus HTTP responder.
    ///
    /// The change feed is an unwired channel feed: it stays silent unless the
    /// host bridges a push transport into it. Hosts that need live updates
    /// build the struct directly and keep the publisher handle.
    ///
    /// # Errors
    /// Fails when the store or responder configuration is missing or invalid.
    pub fn rest(config: &SyncConfig) -> ChatResult<Self> {
        let gateway = RestGateway::new(&config.persistence)?;
        let responder = HttpResponder::new(&config.responder)?;
        Ok(Self {
            gateway: Arc::new(gateway),
            responder: Arc::new(responder),
            feed: Arc::new(ChannelFeed::new()),
        })
    }

    /// Fully in-process stack: the memory gateway publishes its own changes
    /// into the channel feed, so realtime reconciliation works end to end
    /// without a server.
    #[must_use]
    pub fn in_process(responder: Arc<dyn Responder>) -> Self {
        let feed = ChannelFeed::new();
        let gateway = MemoryGateway::new().with_publisher(feed.publisher());
        Self {
            gateway: Arc::new(gateway),
            responder,
            feed: Arc::new(feed),
        }
    }
}

/// Duplicate-submit guard record: the last accepted input and when its send
/// settled.
struct LastSend {
    text: String,
    completed_at: DateTime<Utc>,
}

/// Everything behind the state mutex.
struct EngineState {
    conversation_id: Option<ConversationId>,
    title: Option<String>,
    conversation: ConversationState,
    pending: PendingStore,
    phase: SendPhase,
    last_send: Option<LastSend>,
    last_error: Option<String>,
    /// Bumped on every conversation switch; fences stale async work.
    epoch: u64,
    pump: Option<JoinHandle<()>>,
    /// Recently applied durable row ids, to shrug off feed redeliveries.
    applied: LruCache<MessageId, ()>,
}

impl EngineState {
    fn fresh(config: &SyncConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.send.applied_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            conversation_id: None,
            title: None,
            conversation: ConversationState::new(config.send.identity_bucket_secs),
            pending: PendingStore::new(),
            phase: SendPhase::Idle,
            last_send: None,
            last_error: None,
            epoch: 0,
            pump: None,
            applied: LruCache::new(capacity),
        }
    }
}

struct EngineInner {
    config: SyncConfig,
    gateway: Arc<dyn PersistenceGateway>,
    responder: Arc<dyn Responder>,
    feed: Arc<dyn RealtimeFeed>,
    state: Mutex<EngineState>,
    updates: broadcast::Sender<EngineUpdate>,
    revision: AtomicU64,
}

impl EngineInner {
    fn bump(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn notify_messages(&self) {
        let _ = self.updates.send(EngineUpdate::Messages {
            revision: self.bump(),
        });
    }

    fn notify_phase(&self, phase: SendPhase) {
        let _ = self.updates.send(EngineUpdate::Phase {
            revision: self.bump(),
            phase,
        });
    }

    fn notify_conversation(&self, conversation_id: Option<ConversationId>) {
        let _ = self.updates.send(EngineUpdate::Conversation {
            revision: self.bump(),
            conversation_id,
        });
    }

    fn notify_title(&self, title: String) {
        let _ = self.updates.send(EngineUpdate::Title {
            revision: self.bump(),
            title,
        });
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().pump.take() {
            handle.abort();
        }
    }
}

/// Client-side conversation synchronization engine.
///
/// Cheap to clone; clones share the same state and backends. See
/// [`ChatEngine::send_message`] for the send pipeline and
/// [`ChatEngine::switch_conversation`] for history loading.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    /// Build an engine over validated configuration and backends. The initial
    /// state is a fresh detached chat holding the greeting (when enabled).
    ///
    /// # Errors
    /// Returns [`ChatError::InvalidConfig`] or [`ChatError::InvalidUrl`] when
    /// the configuration fails validation.
    pub fn new(config: SyncConfig, backends: ChatBackends) -> ChatResult<Self> {
        config.validate()?;
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let mut state = EngineState::fresh(&config);
        seed_greeting(&mut state, &config);
        let inner = EngineInner {
            config,
            gateway: backends.gateway,
            responder: backends.responder,
            feed: backends.feed,
            state: Mutex::new(state),
            updates,
            revision: AtomicU64::new(0),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Subscribe to change notifications. Lagged receivers should re-read
    /// [`ChatEngine::current_state`].
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<EngineUpdate> {
        self.inner.updates.subscribe()
    }

    /// Snapshot the current state for rendering.
    pub async fn current_state(&self) -> EngineSnapshot {
        let state = self.inner.state.lock().await;
        EngineSnapshot {
            conversation_id: state.conversation_id,
            title: state.title.clone(),
            messages: state.conversation.messages().to_vec(),
            phase: state.phase,
            last_error: state.last_error.clone(),
            revision: self.inner.revision.load(Ordering::Relaxed),
        }
    }

    /// Send a user message through the full pipeline: guards, optimistic
    /// insert, dispatch with a bounded timeout, reply merge, then
    /// fire-and-forget persistence with an existence check.
    ///
    /// On dispatch failure a supervisor-tagged explanation is appended to the
    /// transcript (never persisted) and the engine settles back to idle; no
    /// automatic retry happens.
    ///
    /// # Errors
    /// [`ChatError::EmptyMessage`] for blank input, [`ChatError::SendInFlight`]
    /// while a cycle is running, [`ChatError::DuplicateSend`] when the same
    /// text is re-sent inside the cooldown, and [`ChatError::Responder`] when
    /// the dispatch itself fails.
    pub async fn send_message(
        &self,
        text: &str,
        agent_override: Option<AgentTag>,
    ) -> ChatResult<()> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let now = Utc::now();
        let (epoch, known) = self.accept_send(trimmed, now).await?;
        let conversation_id = self.ensure_conversation(text, known, epoch).await;
        let user_message = self
            .insert_optimistic(text, conversation_id, epoch, now)
            .await;
        match self.dispatch(text, conversation_id, agent_override).await {
            Ok(reply) => {
                self.complete_send(trimmed, user_message, &reply, conversation_id, epoch)
                    .await;
                Ok(())
            }
            Err(err) => {
                self.fail_send(trimmed, user_message, &err, conversation_id, epoch)
                    .await;
                Err(err.into())
            }
        }
    }

    /// Switch the visible conversation: `Some(id)` loads its history and
    /// replaces the state wholesale, `None` starts a fresh detached chat.
    /// The previous realtime subscription is torn down either way.
    pub async fn switch_conversation(&self, target: Option<ConversationId>) {
        match target {
            Some(id) => self.open_conversation(id).await,
            None => self.start_new_chat().await,
        }
    }

    /// List recent conversations, newest activity first, bounded by the
    /// configured limit.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let limit = self.inner.config.persistence.list_limit;
        Ok(self.inner.gateway.list_conversations(limit).await?)
    }

    /// Delete a conversation and its messages. Deleting the active one
    /// resets the engine to a fresh detached chat.
    ///
    /// # Errors
    /// Propagates store failures; the local state is only reset after the
    /// store confirms.
    pub async fn delete_conversation(&self, id: ConversationId) -> ChatResult<()> {
        self.inner.gateway.delete_conversation(id).await?;
        let old_pump = {
            let mut state = self.inner.state.lock().await;
            if state.conversation_id == Some(id) {
                let old = reset_state(&mut state, None, Vec::new());
                seed_greeting(&mut state, &self.inner.config);
                self.inner.notify_conversation(None);
                self.inner.notify_messages();
                old
            } else {
                None
            }
        };
        if let Some(handle) = old_pump {
            handle.abort();
        }
        Ok(())
    }

    /// Synchronous guards. Claims the busy flag before the first await so two
    /// racing sends cannot both pass.
    async fn accept_send(
        &self,
        trimmed: &str,
        now: DateTime<Utc>,
    ) -> ChatResult<(u64, Option<ConversationId>)> {
        let mut state = self.inner.state.lock().await;
        let reclaim_age = self.inner.config.responder.request_timeout;
        for entry in state.pending.reclaim_stale(now, reclaim_age) {
            warn!(
                provisional = %entry.provisional_id,
                attempt = entry.attempt,
                "reclaimed stale pending message"
            );
        }
        if state.phase == SendPhase::AwaitingPersistence && state.pending.is_empty() {
            state.phase = SendPhase::Idle;
            self.inner.notify_phase(SendPhase::Idle);
        }
        if state.phase.is_busy() {
            return Err(ChatError::SendInFlight);
        }
        if let Some(last) = &state.last_send
            && last.text == trimmed
            && is_within(now, last.completed_at, self.inner.config.send.resend_cooldown)
        {
            return Err(ChatError::DuplicateSend);
        }
        state.phase = SendPhase::Dispatching;
        state.last_error = None;
        self.inner.notify_phase(SendPhase::Dispatching);
        Ok((state.epoch, state.conversation_id))
    }

    /// Make sure the send targets a durable conversation when the store
    /// allows it. Creation failure downgrades to a detached send. A
    /// conversation still holding only the greeting takes its title from the
    /// first real message.
    async fn ensure_conversation(
        &self,
        text: &str,
        known: Option<ConversationId>,
        epoch: u64,
    ) -> Option<ConversationId> {
        let title = derive_title(text, self.inner.config.send.title_max_chars);
        if let Some(id) = known {
            self.rename_seeded(id, &title, epoch).await;
            return Some(id);
        }
        match self.inner.gateway.create_conversation(&title).await {
            Ok(id) => {
                debug!(conversation = %id, "created conversation");
                {
                    let mut state = self.inner.state.lock().await;
                    if state.epoch == epoch {
                        state.conversation_id = Some(id);
                        state.title = Some(title.clone());
                        self.inner.notify_conversation(Some(id));
                        self.inner.notify_title(title);
                    }
                }
                self.start_pump(id, epoch).await;
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, "conversation creation failed; sending detached");
                None
            }
        }
    }

    async fn rename_seeded(&self, id: ConversationId, title: &str, epoch: u64) {
        let seeded = {
            let state = self.inner.state.lock().await;
            state.epoch == epoch
                && state.conversation.len() == 1
                && state.conversation.is_seed_only()
        };
        if !seeded {
            return;
        }
        match self.inner.gateway.rename_conversation(id, title).await {
            Ok(()) => {
                let mut state = self.inner.state.lock().await;
                if state.epoch == epoch {
                    state.title = Some(title.to_string());
                    self.inner.notify_title(title.to_string());
                }
            }
            Err(err) => warn!(conversation = %id, error = %err, "rename failed"),
        }
    }

    /// Optimistic insert of the outgoing user message.
    async fn insert_optimistic(
        &self,
        text: &str,
        conversation_id: Option<ConversationId>,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> ChatMessage {
        let message = ChatMessage::user(conversation_id, text);
        let key = IdentityKey::of(&message, self.inner.config.send.identity_bucket_secs);
        let mut state = self.inner.state.lock().await;
        if state.epoch == epoch {
            let _ = state.conversation.merge(message.clone());
            let _ = state.pending.track(key, message.id.clone(), now);
            self.inner.notify_messages();
        }
        message
    }

    /// Dispatch with the configured deadline; dropping the request future on
    /// expiry cancels the in-flight call.
    async fn dispatch(
        &self,
        text: &str,
        conversation_id: Option<ConversationId>,
        agent_override: Option<AgentTag>,
    ) -> ResponderResult<ResponderReply> {
        let thread_id = conversation_id.map_or_else(
            || format!("thread_{}", Utc::now().timestamp_millis()),
            |id| id.to_string(),
        );
        let request = DispatchRequest {
            message: text.to_string(),
            thread_id: Some(thread_id),
            agent: agent_override,
        };
        let deadline = self.inner.config.responder.request_timeout;
        match tokio::time::timeout(deadline, self.inner.responder.dispatch(request)).await {
            Ok(result) => result,
            Err(_) => Err(ResponderError::Timeout),
        }
    }

    /// Merge the reply and hand both rows to the background persistence task.
    async fn complete_send(
        &self,
        trimmed: &str,
        user_message: ChatMessage,
        reply: &ResponderReply,
        conversation_id: Option<ConversationId>,
        epoch: u64,
    ) {
        let agent = reply
            .agent
            .as_deref()
            .map_or(AgentTag::Supervisor, AgentTag::from_wire);
        let assistant = ChatMessage::assistant(conversation_id, agent, &reply.response);
        let key = IdentityKey::of(&assistant, self.inner.config.send.identity_bucket_secs);
        {
            let mut state = self.inner.state.lock().await;
            if state.epoch == epoch {
                let _ = state.conversation.merge(assistant.clone());
                let _ = state.pending.track(key, assistant.id.clone(), Utc::now());
                state.phase = SendPhase::AwaitingPersistence;
                state.last_send = Some(LastSend {
                    text: trimmed.to_string(),
                    completed_at: Utc::now(),
                });
                self.inner.notify_messages();
                self.inner.notify_phase(SendPhase::AwaitingPersistence);
            }
        }
        self.spawn_persist(vec![user_message, assistant], epoch, true);
    }

    /// Record the failure, append the explanation notice, settle back to
    /// idle. The user row still goes to the store; the pending entry is
    /// dropped as terminal.
    async fn fail_send(
        &self,
        trimmed: &str,
        user_message: ChatMessage,
        error: &ResponderError,
        conversation_id: Option<ConversationId>,
        epoch: u64,
    ) {
        warn!(error = %error, "dispatch failed");
        {
            let mut state = self.inner.state.lock().await;
            if state.epoch == epoch {
                state.phase = SendPhase::Failed;
                state.last_error = Some(error.to_string());
                self.inner.notify_phase(SendPhase::Failed);
                let notice = ChatMessage::local_notice(conversation_id, &error.notice_text());
                let _ = state.conversation.merge(notice);
                self.inner.notify_messages();
                let _ = state.pending.resolve_by_id(&user_message.id);
                state.phase = SendPhase::Idle;
                state.last_send = Some(LastSend {
                    text: trimmed.to_string(),
                    completed_at: Utc::now(),
                });
                self.inner.notify_phase(SendPhase::Idle);
            }
        }
        self.spawn_persist(vec![user_message], epoch, false);
    }

    /// Persist rows on a spawned task holding a strong engine handle, so
    /// writes settle even if every other handle is dropped meanwhile.
    fn spawn_persist(&self, messages: Vec<ChatMessage>, epoch: u64, settles_phase: bool) {
        let engine = self.clone();
        drop(tokio::spawn(async move {
            for message in messages {
                engine.persist_message(message, epoch).await;
            }
            if settles_phase {
                let mut state = engine.inner.state.lock().await;
                if state.epoch == epoch && state.phase == SendPhase::AwaitingPersistence {
                    state.phase = SendPhase::Idle;
                    engine.inner.notify_phase(SendPhase::Idle);
                }
            }
        }));
    }

    /// Existence-checked insert of one row. Failures are logged, never
    /// surfaced, and never roll back the optimistic state.
    async fn persist_message(&self, message: ChatMessage, epoch: u64) {
        let Some(conversation_id) = message.conversation_id else {
            debug!("skipping persistence for detached message");
            return;
        };
        let content = message.content.storage_text();
        let since = dedup_cutoff(Utc::now(), self.inner.config.send.dedup_window);
        match self
            .inner
            .gateway
            .message_exists(conversation_id, message.role, &content, since)
            .await
        {
            Ok(true) => {
                debug!(conversation = %conversation_id, "row already stored; skipping insert");
                let mut state = self.inner.state.lock().await;
                if state.epoch == epoch {
                    let _ = state.pending.resolve_by_id(&message.id);
                }
                return;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(
                    conversation = %conversation_id,
                    error = %err,
                    "existence check failed; inserting anyway"
                );
            }
        }
        match self.inner.gateway.insert_message(&message).await {
            Ok(stored) => {
                let mut state = self.inner.state.lock().await;
                let _ = state.applied.put(stored.id.clone(), ());
                if state.epoch == epoch {
                    let _ = state.pending.resolve_by_id(&message.id);
                    if state.conversation.promote(&message.id, &stored) {
                        self.inner.notify_messages();
                    }
                }
            }
            Err(err) => {
                warn!(conversation = %conversation_id, error = %err, "message persistence failed");
            }
        }
    }

    async fn start_new_chat(&self) {
        let old_pump = {
            let mut state = self.inner.state.lock().await;
            let old = reset_state(&mut state, None, Vec::new());
            seed_greeting(&mut state, &self.inner.config);
            self.inner.notify_conversation(None);
            self.inner.notify_messages();
            old
        };
        if let Some(handle) = old_pump {
            handle.abort();
        }
    }

    async fn open_conversation(&self, id: ConversationId) {
        let messages = match self.inner.gateway.load_messages(id).await {
            Ok(rows) => rows,
            Err(PersistenceError::NotFound(_)) => Vec::new(),
            Err(err) => {
                warn!(conversation = %id, error = %err, "history load failed");
                vec![ChatMessage::local_notice(Some(id), HISTORY_LOAD_FAILED)]
            }
        };
        let (epoch, old_pump) = {
            let mut state = self.inner.state.lock().await;
            let old = reset_state(&mut state, Some(id), messages);
            seed_greeting(&mut state, &self.inner.config);
            self.inner.notify_conversation(Some(id));
            self.inner.notify_messages();
            (state.epoch, old)
        };
        if let Some(handle) = old_pump {
            handle.abort();
        }
        self.start_pump(id, epoch).await;
    }

    /// Subscribe to the change feed and spawn the pump for this epoch. A
    /// switch that raced us wins: the fresh pump is aborted instead of
    /// installed.
    async fn start_pump(&self, conversation_id: ConversationId, epoch: u64) {
        let filter = ChangeFilter::Conversation(conversation_id);
        let subscription = match self.inner.feed.subscribe(filter).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(
                    conversation = %conversation_id,
                    error = %err,
                    "realtime subscription failed; live updates disabled"
                );
                return;
            }
        };
        let handle = tokio::spawn(pump_changes(
            Arc::downgrade(&self.inner),
            subscription,
            conversation_id,
            epoch,
        ));
        let mut state = self.inner.state.lock().await;
        if state.epoch == epoch {
            if let Some(previous) = state.pump.replace(handle) {
                previous.abort();
            }
        } else {
            handle.abort();
        }
    }
}

/// Replace the whole state for a new target conversation. Returns the
/// previous pump handle, which the caller aborts (or drops, when it is the
/// running pump itself).
fn reset_state(
    state: &mut EngineState,
    target: Option<ConversationId>,
    messages: Vec<ChatMessage>,
) -> Option<JoinHandle<()>> {
    let old_pump = state.pump.take();
    state.epoch += 1;
    state.conversation_id = target;
    state.title = None;
    state.conversation.replace_all(messages);
    state.pending.clear();
    state.phase = SendPhase::Idle;
    state.last_send = None;
    state.last_error = None;
    old_pump
}

/// Seed the synthetic greeting into an empty state so the UI is never blank.
/// The greeting is local-only and never persisted.
fn seed_greeting(state: &mut EngineState, config: &SyncConfig) {
    if config.greeting.enabled && state.conversation.is_empty() {
        let greeting = ChatMessage::local_notice(state.conversation_id, &config.greeting.text);
        let _ = state.conversation.merge(greeting);
    }
}

/// First `max_chars` characters of the text, with an ellipsis when cut.
fn derive_title(text: &str, max_chars: usize) -> String {
    let mut title: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        title.push_str("...");
    }
    title
}

fn is_within(now: DateTime<Utc>, earlier: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(earlier)
        .to_std()
        .is_ok_and(|age| age < window)
}

fn dedup_cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window).map_or(now, |delta| now - delta)
}

/// Realtime pump: applies feed changes for one conversation until the feed
/// ends, the engine is dropped, or the conversation is deleted remotely.
async fn pump_changes(
    inner: Weak<EngineInner>,
    mut subscription: Box<dyn FeedSubscription>,
    conversation_id: ConversationId,
    epoch: u64,
) {
    while let Some(change) = subscription.next_change().await {
        let Some(engine) = inner.upgrade() else { break };
        if !apply_change(&engine, &change, conversation_id, epoch).await {
            break;
        }
    }
    subscription.cancel();
}

/// Apply one decoded feed change. Returns `false` when the pump should stop.
async fn apply_change(
    inner: &Arc<EngineInner>,
    change: &RowChange,
    conversation_id: ConversationId,
    epoch: u64,
) -> bool {
    match decode(change, Some(conversation_id)) {
        FeedAction::MergeMessage(message) => {
            merge_remote(inner, *message, epoch).await;
            true
        }
        FeedAction::RenameConversation { title, .. } => {
            let mut state = inner.state.lock().await;
            if state.epoch == epoch {
                state.title = Some(title.clone());
                inner.notify_title(title);
            }
            true
        }
        FeedAction::RemoveConversation(id) => {
            debug!(conversation = %id, "conversation deleted remotely; resetting");
            let mut state = inner.state.lock().await;
            if state.epoch == epoch {
                // The returned handle is this very pump; dropping it detaches
                // the task, and returning false ends it.
                let _ = reset_state(&mut state, None, Vec::new());
                seed_greeting(&mut state, &inner.config);
                inner.notify_conversation(None);
                inner.notify_messages();
            }
            false
        }
        FeedAction::Ignore => true,
    }
}

/// Merge one remote row, shrugging off redeliveries via the applied cache
/// and the identity-keyed merge.
async fn merge_remote(inner: &Arc<EngineInner>, message: ChatMessage, epoch: u64) {
    let mut state = inner.state.lock().await;
    if state.epoch != epoch {
        return;
    }
    if message.id.is_durable() && state.applied.put(message.id.clone(), ()).is_some() {
        return;
    }
    let key = IdentityKey::of(&message, inner.config.send.identity_bucket_secs);
    let _ = state.pending.resolve(&key);
    if state.conversation.merge(message) != MergeOutcome::Unchanged {
        inner.notify_messages();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::pending;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::time::sleep;

    use crate::core::config::{GreetingConfig, ResponderConfig, SendConfig};
    use crate::core::message::ChatRole;
    use crate::persistence::{PersistenceResult, StoreFuture};
    use crate::realtime::{ChangeEvent, ChangeTable};
    use crate::responder::DispatchFuture;

    use super::*;

    struct ScriptedResponder {
        replies: StdMutex<VecDeque<ResponderResult<ResponderReply>>>,
        requests: StdMutex<Vec<DispatchRequest>>,
        calls: AtomicUsize,
    }

    impl ScriptedResponder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(VecDeque::new()),
                requests: StdMutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn push_ok(&self, response: &str, agent: &str) {
            if let Ok(mut replies) = self.replies.lock() {
                replies.push_back(Ok(ResponderReply {
                    response: response.to_string(),
                    agent: Some(agent.to_string()),
                    thread_id: None,
                }));
            }
        }

        fn push_err(&self, error: ResponderError) {
            if let Ok(mut replies) = self.replies.lock() {
                replies.push_back(Err(error));
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }

        fn last_request(&self) -> Option<DispatchRequest> {
            self.requests.lock().ok().and_then(|requests| requests.last().cloned())
        }
    }

    impl Responder for ScriptedResponder {
        fn dispatch(
            &self,
            request: DispatchRequest,
        ) -> DispatchFuture<'_, ResponderResult<ResponderReply>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            let next = self
                .replies
                .lock()
                .ok()
                .and_then(|mut replies| replies.pop_front());
            Box::pin(async move {
                next.unwrap_or_else(|| {
                    Ok(ResponderReply {
                        response: "ok".to_string(),
                        agent: Some("cofounder".to_string()),
                        thread_id: None,
                    })
                })
            })
        }
    }

    /// Responder that never answers; the engine's deadline has to fire.
    struct SilentResponder {
        calls: AtomicUsize,
    }

    impl SilentResponder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl Responder for SilentResponder {
        fn dispatch(
            &self,
            _request: DispatchRequest,
        ) -> DispatchFuture<'_, ResponderResult<ResponderReply>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Box::pin(pending())
        }
    }

    /// Memory gateway wrapper that can refuse creations or hang inserts.
    struct FlakyGateway {
        inner: MemoryGateway,
        fail_create: bool,
        hang_inserts: bool,
    }

    impl PersistenceGateway for FlakyGateway {
        fn create_conversation(
            &self,
            title: &str,
        ) -> StoreFuture<'_, PersistenceResult<ConversationId>> {
            if self.fail_create {
                return Box::pin(async {
                    Err(PersistenceError::Config("store offline".to_string()))
                });
            }
            self.inner.create_conversation(title)
        }

        fn rename_conversation(
            &self,
            id: ConversationId,
            title: &str,
        ) -> StoreFuture<'_, PersistenceResult<()>> {
            self.inner.rename_conversation(id, title)
        }

        fn list_conversations(
            &self,
            limit: usize,
        ) -> StoreFuture<'_, PersistenceResult<Vec<Conversation>>> {
            self.inner.list_conversations(limit)
        }

        fn delete_conversation(
            &self,
            id: ConversationId,
        ) -> StoreFuture<'_, PersistenceResult<()>> {
            self.inner.delete_conversation(id)
        }

        fn load_messages(
            &self,
            id: ConversationId,
        ) -> StoreFuture<'_, PersistenceResult<Vec<ChatMessage>>> {
            self.inner.load_messages(id)
        }

        fn message_exists(
            &self,
            id: ConversationId,
            role: ChatRole,
            content: &str,
            since: DateTime<Utc>,
        ) -> StoreFuture<'_, PersistenceResult<bool>> {
            self.inner.message_exists(id, role, content, since)
        }

        fn insert_message(
            &self,
            message: &ChatMessage,
        ) -> StoreFuture<'_, PersistenceResult<ChatMessage>> {
            if self.hang_inserts {
                return Box::pin(pending());
            }
            self.inner.insert_message(message)
        }
    }

    fn quick_config() -> SyncConfig {
        SyncConfig {
            responder: ResponderConfig {
                request_timeout: Duration::from_millis(250),
                ..ResponderConfig::default()
            },
            send: SendConfig {
                resend_cooldown: Duration::from_millis(40),
                ..SendConfig::default()
            },
            greeting: GreetingConfig {
                enabled: false,
                ..GreetingConfig::default()
            },
            ..SyncConfig::default()
        }
    }

    fn greeting_config() -> SyncConfig {
        SyncConfig {
            send: SendConfig {
                resend_cooldown: Duration::from_millis(40),
                ..SendConfig::default()
            },
            ..SyncConfig::default()
        }
    }

    async fn wait_for_idle(engine: &ChatEngine) {
        for _ in 0..200 {
            if engine.current_state().await.phase == SendPhase::Idle {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    /// Idle plus a grace period for feed echoes to drain.
    async fn settle(engine: &ChatEngine) {
        wait_for_idle(engine).await;
        sleep(Duration::from_millis(30)).await;
    }

    fn texts(snapshot: &EngineSnapshot) -> Vec<String> {
        snapshot
            .messages
            .iter()
            .map(|message| message.content.storage_text())
            .collect()
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected_without_dispatch() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;
        let result = engine.send_message("   \n", None).await;
        assert!(matches!(result, Err(ChatError::EmptyMessage)));
        assert_eq!(responder.calls(), 0);
        assert!(engine.current_state().await.messages.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_within_cooldown_dispatches_once() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;
        engine.send_message("Hello", None).await?;
        wait_for_idle(&engine).await;
        let duplicate = engine.send_message("Hello", None).await;
        assert!(matches!(duplicate, Err(ChatError::DuplicateSend)));
        assert_eq!(responder.calls(), 1);

        sleep(Duration::from_millis(80)).await;
        engine.send_message("Hello", None).await?;
        assert_eq!(responder.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_send_rejected_while_dispatching() -> ChatResult<()> {
        let responder = SilentResponder::new();
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;
        let racing = engine.clone();
        let first = tokio::spawn(async move { racing.send_message("Hello", None).await });
        sleep(Duration::from_millis(30)).await;
        let second = engine.send_message("other text", None).await;
        assert!(matches!(second, Err(ChatError::SendInFlight)));
        let first_result = first.await.unwrap_or(Ok(()));
        assert!(matches!(
            first_result,
            Err(ChatError::Responder(ResponderError::Timeout))
        ));
        assert_eq!(responder.calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_then_idles_and_accepts_again() -> ChatResult<()> {
        let responder = SilentResponder::new();
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;
        let mut updates = engine.subscribe_changes();

        let result = engine.send_message("Hello", None).await;
        assert!(matches!(
            result,
            Err(ChatError::Responder(ResponderError::Timeout))
        ));

        let mut phases = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let EngineUpdate::Phase { phase, .. } = update {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![SendPhase::Dispatching, SendPhase::Failed, SendPhase::Idle]
        );

        let snapshot = engine.current_state().await;
        assert_eq!(snapshot.phase, SendPhase::Idle);
        let notice = snapshot.messages.last().map(|m| m.content.storage_text());
        assert_eq!(
            notice.as_deref(),
            Some("The request timed out. Please try again.")
        );

        let retry = engine.send_message("are you there?", None).await;
        assert!(matches!(
            retry,
            Err(ChatError::Responder(ResponderError::Timeout))
        ));
        assert_eq!(responder.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_first_send_creates_conversation_with_truncated_title() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;
        let long_text = "x".repeat(80);
        engine.send_message(&long_text, None).await?;
        settle(&engine).await;

        let conversations = engine.list_conversations().await?;
        assert_eq!(conversations.len(), 1);
        let expected = format!("{}...", "x".repeat(50));
        assert_eq!(conversations[0].title, expected);
        let snapshot = engine.current_state().await;
        assert_eq!(snapshot.conversation_id, Some(conversations[0].id));
        assert_eq!(snapshot.title.as_deref(), Some(expected.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn test_seeded_conversation_takes_title_from_first_message() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let backends = ChatBackends::in_process(responder.clone());
        let engine = ChatEngine::new(greeting_config(), backends.clone())?;
        let id = backends.gateway.create_conversation("New chat").await?;

        engine.switch_conversation(Some(id)).await;
        let seeded = engine.current_state().await;
        assert_eq!(seeded.messages.len(), 1);
        assert_eq!(seeded.messages[0].agent, Some(AgentTag::Supervisor));

        engine.send_message("Refine my pitch deck", None).await?;
        settle(&engine).await;
        let conversations = engine.list_conversations().await?;
        assert_eq!(conversations[0].title, "Refine my pitch deck");
        Ok(())
    }

    #[tokio::test]
    async fn test_happy_path_hello_two_messages_no_duplicates() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        responder.push_ok("Hi", "cofounder");
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;

        engine.send_message("Hello", None).await?;
        settle(&engine).await;

        let snapshot = engine.current_state().await;
        assert!(snapshot.conversation_id.is_some());
        assert_eq!(texts(&snapshot), vec!["Hello", "Hi"]);
        assert_eq!(snapshot.messages[0].role, ChatRole::User);
        assert_eq!(snapshot.messages[1].role, ChatRole::Assistant);
        assert_eq!(snapshot.messages[1].agent, Some(AgentTag::Cofounder));
        assert!(snapshot.messages.iter().all(|m| m.id.is_durable()));
        Ok(())
    }

    #[tokio::test]
    async fn test_switch_discards_messages_and_fences_stale_events() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let feed = Arc::new(ChannelFeed::new());
        let publisher = feed.publisher();
        let gateway = Arc::new(MemoryGateway::new().with_publisher(feed.publisher()));
        let backends = ChatBackends {
            gateway: gateway.clone(),
            responder,
            feed: feed.clone(),
        };
        let engine = ChatEngine::new(quick_config(), backends)?;

        engine.send_message("first conversation", None).await?;
        settle(&engine).await;
        let snapshot_a = engine.current_state().await;
        let conversation_a = snapshot_a.conversation_id.ok_or(ChatError::EmptyMessage)?;
        assert_eq!(snapshot_a.messages.len(), 2);

        let conversation_b = gateway.create_conversation("side quest").await?;
        engine.switch_conversation(Some(conversation_b)).await;
        sleep(Duration::from_millis(30)).await;
        assert_eq!(feed.subscriber_count(), 1);

        publisher.publish(&RowChange {
            table: ChangeTable::Messages,
            event: ChangeEvent::Insert,
            row: json!({
                "id": "11111111-2222-3333-4444-555555555555",
                "conversation_id": conversation_a.to_string(),
                "role": "assistant",
                "content": "late event for the old conversation",
                "created_at": "2026-08-25T10:00:00Z",
            }),
        });
        sleep(Duration::from_millis(30)).await;

        let snapshot_b = engine.current_state().await;
        assert_eq!(snapshot_b.conversation_id, Some(conversation_b));
        assert!(snapshot_b.messages.is_empty());
        assert!(!texts(&snapshot_b).contains(&"first conversation".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_realtime_rows_from_peers_merge_into_active_conversation() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let backends = ChatBackends::in_process(responder.clone());
        let gateway = backends.gateway.clone();
        let engine = ChatEngine::new(quick_config(), backends)?;

        engine.send_message("anyone there?", None).await?;
        settle(&engine).await;
        let conversation_id = engine
            .current_state()
            .await
            .conversation_id
            .ok_or(ChatError::EmptyMessage)?;

        // Another participant writes straight to the store; the published
        // change must land in our transcript.
        let peer = ChatMessage::user(Some(conversation_id), "joining late");
        let _stored = gateway.insert_message(&peer).await?;
        sleep(Duration::from_millis(40)).await;

        let snapshot = engine.current_state().await;
        assert!(texts(&snapshot).contains(&"joining late".to_string()));
        assert_eq!(snapshot.messages.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_http_500_appends_supervisor_notice_and_recovers() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        responder.push_err(ResponderError::Remote {
            status: 500,
            body: "Internal Server Error".to_string(),
        });
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;

        let result = engine.send_message("Hello", None).await;
        assert!(matches!(
            result,
            Err(ChatError::Responder(ResponderError::Remote { status: 500, .. }))
        ));

        let snapshot = engine.current_state().await;
        assert_eq!(snapshot.phase, SendPhase::Idle);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].content.storage_text(), "Hello");
        let notice = &snapshot.messages[1];
        assert_eq!(notice.agent, Some(AgentTag::Supervisor));
        assert!(notice.content.storage_text().contains("500"));
        assert!(snapshot.last_error.is_some());

        sleep(Duration::from_millis(80)).await;
        engine.send_message("Hello", None).await?;
        assert_eq!(responder.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_failure_downgrades_to_detached_send() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let gateway = Arc::new(FlakyGateway {
            inner: MemoryGateway::new(),
            fail_create: true,
            hang_inserts: false,
        });
        let backends = ChatBackends {
            gateway: gateway.clone(),
            responder: responder.clone(),
            feed: Arc::new(ChannelFeed::new()),
        };
        let engine = ChatEngine::new(quick_config(), backends)?;

        engine.send_message("Hello", None).await?;
        wait_for_idle(&engine).await;

        let snapshot = engine.current_state().await;
        assert_eq!(snapshot.conversation_id, None);
        assert_eq!(texts(&snapshot), vec!["Hello", "ok"]);
        assert!(engine.list_conversations().await?.is_empty());

        let request = responder.last_request().ok_or(ChatError::EmptyMessage)?;
        let thread = request.thread_id.unwrap_or_default();
        assert!(thread.starts_with("thread_"));
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_override_reaches_the_wire() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let engine = ChatEngine::new(quick_config(), ChatBackends::in_process(responder.clone()))?;
        engine
            .send_message("is this clause enforceable?", Some(AgentTag::LegalAdvisor))
            .await?;
        let request = responder.last_request().ok_or(ChatError::EmptyMessage)?;
        assert_eq!(request.agent, Some(AgentTag::LegalAdvisor));
        assert_eq!(request.message, "is this clause enforceable?");
        Ok(())
    }

    #[tokio::test]
    async fn test_greeting_seeds_new_chat_and_empty_conversations() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let backends = ChatBackends::in_process(responder.clone());
        let engine = ChatEngine::new(greeting_config(), backends.clone())?;

        let initial = engine.current_state().await;
        assert_eq!(initial.messages.len(), 1);
        assert_eq!(initial.messages[0].role, ChatRole::Assistant);
        assert_eq!(initial.messages[0].agent, Some(AgentTag::Supervisor));
        assert!(!initial.messages[0].id.is_durable());

        let id = backends.gateway.create_conversation("empty one").await?;
        engine.switch_conversation(Some(id)).await;
        let switched = engine.current_state().await;
        assert_eq!(switched.conversation_id, Some(id));
        assert_eq!(switched.messages.len(), 1);

        engine.switch_conversation(None).await;
        let detached = engine.current_state().await;
        assert_eq!(detached.conversation_id, None);
        assert_eq!(detached.messages.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_active_conversation_resets_to_new_chat() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let engine =
            ChatEngine::new(greeting_config(), ChatBackends::in_process(responder.clone()))?;
        engine.send_message("to be deleted", None).await?;
        settle(&engine).await;
        let id = engine
            .current_state()
            .await
            .conversation_id
            .ok_or(ChatError::EmptyMessage)?;

        engine.delete_conversation(id).await?;
        let snapshot = engine.current_state().await;
        assert_eq!(snapshot.conversation_id, None);
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].agent, Some(AgentTag::Supervisor));
        assert!(engine.list_conversations().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_delete_of_active_conversation_resets_state() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        let feed = Arc::new(ChannelFeed::new());
        let publisher = feed.publisher();
        let backends = ChatBackends {
            gateway: Arc::new(MemoryGateway::new().with_publisher(feed.publisher())),
            responder,
            feed: feed.clone(),
        };
        let engine = ChatEngine::new(greeting_config(), backends)?;

        engine.send_message("short lived", None).await?;
        settle(&engine).await;
        let id = engine
            .current_state()
            .await
            .conversation_id
            .ok_or(ChatError::EmptyMessage)?;

        publisher.publish(&RowChange {
            table: ChangeTable::Conversations,
            event: ChangeEvent::Delete,
            row: json!({ "id": id.to_string() }),
        });
        sleep(Duration::from_millis(40)).await;

        let snapshot = engine.current_state().await;
        assert_eq!(snapshot.conversation_id, None);
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].agent, Some(AgentTag::Supervisor));
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_pending_reclaim_unwedges_the_phase() -> ChatResult<()> {
        let responder = ScriptedResponder::new();
        responder.push_ok("working on it", "cofounder");
        responder.push_ok("done", "cofounder");
        let gateway = Arc::new(FlakyGateway {
            inner: MemoryGateway::new(),
            fail_create: false,
            hang_inserts: true,
        });
        let backends = ChatBackends {
            gateway,
            responder: responder.clone(),
            feed: Arc::new(ChannelFeed::new()),
        };
        let mut config = quick_config();
        config.responder.request_timeout = Duration::from_millis(60);
        let engine = ChatEngine::new(config, backends)?;

        engine.send_message("first", None).await?;
        assert_eq!(
            engine.current_state().await.phase,
            SendPhase::AwaitingPersistence
        );

        sleep(Duration::from_millis(120)).await;
        engine.send_message("second", None).await?;
        assert_eq!(responder.calls(), 2);
        let snapshot = engine.current_state().await;
        assert_eq!(snapshot.messages.len(), 4);
        Ok(())
    }
}
