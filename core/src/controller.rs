/// Sync controller: the single entry point that mutates the session's stores
///
/// One controller serves both screens. The conversation list is fed by a
/// viewer-scoped subscription (`Loading -> Ready`, never back), and the open
/// chat by a conversation-scoped one with its own state machine:
///
/// ```text
/// Idle -> Loading -> Live -> (Disconnected -> Loading -> Live) -> Closed
/// ```
///
/// Every open gets a fresh token. Work that finishes after its chat was
/// closed or replaced still lands in the stores, but its UI effects are
/// suppressed by comparing tokens at completion time.
use crate::backend::{Backend, FeedScope, FeedSubscription};
use crate::config::Config;
use crate::dto::{convert_rows, NewConversation};
use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeedAdapter, FeedEffect, FeedEvent, Mutation};
use crate::session::Session;
use crate::types::{
    ChatView, Conversation, ConversationId, ConversationSummary, Listing, Message, MessageId,
    SyncEvent,
};
use crate::utils::{Backoff, EventBus};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Idle,
    Loading,
    Live,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListState {
    Loading,
    Ready,
}

/// Backoff settings for transport calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            initial: config.retry_initial,
            max: config.retry_max,
            max_attempts: config.max_attempts.max(1),
        }
    }
}

struct ChatScreen {
    token: Uuid,
    conversation_id: ConversationId,
    state: ChatState,
    /// Feed pump; aborting it drops the subscription
    pump: Option<JoinHandle<()>>,
}

impl ChatScreen {
    fn is_open(&self) -> bool {
        self.state != ChatState::Closed
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[derive(Clone)]
pub struct SyncController {
    session: Arc<Session>,
    backend: Arc<dyn Backend>,
    adapter: ChangeFeedAdapter,
    retry: RetryPolicy,
    chat: Arc<Mutex<Option<ChatScreen>>>,
    list_state: Arc<RwLock<ListState>>,
    list_pump: Arc<Mutex<Option<JoinHandle<()>>>>,
    draft: Arc<RwLock<Option<String>>>,
    events: EventBus,
}

impl SyncController {
    pub fn new(session: Arc<Session>, backend: Arc<dyn Backend>, config: &Config) -> Self {
        let viewer_id = session.viewer().id.clone();
        Self {
            adapter: ChangeFeedAdapter::new(viewer_id.clone()),
            events: EventBus::new(viewer_id, config.event_capacity),
            retry: RetryPolicy::from(config),
            session,
            backend,
            chat: Arc::new(Mutex::new(None)),
            list_state: Arc::new(RwLock::new(ListState::Loading)),
            list_pump: Arc::new(Mutex::new(None)),
            draft: Arc::new(RwLock::new(None)),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ---- read models ----

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.session.summaries().await
    }

    pub async fn unread_total(&self) -> usize {
        self.session.unread_total().await
    }

    /// The open chat as the renderer should draw it
    pub async fn chat_view(&self) -> Option<ChatView> {
        let id = self.open_chat_id().await?;
        Some(self.session.chat_view(id).await)
    }

    pub async fn messages(&self) -> Vec<Message> {
        match self.open_chat_id().await {
            Some(id) => self.session.messages(id).await,
            None => Vec::new(),
        }
    }

    /// Always the open chat's conversation; both change under one lock
    pub async fn selected_conversation_id(&self) -> Option<ConversationId> {
        self.open_chat_id().await
    }

    pub async fn chat_state(&self) -> ChatState {
        self.chat
            .lock()
            .await
            .as_ref()
            .map(|screen| screen.state)
            .unwrap_or(ChatState::Idle)
    }

    pub async fn list_state(&self) -> ListState {
        *self.list_state.read().await
    }

    /// Compose box text kept after a failed send
    pub async fn draft(&self) -> Option<String> {
        self.draft.read().await.clone()
    }

    // ---- conversation list ----

    /// Subscribe to the viewer's conversations and load the list.
    /// The list becomes `Ready` once loaded, even if the subscription could not
    /// be established; that failure is still returned and the subscription is
    /// retried in the background.
    pub async fn load_conversations(&self) -> Result<()> {
        self.session.ensure_active()?;
        let scope = FeedScope::Viewer(self.session.viewer().id.clone());

        let subscription = self
            .with_retry("subscribe to conversations", || self.backend.subscribe(scope.clone()))
            .await;

        self.refresh_conversations().await?;
        *self.list_state.write().await = ListState::Ready;

        // Without a subscription the pump starts by resyncing in the background
        let (initial, result) = match subscription {
            Ok(sub) => (Some(sub), Ok(())),
            Err(e) => (None, Err(e)),
        };
        let pump = tokio::spawn(self.clone().run_list_pump(initial));
        if let Some(old) = self.list_pump.lock().await.replace(pump) {
            old.abort();
        }
        info!("Conversation list ready for {}", self.session.viewer().id);
        result
    }

    /// Re-read the viewer's conversations and their messages.
    /// Never changes the selection and never removes rendered messages.
    pub async fn refresh_conversations(&self) -> Result<()> {
        self.session.ensure_active()?;
        let viewer = self.session.viewer().id.clone();

        let rows = self
            .with_retry("fetch conversations", || self.backend.fetch_conversations(&viewer))
            .await?;
        let conversations: Vec<Conversation> = convert_rows::<_, Conversation>(rows)
            .into_iter()
            .filter(|c| c.involves(&viewer))
            .collect();

        {
            let mut index = self.session.index().write().await;
            for conv in &conversations {
                index.upsert(conv.clone());
            }
        }

        for conv in &conversations {
            match self.backend.fetch_messages(conv.id).await {
                Ok(rows) => {
                    self.merge_messages(conv.id, convert_rows(rows)).await;
                }
                Err(e) => warn!("Failed to fetch messages for {}: {}", conv.id, e),
            }
        }

        if let Some(open) = self.open_chat_id().await {
            self.mark_open_read(open).await;
        }

        debug!("Refreshed {} conversations", conversations.len());
        self.events.emit(SyncEvent::ConversationsChanged);
        Ok(())
    }

    async fn run_list_pump(self, initial: Option<FeedSubscription>) {
        let mut sub = match initial {
            Some(sub) => sub,
            None => match self.resync_list().await {
                Some(sub) => sub,
                None => return,
            },
        };
        loop {
            match sub.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    drop(sub);
                    warn!("Conversation list: {}", e);
                    match self.resync_list().await {
                        Some(next) => sub = next,
                        None => return,
                    }
                }
            }
        }
    }

    async fn resync_list(&self) -> Option<FeedSubscription> {
        let scope = FeedScope::Viewer(self.session.viewer().id.clone());
        let mut backoff = Backoff::new(self.retry.initial, self.retry.max);

        while self.session.is_active() {
            let attempt = async {
                let sub = self.backend.subscribe(scope.clone()).await?;
                self.refresh_conversations().await?;
                Ok::<_, SyncError>(sub)
            };
            match attempt.await {
                Ok(sub) => {
                    info!("Conversation feed resubscribed");
                    return Some(sub);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.attempts() == 1 {
                        self.events.emit(SyncEvent::TransportDegraded {
                            reason: e.to_string(),
                        });
                    }
                    warn!("Conversation feed resync failed ({}), retrying in {:?}", e, delay);
                    sleep(delay).await;
                }
            }
        }
        None
    }

    // ---- chat screen ----

    /// Open a conversation that is already in the index.
    /// If the snapshot or the subscription fails the chat stays `Loading`,
    /// the error is returned, and a background loop keeps retrying until the
    /// chat goes `Live` or is closed.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.session.ensure_active()?;
        if !self.session.index().read().await.contains(conversation_id) {
            return Err(SyncError::NotFound(format!("conversation {}", conversation_id)));
        }

        let token = Uuid::new_v4();
        {
            let mut chat = self.chat.lock().await;
            if let Some(prev) = chat.as_mut() {
                if prev.is_open() && prev.conversation_id == conversation_id && prev.state == ChatState::Live {
                    debug!("Conversation {} already open", conversation_id);
                    return Ok(());
                }
                prev.stop_pump();
            }
            *chat = Some(ChatScreen {
                token,
                conversation_id,
                state: ChatState::Loading,
                pump: None,
            });
        }
        info!("Opening conversation {}", conversation_id);

        let synced = self.initial_sync(conversation_id).await;

        let mut chat = self.chat.lock().await;
        let screen = match chat.as_mut() {
            Some(screen) if screen.token == token && screen.is_open() => screen,
            _ => {
                debug!("Chat {} closed while loading", conversation_id);
                return Ok(());
            }
        };
        match synced {
            Ok(sub) => {
                screen.pump = Some(tokio::spawn(
                    self.clone().run_chat_pump(token, conversation_id, Some(sub)),
                ));
                screen.state = ChatState::Live;
                drop(chat);
                self.events.emit(SyncEvent::Live { conversation_id });
                Ok(())
            }
            Err(e) => {
                warn!("Chat {} stays loading, retrying in the background", conversation_id);
                screen.pump = Some(tokio::spawn(
                    self.clone().run_chat_pump(token, conversation_id, None),
                ));
                Err(e)
            }
        }
    }

    /// Snapshot, subscribe, then catch up on anything sent in between
    async fn initial_sync(&self, conversation_id: ConversationId) -> Result<FeedSubscription> {
        self.load_snapshot(conversation_id).await?;
        self.mark_open_read(conversation_id).await;

        let sub = self
            .with_retry("subscribe to conversation", || {
                self.backend.subscribe(FeedScope::Conversation(conversation_id))
            })
            .await?;

        self.load_snapshot(conversation_id).await?;
        self.mark_open_read(conversation_id).await;
        Ok(sub)
    }

    /// Deep link: open by id, fetching the conversation first if needed
    pub async fn navigate_to(&self, conversation_id: ConversationId) -> Result<()> {
        self.session.ensure_active()?;
        let known = self.session.index().read().await.contains(conversation_id);
        if !known {
            let row = self
                .with_retry("fetch conversation", || self.backend.fetch_conversation(conversation_id))
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("conversation {}", conversation_id)))?;
            let conv = Conversation::try_from(row)?;
            if !conv.involves(&self.session.viewer().id) {
                return Err(SyncError::NotFound(format!("conversation {}", conversation_id)));
            }
            self.session.index().write().await.upsert(conv);
            self.events.emit(SyncEvent::ConversationsChanged);
        }

        self.open_conversation(conversation_id).await?;

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh_conversations().await {
                warn!("Background refresh after navigation failed: {}", e);
            }
        });
        Ok(())
    }

    /// First contact from a listing page: find or create the conversation,
    /// open it and send `text`
    pub async fn start_conversation(&self, listing: &Listing, text: &str) -> Result<Message> {
        self.session.ensure_active()?;
        if text.trim().is_empty() {
            return Err(SyncError::Validation("message is empty".to_string()));
        }
        let viewer = self.session.viewer().clone();
        if listing.seller_id == viewer.id {
            return Err(SyncError::Validation(
                "cannot start a conversation on your own listing".to_string(),
            ));
        }

        let new = NewConversation {
            listing_id: listing.id.clone(),
            buyer_id: viewer.id.clone(),
            seller_id: listing.seller_id.clone(),
            buyer_name: Some(viewer.display_name.clone()).filter(|n| !n.trim().is_empty()),
            seller_name: Some(listing.seller_name.clone()).filter(|n| !n.trim().is_empty()),
        };
        let row = self
            .with_retry("find or create conversation", || {
                self.backend.find_or_create_conversation(new.clone())
            })
            .await?;

        let mut conv = Conversation::try_from(row)?;
        if conv.listing.title.is_none() && !listing.title.is_empty() {
            conv.listing.title = Some(listing.title.clone());
        }
        let conversation_id = conv.id;
        self.session.index().write().await.upsert(conv);
        self.events.emit(SyncEvent::ConversationsChanged);

        // Sending only needs the chat screen, not a live feed
        let opened = self.open_conversation(conversation_id).await;
        if self.open_chat_id().await != Some(conversation_id) {
            let reason = match opened {
                Err(e) => e.to_string(),
                Ok(()) => "chat was closed before sending".to_string(),
            };
            return Err(self.keep_draft(text, reason).await);
        }
        if let Err(e) = opened {
            warn!("Sending first message to {} before the chat is live: {}", conversation_id, e);
        }
        self.send(text).await
    }

    /// Send into the open chat. Empty text and a missing chat are rejected
    /// before any network call; on failure the text is kept as the draft.
    pub async fn send(&self, text: &str) -> Result<Message> {
        self.session.ensure_active()?;
        let content = text.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("message is empty".to_string()));
        }
        let (token, conversation_id) = self
            .open_chat()
            .await
            .ok_or_else(|| SyncError::Validation("no conversation is open".to_string()))?;

        let sender = self.session.viewer().id.clone();
        let row = match self.backend.send_message(conversation_id, &sender, content).await {
            Ok(row) => row,
            Err(e) => {
                warn!("Send to {} failed: {}", conversation_id, e);
                return Err(self.keep_draft(text, e.to_string()).await);
            }
        };

        let message = Message::try_from(row)?;
        {
            let mut store = self.session.store().write().await;
            let mut index = self.session.index().write().await;
            match store.append(conversation_id, message.clone()) {
                // The feed echo got here first
                Ok(_) | Err(SyncError::DuplicateMessage { .. }) => {}
                Err(e) => return Err(e),
            }
            index.note_message(&message);
        }

        if self.is_current(token).await {
            *self.draft.write().await = None;
            self.events.emit(SyncEvent::ScrollToBottom { conversation_id });
        }
        self.events.emit(SyncEvent::ConversationsChanged);
        Ok(message)
    }

    /// Keep unsent text in the compose box and report it back
    async fn keep_draft(&self, text: &str, reason: String) -> SyncError {
        *self.draft.write().await = Some(text.to_string());
        self.events.emit(SyncEvent::SendFailed {
            content: text.to_string(),
            reason: reason.clone(),
        });
        SyncError::SendFailed {
            content: text.to_string(),
            reason,
        }
    }

    /// Close the chat screen: unsubscribe and clear the selection.
    /// In-flight sends and fetches still complete into the stores.
    pub async fn close(&self) {
        let mut chat = self.chat.lock().await;
        if let Some(screen) = chat.as_mut().filter(|screen| screen.is_open()) {
            screen.stop_pump();
            screen.state = ChatState::Closed;
            info!("Closed conversation {}", screen.conversation_id);
        }
    }

    pub async fn logout(&self) {
        self.close().await;
        if let Some(pump) = self.list_pump.lock().await.take() {
            pump.abort();
        }
        *self.list_state.write().await = ListState::Loading;
        *self.draft.write().await = None;
        self.session.logout().await;
    }

    async fn run_chat_pump(
        self,
        token: Uuid,
        conversation_id: ConversationId,
        initial: Option<FeedSubscription>,
    ) {
        let mut sub = match initial {
            Some(sub) => sub,
            None => match self.connect_chat(token, conversation_id).await {
                Some(sub) => sub,
                None => return,
            },
        };
        loop {
            match sub.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    drop(sub);
                    match self.resync_chat(token, conversation_id, &e).await {
                        Some(next) => sub = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Forced full resync after the feed dropped. Rendered history is kept;
    /// the fresh snapshot only appends or marks read.
    async fn resync_chat(
        &self,
        token: Uuid,
        conversation_id: ConversationId,
        cause: &SyncError,
    ) -> Option<FeedSubscription> {
        if !self.set_chat_state(token, ChatState::Disconnected).await {
            return None;
        }
        warn!("Chat {}: {}, resyncing", conversation_id, cause);
        self.events.emit(SyncEvent::Reconnecting);
        self.set_chat_state(token, ChatState::Loading).await;
        self.connect_chat(token, conversation_id).await
    }

    /// Subscribe and fetch with unbounded backoff while `token` owns the chat,
    /// then go `Live`
    async fn connect_chat(&self, token: Uuid, conversation_id: ConversationId) -> Option<FeedSubscription> {
        let mut backoff = Backoff::new(self.retry.initial, self.retry.max);
        while self.session.is_active() && self.is_current(token).await {
            let attempt = async {
                let sub = self
                    .backend
                    .subscribe(FeedScope::Conversation(conversation_id))
                    .await?;
                let rows = self.backend.fetch_messages(conversation_id).await?;
                self.merge_messages(conversation_id, convert_rows(rows)).await;
                Ok::<_, SyncError>(sub)
            };
            match attempt.await {
                Ok(sub) => {
                    self.mark_open_read(conversation_id).await;
                    if !self.set_chat_state(token, ChatState::Live).await {
                        return None;
                    }
                    info!("Chat feed for {} live", conversation_id);
                    self.events.emit(SyncEvent::Live { conversation_id });
                    return Some(sub);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.attempts() == 1 {
                        self.events.emit(SyncEvent::TransportDegraded {
                            reason: e.to_string(),
                        });
                    }
                    warn!("Connecting chat {} failed ({}), retrying in {:?}", conversation_id, e, delay);
                    sleep(delay).await;
                }
            }
        }
        None
    }

    // ---- feed handling ----

    async fn handle_event(&self, event: FeedEvent) {
        if !self.session.is_active() {
            return;
        }

        let mutation = {
            let index = self.session.index().read().await;
            self.adapter.translate(event, &index)
        };
        if let Mutation::ResolveConversation(msg) = &mutation {
            self.resolve_conversation(msg.conversation_id).await;
        }

        let open_chat = self.open_chat_id().await;
        let effects = {
            let mut store = self.session.store().write().await;
            let mut index = self.session.index().write().await;
            self.adapter.apply(mutation, &mut store, &mut index, open_chat)
        };
        self.run_effects(effects).await;
    }

    /// Index a conversation first seen through one of its messages
    async fn resolve_conversation(&self, conversation_id: ConversationId) {
        match self.backend.fetch_conversation(conversation_id).await {
            Ok(Some(row)) => match Conversation::try_from(row) {
                Ok(conv) if conv.involves(self.adapter.viewer()) => {
                    self.session.index().write().await.upsert(conv);
                }
                Ok(_) => debug!("Conversation {} is not the viewer's", conversation_id),
                Err(e) => warn!("Malformed conversation {}: {}", conversation_id, e),
            },
            Ok(None) => debug!("Conversation {} not found", conversation_id),
            Err(e) => warn!("Failed to resolve conversation {}: {}", conversation_id, e),
        }
    }

    async fn run_effects(&self, effects: Vec<FeedEffect>) {
        let mut list_changed = false;
        for effect in effects {
            match effect {
                FeedEffect::ScrollToBottom(conversation_id) => {
                    self.events.emit(SyncEvent::ScrollToBottom { conversation_id });
                }
                FeedEffect::UnreadChanged(conversation_id) => self.emit_unread(conversation_id).await,
                FeedEffect::ConversationsChanged => list_changed = true,
                FeedEffect::MarkReadRemote {
                    conversation_id,
                    message_ids,
                } => self.spawn_remote_mark_read(conversation_id, message_ids),
            }
        }
        if list_changed {
            self.events.emit(SyncEvent::ConversationsChanged);
        }
    }

    // ---- helpers ----

    async fn load_snapshot(&self, conversation_id: ConversationId) -> Result<usize> {
        let rows = self
            .with_retry("fetch messages", || self.backend.fetch_messages(conversation_id))
            .await?;
        Ok(self.merge_messages(conversation_id, convert_rows(rows)).await)
    }

    /// Fold fetched messages in. For the open chat, whatever arrives from the
    /// other party is read in the same step, so it never shows as unread.
    async fn merge_messages(&self, conversation_id: ConversationId, messages: Vec<Message>) -> usize {
        let is_open = self.open_chat_id().await == Some(conversation_id);
        let (changed, read_now) = {
            let mut store = self.session.store().write().await;
            let mut index = self.session.index().write().await;
            for msg in &messages {
                index.note_message(msg);
            }
            let changed = store.merge_snapshot(conversation_id, messages);
            let read_now = if is_open {
                let unread = store.unread_ids(conversation_id, self.adapter.viewer());
                store.mark_read(conversation_id, &unread)
            } else {
                Vec::new()
            };
            (changed, read_now)
        };

        if !read_now.is_empty() {
            self.emit_unread(conversation_id).await;
            self.spawn_remote_mark_read(conversation_id, read_now);
        }
        changed
    }

    /// Mark everything the other party sent as read, locally now and remotely
    /// in the background
    async fn mark_open_read(&self, conversation_id: ConversationId) {
        if self.open_chat_id().await != Some(conversation_id) {
            return;
        }
        let viewer = self.adapter.viewer();
        let changed = {
            let mut store = self.session.store().write().await;
            let unread = store.unread_ids(conversation_id, viewer);
            store.mark_read(conversation_id, &unread)
        };
        if changed.is_empty() {
            return;
        }
        self.emit_unread(conversation_id).await;
        self.spawn_remote_mark_read(conversation_id, changed);
    }

    fn spawn_remote_mark_read(&self, conversation_id: ConversationId, message_ids: Vec<MessageId>) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            // Stale read state heals on the next fetch
            if let Err(e) = backend.mark_messages_read(conversation_id, &message_ids).await {
                warn!("Failed to mark {} messages read in {}: {}", message_ids.len(), conversation_id, e);
            }
        });
    }

    async fn emit_unread(&self, conversation_id: ConversationId) {
        let viewer = self.adapter.viewer();
        let (unread, total) = {
            let store = self.session.store().read().await;
            let index = self.session.index().read().await;
            (
                store.unread_count(conversation_id, viewer),
                index.unread_total(viewer, &store),
            )
        };
        self.events.emit(SyncEvent::UnreadChanged {
            conversation_id,
            unread,
            total,
        });
    }

    async fn open_chat(&self) -> Option<(Uuid, ConversationId)> {
        self.chat
            .lock()
            .await
            .as_ref()
            .filter(|screen| screen.is_open())
            .map(|screen| (screen.token, screen.conversation_id))
    }

    async fn open_chat_id(&self) -> Option<ConversationId> {
        self.open_chat().await.map(|(_, id)| id)
    }

    async fn is_current(&self, token: Uuid) -> bool {
        self.open_chat().await.map(|(t, _)| t == token).unwrap_or(false)
    }

    /// Returns false if `token` no longer owns the chat screen
    async fn set_chat_state(&self, token: Uuid, state: ChatState) -> bool {
        let mut chat = self.chat.lock().await;
        match chat.as_mut() {
            Some(screen) if screen.token == token && screen.is_open() => {
                screen.state = state;
                true
            }
            _ => false,
        }
    }

    /// Run `op` with backoff while it fails with a retryable error
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = Backoff::new(self.retry.initial, self.retry.max);
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && backoff.attempts() + 1 < self.retry.max_attempts => {
                    let delay = backoff.next_delay();
                    if backoff.attempts() == 1 {
                        self.events.emit(SyncEvent::TransportDegraded {
                            reason: e.to_string(),
                        });
                    }
                    warn!("{} failed ({}), retrying in {:?}", what, e, delay);
                    sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.events.emit(SyncEvent::TransportDegraded {
                            reason: e.to_string(),
                        });
                    }
                    warn!("{} failed: {}", what, e);
                    return Err(e);
                }
            }
        }
    }
}
