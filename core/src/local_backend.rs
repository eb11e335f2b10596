/// Local backend: the table API backed by sled, with an in-process change feed
///
/// Trees:
///   conversations  id -> ConversationRow json
///   messages       "{conversation}:{created_at micros}:{id}" -> MessageRow json
///   listings       listing id -> ListingRow json
///   pair_index     "{listing len}:{listing}{buyer}" -> conversation id (unique, compare-and-swap)
use crate::backend::{Backend, FeedScope, FeedSubscription};
use crate::dto::{ConversationRow, ListingRow, MessageRow, NewConversation};
use crate::error::{Result, SyncError};
use crate::feed::{ChangeKind, FeedEvent, FeedSignal};
use crate::types::{ConversationId, MessageId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_FEED_CAPACITY: usize = 256;

struct Subscriber {
    scope: FeedScope,
    tx: mpsc::Sender<FeedSignal>,
}

type Subscribers = Arc<Mutex<HashMap<u64, Subscriber>>>;

fn lock(subs: &Subscribers) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
    subs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct LocalBackend {
    db: sled::Db,
    conversations: sled::Tree,
    messages: sled::Tree,
    listings: sled::Tree,
    pair_index: sled::Tree,
    subscribers: Subscribers,
    next_subscriber: Arc<AtomicU64>,
    feed_capacity: usize,
}

/// Length prefix keeps the split unambiguous whatever the ids contain
fn pair_key(listing_id: &str, buyer_id: &str) -> String {
    format!("{}:{}{}", listing_id.len(), listing_id, buyer_id)
}

fn message_key(row: &MessageRow) -> String {
    format!(
        "{}:{:020}:{}",
        row.conversation_id,
        row.created_at.timestamp_micros().max(0),
        row.id
    )
}

impl LocalBackend {
    /// Open (or create) the backend under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("tables.db");
        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open tables DB: {}", e)))?;
        info!("Local backend opened at {:?}", db_path);
        Self::from_db(db)
    }

    /// In-memory backend, removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            conversations: db.open_tree("conversations")?,
            messages: db.open_tree("messages")?,
            listings: db.open_tree("listings")?,
            pair_index: db.open_tree("pair_index")?,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: Arc::new(AtomicU64::new(1)),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            db,
        })
    }

    /// Per-subscriber buffer; a subscriber that falls further behind is cut off
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn put_listing(&self, listing: &ListingRow) -> Result<()> {
        let value = serde_json::to_vec(listing)?;
        self.listings.insert(listing.id.as_bytes(), value)?;
        Ok(())
    }

    fn get_listing(&self, id: &str) -> Result<Option<ListingRow>> {
        match self.listings.get(id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationRow>> {
        match self.conversations.get(id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn put_conversation(&self, row: &ConversationRow) -> Result<()> {
        // Embedded listing is a join result, not a stored column
        let mut stored = row.clone();
        stored.listing = None;
        self.conversations
            .insert(row.id.as_bytes(), serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    fn with_listing(&self, mut row: ConversationRow) -> Result<ConversationRow> {
        row.listing = self.get_listing(&row.listing_id)?;
        Ok(row)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Drop every subscription, as a lost realtime connection would
    pub fn disconnect_all(&self) {
        let drained: Vec<Subscriber> = lock(&self.subscribers).drain().map(|(_, s)| s).collect();
        info!("Disconnecting {} feed subscribers", drained.len());
        for sub in drained {
            let _ = sub.tx.try_send(FeedSignal::Disconnected);
        }
    }

    fn publish(&self, conversation: &ConversationRow, event: FeedEvent) {
        let mut subs = lock(&self.subscribers);
        let mut overflowed = Vec::new();
        for (id, sub) in subs.iter() {
            if !sub.scope.admits(conversation) {
                continue;
            }
            match sub.tx.try_send(FeedSignal::Event(event.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // A subscriber that cannot keep up is cut off; it resyncs on reconnect
                    warn!("Feed subscriber {} overflowed, disconnecting", id);
                    overflowed.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => overflowed.push(*id),
            }
        }
        for id in overflowed {
            subs.remove(&id);
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn fetch_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageRow>> {
        let prefix = format!("{}:", conversation_id);
        let mut out = Vec::new();
        for entry in self.messages.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice::<MessageRow>(&value)?);
        }
        Ok(out)
    }

    async fn fetch_conversations(&self, viewer: &str) -> Result<Vec<ConversationRow>> {
        let mut out = Vec::new();
        for entry in self.conversations.iter() {
            let (_, value) = entry?;
            let row: ConversationRow = serde_json::from_slice(&value)?;
            if row.seller_id == viewer || row.buyer_id == viewer {
                out.push(self.with_listing(row)?);
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn fetch_conversation(&self, id: ConversationId) -> Result<Option<ConversationRow>> {
        self.get_conversation(id)?
            .map(|row| self.with_listing(row))
            .transpose()
    }

    async fn find_conversation(&self, listing_id: &str, buyer_id: &str) -> Result<Option<ConversationRow>> {
        let key = pair_key(listing_id, buyer_id);
        let Some(raw) = self.pair_index.get(key.as_bytes())? else {
            return Ok(None);
        };
        let id = Uuid::from_slice(&raw)
            .map_err(|e| SyncError::Storage(format!("corrupt pair index entry {}: {}", key, e)))?;
        self.fetch_conversation(id).await
    }

    async fn insert_conversation(&self, new: NewConversation) -> Result<ConversationRow> {
        if new.seller_id == new.buyer_id {
            return Err(SyncError::Validation(
                "buyer and seller must differ".to_string(),
            ));
        }

        let now = Utc::now();
        let row = ConversationRow {
            id: Uuid::new_v4(),
            listing_id: new.listing_id,
            seller_id: new.seller_id,
            buyer_id: new.buyer_id,
            buyer_name: new.buyer_name,
            seller_name: new.seller_name,
            created_at: now,
            updated_at: now,
            listing: None,
        };

        // Row first, so whoever sees the index entry can also read the row
        self.put_conversation(&row)?;
        let key = pair_key(&row.listing_id, &row.buyer_id);
        let swapped = self.pair_index.compare_and_swap(
            key.as_bytes(),
            None as Option<&[u8]>,
            Some(row.id.as_bytes().as_slice()),
        )?;
        if swapped.is_err() {
            self.conversations.remove(row.id.as_bytes())?;
            return Err(SyncError::UniqueViolation(format!(
                "conversation already exists for {}",
                key
            )));
        }

        debug!("Created conversation {} for {}", row.id, key);
        let row = self.with_listing(row)?;
        self.publish(&row, FeedEvent::conversation(ChangeKind::Insert, row.clone()));
        Ok(row)
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("message content is empty".to_string()));
        }
        let mut conversation = self
            .get_conversation(conversation_id)?
            .ok_or_else(|| SyncError::NotFound(format!("conversation {}", conversation_id)))?;
        if conversation.seller_id != sender_id && conversation.buyer_id != sender_id {
            return Err(SyncError::Validation(format!(
                "{} is not a participant of {}",
                sender_id, conversation_id
            )));
        }

        let row = MessageRow {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: false,
        };
        self.messages
            .insert(message_key(&row).as_bytes(), serde_json::to_vec(&row)?)?;

        conversation.updated_at = row.created_at;
        self.put_conversation(&conversation)?;

        self.publish(&conversation, FeedEvent::message(ChangeKind::Insert, row.clone()));
        let conversation = self.with_listing(conversation)?;
        self.publish(
            &conversation,
            FeedEvent::conversation(ChangeKind::Update, conversation.clone()),
        );
        Ok(row)
    }

    async fn mark_messages_read(&self, conversation_id: ConversationId, message_ids: &[MessageId]) -> Result<()> {
        let Some(conversation) = self.get_conversation(conversation_id)? else {
            return Ok(());
        };

        let prefix = format!("{}:", conversation_id);
        let mut changed = Vec::new();
        for entry in self.messages.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let mut row: MessageRow = serde_json::from_slice(&value)?;
            if row.is_read || !message_ids.contains(&row.id) {
                continue;
            }
            row.is_read = true;
            self.messages.insert(key, serde_json::to_vec(&row)?)?;
            changed.push(row);
        }

        for row in changed {
            self.publish(&conversation, FeedEvent::message(ChangeKind::Update, row));
        }
        Ok(())
    }

    async fn subscribe(&self, scope: FeedScope) -> Result<FeedSubscription> {
        let (tx, rx) = mpsc::channel(self.feed_capacity);
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).insert(
            id,
            Subscriber {
                scope: scope.clone(),
                tx,
            },
        );
        debug!("Feed subscriber {} registered for {:?}", id, scope);

        let subscribers = self.subscribers.clone();
        Ok(FeedSubscription::new(scope, rx, move || {
            lock(&subscribers).remove(&id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEntity;
    use tempfile::TempDir;

    fn new_conversation(listing: &str, buyer: &str, seller: &str) -> NewConversation {
        NewConversation {
            listing_id: listing.into(),
            buyer_id: buyer.into(),
            seller_id: seller.into(),
            buyer_name: Some("Bea".into()),
            seller_name: Some("Sam".into()),
        }
    }

    #[tokio::test]
    async fn test_unique_pair_constraint() {
        let backend = LocalBackend::temporary().unwrap();
        let first = backend
            .insert_conversation(new_conversation("L42", "B1", "S1"))
            .await
            .unwrap();
        let second = backend
            .insert_conversation(new_conversation("L42", "B1", "S1"))
            .await;
        assert!(matches!(second, Err(SyncError::UniqueViolation(_))));

        let adopted = backend
            .find_or_create_conversation(new_conversation("L42", "B1", "S1"))
            .await
            .unwrap();
        assert_eq!(adopted.id, first.id);
        assert_eq!(backend.fetch_conversations("S1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pair_key_separator_in_ids() {
        let backend = LocalBackend::temporary().unwrap();
        let first = backend
            .insert_conversation(new_conversation("a/b", "c", "S1"))
            .await
            .unwrap();
        let second = backend
            .insert_conversation(new_conversation("a", "b/c", "S1"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let found = backend.find_conversation("a", "b/c").await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
        assert_eq!(found.buyer_id, "b/c");
        assert!(backend.find_conversation("a/", "bc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_ordered_and_touch_conversation() {
        let backend = LocalBackend::temporary().unwrap();
        let conv = backend
            .insert_conversation(new_conversation("L1", "B1", "S1"))
            .await
            .unwrap();

        let a = backend.send_message(conv.id, "B1", "  first ").await.unwrap();
        let b = backend.send_message(conv.id, "S1", "second").await.unwrap();
        assert_eq!(a.content, "first");

        let rows = backend.fetch_messages(conv.id).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        let touched = backend.fetch_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(touched.updated_at, b.created_at);
    }

    #[tokio::test]
    async fn test_send_rejects_outsiders_and_blank() {
        let backend = LocalBackend::temporary().unwrap();
        let conv = backend
            .insert_conversation(new_conversation("L1", "B1", "S1"))
            .await
            .unwrap();
        assert!(backend.send_message(conv.id, "X", "hi").await.is_err());
        assert!(backend.send_message(conv.id, "B1", "   ").await.is_err());
        assert!(matches!(
            backend.send_message(Uuid::new_v4(), "B1", "hi").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_feed_scoping() {
        let backend = LocalBackend::temporary().unwrap();
        let conv = backend
            .insert_conversation(new_conversation("L1", "B1", "S1"))
            .await
            .unwrap();
        let mut seller_feed = backend.subscribe(FeedScope::Viewer("S1".into())).await.unwrap();
        let mut chat_feed = backend.subscribe(FeedScope::Conversation(conv.id)).await.unwrap();
        let outsider_feed = backend.subscribe(FeedScope::Viewer("X".into())).await.unwrap();

        let sent = backend.send_message(conv.id, "B1", "hello").await.unwrap();

        for feed in [&mut seller_feed, &mut chat_feed] {
            match feed.next().await {
                FeedSignal::Event(FeedEvent {
                    kind: ChangeKind::Insert,
                    entity: FeedEntity::Message(row),
                }) => assert_eq!(row.id, sent.id),
                other => panic!("unexpected signal {:?}", other),
            }
        }
        assert_eq!(backend.subscriber_count(), 3);
        drop(outsider_feed);
        assert_eq!(backend.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_mark_read_publishes_updates() {
        let backend = LocalBackend::temporary().unwrap();
        let conv = backend
            .insert_conversation(new_conversation("L1", "B1", "S1"))
            .await
            .unwrap();
        let sent = backend.send_message(conv.id, "B1", "hello").await.unwrap();
        let mut feed = backend.subscribe(FeedScope::Conversation(conv.id)).await.unwrap();

        backend.mark_messages_read(conv.id, &[sent.id]).await.unwrap();
        // Second call is a no-op
        backend.mark_messages_read(conv.id, &[sent.id]).await.unwrap();

        match feed.next().await {
            FeedSignal::Event(ev) => assert_eq!(ev.kind, ChangeKind::Update),
            other => panic!("unexpected signal {:?}", other),
        }
        assert!(backend.fetch_messages(conv.id).await.unwrap()[0].is_read);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let backend = LocalBackend::temporary().unwrap();
        let mut feed = backend.subscribe(FeedScope::Viewer("S1".into())).await.unwrap();
        backend.disconnect_all();
        assert_eq!(feed.next().await, FeedSignal::Disconnected);
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let id = {
            let backend = LocalBackend::open(temp_dir.path()).unwrap();
            backend
                .put_listing(&ListingRow {
                    id: "L1".into(),
                    title: Some("Bike".into()),
                    price: Some(80.0),
                    seller_id: Some("S1".into()),
                    seller_name: Some("Sam".into()),
                })
                .unwrap();
            let id = backend
                .insert_conversation(new_conversation("L1", "B1", "S1"))
                .await
                .unwrap()
                .id;
            backend.flush().await.unwrap();
            id
        };

        let backend = LocalBackend::open(temp_dir.path()).unwrap();
        let row = backend.fetch_conversation(id).await.unwrap().unwrap();
        assert_eq!(row.listing.and_then(|l| l.title).as_deref(), Some("Bike"));
    }
}
