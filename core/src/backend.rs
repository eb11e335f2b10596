/// Backend contract: the remote table API the sync engine consumes
use crate::dto::{ConversationRow, MessageRow, NewConversation};
use crate::error::{Result, SyncError};
use crate::feed::{FeedEvent, FeedSignal};
use crate::types::{ConversationId, MessageId, UserId};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Row filter of a push subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedScope {
    /// Messages (and the row) of one conversation; backs an open chat
    Conversation(ConversationId),
    /// Every conversation the user is buyer or seller of, and their messages
    Viewer(UserId),
}

impl FeedScope {
    /// Whether a change touching `conversation` passes this filter
    pub fn admits(&self, conversation: &ConversationRow) -> bool {
        match self {
            FeedScope::Conversation(id) => conversation.id == *id,
            FeedScope::Viewer(user) => {
                conversation.seller_id == *user || conversation.buyer_id == *user
            }
        }
    }
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live push subscription. Dropping it unsubscribes.
pub struct FeedSubscription {
    scope: FeedScope,
    rx: mpsc::Receiver<FeedSignal>,
    unsubscribe: Option<Unsubscribe>,
}

impl FeedSubscription {
    pub fn new(
        scope: FeedScope,
        rx: mpsc::Receiver<FeedSignal>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            scope,
            rx,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Next signal; a closed channel reads as `Disconnected`
    pub async fn next(&mut self) -> FeedSignal {
        self.rx.recv().await.unwrap_or(FeedSignal::Disconnected)
    }

    /// Next event, or `FeedDisconnected` once the feed is gone
    pub async fn recv(&mut self) -> Result<FeedEvent> {
        match self.next().await {
            FeedSignal::Event(event) => Ok(event),
            FeedSignal::Disconnected => Err(SyncError::FeedDisconnected),
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            debug!("Unsubscribing feed {:?}", self.scope);
            f();
        }
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("scope", &self.scope)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Messages of a conversation, ascending by creation time
    async fn fetch_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageRow>>;

    /// Conversations where `viewer` is buyer or seller, most recently updated first
    async fn fetch_conversations(&self, viewer: &str) -> Result<Vec<ConversationRow>>;

    async fn fetch_conversation(&self, id: ConversationId) -> Result<Option<ConversationRow>>;

    async fn find_conversation(&self, listing_id: &str, buyer_id: &str) -> Result<Option<ConversationRow>>;

    /// Fails with `UniqueViolation` if (listing, buyer) already has a conversation
    async fn insert_conversation(&self, new: NewConversation) -> Result<ConversationRow>;

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: &str,
        content: &str,
    ) -> Result<MessageRow>;

    async fn mark_messages_read(&self, conversation_id: ConversationId, message_ids: &[MessageId]) -> Result<()>;

    async fn subscribe(&self, scope: FeedScope) -> Result<FeedSubscription>;

    /// Look up the (listing, buyer) conversation or create it. The first
    /// successful insert wins; a loser of the race adopts the winner's row.
    async fn find_or_create_conversation(&self, new: NewConversation) -> Result<ConversationRow> {
        if let Some(row) = self.find_conversation(&new.listing_id, &new.buyer_id).await? {
            return Ok(row);
        }

        let listing_id = new.listing_id.clone();
        let buyer_id = new.buyer_id.clone();
        match self.insert_conversation(new).await {
            Ok(row) => Ok(row),
            Err(SyncError::UniqueViolation(reason)) => {
                debug!("Lost conversation insert race ({}), adopting existing row", reason);
                self.find_conversation(&listing_id, &buyer_id)
                    .await?
                    .ok_or_else(|| {
                        SyncError::NotFound(format!(
                            "conversation for listing {} and buyer {}",
                            listing_id, buyer_id
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn row(listing: &str, seller: &str, buyer: &str) -> ConversationRow {
        let now = Utc::now();
        ConversationRow {
            id: Uuid::new_v4(),
            listing_id: listing.into(),
            seller_id: seller.into(),
            buyer_id: buyer.into(),
            buyer_name: None,
            seller_name: None,
            created_at: now,
            updated_at: now,
            listing: None,
        }
    }

    #[test]
    fn test_scope_admits() {
        let conv = row("L1", "S1", "B1");
        assert!(FeedScope::Conversation(conv.id).admits(&conv));
        assert!(!FeedScope::Conversation(Uuid::new_v4()).admits(&conv));
        assert!(FeedScope::Viewer("S1".into()).admits(&conv));
        assert!(FeedScope::Viewer("B1".into()).admits(&conv));
        assert!(!FeedScope::Viewer("X".into()).admits(&conv));
    }

    #[tokio::test]
    async fn test_subscription_unsubscribes_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let (tx, rx) = mpsc::channel(4);
        let sub = FeedSubscription::new(FeedScope::Viewer("S1".into()), rx, move || {
            flag.store(true, Ordering::SeqCst)
        });

        drop(tx);
        drop(sub);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_channel_reads_disconnected() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = FeedSubscription::new(FeedScope::Viewer("S1".into()), rx, || {});
        drop(tx);
        assert_eq!(sub.next().await, FeedSignal::Disconnected);
        assert!(matches!(sub.recv().await, Err(SyncError::FeedDisconnected)));
    }

    /// Backend whose lookups always miss, forcing every caller through the insert race
    struct RacingBackend {
        winner: ConversationRow,
        inserted: AtomicBool,
        lookups: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Backend for RacingBackend {
        async fn fetch_messages(&self, _: ConversationId) -> Result<Vec<MessageRow>> {
            Ok(Vec::new())
        }
        async fn fetch_conversations(&self, _: &str) -> Result<Vec<ConversationRow>> {
            Ok(Vec::new())
        }
        async fn fetch_conversation(&self, _: ConversationId) -> Result<Option<ConversationRow>> {
            Ok(None)
        }
        async fn find_conversation(&self, _: &str, _: &str) -> Result<Option<ConversationRow>> {
            // First lookup misses (stale read), later ones see the winner
            if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(self.winner.clone()))
            }
        }
        async fn insert_conversation(&self, _: NewConversation) -> Result<ConversationRow> {
            if self.inserted.swap(true, Ordering::SeqCst) {
                Err(SyncError::UniqueViolation("listing_id, buyer_id".into()))
            } else {
                Ok(self.winner.clone())
            }
        }
        async fn send_message(&self, _: ConversationId, _: &str, _: &str) -> Result<MessageRow> {
            Err(SyncError::Transport("not used".into()))
        }
        async fn mark_messages_read(&self, _: ConversationId, _: &[MessageId]) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _: FeedScope) -> Result<FeedSubscription> {
            Err(SyncError::Transport("not used".into()))
        }
    }

    #[tokio::test]
    async fn test_loser_adopts_existing_row() {
        let winner = row("L42", "S1", "B1");
        // Someone else already won the insert
        let backend = RacingBackend {
            winner: winner.clone(),
            inserted: AtomicBool::new(true),
            lookups: Default::default(),
        };
        let new = NewConversation {
            listing_id: "L42".into(),
            buyer_id: "B1".into(),
            seller_id: "S1".into(),
            buyer_name: None,
            seller_name: None,
        };
        let got = backend.find_or_create_conversation(new).await.unwrap();
        assert_eq!(got.id, winner.id);
    }
}
