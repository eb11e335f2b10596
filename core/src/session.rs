/// Process-wide session: the logged-in viewer plus the stores the controller owns
///
/// Readers may share the stores freely. Writes go through `SyncController`
/// only, which is why the write accessors are crate-private.
use crate::conversation_index::ConversationIndex;
use crate::error::{Result, SyncError};
use crate::message_store::MessageStore;
use crate::types::{ChatView, ConversationId, ConversationSummary, Message, Viewer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct Session {
    viewer: Viewer,
    store: RwLock<MessageStore>,
    index: RwLock<ConversationIndex>,
    active: AtomicBool,
}

impl Session {
    /// Start a session for `viewer`
    pub fn login(viewer: Viewer) -> Result<Arc<Self>> {
        if viewer.id.trim().is_empty() {
            return Err(SyncError::Validation("viewer id is empty".to_string()));
        }
        info!("Session started for {}", viewer.id);
        Ok(Arc::new(Self {
            viewer,
            store: RwLock::new(MessageStore::new()),
            index: RwLock::new(ConversationIndex::new()),
            active: AtomicBool::new(true),
        }))
    }

    /// Tear the session down; further controller calls fail
    pub async fn logout(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.store.write().await.clear();
        self.index.write().await.clear();
        info!("Session ended for {}", self.viewer.id);
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SyncError::Validation("no active session".to_string()))
        }
    }

    pub(crate) fn store(&self) -> &RwLock<MessageStore> {
        &self.store
    }

    pub(crate) fn index(&self) -> &RwLock<ConversationIndex> {
        &self.index
    }

    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        let store = self.store.read().await;
        let index = self.index.read().await;
        index.summaries(&self.viewer.id, &store)
    }

    pub async fn unread_total(&self) -> usize {
        let store = self.store.read().await;
        let index = self.index.read().await;
        index.unread_total(&self.viewer.id, &store)
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.store.read().await.list_messages(conversation_id)
    }

    pub async fn chat_view(&self, conversation_id: ConversationId) -> ChatView {
        let store = self.store.read().await;
        ChatView {
            conversation_id,
            revision: store.revision(conversation_id),
            messages: store.list_messages(conversation_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn viewer(id: &str) -> Viewer {
        Viewer {
            id: id.to_string(),
            display_name: id.to_string(),
        }
    }

    #[test]
    fn test_login_requires_viewer() {
        assert!(Session::login(viewer("  ")).is_err());
    }

    #[tokio::test]
    async fn test_logout_clears_state() {
        let session = Session::login(viewer("S1")).unwrap();
        let conv = Uuid::new_v4();
        session
            .store()
            .write()
            .await
            .append(
                conv,
                Message {
                    id: Uuid::new_v4(),
                    conversation_id: conv,
                    sender_id: "B1".to_string(),
                    content: "hi".to_string(),
                    created_at: Utc::now(),
                    is_read: false,
                },
            )
            .unwrap();
        assert_eq!(session.messages(conv).await.len(), 1);

        session.logout().await;
        assert!(!session.is_active());
        assert!(session.ensure_active().is_err());
        assert!(session.messages(conv).await.is_empty());
    }
}
