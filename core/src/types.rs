/// Shared entity and read-model types for the sync engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;
pub type ListingId = String;
pub type ConversationId = Uuid;
pub type MessageId = Uuid;

const FALLBACK_BUYER_NAME: &str = "Buyer";
const FALLBACK_SELLER_NAME: &str = "Unknown";

/// The logged-in user whose point of view every read model takes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: UserId,
    pub display_name: String,
}

/// One side of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub display_name: Option<String>,
}

/// The listing a conversation is about, as far as the conversation row knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRef {
    pub id: ListingId,
    pub title: Option<String>,
    /// Seller name recorded on the listing itself
    pub seller_name: Option<String>,
}

/// A listing as seen from its detail page, enough to start a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub seller_id: UserId,
    pub seller_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Seller,
    Buyer,
}

/// A persistent thread between a listing's seller and one prospective buyer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub listing: ListingRef,
    pub seller: Participant,
    pub buyer: Participant,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    pub fn role_of(&self, user: &str) -> Option<Role> {
        if self.seller.id == user {
            Some(Role::Seller)
        } else if self.buyer.id == user {
            Some(Role::Buyer)
        } else {
            None
        }
    }

    pub fn involves(&self, user: &str) -> bool {
        self.role_of(user).is_some()
    }

    /// Display name of whoever the viewer is talking to
    pub fn other_participant_name(&self, viewer: &str) -> String {
        match self.role_of(viewer) {
            Some(Role::Seller) => self
                .buyer
                .display_name
                .clone()
                .unwrap_or_else(|| FALLBACK_BUYER_NAME.to_string()),
            _ => self
                .seller
                .display_name
                .clone()
                .or_else(|| self.listing.seller_name.clone())
                .unwrap_or_else(|| FALLBACK_SELLER_NAME.to_string()),
        }
    }
}

/// A chat message. Immutable apart from `is_read`, which only ever goes false -> true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Counts toward `viewer`'s unread badge
    pub fn is_unread_for(&self, viewer: &str) -> bool {
        !self.is_read && self.sender_id != viewer
    }
}

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub unread_count: usize,
    pub other_participant_name: String,
}

/// What the chat pane renders. `revision` lets a renderer skip unchanged frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatView {
    pub conversation_id: ConversationId,
    pub revision: u64,
    pub messages: Vec<Message>,
}

/// Notifications pushed to UI collaborators (also streamed over SSE)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A message from the other party landed in the open chat
    ScrollToBottom { conversation_id: ConversationId },
    /// A conversation's unread badge changed
    UnreadChanged {
        conversation_id: ConversationId,
        unread: usize,
        total: usize,
    },
    /// The conversation list read model changed
    ConversationsChanged,
    /// The feed dropped; a fresh snapshot is being loaded
    Reconnecting,
    /// The open chat is live again
    Live { conversation_id: ConversationId },
    /// A send failed; `content` is the preserved text
    SendFailed { content: String, reason: String },
    /// Backend unreachable, shown as a non-blocking banner
    TransportDegraded { reason: String },
}
