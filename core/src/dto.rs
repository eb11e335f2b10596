/// Wire rows of the remote table API
///
/// Column names follow the backing tables (`conversations`, `messages`,
/// `listings`). Rows are converted into the entities in `types` as soon as
/// they cross the boundary; nothing past the controller sees a row.
use crate::error::SyncError;
use crate::types::{
    Conversation, ConversationId, ListingId, ListingRef, Message, MessageId, Participant,
    UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRow {
    pub id: ListingId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub seller_id: Option<UserId>,
    #[serde(default)]
    pub seller_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub listing_id: ListingId,
    pub seller_id: UserId,
    pub buyer_id: UserId,
    #[serde(default)]
    pub buyer_name: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Embedded listing, present when the select joined it
    #[serde(default, rename = "listings", skip_serializing_if = "Option::is_none")]
    pub listing: Option<ListingRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

/// Insert payload for the `conversations` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversation {
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub buyer_name: Option<String>,
    pub seller_name: Option<String>,
}

fn non_blank(value: &str) -> bool {
    !value.trim().is_empty()
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = SyncError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        if !non_blank(&row.seller_id) || !non_blank(&row.buyer_id) {
            return Err(SyncError::Validation(format!(
                "conversation {} is missing a participant",
                row.id
            )));
        }
        if row.seller_id == row.buyer_id {
            return Err(SyncError::Validation(format!(
                "conversation {} has the same buyer and seller",
                row.id
            )));
        }

        let listing = match row.listing {
            Some(l) => ListingRef {
                id: l.id,
                title: l.title,
                seller_name: l.seller_name,
            },
            None => ListingRef {
                id: row.listing_id,
                title: None,
                seller_name: None,
            },
        };

        Ok(Conversation {
            id: row.id,
            listing,
            seller: Participant {
                id: row.seller_id,
                display_name: row.seller_name,
            },
            buyer: Participant {
                id: row.buyer_id,
                display_name: row.buyer_name,
            },
            created_at: row.created_at,
            // A row whose updated_at predates creation is treated as never touched
            last_activity: row.updated_at.max(row.created_at),
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = SyncError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        if !non_blank(&row.content) {
            return Err(SyncError::Validation(format!("message {} is empty", row.id)));
        }
        if !non_blank(&row.sender_id) {
            return Err(SyncError::Validation(format!(
                "message {} has no sender",
                row.id
            )));
        }
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            is_read: row.is_read,
        })
    }
}

/// Convert a batch of rows, dropping (and logging) the ones that fail validation
pub fn convert_rows<R, T>(rows: Vec<R>) -> Vec<T>
where
    T: TryFrom<R, Error = SyncError>,
{
    rows.into_iter()
        .filter_map(|row| match T::try_from(row) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Dropping malformed row: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_conversation_row_with_embedded_listing() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "id": id,
            "listing_id": "L42",
            "seller_id": "S1",
            "buyer_id": "B1",
            "buyer_name": "Bea",
            "seller_name": null,
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T12:00:00Z",
            "listings": { "id": "L42", "title": "Mini fridge", "price": 40.0, "seller_name": "Sam" }
        });
        let row: ConversationRow = serde_json::from_value(json).unwrap();
        let conv = Conversation::try_from(row).unwrap();

        assert_eq!(conv.id, id);
        assert_eq!(conv.listing.title.as_deref(), Some("Mini fridge"));
        assert_eq!(conv.other_participant_name("B1"), "Sam");
        assert!(conv.last_activity > conv.created_at);
    }

    #[test]
    fn test_conversation_row_rejects_self_conversation() {
        let now = Utc::now();
        let row = ConversationRow {
            id: Uuid::new_v4(),
            listing_id: "L1".into(),
            seller_id: "S1".into(),
            buyer_id: "S1".into(),
            buyer_name: None,
            seller_name: None,
            created_at: now,
            updated_at: now,
            listing: None,
        };
        assert!(matches!(Conversation::try_from(row), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_blank_message_rejected() {
        let row = MessageRow {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: "B1".into(),
            content: "   ".into(),
            created_at: Utc::now(),
            is_read: false,
        };
        assert!(Message::try_from(row).is_err());
    }

    #[test]
    fn test_convert_rows_skips_bad_rows() {
        let conv = Uuid::new_v4();
        let good = MessageRow {
            id: Uuid::new_v4(),
            conversation_id: conv,
            sender_id: "B1".into(),
            content: "hi".into(),
            created_at: Utc::now(),
            is_read: false,
        };
        let bad = MessageRow {
            content: String::new(),
            id: Uuid::new_v4(),
            ..good.clone()
        };
        let out: Vec<Message> = convert_rows(vec![good, bad]);
        assert_eq!(out.len(), 1);
    }
}
