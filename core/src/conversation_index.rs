/// Conversation index: the conversations a viewer can see plus their last-message summaries
/// Unread counts are always derived from the message store's read flags, never cached here
use crate::message_store::MessageStore;
use crate::types::{Conversation, ConversationId, ConversationSummary, ListingId, Message};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    conversation: Conversation,
    /// Last message seen for this conversation, from a snapshot or the feed
    last_message: Option<Message>,
}

#[derive(Debug, Default)]
pub struct ConversationIndex {
    entries: HashMap<ConversationId, IndexEntry>,
    by_listing_buyer: HashMap<(ListingId, String), ConversationId>,
}

fn merge_name(current: &mut Option<String>, incoming: Option<String>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge by id. `last_activity` never moves backward.
    pub fn upsert(&mut self, conversation: Conversation) -> UpsertOutcome {
        match self.entries.get_mut(&conversation.id) {
            Some(entry) => {
                let before = entry.conversation.clone();
                let current = &mut entry.conversation;

                current.last_activity = current.last_activity.max(conversation.last_activity);
                merge_name(&mut current.seller.display_name, conversation.seller.display_name);
                merge_name(&mut current.buyer.display_name, conversation.buyer.display_name);
                merge_name(&mut current.listing.title, conversation.listing.title);
                merge_name(&mut current.listing.seller_name, conversation.listing.seller_name);

                if *current == before {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::Updated
                }
            }
            None => {
                debug!("Indexing conversation {}", conversation.id);
                self.by_listing_buyer.insert(
                    (conversation.listing.id.clone(), conversation.buyer.id.clone()),
                    conversation.id,
                );
                self.entries.insert(
                    conversation.id,
                    IndexEntry {
                        conversation,
                        last_message: None,
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Record a message as a candidate last message and bump activity.
    /// Returns false if the conversation is not indexed.
    pub fn note_message(&mut self, message: &Message) -> bool {
        let Some(entry) = self.entries.get_mut(&message.conversation_id) else {
            return false;
        };

        let newer = entry
            .last_message
            .as_ref()
            .map(|m| message.created_at >= m.created_at)
            .unwrap_or(true);
        if newer {
            entry.last_message = Some(message.clone());
        } else if let Some(last) = entry.last_message.as_mut().filter(|m| m.id == message.id) {
            last.is_read |= message.is_read;
        }

        entry.conversation.last_activity = entry.conversation.last_activity.max(message.created_at);
        true
    }

    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.entries.get(&id).map(|e| &e.conversation)
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn find_by_listing_and_buyer(&self, listing_id: &str, buyer_id: &str) -> Option<&Conversation> {
        self.by_listing_buyer
            .get(&(listing_id.to_string(), buyer_id.to_string()))
            .and_then(|id| self.get(*id))
    }

    /// Summaries for every conversation the viewer takes part in, most recent first
    pub fn summaries(&self, viewer: &str, store: &MessageStore) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .entries
            .values()
            .filter(|e| e.conversation.involves(viewer))
            .map(|e| {
                let id = e.conversation.id;
                let last_message = match (store.last_message(id), e.last_message.clone()) {
                    (Some(stored), Some(cached)) if cached.created_at > stored.created_at => Some(cached),
                    (Some(stored), _) => Some(stored),
                    (None, cached) => cached,
                };
                ConversationSummary {
                    other_participant_name: e.conversation.other_participant_name(viewer),
                    unread_count: store.unread_count(id, viewer),
                    conversation: e.conversation.clone(),
                    last_message,
                }
            })
            .collect();

        out.sort_by(|a, b| {
            b.conversation
                .last_activity
                .cmp(&a.conversation.last_activity)
                .then_with(|| a.conversation.id.cmp(&b.conversation.id))
        });
        out
    }

    pub fn unread_total(&self, viewer: &str, store: &MessageStore) -> usize {
        self.entries
            .values()
            .filter(|e| e.conversation.involves(viewer))
            .map(|e| store.unread_count(e.conversation.id, viewer))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_listing_buyer.clear();
    }
}
