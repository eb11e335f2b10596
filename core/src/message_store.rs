/// Message store: ordered, append-only message log per conversation
/// Keys are (created_at, insertion seq), so equal timestamps keep arrival order
use crate::error::{Result, SyncError};
use crate::types::{ConversationId, Message, MessageId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type LogKey = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct ConversationLog {
    entries: BTreeMap<LogKey, Message>,
    by_id: HashMap<MessageId, LogKey>,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    logs: HashMap<ConversationId, ConversationLog>,
    revisions: HashMap<ConversationId, u64>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self, conversation_id: ConversationId) -> u64 {
        let rev = self.revisions.entry(conversation_id).or_insert(0);
        *rev += 1;
        *rev
    }

    /// Insert a message in timestamp order. Returns the new revision.
    pub fn append(&mut self, conversation_id: ConversationId, message: Message) -> Result<u64> {
        if message.conversation_id != conversation_id {
            return Err(SyncError::Validation(format!(
                "message {} belongs to {}, not {}",
                message.id, message.conversation_id, conversation_id
            )));
        }

        let log = self.logs.entry(conversation_id).or_default();
        if log.by_id.contains_key(&message.id) {
            return Err(SyncError::DuplicateMessage {
                message_id: message.id,
            });
        }

        let key = (message.created_at, self.next_seq);
        self.next_seq += 1;
        log.by_id.insert(message.id, key);
        log.entries.insert(key, message);

        let rev = self.bump(conversation_id);
        debug!("Appended message to {} (rev {})", conversation_id, rev);
        Ok(rev)
    }

    /// Mark the given messages read. Unknown or already-read ids are skipped.
    /// Returns the ids that actually changed.
    pub fn mark_read(
        &mut self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Vec<MessageId> {
        let Some(log) = self.logs.get_mut(&conversation_id) else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for id in message_ids {
            let Some(key) = log.by_id.get(id) else {
                continue;
            };
            if let Some(msg) = log.entries.get_mut(key) {
                if !msg.is_read {
                    msg.is_read = true;
                    changed.push(*id);
                }
            }
        }

        if !changed.is_empty() {
            self.bump(conversation_id);
        }
        changed
    }

    /// Fold a fetched snapshot into the log: new messages are appended and
    /// read flags only move forward. Nothing already present is removed.
    /// Returns how many messages changed.
    pub fn merge_snapshot(&mut self, conversation_id: ConversationId, messages: Vec<Message>) -> usize {
        let mut changed = 0;
        let mut newly_read = Vec::new();

        for msg in messages {
            if msg.conversation_id != conversation_id {
                continue;
            }
            let known = self
                .logs
                .get(&conversation_id)
                .map(|log| log.by_id.contains_key(&msg.id))
                .unwrap_or(false);

            if known {
                if msg.is_read {
                    newly_read.push(msg.id);
                }
            } else if self.append(conversation_id, msg).is_ok() {
                changed += 1;
            }
        }

        changed += self.mark_read(conversation_id, &newly_read).len();
        changed
    }

    /// Messages of one conversation, ascending by time
    pub fn list_messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.logs
            .get(&conversation_id)
            .map(|log| log.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_message(&self, conversation_id: ConversationId) -> Option<Message> {
        self.logs
            .get(&conversation_id)
            .and_then(|log| log.entries.values().next_back().cloned())
    }

    pub fn unread_ids(&self, conversation_id: ConversationId, viewer: &str) -> Vec<MessageId> {
        self.logs
            .get(&conversation_id)
            .map(|log| {
                log.entries
                    .values()
                    .filter(|m| m.is_unread_for(viewer))
                    .map(|m| m.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn unread_count(&self, conversation_id: ConversationId, viewer: &str) -> usize {
        self.logs
            .get(&conversation_id)
            .map(|log| log.entries.values().filter(|m| m.is_unread_for(viewer)).count())
            .unwrap_or(0)
    }

    pub fn contains(&self, conversation_id: ConversationId, message_id: MessageId) -> bool {
        self.logs
            .get(&conversation_id)
            .map(|log| log.by_id.contains_key(&message_id))
            .unwrap_or(false)
    }

    pub fn len(&self, conversation_id: ConversationId) -> usize {
        self.logs
            .get(&conversation_id)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, conversation_id: ConversationId) -> bool {
        self.len(conversation_id) == 0
    }

    /// Monotonic per-conversation revision; 0 if nothing was ever stored
    pub fn revision(&self, conversation_id: ConversationId) -> u64 {
        self.revisions.get(&conversation_id).copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.logs.clear();
        self.revisions.clear();
    }
}
