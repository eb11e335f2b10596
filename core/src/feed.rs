/// Change feed adapter: turns pushed row events into local store mutations
///
/// The feed is at-least-once and unordered across conversations, so every
/// insert goes through the message store's timestamp ordering and duplicate
/// check. Participant scoping is re-checked here even though the backend
/// already filters server-side.
use crate::conversation_index::{ConversationIndex, UpsertOutcome};
use crate::dto::{ConversationRow, MessageRow};
use crate::error::SyncError;
use crate::message_store::MessageStore;
use crate::types::{Conversation, ConversationId, Message, MessageId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "payload", rename_all = "snake_case")]
pub enum FeedEntity {
    Conversation(ConversationRow),
    Message(MessageRow),
}

/// One row-level change pushed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub kind: ChangeKind,
    pub entity: FeedEntity,
}

impl FeedEvent {
    pub fn message(kind: ChangeKind, row: MessageRow) -> Self {
        Self {
            kind,
            entity: FeedEntity::Message(row),
        }
    }

    pub fn conversation(kind: ChangeKind, row: ConversationRow) -> Self {
        Self {
            kind,
            entity: FeedEntity::Conversation(row),
        }
    }
}

/// What arrives on a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Event(FeedEvent),
    Disconnected,
}

/// Why an event produced no mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotParticipant,
    Malformed,
    /// An update asking for read=false; read flags never go back
    ReadRegression,
}

/// The single local mutation an event translates into
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    UpsertConversation(Conversation),
    AppendMessage(Message),
    MarkRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    /// The message belongs to a conversation not indexed yet; the caller
    /// resolves the conversation and then appends
    ResolveConversation(Message),
    Skip(SkipReason),
}

/// Side effects the controller carries out after a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEffect {
    ScrollToBottom(ConversationId),
    UnreadChanged(ConversationId),
    ConversationsChanged,
    /// Mark these read remotely (fire-and-forget)
    MarkReadRemote {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
}

#[derive(Debug, Clone)]
pub struct ChangeFeedAdapter {
    viewer: UserId,
}

impl ChangeFeedAdapter {
    pub fn new(viewer: UserId) -> Self {
        Self { viewer }
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    /// Decide which mutation an event maps to, without touching the stores
    pub fn translate(&self, event: FeedEvent, index: &ConversationIndex) -> Mutation {
        match (event.kind, event.entity) {
            (_, FeedEntity::Conversation(row)) => match Conversation::try_from(row) {
                Ok(conv) if conv.involves(&self.viewer) => Mutation::UpsertConversation(conv),
                Ok(conv) => {
                    warn!("Feed delivered conversation {} the viewer is not part of", conv.id);
                    Mutation::Skip(SkipReason::NotParticipant)
                }
                Err(e) => {
                    warn!("Malformed conversation event: {}", e);
                    Mutation::Skip(SkipReason::Malformed)
                }
            },
            (kind, FeedEntity::Message(row)) => {
                let msg = match Message::try_from(row) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Malformed message event: {}", e);
                        return Mutation::Skip(SkipReason::Malformed);
                    }
                };
                match index.get(msg.conversation_id) {
                    Some(conv) if !conv.involves(&self.viewer) => {
                        warn!("Feed delivered message {} from a foreign conversation", msg.id);
                        Mutation::Skip(SkipReason::NotParticipant)
                    }
                    None if kind == ChangeKind::Insert => Mutation::ResolveConversation(msg),
                    _ if kind == ChangeKind::Insert => Mutation::AppendMessage(msg),
                    _ if msg.is_read => Mutation::MarkRead {
                        conversation_id: msg.conversation_id,
                        message_ids: vec![msg.id],
                    },
                    _ => Mutation::Skip(SkipReason::ReadRegression),
                }
            }
        }
    }

    /// Apply a mutation. `open_chat` is the conversation currently on screen, if any.
    pub fn apply(
        &self,
        mutation: Mutation,
        store: &mut MessageStore,
        index: &mut ConversationIndex,
        open_chat: Option<ConversationId>,
    ) -> Vec<FeedEffect> {
        match mutation {
            Mutation::UpsertConversation(conv) => match index.upsert(conv) {
                UpsertOutcome::Unchanged => Vec::new(),
                _ => vec![FeedEffect::ConversationsChanged],
            },
            Mutation::AppendMessage(msg) => self.append(msg, store, index, open_chat),
            Mutation::MarkRead {
                conversation_id,
                message_ids,
            } => {
                if store.mark_read(conversation_id, &message_ids).is_empty() {
                    Vec::new()
                } else {
                    vec![FeedEffect::UnreadChanged(conversation_id)]
                }
            }
            Mutation::ResolveConversation(msg) => {
                // The caller indexes the conversation first; if it still is
                // unknown the message is dropped rather than orphaned.
                if index.contains(msg.conversation_id) {
                    self.append(msg, store, index, open_chat)
                } else {
                    debug!("Dropping message {} for unresolved conversation", msg.id);
                    Vec::new()
                }
            }
            Mutation::Skip(_) => Vec::new(),
        }
    }

    fn append(
        &self,
        msg: Message,
        store: &mut MessageStore,
        index: &mut ConversationIndex,
        open_chat: Option<ConversationId>,
    ) -> Vec<FeedEffect> {
        let conversation_id = msg.conversation_id;
        let from_other = msg.sender_id != self.viewer;
        index.note_message(&msg);

        match store.append(conversation_id, msg.clone()) {
            Ok(_) => {}
            Err(SyncError::DuplicateMessage { message_id }) => {
                debug!("Feed replayed message {}", message_id);
                return Vec::new();
            }
            Err(e) => {
                warn!("Feed message rejected: {}", e);
                return Vec::new();
            }
        }

        let mut effects = vec![FeedEffect::ConversationsChanged];
        if !from_other {
            return effects;
        }

        if open_chat == Some(conversation_id) {
            // Seen as it arrives
            store.mark_read(conversation_id, &[msg.id]);
            effects.push(FeedEffect::ScrollToBottom(conversation_id));
            effects.push(FeedEffect::MarkReadRemote {
                conversation_id,
                message_ids: vec![msg.id],
            });
        } else {
            effects.push(FeedEffect::UnreadChanged(conversation_id));
        }
        effects
    }
}
