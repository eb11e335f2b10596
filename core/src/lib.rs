/// chatsync - conversation sync engine for a marketplace messenger
///
/// Keeps an ordered local copy of a viewer's conversations and messages in
/// step with a remote table API and its change feed, and exposes read models
/// plus a small set of actions to UI collaborators.

pub mod error;
pub mod config;
pub mod types;
pub mod dto;
pub mod message_store;
pub mod conversation_index;
pub mod feed;
pub mod backend;
pub mod local_backend;
pub mod session;
pub mod controller;
pub mod ui_api;
pub mod utils;

pub use backend::{Backend, FeedScope, FeedSubscription};
pub use config::Config;
pub use controller::{ChatState, ListState, SyncController};
pub use error::{Result, SyncError};
pub use local_backend::LocalBackend;
pub use session::Session;
