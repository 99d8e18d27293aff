//! `CourtChat`: real-time chat delivery and consistency engine.
//!
//! A conversation merges three sources into one ordered, duplicate-free
//! list: paged history fetched over HTTP, live messages pushed over a
//! WebSocket, and the user's own optimistic sends. Each open conversation
//! runs as a [`actor::ConversationActor`]; callers drive it through a
//! cloneable [`actor::ConversationHandle`] and render the
//! [`actor::ConversationSnapshot`]s it publishes.

pub mod actor;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod registry;
pub mod stream;
pub mod transport;
