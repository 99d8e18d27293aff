//! `CourtChat` reference server library.
//!
//! Exposes the server for use in tests and embedding. The server stores
//! messages per conversation, serves paged history over HTTP and fans
//! live messages out to every WebSocket subscribed to a conversation.

pub mod config;
pub mod server;
pub mod store;
