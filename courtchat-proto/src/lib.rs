//! Shared protocol definitions for the `CourtChat` wire format.

pub mod codec;
pub mod history;
pub mod message;
