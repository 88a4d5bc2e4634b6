//! # parley-shared
//!
//! Domain types, wire frames, and design constants shared by the chat
//! sync engine crates. This crate does no I/O.

pub mod constants;
pub mod protocol;
pub mod types;

pub use protocol::ClientFrame;
pub use types::{
    ChatPreview, ChatsResponse, FollowingResponse, Message, MessagesPage, RawMessage,
    StartChatResponse,
};
