//! # parley-store
//!
//! Local cache for the chat sync engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the three
//! persisted concerns: per-chat message history, the chat-preview
//! snapshot, and per-chat sync stamps. The store is the sole owner of
//! persisted state; higher layers hold the only in-memory handle.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod previews;
pub mod sync_state;

mod error;

pub use database::Database;
pub use error::StoreError;
