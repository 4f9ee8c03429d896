//! # pawchat-store
//!
//! Local durable storage for the PawChat client, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection`, and the [`KeyValueStore`] port through which the
//! offline queue persists its snapshot.

pub mod database;
pub mod entries;
pub mod migrations;
pub mod port;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use port::{KeyValueStore, MemoryStore, SqliteStore};
