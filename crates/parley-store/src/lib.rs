//! # parley-store
//!
//! Durable storage for Parley, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for users,
//! conversations, the message log and chat requests. Async callers go
//! through [`SharedDatabase`].

pub mod chat_requests;
pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod shared;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use shared::SharedDatabase;
