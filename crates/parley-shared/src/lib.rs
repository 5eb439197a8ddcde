//! # parley-shared
//!
//! Types shared by the Parley store and server: entity identifiers, the
//! message content union, session tokens, and protocol constants.

pub mod constants;
pub mod content;
pub mod error;
pub mod token;
pub mod types;

pub use content::{MediaMetadata, MessageBody};
pub use error::{ContentError, TokenError, TypeError};
pub use token::{SessionClaims, TokenSigner};
pub use types::{
    ChatRequestId, ChatRequestStatus, ConversationId, MessageId, MessageKind, MessageStatus,
    PairKey, SessionId, UserId,
};
