use thiserror::Error;

use crate::types::UserId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("A conversation needs two distinct participants (got {0} twice)")]
    SelfPair(UserId),

    #[error("Unknown message type: {0}")]
    UnknownMessageKind(String),

    #[error("Unknown request status: {0}")]
    UnknownRequestStatus(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("Message content must not be empty")]
    Empty,

    #[error("Text message is {len} characters long (max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("Media content must be an http(s) URL, got '{0}'")]
    InvalidMediaUrl(String),

    #[error("Text messages cannot carry file metadata")]
    MetadataOnText,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed session token")]
    Malformed,

    #[error("Session token signature is invalid")]
    BadSignature,

    #[error("Session token has expired")]
    Expired,
}
