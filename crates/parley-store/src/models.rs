//! Domain records persisted in the SQLite database.
//!
//! `UserProfile`, `Conversation` and `ChatRequest` serialize directly to the
//! camelCase JSON the HTTP and WebSocket layers send. `Message` carries the
//! typed [`MessageBody`] and is flattened into a wire payload by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{
    ChatRequestId, ChatRequestStatus, ConversationId, MessageBody, MessageId, MessageStatus,
    UserId,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Public view of a user. Never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// Last persisted presence. The live value comes from the connection
    /// registry; this one only survives reconnects.
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A profile plus its bcrypt password hash, for login only.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub profile: UserProfile,
    pub password_hash: String,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A two-party conversation. `participant_a < participant_b` always holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    /// Weak pointer to the most recent message; may be `None`.
    pub last_message_id: Option<MessageId>,
    pub unread_a: u32,
    pub unread_b: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn includes(&self, user: UserId) -> bool {
        self.participant_a == user || self.participant_b == user
    }

    /// `true` when the conversation is exactly between `a` and `b`.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        a != b && self.includes(a) && self.includes(b)
    }

    pub fn other_participant(&self, user: UserId) -> Option<UserId> {
        if user == self.participant_a {
            Some(self.participant_b)
        } else if user == self.participant_b {
            Some(self.participant_a)
        } else {
            None
        }
    }

    /// Unread counter for `user`, 0 if they are not a participant.
    pub fn unread_for(&self, user: UserId) -> u32 {
        if user == self.participant_a {
            self.unread_a
        } else if user == self.participant_b {
            self.unread_b
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    pub body: MessageBody,
    pub status: MessageStatus,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A fresh message with status `sent`, stamped now.
    pub fn new(
        conversation_id: ConversationId,
        sender: UserId,
        receiver: UserId,
        body: MessageBody,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender,
            receiver,
            body,
            status: MessageStatus::Sent,
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }
}

/// One page of conversation history, oldest message first.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

/// Result of a conditional status update.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// The message as persisted after the call.
    pub message: Message,
    /// `false` when the message was already at or past the target status.
    pub changed: bool,
}

// ---------------------------------------------------------------------------
// Chat request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub id: ChatRequestId,
    pub sender: UserId,
    pub receiver: UserId,
    pub status: ChatRequestStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
