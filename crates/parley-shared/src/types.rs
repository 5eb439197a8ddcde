use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

// Every entity is addressed by a random v4 UUID wrapped in its own newtype so
// a `MessageId` can never be passed where a `ConversationId` is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| TypeError::InvalidId(s.to_string()))
            }
        }
    };
}

uuid_id!(
    /// Stable user identifier, owned by the identity store.
    UserId
);
uuid_id!(
    /// Identifier of a two-party conversation.
    ConversationId
);
uuid_id!(
    /// Identifier of a single message.
    MessageId
);
uuid_id!(
    /// Identifier of a chat (connection) request.
    ChatRequestId
);
uuid_id!(
    /// Identifier of one live transport session. Never persisted.
    SessionId
);

// ---------------------------------------------------------------------------
// Pair key
// ---------------------------------------------------------------------------

/// Canonical unordered pair of two distinct users.
///
/// `PairKey::new(a, b) == PairKey::new(b, a)`; the lower id is always stored
/// first. Its string form is the uniqueness key for conversations and chat
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    low: UserId,
    high: UserId,
}

impl PairKey {
    pub fn new(a: UserId, b: UserId) -> Result<Self, TypeError> {
        if a == b {
            return Err(TypeError::SelfPair(a));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`, if `user` is part of the pair.
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if user == self.low {
            Some(self.high)
        } else if user == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low.0.simple(), self.high.0.simple())
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Gif,
    Sticker,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Gif => "gif",
            Self::Sticker => "sticker",
        }
    }
}

impl FromStr for MessageKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "gif" => Ok(Self::Gif),
            "sticker" => Ok(Self::Sticker),
            other => Err(TypeError::UnknownMessageKind(other.to_string())),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of a message. Ordered: `Sent < Delivered < Read`.
///
/// A status may only move forward; see [`MessageStatus::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent = 0,
    Delivered = 1,
    Read = 2,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// Integer rank used for persistence and conditional updates.
    pub fn rank(&self) -> i64 {
        *self as i64
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Sent),
            1 => Some(Self::Delivered),
            2 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        next > *self
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ChatRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for ChatRequestStatus {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(TypeError::UnknownRequestStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_insensitive() {
        let a = UserId::new();
        let b = UserId::new();
        let ab = PairKey::new(a, b).unwrap();
        let ba = PairKey::new(b, a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), ba.to_string());
        assert!(ab.low() < ab.high());
    }

    #[test]
    fn test_pair_key_rejects_self() {
        let a = UserId::new();
        assert!(PairKey::new(a, a).is_err());
    }

    #[test]
    fn test_pair_key_other() {
        let a = UserId::new();
        let b = UserId::new();
        let pair = PairKey::new(a, b).unwrap();
        assert_eq!(pair.other(a), Some(b));
        assert_eq!(pair.other(b), Some(a));
        assert_eq!(pair.other(UserId::new()), None);
    }

    #[test]
    fn test_status_only_advances() {
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_advance_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Delivered));
    }

    #[test]
    fn test_status_rank_roundtrip() {
        for status in [MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Read] {
            assert_eq!(MessageStatus::from_rank(status.rank()), Some(status));
        }
        assert_eq!(MessageStatus::from_rank(7), None);
    }

    #[test]
    fn test_user_id_parse() {
        let id = UserId::new();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<UserId>().is_err());
    }

    #[test]
    fn test_message_kind_serde() {
        let json = serde_json::to_string(&MessageKind::Sticker).unwrap();
        assert_eq!(json, "\"sticker\"");
        assert_eq!("gif".parse::<MessageKind>().unwrap(), MessageKind::Gif);
        assert!("video".parse::<MessageKind>().is_err());
    }
}
