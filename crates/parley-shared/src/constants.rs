/// Content shown in place of a soft-deleted message
pub const DELETED_MESSAGE_MARKER: &str = "This message was deleted";

/// Default maximum length of a text message, in characters
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 4000;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default session token lifetime (7 days)
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 168;

/// Longest accepted session token lifetime (10 years)
pub const MAX_SESSION_TTL_HOURS: i64 = 87_600;

/// Outbound event queue capacity per live session
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;

/// Message history paging
pub const DEFAULT_PAGE_SIZE: u32 = 30;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Maximum number of users returned by a directory search
pub const MAX_SEARCH_RESULTS: u32 = 20;

/// Username rules: 3..=32 chars of [a-z0-9_.]
pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 32;

/// Minimum password length at registration
pub const PASSWORD_MIN_LEN: usize = 8;

/// Maximum length of the optional note attached to a chat request
pub const MAX_REQUEST_NOTE_LENGTH: usize = 280;
