//! Message content.
//!
//! The four message types share one envelope (id, participants, status,
//! timestamps) that lives in the store; this module only models the
//! type-specific payload and its validation rules.

use serde::{Deserialize, Serialize};

use crate::constants::DELETED_MESSAGE_MARKER;
use crate::error::ContentError;
use crate::types::MessageKind;

/// Optional file details attached to media messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl MediaMetadata {
    pub fn is_empty(&self) -> bool {
        self.file_name.is_none()
            && self.size.is_none()
            && self.mime_type.is_none()
            && self.width.is_none()
            && self.height.is_none()
    }
}

/// Type-specific message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text {
        text: String,
    },
    Image {
        url: String,
        metadata: Option<MediaMetadata>,
    },
    Gif {
        url: String,
        metadata: Option<MediaMetadata>,
    },
    Sticker {
        url: String,
        metadata: Option<MediaMetadata>,
    },
}

impl MessageBody {
    /// Build and validate a body from the loosely-typed wire fields.
    ///
    /// Text is trimmed and limited to `max_text_len` characters. Media
    /// content must be an absolute `http://` or `https://` URL.
    pub fn parse(
        kind: MessageKind,
        content: &str,
        metadata: Option<MediaMetadata>,
        max_text_len: usize,
    ) -> Result<Self, ContentError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ContentError::Empty);
        }
        let metadata = metadata.filter(|m| !m.is_empty());

        match kind {
            MessageKind::Text => {
                if metadata.is_some() {
                    return Err(ContentError::MetadataOnText);
                }
                let len = content.chars().count();
                if len > max_text_len {
                    return Err(ContentError::TextTooLong {
                        len,
                        max: max_text_len,
                    });
                }
                Ok(Self::Text {
                    text: content.to_string(),
                })
            }
            MessageKind::Image | MessageKind::Gif | MessageKind::Sticker => {
                if !is_http_url(content) {
                    return Err(ContentError::InvalidMediaUrl(content.to_string()));
                }
                Ok(Self::from_parts(kind, content.to_string(), metadata))
            }
        }
    }

    /// Rebuild a body from persisted columns without validation.
    pub fn from_parts(kind: MessageKind, content: String, metadata: Option<MediaMetadata>) -> Self {
        match kind {
            MessageKind::Text => Self::Text { text: content },
            MessageKind::Image => Self::Image {
                url: content,
                metadata,
            },
            MessageKind::Gif => Self::Gif {
                url: content,
                metadata,
            },
            MessageKind::Sticker => Self::Sticker {
                url: content,
                metadata,
            },
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::Gif { .. } => MessageKind::Gif,
            Self::Sticker { .. } => MessageKind::Sticker,
        }
    }

    /// The text, or the media URL.
    pub fn content(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::Image { url, .. } | Self::Gif { url, .. } | Self::Sticker { url, .. } => url,
        }
    }

    pub fn metadata(&self) -> Option<&MediaMetadata> {
        match self {
            Self::Text { .. } => None,
            Self::Image { metadata, .. }
            | Self::Gif { metadata, .. }
            | Self::Sticker { metadata, .. } => metadata.as_ref(),
        }
    }

    /// Same type, content replaced by the deletion marker, metadata dropped.
    pub fn redacted(&self) -> Self {
        Self::from_parts(self.kind(), DELETED_MESSAGE_MARKER.to_string(), None)
    }
}

fn is_http_url(s: &str) -> bool {
    let rest = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.chars().any(char::is_whitespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_is_trimmed() {
        let body = MessageBody::parse(MessageKind::Text, "  hi  ", None, 10).unwrap();
        assert_eq!(body, MessageBody::Text { text: "hi".into() });
    }

    #[test]
    fn test_empty_content_rejected() {
        for kind in [MessageKind::Text, MessageKind::Image, MessageKind::Gif] {
            assert_eq!(
                MessageBody::parse(kind, "   ", None, 10),
                Err(ContentError::Empty)
            );
        }
    }

    #[test]
    fn test_text_length_counts_chars() {
        assert!(MessageBody::parse(MessageKind::Text, "ééééé", None, 5).is_ok());
        assert_eq!(
            MessageBody::parse(MessageKind::Text, "ééééé!", None, 5),
            Err(ContentError::TextTooLong { len: 6, max: 5 })
        );
    }

    #[test]
    fn test_media_requires_url() {
        assert!(matches!(
            MessageBody::parse(MessageKind::Image, "cat.png", None, 10),
            Err(ContentError::InvalidMediaUrl(_))
        ));
        assert!(matches!(
            MessageBody::parse(MessageKind::Gif, "https://", None, 10),
            Err(ContentError::InvalidMediaUrl(_))
        ));
        let body = MessageBody::parse(
            MessageKind::Image,
            "https://cdn.example.com/cat.png",
            Some(MediaMetadata {
                mime_type: Some("image/png".into()),
                width: Some(640),
                height: Some(480),
                ..Default::default()
            }),
            10,
        )
        .unwrap();
        assert_eq!(body.kind(), MessageKind::Image);
        assert_eq!(body.metadata().and_then(|m| m.width), Some(640));
    }

    #[test]
    fn test_text_rejects_metadata_but_ignores_empty_metadata() {
        let meta = MediaMetadata {
            size: Some(10),
            ..Default::default()
        };
        assert_eq!(
            MessageBody::parse(MessageKind::Text, "hi", Some(meta), 10),
            Err(ContentError::MetadataOnText)
        );
        assert!(MessageBody::parse(MessageKind::Text, "hi", Some(MediaMetadata::default()), 10).is_ok());
    }

    #[test]
    fn test_redacted_keeps_kind() {
        let body = MessageBody::parse(
            MessageKind::Sticker,
            "https://cdn.example.com/s/1.webp",
            Some(MediaMetadata {
                file_name: Some("1.webp".into()),
                ..Default::default()
            }),
            10,
        )
        .unwrap();
        let redacted = body.redacted();
        assert_eq!(redacted.kind(), MessageKind::Sticker);
        assert_eq!(redacted.content(), DELETED_MESSAGE_MARKER);
        assert!(redacted.metadata().is_none());
    }
}
