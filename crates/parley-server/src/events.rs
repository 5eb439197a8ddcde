//! WebSocket event envelopes.
//!
//! Every frame is a JSON text frame shaped `{"event": "<name>", "data": {...}}`
//! with snake_case event names and camelCase fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{
    ConversationId, MediaMetadata, MessageId, MessageKind, MessageStatus, UserId,
};
use parley_store::{ChatRequest, Conversation, Message};

use crate::error::ServerError;

/// Events a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    SendMessage {
        receiver_id: UserId,
        #[serde(rename = "type")]
        kind: MessageKind,
        content: String,
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        metadata: Option<MediaMetadata>,
    },
    Typing {
        receiver_id: UserId,
        conversation_id: ConversationId,
    },
    StopTyping {
        receiver_id: UserId,
        conversation_id: ConversationId,
    },
    MessageDelivered {
        message_id: MessageId,
    },
    /// Either a single message or a whole conversation.
    MessageRead {
        #[serde(default)]
        message_id: Option<MessageId>,
        #[serde(default)]
        conversation_id: Option<ConversationId>,
    },
    RequestSent {
        receiver_id: UserId,
        request: ChatRequest,
    },
    RequestAccepted {
        sender_id: UserId,
        conversation: Conversation,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::StopTyping { .. } => "stop_typing",
            ClientEvent::MessageDelivered { .. } => "message_delivered",
            ClientEvent::MessageRead { .. } => "message_read",
            ClientEvent::RequestSent { .. } => "request_sent",
            ClientEvent::RequestAccepted { .. } => "request_accepted",
        }
    }
}

/// Events the server pushes to sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    MessageSent {
        message: MessagePayload,
        conversation_id: ConversationId,
    },
    MessageError {
        error: String,
    },
    ReceiveMessage {
        message: MessagePayload,
        conversation_id: ConversationId,
    },
    UserTyping {
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    },
    MessageStatusUpdated {
        message_id: MessageId,
        status: MessageStatus,
    },
    MessagesRead {
        conversation_id: ConversationId,
        read_by: UserId,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    RequestReceived {
        request: ChatRequest,
    },
    RequestAcceptedNotification {
        conversation: Conversation,
        accepted_by: UserId,
    },
    UserOnline {
        user_id: UserId,
        online: bool,
    },
    UserOffline {
        user_id: UserId,
        online: bool,
        last_seen: DateTime<Utc>,
    },
    OnlineUsers {
        user_ids: Vec<UserId>,
    },
    Error {
        code: String,
        error: String,
    },
}

impl ServerEvent {
    pub fn error(err: &ServerError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            error: err.public_message(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Wire form of a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,
    pub status: MessageStatus,
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender,
            receiver_id: message.receiver,
            kind: message.body.kind(),
            content: message.body.content().to_string(),
            metadata: message.body.metadata().cloned(),
            status: message.status,
            is_deleted: message.is_deleted,
            deleted_at: message.deleted_at,
            created_at: message.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::MessageBody;
    use serde_json::json;

    #[test]
    fn parses_send_message_frame() {
        let receiver = UserId::new();
        let frame = json!({
            "event": "send_message",
            "data": {
                "receiverId": receiver,
                "type": "image",
                "content": "https://cdn.example.com/a.png",
                "metadata": { "mimeType": "image/png", "width": 10 }
            }
        });

        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        match event {
            ClientEvent::SendMessage {
                receiver_id,
                kind,
                conversation_id,
                metadata,
                ..
            } => {
                assert_eq!(receiver_id, receiver);
                assert_eq!(kind, MessageKind::Image);
                assert!(conversation_id.is_none());
                assert_eq!(metadata.unwrap().width, Some(10));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn message_read_accepts_either_target() {
        let by_message: ClientEvent = serde_json::from_value(json!({
            "event": "message_read",
            "data": { "messageId": MessageId::new() }
        }))
        .unwrap();
        assert!(matches!(
            by_message,
            ClientEvent::MessageRead { message_id: Some(_), conversation_id: None }
        ));

        let by_conversation: ClientEvent = serde_json::from_value(json!({
            "event": "message_read",
            "data": { "conversationId": ConversationId::new() }
        }))
        .unwrap();
        assert!(matches!(
            by_conversation,
            ClientEvent::MessageRead { message_id: None, conversation_id: Some(_) }
        ));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({ "event": "launch_rockets", "data": {} }));
        assert!(result.is_err());
    }

    #[test]
    fn server_events_use_camel_case_fields() {
        let user = UserId::new();
        let conversation = ConversationId::new();
        let value = serde_json::to_value(ServerEvent::UserTyping {
            user_id: user,
            conversation_id: conversation,
            is_typing: true,
        })
        .unwrap();

        assert_eq!(value["event"], "user_typing");
        assert_eq!(value["data"]["isTyping"], true);
        assert_eq!(value["data"]["userId"], json!(user));
    }

    #[test]
    fn payload_flattens_body() {
        let message = Message::new(
            ConversationId::new(),
            UserId::new(),
            UserId::new(),
            MessageBody::Text { text: "hello".into() },
        );
        let value = serde_json::to_value(MessagePayload::from(&message)).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["content"], "hello");
        assert_eq!(value["status"], "sent");
        assert!(value.get("metadata").is_none());
    }
}
