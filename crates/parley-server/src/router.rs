//! Message routing and status tracking.
//!
//! A send is persisted first and fanned out second. Delivery is optimistic:
//! a message becomes `delivered` as soon as one of the receiver's session
//! queues accepts it, without waiting for a client acknowledgement.

use tracing::{debug, info, warn};

use parley_shared::{
    ConversationId, MediaMetadata, MessageBody, MessageId, MessageKind, MessageStatus, PairKey,
    UserId,
};
use parley_store::{Conversation, Message, SharedDatabase};

use crate::error::{ServerError, ServerResult};
use crate::events::{MessagePayload, ServerEvent};
use crate::registry::{ConnectionRegistry, SessionHandle};

/// A `send_message` request from an authenticated session.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub receiver: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub conversation_id: Option<ConversationId>,
    pub metadata: Option<MediaMetadata>,
}

#[derive(Clone)]
pub struct MessageRouter {
    db: SharedDatabase,
    registry: ConnectionRegistry,
    max_text_len: usize,
}

impl MessageRouter {
    pub fn new(db: SharedDatabase, registry: ConnectionRegistry, max_text_len: usize) -> Self {
        Self {
            db,
            registry,
            max_text_len,
        }
    }

    /// Persist and route one message. On success the originating session
    /// has been sent `message_sent`; on failure nothing was persisted and
    /// the caller reports the error to that session only.
    pub async fn send(&self, origin: &SessionHandle, req: SendRequest) -> ServerResult<MessagePayload> {
        let sender = origin.user;
        if req.receiver == sender {
            return Err(ServerError::Validation("cannot send a message to yourself".into()));
        }
        let body = MessageBody::parse(req.kind, &req.content, req.metadata, self.max_text_len)?;

        let receiver = req.receiver;
        let exists = self.db.call(move |db| db.user_exists(receiver)).await?;
        if !exists {
            return Err(ServerError::NotFound(format!("user {receiver} not found")));
        }

        let conversation = self.resolve_conversation(sender, receiver, req.conversation_id).await?;

        let mut message = Message::new(conversation.id, sender, receiver, body);
        let stored = message.clone();
        self.db.call(move |db| db.append_message(&stored)).await?;

        // Receivers see the status the message is about to reach.
        let sessions = self.registry.sessions_for(receiver);
        if !sessions.is_empty() {
            let mut outgoing = MessagePayload::from(&message);
            outgoing.status = MessageStatus::Delivered;
            let event = ServerEvent::ReceiveMessage {
                message: outgoing,
                conversation_id: conversation.id,
            };
            let accepted = sessions.iter().filter(|s| s.send(event.clone())).count();

            if accepted > 0 {
                message = self.record_delivery(message).await;
            }
        }

        let payload = MessagePayload::from(&message);
        origin.send(ServerEvent::MessageSent {
            message: payload.clone(),
            conversation_id: conversation.id,
        });

        debug!(
            message = %message.id,
            sender = %sender,
            receiver = %receiver,
            status = %message.status,
            "message routed"
        );
        Ok(payload)
    }

    /// Persist `delivered` for a message already pushed to the receiver.
    /// The message is committed by now, so a failure here is logged and the
    /// send still succeeds with the last stored status.
    async fn record_delivery(&self, message: Message) -> Message {
        let id = message.id;
        match self
            .db
            .call(move |db| db.advance_status(id, MessageStatus::Delivered))
            .await
        {
            Ok(change) => change.message,
            Err(e) => {
                warn!(message = %id, error = %e, "Failed to record delivery");
                message
            }
        }
    }

    async fn resolve_conversation(
        &self,
        sender: UserId,
        receiver: UserId,
        requested: Option<ConversationId>,
    ) -> ServerResult<Conversation> {
        match requested {
            Some(id) => {
                let conversation = self.db.call(move |db| db.get_conversation(id)).await?;
                if !conversation.is_between(sender, receiver) {
                    return Err(ServerError::Forbidden(
                        "conversation does not belong to this pair".into(),
                    ));
                }
                Ok(conversation)
            }
            None => {
                let pair = PairKey::new(sender, receiver)
                    .map_err(|e| ServerError::Validation(e.to_string()))?;
                let (conversation, created) = self
                    .db
                    .call(move |db| db.create_or_reuse_conversation(&pair))
                    .await?;
                if created {
                    info!(conversation = %conversation.id, "conversation started");
                }
                Ok(conversation)
            }
        }
    }

    /// Receiver acknowledges delivery. Never moves a message backwards.
    pub async fn mark_delivered(&self, caller: UserId, id: MessageId) -> ServerResult<MessagePayload> {
        self.advance(caller, id, MessageStatus::Delivered).await
    }

    /// Receiver has read one message.
    pub async fn mark_read(&self, caller: UserId, id: MessageId) -> ServerResult<MessagePayload> {
        self.advance(caller, id, MessageStatus::Read).await
    }

    async fn advance(
        &self,
        caller: UserId,
        id: MessageId,
        to: MessageStatus,
    ) -> ServerResult<MessagePayload> {
        let message = self.db.call(move |db| db.get_message(id)).await?;
        if message.receiver != caller {
            return Err(ServerError::Forbidden(
                "only the receiver can acknowledge a message".into(),
            ));
        }

        let change = self.db.call(move |db| db.advance_status(id, to)).await?;
        if change.changed {
            self.registry.push(
                change.message.sender,
                &ServerEvent::MessageStatusUpdated {
                    message_id: id,
                    status: change.message.status,
                },
            );
        }
        Ok(MessagePayload::from(&change.message))
    }

    /// Read every message addressed to `caller` in the conversation.
    /// Returns the ids that moved to `read`.
    pub async fn mark_conversation_read(
        &self,
        caller: UserId,
        conversation_id: ConversationId,
    ) -> ServerResult<Vec<MessageId>> {
        let conversation = self.participant_conversation(caller, conversation_id).await?;

        let changed = self
            .db
            .call(move |db| db.mark_conversation_read(conversation_id, caller))
            .await?;

        if !changed.is_empty() {
            if let Some(other) = conversation.other_participant(caller) {
                self.registry.push(
                    other,
                    &ServerEvent::MessagesRead {
                        conversation_id,
                        read_by: caller,
                    },
                );
            }
        }
        Ok(changed)
    }

    /// Soft-delete a message. Only its sender may do this.
    pub async fn delete_message(&self, caller: UserId, id: MessageId) -> ServerResult<MessagePayload> {
        let message = self.db.call(move |db| db.get_message(id)).await?;
        if message.sender != caller {
            return Err(ServerError::Forbidden("only the sender can delete a message".into()));
        }

        let change = self.db.call(move |db| db.soft_delete_message(id)).await?;
        if change.changed {
            let event = ServerEvent::MessageDeleted {
                message_id: id,
                conversation_id: message.conversation_id,
            };
            self.registry.push(message.sender, &event);
            self.registry.push(message.receiver, &event);
        }
        Ok(MessagePayload::from(&change.message))
    }

    /// Delete a conversation and all of its messages.
    pub async fn delete_conversation(
        &self,
        caller: UserId,
        conversation_id: ConversationId,
    ) -> ServerResult<()> {
        self.participant_conversation(caller, conversation_id).await?;
        self.db
            .call(move |db| db.delete_conversation(conversation_id))
            .await?;
        info!(conversation = %conversation_id, user = %caller, "conversation deleted");
        Ok(())
    }

    /// Load a conversation, requiring `caller` to take part in it.
    pub async fn participant_conversation(
        &self,
        caller: UserId,
        conversation_id: ConversationId,
    ) -> ServerResult<Conversation> {
        let conversation = self
            .db
            .call(move |db| db.get_conversation(conversation_id))
            .await?;
        if !conversation.includes(caller) {
            return Err(ServerError::Forbidden("not a participant".into()));
        }
        Ok(conversation)
    }
}
