//! The durable message log.
//!
//! Appending a message and updating its conversation (last message, activity
//! timestamp, receiver's unread counter) happen in one transaction. Status
//! updates are conditional on the persisted status so that `sent < delivered
//! < read` can never go backwards, whatever order acknowledgements arrive in.

use chrono::Utc;
use rusqlite::{params, Connection};

use parley_shared::{
    ConversationId, MediaMetadata, MessageBody, MessageId, MessageKind, MessageStatus, UserId,
};

use crate::conversations::{self, unread_column};
use crate::database::{conversion_error, opt_ts_col, ts, ts_col, uuid_col, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::{Conversation, Message, MessagePage, StatusChange};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, receiver, kind, content, metadata, \
     status, is_deleted, deleted_at, created_at";

impl Database {
    /// Persist `message` and fold it into its conversation. Returns the
    /// conversation as it stands after the commit.
    ///
    /// Nothing is written if any step fails.
    pub fn append_message(&mut self, message: &Message) -> Result<Conversation> {
        let tx = self.conn_mut().transaction()?;

        let conversation = conversations::get_by_id(&tx, message.conversation_id)?;
        if !conversation.is_between(message.sender, message.receiver) {
            return Err(StoreError::Conflict(format!(
                "conversation {} is not between {} and {}",
                conversation.id, message.sender, message.receiver
            )));
        }

        let metadata = message
            .body
            .metadata()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            "INSERT INTO messages
                 (id, conversation_id, sender, receiver, kind, content, metadata,
                  status, is_deleted, deleted_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, ?9)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender.to_string(),
                message.receiver.to_string(),
                message.body.kind().as_str(),
                message.body.content(),
                metadata,
                message.status.rank(),
                ts(&message.created_at),
            ],
        )?;

        let column = unread_column(&conversation, message.receiver)?;
        tx.execute(
            &format!(
                "UPDATE conversations
                 SET last_message_id = ?2, updated_at = ?3, {column} = {column} + 1
                 WHERE id = ?1"
            ),
            params![
                conversation.id.to_string(),
                message.id.to_string(),
                ts(&message.created_at),
            ],
        )?;

        let updated = conversations::get_by_id(&tx, conversation.id)?;
        tx.commit()?;

        tracing::debug!(
            message = %message.id,
            conversation = %updated.id,
            kind = %message.body.kind(),
            "message appended"
        );
        Ok(updated)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        get_by_id(self.conn(), id)
    }

    /// Move a message forward to `to`. A message already at or past `to` is
    /// left untouched and reported with `changed == false`.
    ///
    /// Reaching `read` decrements the receiver's unread counter, never below
    /// zero.
    pub fn advance_status(&mut self, id: MessageId, to: MessageStatus) -> Result<StatusChange> {
        let tx = self.conn_mut().transaction()?;

        let current = get_by_id(&tx, id)?;
        if !current.status.can_advance_to(to) {
            return Ok(StatusChange {
                message: current,
                changed: false,
            });
        }

        let affected = tx.execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
            params![id.to_string(), to.rank()],
        )?;

        if affected > 0 && to == MessageStatus::Read {
            let conversation = conversations::get_by_id(&tx, current.conversation_id)?;
            let column = unread_column(&conversation, current.receiver)?;
            tx.execute(
                &format!("UPDATE conversations SET {column} = MAX({column} - 1, 0) WHERE id = ?1"),
                params![conversation.id.to_string()],
            )?;
        }

        let message = get_by_id(&tx, id)?;
        tx.commit()?;

        Ok(StatusChange {
            message,
            changed: affected > 0,
        })
    }

    /// One page of history. Page 1 holds the newest `limit` messages; each
    /// page is returned oldest first.
    pub fn list_messages(
        &self,
        conversation: ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage> {
        let page = page.max(1);
        let limit = limit.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation.to_string(), i64::from(limit) + 1, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }

        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);
        messages.reverse();

        Ok(MessagePage {
            messages,
            page,
            limit,
            has_more,
        })
    }

    /// Redact a message in place. The row keeps its id, status and
    /// timestamps. Returns `changed == false` if it was already deleted.
    pub fn soft_delete_message(&self, id: MessageId) -> Result<StatusChange> {
        let current = get_by_id(self.conn(), id)?;
        if current.is_deleted {
            return Ok(StatusChange {
                message: current,
                changed: false,
            });
        }

        let redacted = current.body.redacted();
        self.conn().execute(
            "UPDATE messages
             SET content = ?2, metadata = NULL, is_deleted = 1, deleted_at = ?3
             WHERE id = ?1 AND is_deleted = 0",
            params![id.to_string(), redacted.content(), ts(&Utc::now())],
        )?;

        Ok(StatusChange {
            message: get_by_id(self.conn(), id)?,
            changed: true,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn get_by_id(conn: &Connection, id: MessageId) -> Result<Message> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![id.to_string()],
        row_to_message,
    )
    .map_err(not_found)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(4)?;
    let kind: MessageKind = kind.parse().map_err(|e| conversion_error(4, e))?;
    let content: String = row.get(5)?;
    let metadata: Option<String> = row.get(6)?;
    let metadata: Option<MediaMetadata> = metadata
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| conversion_error(6, e))?;
    let rank: i64 = row.get(7)?;
    let status = MessageStatus::from_rank(rank).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(7, rank)
    })?;

    Ok(Message {
        id: MessageId(uuid_col(row, 0)?),
        conversation_id: ConversationId(uuid_col(row, 1)?),
        sender: UserId(uuid_col(row, 2)?),
        receiver: UserId(uuid_col(row, 3)?),
        body: MessageBody::from_parts(kind, content, metadata),
        status,
        is_deleted: row.get(8)?,
        deleted_at: opt_ts_col(row, 9)?,
        created_at: ts_col(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::constants::DELETED_MESSAGE_MARKER;
    use parley_shared::PairKey;

    struct Fixture {
        db: Database,
        alice: UserId,
        bob: UserId,
        conversation: Conversation,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "Alice", "h").unwrap().id;
        let bob = db.create_user("bob", "Bob", "h").unwrap().id;
        let (conversation, _) = db
            .create_or_reuse_conversation(&PairKey::new(alice, bob).unwrap())
            .unwrap();
        Fixture {
            db,
            alice,
            bob,
            conversation,
        }
    }

    fn text(s: &str) -> MessageBody {
        MessageBody::Text { text: s.into() }
    }

    #[test]
    fn append_updates_conversation() {
        let mut f = fixture();
        let msg = Message::new(f.conversation.id, f.alice, f.bob, text("hi"));

        let conv = f.db.append_message(&msg).unwrap();
        assert_eq!(conv.last_message_id, Some(msg.id));
        assert_eq!(conv.unread_for(f.bob), 1);
        assert_eq!(conv.unread_for(f.alice), 0);
        assert!(conv.updated_at >= f.conversation.updated_at);

        let stored = f.db.get_message(msg.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.body, text("hi"));
    }

    #[test]
    fn failed_insert_leaves_conversation_untouched() {
        let mut f = fixture();
        let msg = Message::new(f.conversation.id, f.alice, f.bob, text("hi"));
        f.db.append_message(&msg).unwrap();

        // Same id again violates the primary key and rolls back.
        assert!(f.db.append_message(&msg).is_err());
        let conv = f.db.get_conversation(f.conversation.id).unwrap();
        assert_eq!(conv.unread_for(f.bob), 1);
    }

    #[test]
    fn append_rejects_foreign_pair() {
        let mut f = fixture();
        let carol = f.db.create_user("carol", "Carol", "h").unwrap().id;
        let msg = Message::new(f.conversation.id, f.alice, carol, text("hi"));
        assert!(matches!(
            f.db.append_message(&msg),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn media_metadata_is_persisted() {
        let mut f = fixture();
        let body = MessageBody::Image {
            url: "https://cdn.example.com/cat.png".into(),
            metadata: Some(MediaMetadata {
                mime_type: Some("image/png".into()),
                width: Some(640),
                ..Default::default()
            }),
        };
        let msg = Message::new(f.conversation.id, f.alice, f.bob, body.clone());
        f.db.append_message(&msg).unwrap();
        assert_eq!(f.db.get_message(msg.id).unwrap().body, body);
    }

    #[test]
    fn status_is_monotonic() {
        let mut f = fixture();
        let msg = Message::new(f.conversation.id, f.alice, f.bob, text("hi"));
        f.db.append_message(&msg).unwrap();

        let change = f.db.advance_status(msg.id, MessageStatus::Delivered).unwrap();
        assert!(change.changed);
        assert_eq!(change.message.status, MessageStatus::Delivered);

        let change = f.db.advance_status(msg.id, MessageStatus::Delivered).unwrap();
        assert!(!change.changed);

        let change = f.db.advance_status(msg.id, MessageStatus::Read).unwrap();
        assert!(change.changed);

        let change = f.db.advance_status(msg.id, MessageStatus::Delivered).unwrap();
        assert!(!change.changed);
        assert_eq!(change.message.status, MessageStatus::Read);
    }

    #[test]
    fn single_read_decrements_unread_once() {
        let mut f = fixture();
        let first = Message::new(f.conversation.id, f.alice, f.bob, text("one"));
        let second = Message::new(f.conversation.id, f.alice, f.bob, text("two"));
        f.db.append_message(&first).unwrap();
        f.db.append_message(&second).unwrap();

        f.db.advance_status(first.id, MessageStatus::Read).unwrap();
        f.db.advance_status(first.id, MessageStatus::Read).unwrap();

        let conv = f.db.get_conversation(f.conversation.id).unwrap();
        assert_eq!(conv.unread_for(f.bob), 1);
    }

    #[test]
    fn conversation_read_only_touches_receiver_messages() {
        let mut f = fixture();
        let to_bob = Message::new(f.conversation.id, f.alice, f.bob, text("to bob"));
        let to_alice = Message::new(f.conversation.id, f.bob, f.alice, text("to alice"));
        f.db.append_message(&to_bob).unwrap();
        f.db.append_message(&to_alice).unwrap();

        let changed = f.db.mark_conversation_read(f.conversation.id, f.bob).unwrap();
        assert_eq!(changed, vec![to_bob.id]);

        assert_eq!(f.db.get_message(to_bob.id).unwrap().status, MessageStatus::Read);
        assert_eq!(f.db.get_message(to_alice.id).unwrap().status, MessageStatus::Sent);

        let conv = f.db.get_conversation(f.conversation.id).unwrap();
        assert_eq!(conv.unread_for(f.bob), 0);
        assert_eq!(conv.unread_for(f.alice), 1);

        // Second pass has nothing left to change.
        assert!(f.db.mark_conversation_read(f.conversation.id, f.bob).unwrap().is_empty());
    }

    #[test]
    fn pages_are_newest_first_and_oldest_first_within() {
        let mut f = fixture();
        let mut ids = Vec::new();
        for i in 0..5 {
            let msg = Message::new(f.conversation.id, f.alice, f.bob, text(&format!("m{i}")));
            f.db.append_message(&msg).unwrap();
            ids.push(msg.id);
        }

        let first = f.db.list_messages(f.conversation.id, 1, 2).unwrap();
        assert!(first.has_more);
        assert_eq!(
            first.messages.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![ids[3], ids[4]]
        );

        let last = f.db.list_messages(f.conversation.id, 3, 2).unwrap();
        assert!(!last.has_more);
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.messages[0].id, ids[0]);
    }

    #[test]
    fn soft_delete_redacts_body() {
        let mut f = fixture();
        let body = MessageBody::Gif {
            url: "https://gifs.example.com/x.gif".into(),
            metadata: Some(MediaMetadata {
                size: Some(42),
                ..Default::default()
            }),
        };
        let msg = Message::new(f.conversation.id, f.alice, f.bob, body);
        f.db.append_message(&msg).unwrap();

        let change = f.db.soft_delete_message(msg.id).unwrap();
        assert!(change.changed);
        assert!(change.message.is_deleted);
        assert!(change.message.deleted_at.is_some());
        assert_eq!(change.message.body.kind(), MessageKind::Gif);
        assert_eq!(change.message.body.content(), DELETED_MESSAGE_MARKER);
        assert!(change.message.body.metadata().is_none());
        assert_eq!(change.message.created_at.timestamp_micros(), msg.created_at.timestamp_micros());

        assert!(!f.db.soft_delete_message(msg.id).unwrap().changed);
    }

    #[test]
    fn deleting_conversation_cascades_messages() {
        let mut f = fixture();
        let msg = Message::new(f.conversation.id, f.alice, f.bob, text("bye"));
        f.db.append_message(&msg).unwrap();

        f.db.delete_conversation(f.conversation.id).unwrap();
        assert!(matches!(f.db.get_message(msg.id), Err(StoreError::NotFound)));
    }
}
