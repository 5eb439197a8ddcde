//! CRUD operations for two-party [`Conversation`] records.
//!
//! A conversation is keyed by the unordered pair of its participants. The
//! unique `pair_key` index makes creation race-safe: a concurrent insert for
//! the same pair fails with a constraint violation and the loser re-reads the
//! winner's row.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{ConversationId, MessageId, MessageStatus, PairKey, UserId};

use crate::database::{opt_uuid_col, ts, ts_col, uuid_col, Database};
use crate::error::{is_unique_violation, not_found, Result, StoreError};
use crate::models::Conversation;

const CONVERSATION_COLUMNS: &str = "id, participant_a, participant_b, last_message_id, \
     unread_a, unread_b, created_at, updated_at";

impl Database {
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        get_by_id(self.conn(), id)
    }

    /// Return the conversation for `pair`, creating it if absent. The flag is
    /// `true` when this call created the row.
    pub fn create_or_reuse_conversation(&self, pair: &PairKey) -> Result<(Conversation, bool)> {
        create_or_reuse(self.conn(), pair)
    }

    /// All conversations `user` takes part in, most recently active first.
    pub fn list_conversations_for(&self, user: UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE participant_a = ?1 OR participant_b = ?1
             ORDER BY updated_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![user.to_string()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Mark every message addressed to `reader` in the conversation as read
    /// and reset their unread counter. Returns the ids that changed.
    pub fn mark_conversation_read(
        &mut self,
        id: ConversationId,
        reader: UserId,
    ) -> Result<Vec<MessageId>> {
        let tx = self.conn_mut().transaction()?;

        let conversation = get_by_id(&tx, id)?;
        if !conversation.includes(reader) {
            return Err(StoreError::NotFound);
        }

        let changed = {
            let mut stmt = tx.prepare(
                "SELECT id FROM messages
                 WHERE conversation_id = ?1 AND receiver = ?2 AND status < ?3
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(
                params![id.to_string(), reader.to_string(), MessageStatus::Read.rank()],
                |row| uuid_col(row, 0).map(MessageId),
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        tx.execute(
            "UPDATE messages SET status = ?3
             WHERE conversation_id = ?1 AND receiver = ?2 AND status < ?3",
            params![id.to_string(), reader.to_string(), MessageStatus::Read.rank()],
        )?;
        reset_unread(&tx, &conversation, reader)?;

        tx.commit()?;
        Ok(changed)
    }

    /// Hard-delete a conversation. Messages go with it through the cascade.
    pub fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers, usable inside a transaction
// ---------------------------------------------------------------------------

pub(crate) fn get_by_id(conn: &Connection, id: ConversationId) -> Result<Conversation> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        params![id.to_string()],
        row_to_conversation,
    )
    .map_err(not_found)
}

pub(crate) fn find_by_pair(conn: &Connection, pair: &PairKey) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE pair_key = ?1"),
        params![pair.to_string()],
        row_to_conversation,
    )
    .optional()
    .map_err(StoreError::Sqlite)
}

pub(crate) fn create_or_reuse(conn: &Connection, pair: &PairKey) -> Result<(Conversation, bool)> {
    if let Some(existing) = find_by_pair(conn, pair)? {
        return Ok((existing, false));
    }

    let now = Utc::now();
    let conversation = Conversation {
        id: ConversationId::new(),
        participant_a: pair.low(),
        participant_b: pair.high(),
        last_message_id: None,
        unread_a: 0,
        unread_b: 0,
        created_at: now,
        updated_at: now,
    };

    let inserted = conn.execute(
        "INSERT INTO conversations
             (id, pair_key, participant_a, participant_b, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            conversation.id.to_string(),
            pair.to_string(),
            conversation.participant_a.to_string(),
            conversation.participant_b.to_string(),
            ts(&now),
        ],
    );

    match inserted {
        Ok(_) => {
            tracing::debug!(conversation = %conversation.id, pair = %pair, "conversation created");
            Ok((conversation, true))
        }
        Err(e) if is_unique_violation(&e) => {
            // Lost the race; the other writer's row is authoritative.
            let existing = find_by_pair(conn, pair)?.ok_or(StoreError::NotFound)?;
            Ok((existing, false))
        }
        Err(e) => Err(StoreError::Sqlite(e)),
    }
}

pub(crate) fn reset_unread(conn: &Connection, conversation: &Conversation, reader: UserId) -> Result<()> {
    let column = unread_column(conversation, reader)?;
    conn.execute(
        &format!("UPDATE conversations SET {column} = 0 WHERE id = ?1"),
        params![conversation.id.to_string()],
    )?;
    Ok(())
}

/// Name of the unread counter column that belongs to `user`.
pub(crate) fn unread_column(conversation: &Conversation, user: UserId) -> Result<&'static str> {
    if user == conversation.participant_a {
        Ok("unread_a")
    } else if user == conversation.participant_b {
        Ok("unread_b")
    } else {
        Err(StoreError::NotFound)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let unread_a: i64 = row.get(4)?;
    let unread_b: i64 = row.get(5)?;
    Ok(Conversation {
        id: ConversationId(uuid_col(row, 0)?),
        participant_a: UserId(uuid_col(row, 1)?),
        participant_b: UserId(uuid_col(row, 2)?),
        last_message_id: opt_uuid_col(row, 3)?.map(MessageId),
        unread_a: u32::try_from(unread_a.max(0)).unwrap_or(u32::MAX),
        unread_b: u32::try_from(unread_b.max(0)).unwrap_or(u32::MAX),
        created_at: ts_col(row, 6)?,
        updated_at: ts_col(row, 7)?,
    })
}
