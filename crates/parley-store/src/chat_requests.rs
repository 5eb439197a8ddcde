//! CRUD operations for [`ChatRequest`] records.
//!
//! There is at most one request row per unordered pair of users. A rejected
//! request can be reopened by either side; a pending or accepted one cannot
//! be sent again.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::{ChatRequestId, ChatRequestStatus, PairKey, UserId};

use crate::conversations;
use crate::database::{conversion_error, ts, ts_col, uuid_col, Database};
use crate::error::{is_unique_violation, not_found, Result, StoreError};
use crate::models::{ChatRequest, Conversation};

const REQUEST_COLUMNS: &str = "id, sender, receiver, status, message, created_at, updated_at";

impl Database {
    /// Send (or reopen) a request from `sender` to `receiver`.
    pub fn send_chat_request(
        &mut self,
        sender: UserId,
        receiver: UserId,
        note: Option<&str>,
    ) -> Result<ChatRequest> {
        let pair = PairKey::new(sender, receiver)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        let tx = self.conn_mut().transaction()?;
        let now = Utc::now();

        let request = match find_by_pair(&tx, &pair)? {
            Some(existing) => match existing.status {
                ChatRequestStatus::Pending => {
                    return Err(StoreError::Conflict(
                        "a chat request between these users is already pending".into(),
                    ))
                }
                ChatRequestStatus::Accepted => {
                    return Err(StoreError::Conflict(
                        "these users are already connected".into(),
                    ))
                }
                ChatRequestStatus::Rejected => {
                    tx.execute(
                        "UPDATE chat_requests
                         SET sender = ?2, receiver = ?3, status = 'pending',
                             message = ?4, updated_at = ?5
                         WHERE id = ?1 AND status = 'rejected'",
                        params![
                            existing.id.to_string(),
                            sender.to_string(),
                            receiver.to_string(),
                            note,
                            ts(&now),
                        ],
                    )?;
                    get_by_id(&tx, existing.id)?
                }
            },
            None => {
                let request = ChatRequest {
                    id: ChatRequestId::new(),
                    sender,
                    receiver,
                    status: ChatRequestStatus::Pending,
                    message: note.map(str::to_string),
                    created_at: now,
                    updated_at: now,
                };
                tx.execute(
                    "INSERT INTO chat_requests
                         (id, pair_key, sender, receiver, status, message, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                    params![
                        request.id.to_string(),
                        pair.to_string(),
                        sender.to_string(),
                        receiver.to_string(),
                        request.message,
                        ts(&now),
                    ],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::Conflict("a chat request between these users already exists".into())
                    } else {
                        StoreError::Sqlite(e)
                    }
                })?;
                request
            }
        };

        tx.commit()?;
        tracing::debug!(request = %request.id, sender = %sender, receiver = %receiver, "chat request sent");
        Ok(request)
    }

    pub fn get_chat_request(&self, id: ChatRequestId) -> Result<ChatRequest> {
        get_by_id(self.conn(), id)
    }

    /// Pending requests addressed to `receiver`, newest first.
    pub fn list_pending_requests_for(&self, receiver: UserId) -> Result<Vec<ChatRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM chat_requests
             WHERE receiver = ?1 AND status = 'pending'
             ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map(params![receiver.to_string()], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    /// Accept a pending request and create (or reuse) the pair's
    /// conversation in the same transaction.
    pub fn accept_chat_request(&mut self, id: ChatRequestId) -> Result<(ChatRequest, Conversation)> {
        let tx = self.conn_mut().transaction()?;

        let request = resolve(&tx, id, ChatRequestStatus::Accepted)?;
        let pair = PairKey::new(request.sender, request.receiver)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        let (conversation, _) = conversations::create_or_reuse(&tx, &pair)?;

        tx.commit()?;
        Ok((request, conversation))
    }

    pub fn reject_chat_request(&mut self, id: ChatRequestId) -> Result<ChatRequest> {
        let tx = self.conn_mut().transaction()?;
        let request = resolve(&tx, id, ChatRequestStatus::Rejected)?;
        tx.commit()?;
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Move a pending request to `to`; anything else is a conflict.
fn resolve(conn: &Connection, id: ChatRequestId, to: ChatRequestStatus) -> Result<ChatRequest> {
    let affected = conn.execute(
        "UPDATE chat_requests SET status = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_string(), to.as_str(), ts(&Utc::now())],
    )?;

    let request = get_by_id(conn, id)?;
    if affected == 0 {
        return Err(StoreError::Conflict(format!(
            "chat request is already {}",
            request.status.as_str()
        )));
    }
    Ok(request)
}

fn get_by_id(conn: &Connection, id: ChatRequestId) -> Result<ChatRequest> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM chat_requests WHERE id = ?1"),
        params![id.to_string()],
        row_to_request,
    )
    .map_err(not_found)
}

fn find_by_pair(conn: &Connection, pair: &PairKey) -> Result<Option<ChatRequest>> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM chat_requests WHERE pair_key = ?1"),
        params![pair.to_string()],
        row_to_request,
    )
    .optional()
    .map_err(StoreError::Sqlite)
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRequest> {
    let status: String = row.get(3)?;
    Ok(ChatRequest {
        id: ChatRequestId(uuid_col(row, 0)?),
        sender: UserId(uuid_col(row, 1)?),
        receiver: UserId(uuid_col(row, 2)?),
        status: status.parse().map_err(|e| conversion_error(3, e))?,
        message: row.get(4)?,
        created_at: ts_col(row, 5)?,
        updated_at: ts_col(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_users() -> (Database, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "Alice", "h").unwrap().id;
        let b = db.create_user("bob", "Bob", "h").unwrap().id;
        (db, a, b)
    }

    #[test]
    fn pending_request_blocks_resend_both_ways() {
        let (mut db, a, b) = db_with_users();
        let req = db.send_chat_request(a, b, Some("hey")).unwrap();
        assert_eq!(req.status, ChatRequestStatus::Pending);
        assert_eq!(req.message.as_deref(), Some("hey"));

        assert!(matches!(db.send_chat_request(a, b, None), Err(StoreError::Conflict(_))));
        assert!(matches!(db.send_chat_request(b, a, None), Err(StoreError::Conflict(_))));

        let pending = db.list_pending_requests_for(b).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(db.list_pending_requests_for(a).unwrap().is_empty());
    }

    #[test]
    fn accept_creates_exactly_one_conversation() {
        let (mut db, a, b) = db_with_users();
        let (existing, _) = db
            .create_or_reuse_conversation(&PairKey::new(a, b).unwrap())
            .unwrap();

        let req = db.send_chat_request(a, b, None).unwrap();
        let (accepted, conversation) = db.accept_chat_request(req.id).unwrap();
        assert_eq!(accepted.status, ChatRequestStatus::Accepted);
        assert_eq!(conversation.id, existing.id);
        assert_eq!(db.list_conversations_for(a).unwrap().len(), 1);

        assert!(matches!(db.accept_chat_request(req.id), Err(StoreError::Conflict(_))));
        assert!(matches!(db.send_chat_request(b, a, None), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn rejected_request_reopens_in_new_direction() {
        let (mut db, a, b) = db_with_users();
        let req = db.send_chat_request(a, b, None).unwrap();
        db.reject_chat_request(req.id).unwrap();
        assert!(db.list_conversations_for(a).unwrap().is_empty());

        let reopened = db.send_chat_request(b, a, Some("again")).unwrap();
        assert_eq!(reopened.id, req.id);
        assert_eq!(reopened.sender, b);
        assert_eq!(reopened.receiver, a);
        assert_eq!(reopened.status, ChatRequestStatus::Pending);
        assert_eq!(reopened.message.as_deref(), Some("again"));
    }

    #[test]
    fn self_request_is_rejected() {
        let (mut db, a, _) = db_with_users();
        assert!(matches!(db.send_chat_request(a, a, None), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn unknown_request_is_not_found() {
        let (mut db, _, _) = db_with_users();
        assert!(matches!(
            db.accept_chat_request(ChatRequestId::new()),
            Err(StoreError::NotFound)
        ));
    }
}
