use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Pending-request inbox and directory search
CREATE INDEX IF NOT EXISTS idx_chat_requests_receiver ON chat_requests(receiver, status);
CREATE INDEX IF NOT EXISTS idx_users_display_name ON users(display_name COLLATE NOCASE);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
