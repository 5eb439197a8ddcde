//! CRUD operations for [`UserProfile`] records and presence persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::UserId;

use crate::database::{opt_ts_col, ts, ts_col, uuid_col, Database};
use crate::error::{is_unique_violation, not_found, Result, StoreError};
use crate::models::{UserCredentials, UserProfile};

const PROFILE_COLUMNS: &str =
    "id, username, display_name, avatar_url, online, last_seen, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new user. Usernames are unique case-insensitively.
    pub fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<UserProfile> {
        let profile = UserProfile {
            id: UserId::new(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
            online: false,
            last_seen: None,
            created_at: Utc::now(),
        };

        self.conn()
            .execute(
                "INSERT INTO users (id, username, display_name, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    profile.id.to_string(),
                    profile.username,
                    profile.display_name,
                    password_hash,
                    ts(&profile.created_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!("username '{username}' is already taken"))
                } else {
                    StoreError::Sqlite(e)
                }
            })?;

        Ok(profile)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: UserId) -> Result<UserProfile> {
        self.conn()
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_profile,
            )
            .map_err(not_found)
    }

    pub fn user_exists(&self, id: UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Look up credentials for login.
    pub fn find_credentials(&self, username: &str) -> Result<UserCredentials> {
        self.conn()
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS}, password_hash FROM users WHERE username = ?1"),
                params![username],
                |row| {
                    Ok(UserCredentials {
                        profile: row_to_profile(row)?,
                        password_hash: row.get(7)?,
                    })
                },
            )
            .map_err(not_found)
    }

    /// Case-insensitive substring search over username and display name,
    /// excluding the caller.
    pub fn search_users(&self, query: &str, exclude: UserId, limit: u32) -> Result<Vec<UserProfile>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM users
             WHERE id != ?1
               AND (username LIKE ?2 ESCAPE '\\' OR display_name LIKE ?2 ESCAPE '\\')
             ORDER BY username ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(params![exclude.to_string(), pattern, limit], row_to_profile)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Persist presence so that `last_seen` survives reconnects.
    pub fn set_presence(
        &self,
        id: UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET online = ?2, last_seen = COALESCE(?3, last_seen) WHERE id = ?1",
            params![id.to_string(), online, last_seen.as_ref().map(ts)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        id: UserId(uuid_col(row, 0)?),
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        online: row.get(4)?,
        last_seen: opt_ts_col(row, 5)?,
        created_at: ts_col(row, 6)?,
    })
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_user() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "Alice", "hash").unwrap();

        let fetched = db.get_user(alice.id).unwrap();
        assert_eq!(fetched.username, "alice");
        assert!(!fetched.online);
        assert!(db.user_exists(alice.id).unwrap());
        assert!(!db.user_exists(UserId::new()).unwrap());
    }

    #[test]
    fn duplicate_username_is_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", "Alice", "hash").unwrap();
        let err = db.create_user("ALICE", "Other", "hash").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn credentials_lookup_is_case_insensitive() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "Alice", "secret-hash").unwrap();
        let creds = db.find_credentials("Alice").unwrap();
        assert_eq!(creds.profile.id, alice.id);
        assert_eq!(creds.password_hash, "secret-hash");
        assert!(matches!(db.find_credentials("bob"), Err(StoreError::NotFound)));
    }

    #[test]
    fn search_excludes_caller_and_escapes_wildcards() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "Alice", "h").unwrap();
        db.create_user("alicia", "Alicia Keys", "h").unwrap();
        db.create_user("bob", "Bob", "h").unwrap();
        db.create_user("under_score", "U", "h").unwrap();

        let found = db.search_users("ali", alice.id, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "alicia");

        let found = db.search_users("_", alice.id, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "under_score");
    }

    #[test]
    fn presence_keeps_last_seen_when_going_online() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "Alice", "h").unwrap();

        let seen = Utc::now();
        db.set_presence(alice.id, false, Some(seen)).unwrap();
        db.set_presence(alice.id, true, None).unwrap();

        let fetched = db.get_user(alice.id).unwrap();
        assert!(fetched.online);
        assert_eq!(
            fetched.last_seen.map(|t| t.timestamp_micros()),
            Some(seen.timestamp_micros())
        );

        assert!(matches!(
            db.set_presence(UserId::new(), true, None),
            Err(StoreError::NotFound)
        ));
    }
}
