//! Async access to a [`Database`] from the server.
//!
//! `rusqlite` is synchronous, so every call is moved onto tokio's blocking
//! thread pool. The connection sits behind a mutex; SQLite serializes writers
//! anyway and the lock is held only for the duration of one closure.

use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Cloneable handle to a single shared [`Database`].
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut db = inner.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut db)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_run_on_blocking_pool() {
        let shared = SharedDatabase::new(Database::open_in_memory().unwrap());

        let user = shared
            .call(|db| db.create_user("alice", "Alice", "h"))
            .await
            .unwrap();

        let clone = shared.clone();
        let fetched = clone.call(move |db| db.get_user(user.id)).await.unwrap();
        assert_eq!(fetched.username, "alice");
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let shared = SharedDatabase::new(Database::open_in_memory().unwrap());
        let err = shared
            .call(|db| db.get_user(parley_shared::UserId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }
}
