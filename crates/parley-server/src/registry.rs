//! Live connection registry.
//!
//! Maps each user to their connected sessions (one per device). Every session
//! owns a bounded outbound queue drained by its socket writer task; fan-out
//! uses `try_send` so a slow client never stalls the sender.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use parley_shared::{SessionId, UserId};

use crate::events::ServerEvent;

/// Handle to one live connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user: UserId,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<ServerEvent>,
}

impl SessionHandle {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(user: UserId, capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: SessionId::new(),
            user,
            connected_at: Utc::now(),
            tx,
        };
        (handle, rx)
    }

    /// Enqueue without waiting. Returns `false` if the queue is full or
    /// the writer has gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    user = %self.user,
                    session = %self.id,
                    "Dropping event for slow session"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(user = %self.user, session = %self.id, "Session queue closed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// The user had no live session before this one.
    pub first_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterOutcome {
    /// The user has no live session left.
    pub last_session: bool,
}

type SessionMap = HashMap<UserId, HashMap<SessionId, SessionHandle>>;

/// Process-local map of user id to live sessions. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<SessionMap>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Add a session. Registering the same session twice is a no-op.
    pub fn register(&self, session: SessionHandle) -> RegisterOutcome {
        self.register_with(session, |_| {})
    }

    /// Add a session and, if it is the user's first, run `on_first` with
    /// every other user's sessions while the registry is still locked.
    /// Online/offline transitions of one user are therefore observed in
    /// the order the registry applied them.
    pub fn register_with(
        &self,
        session: SessionHandle,
        on_first: impl FnOnce(&[SessionHandle]),
    ) -> RegisterOutcome {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let user = session.user;
        let id = session.id;
        let user_sessions = sessions.entry(user).or_default();
        let first_session = user_sessions.is_empty();
        user_sessions.insert(id, session);
        let count = user_sessions.len();

        if first_session {
            on_first(&others(&sessions, user));
        }

        info!(user = %user, session = %id, sessions = count, "Session registered");
        RegisterOutcome { first_session }
    }

    /// Remove a session. Unknown sessions are ignored.
    pub fn unregister(&self, user: UserId, session: SessionId) -> UnregisterOutcome {
        self.unregister_with(user, session, |_| {})
    }

    /// Remove a session and, if it was the user's last, run `on_last` with
    /// every other user's sessions under the same lock.
    pub fn unregister_with(
        &self,
        user: UserId,
        session: SessionId,
        on_last: impl FnOnce(&[SessionHandle]),
    ) -> UnregisterOutcome {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(user_sessions) = sessions.get_mut(&user) else {
            return UnregisterOutcome { last_session: false };
        };
        if user_sessions.remove(&session).is_none() {
            return UnregisterOutcome { last_session: false };
        }

        let last_session = user_sessions.is_empty();
        if last_session {
            sessions.remove(&user);
            on_last(&others(&sessions, user));
        }

        info!(user = %user, session = %session, last_session, "Session unregistered");
        UnregisterOutcome { last_session }
    }

    pub fn sessions_for(&self, user: UserId) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(&user)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user: UserId) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&user).is_some_and(|s| !s.is_empty())
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.keys().copied().collect()
    }

    /// Every live session that does not belong to `user`.
    pub fn all_sessions_except(&self, user: UserId) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        others(&sessions, user)
    }

    /// Enqueue `event` on every session of `user`. Returns how many
    /// sessions accepted it.
    pub fn push(&self, user: UserId, event: &ServerEvent) -> usize {
        self.sessions_for(user)
            .iter()
            .filter(|session| session.send(event.clone()))
            .count()
    }

    pub fn session_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.values().map(HashMap::len).sum()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Drop every session and tell connection tasks to close. Returns the
    /// users that were online, so their presence can be closed out.
    pub fn shutdown(&self) -> Vec<UserId> {
        let (users, dropped) = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let count = sessions.values().map(HashMap::len).sum::<usize>();
            let users: Vec<UserId> = sessions.drain().map(|(user, _)| user).collect();
            (users, count)
        };
        self.shutdown.send_replace(true);
        info!(users = users.len(), sessions = dropped, "Connection registry shut down");
        users
    }
}

fn others(sessions: &SessionMap, user: UserId) -> Vec<SessionHandle> {
    sessions
        .iter()
        .filter(|(owner, _)| **owner != user)
        .flat_map(|(_, s)| s.values().cloned())
        .collect()
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
