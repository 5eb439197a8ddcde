//! Presence, typing and chat-request notifications.
//!
//! Everything here is fan-out over the [`ConnectionRegistry`]; nothing is
//! queued for offline users. Presence changes are also written to the user
//! row so `lastSeen` survives restarts. Those writes go through a single
//! background task, in order, and never delay the broadcast.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use parley_shared::{ConversationId, SessionId, UserId};
use parley_store::{ChatRequest, Conversation, SharedDatabase};

use crate::events::ServerEvent;
use crate::registry::{ConnectionRegistry, RegisterOutcome, SessionHandle, UnregisterOutcome};

#[derive(Debug)]
enum PresenceCommand {
    Write {
        user: UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    /// Answered once every earlier write has been applied.
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PresenceBroadcaster {
    registry: ConnectionRegistry,
    writes: mpsc::UnboundedSender<PresenceCommand>,
}

impl PresenceBroadcaster {
    /// Must be called inside a tokio runtime; spawns the presence writer.
    pub fn new(db: SharedDatabase, registry: ConnectionRegistry) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_presence(db, rx));
        Self { registry, writes }
    }

    /// Register a freshly authenticated session. The first session of a
    /// user announces them online to everyone else; every new session gets
    /// a snapshot of who is online.
    pub fn connect(&self, session: SessionHandle) -> RegisterOutcome {
        let user = session.user;
        let outcome = self.registry.register_with(session.clone(), |others| {
            broadcast(
                user,
                others,
                &ServerEvent::UserOnline {
                    user_id: user,
                    online: true,
                },
            );
            self.persist(user, true, None);
        });

        let user_ids = self
            .registry
            .online_users()
            .into_iter()
            .filter(|id| *id != user)
            .collect();
        session.send(ServerEvent::OnlineUsers { user_ids });

        outcome
    }

    /// Remove a session. The last session of a user announces them offline.
    pub fn disconnect(&self, user: UserId, session: SessionId) -> UnregisterOutcome {
        self.registry.unregister_with(user, session, |others| {
            let last_seen = Utc::now();
            broadcast(
                user,
                others,
                &ServerEvent::UserOffline {
                    user_id: user,
                    online: false,
                    last_seen,
                },
            );
            self.persist(user, false, Some(last_seen));
        })
    }

    /// Close the registry and record every user that was still connected
    /// as offline. Resolves once those writes are stored.
    pub async fn shutdown(&self) {
        let users = self.registry.shutdown();
        let last_seen = Utc::now();
        for user in &users {
            self.persist(*user, false, Some(last_seen));
        }
        self.flush().await;
        info!(users = users.len(), "Presence closed out");
    }

    /// Wait until every presence write queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writes.send(PresenceCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Forward a typing indicator to the recipient only. Dropped if they
    /// are offline.
    pub fn typing(
        &self,
        from: UserId,
        to: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> usize {
        self.registry.push(
            to,
            &ServerEvent::UserTyping {
                user_id: from,
                conversation_id,
                is_typing,
            },
        )
    }

    pub fn notify_request_received(&self, receiver: UserId, request: ChatRequest) -> usize {
        self.registry
            .push(receiver, &ServerEvent::RequestReceived { request })
    }

    pub fn notify_request_accepted(
        &self,
        sender: UserId,
        conversation: Conversation,
        accepted_by: UserId,
    ) -> usize {
        self.registry.push(
            sender,
            &ServerEvent::RequestAcceptedNotification {
                conversation,
                accepted_by,
            },
        )
    }

    fn persist(&self, user: UserId, online: bool, last_seen: Option<DateTime<Utc>>) {
        let write = PresenceCommand::Write {
            user,
            online,
            last_seen,
        };
        if self.writes.send(write).is_err() {
            warn!(user = %user, "Presence writer stopped; update not persisted");
        }
    }
}

fn broadcast(user: UserId, sessions: &[SessionHandle], event: &ServerEvent) {
    let delivered = sessions.iter().filter(|s| s.send(event.clone())).count();
    debug!(user = %user, sessions = sessions.len(), delivered, "presence broadcast");
}

async fn write_presence(db: SharedDatabase, mut rx: mpsc::UnboundedReceiver<PresenceCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            PresenceCommand::Write {
                user,
                online,
                last_seen,
            } => {
                if let Err(e) = db.call(move |db| db.set_presence(user, online, last_seen)).await {
                    warn!(user = %user, error = %e, "Failed to persist presence");
                }
            }
            PresenceCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::Database;

    async fn setup() -> (PresenceBroadcaster, ConnectionRegistry, SharedDatabase, UserId, UserId) {
        let db = SharedDatabase::new(Database::open_in_memory().unwrap());
        let alice = db.call(|db| db.create_user("alice", "Alice", "h")).await.unwrap().id;
        let bob = db.call(|db| db.create_user("bob", "Bob", "h")).await.unwrap().id;
        let registry = ConnectionRegistry::new();
        let presence = PresenceBroadcaster::new(db.clone(), registry.clone());
        (presence, registry, db, alice, bob)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    async fn stored(
        presence: &PresenceBroadcaster,
        db: &SharedDatabase,
        user: UserId,
    ) -> parley_store::UserProfile {
        presence.flush().await;
        db.call(move |db| db.get_user(user)).await.unwrap()
    }

    #[tokio::test]
    async fn one_online_event_per_user() {
        let (presence, _registry, db, alice, bob) = setup().await;
        let (watcher, mut watcher_rx) = SessionHandle::new(bob, 16);
        presence.connect(watcher);
        drain(&mut watcher_rx);

        let (phone, mut phone_rx) = SessionHandle::new(alice, 16);
        let (laptop, mut laptop_rx) = SessionHandle::new(alice, 16);
        assert!(presence.connect(phone).first_session);
        assert!(!presence.connect(laptop).first_session);

        assert_eq!(
            drain(&mut watcher_rx),
            vec![ServerEvent::UserOnline {
                user_id: alice,
                online: true,
            }]
        );

        // Each new session sees bob in its snapshot.
        for rx in [&mut phone_rx, &mut laptop_rx] {
            assert_eq!(
                drain(rx),
                vec![ServerEvent::OnlineUsers { user_ids: vec![bob] }]
            );
        }

        assert!(stored(&presence, &db, alice).await.online);
    }

    #[tokio::test]
    async fn one_offline_event_on_last_disconnect() {
        let (presence, registry, db, alice, bob) = setup().await;
        let (watcher, mut watcher_rx) = SessionHandle::new(bob, 16);
        presence.connect(watcher);

        let connected_at = Utc::now();
        let (phone, _p) = SessionHandle::new(alice, 16);
        let (laptop, _l) = SessionHandle::new(alice, 16);
        presence.connect(phone.clone());
        presence.connect(laptop.clone());
        drain(&mut watcher_rx);

        assert!(!presence.disconnect(alice, phone.id).last_session);
        assert!(drain(&mut watcher_rx).is_empty());
        assert!(registry.is_online(alice));

        assert!(presence.disconnect(alice, laptop.id).last_session);
        match drain(&mut watcher_rx).as_slice() {
            [ServerEvent::UserOffline {
                user_id,
                online,
                last_seen,
            }] => {
                assert_eq!(*user_id, alice);
                assert!(!online);
                assert!(*last_seen >= connected_at);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(!registry.is_online(alice));

        let profile = stored(&presence, &db, alice).await;
        assert!(!profile.online);
        assert!(profile.last_seen.is_some());
    }

    #[tokio::test]
    async fn typing_goes_to_recipient_only() {
        let (presence, _registry, _db, alice, bob) = setup().await;
        let carol = UserId::new();
        let (a, mut a_rx) = SessionHandle::new(alice, 16);
        let (b, mut b_rx) = SessionHandle::new(bob, 16);
        let (c, mut c_rx) = SessionHandle::new(carol, 16);
        presence.connect(a);
        presence.connect(b);
        presence.connect(c);
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        let conversation = ConversationId::new();
        assert_eq!(presence.typing(alice, bob, conversation, true), 1);
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::UserTyping {
                user_id: alice,
                conversation_id: conversation,
                is_typing: true,
            }]
        );
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut c_rx).is_empty());

        // Offline recipients are skipped silently.
        assert_eq!(presence.typing(alice, UserId::new(), conversation, false), 0);
    }

    #[tokio::test]
    async fn shutdown_records_connected_users_offline() {
        let (presence, registry, db, alice, bob) = setup().await;
        let (a, _a_rx) = SessionHandle::new(alice, 16);
        let (b, _b_rx) = SessionHandle::new(bob, 16);
        presence.connect(a.clone());
        presence.connect(b);
        assert!(stored(&presence, &db, alice).await.online);

        // Stored timestamps keep microseconds.
        let before = Utc::now() - chrono::Duration::milliseconds(1);
        presence.shutdown().await;
        assert_eq!(registry.session_count(), 0);

        for user in [alice, bob] {
            let profile = db.call(move |db| db.get_user(user)).await.unwrap();
            assert!(!profile.online);
            assert!(profile.last_seen.is_some_and(|seen| seen >= before));
        }

        // The socket task's own disconnect afterwards changes nothing.
        assert!(!presence.disconnect(alice, a.id).last_session);
        assert!(!stored(&presence, &db, alice).await.online);
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_ends_online() {
        let (presence, _registry, db, alice, bob) = setup().await;
        let (watcher, mut watcher_rx) = SessionHandle::new(bob, 16);
        presence.connect(watcher);

        for _ in 0..5 {
            let (s, _rx) = SessionHandle::new(alice, 16);
            presence.connect(s.clone());
            presence.disconnect(alice, s.id);
        }
        let (s, _rx) = SessionHandle::new(alice, 16);
        presence.connect(s);

        let last = drain(&mut watcher_rx).pop();
        assert!(matches!(last, Some(ServerEvent::UserOnline { user_id, .. }) if user_id == alice));
        assert!(stored(&presence, &db, alice).await.online);
    }
}
