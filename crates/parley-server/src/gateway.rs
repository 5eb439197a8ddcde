//! WebSocket gateway.
//!
//! One authenticated socket becomes one registry session. The reader loop
//! decodes [`ClientEvent`]s and hands them to the router or the presence
//! broadcaster; a writer task drains the session queue onto the socket.
//! A failing event only produces an error frame; the socket stays open.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::{ChatRequestStatus, UserId};

use crate::api::AppState;
use crate::auth::bearer_token;
use crate::error::{ServerError, ServerResult};
use crate::events::{ClientEvent, ServerEvent};
use crate::registry::SessionHandle;
use crate::router::SendRequest;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws`. Authentication happens before the upgrade is looked at, so
/// a bad token gets a plain 401 and no session is ever created.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user = match authenticate(&state, &headers, query.token.as_deref()).await {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, user)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> ServerResult<UserId> {
    let token = bearer_token(headers, query_token)
        .ok_or_else(|| ServerError::Unauthorized("missing bearer token".into()))?;
    state.auth.verify_identity(&token).await
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let (session, rx) = SessionHandle::new(user, state.config.session_queue_capacity);
    let (sink, mut stream) = socket.split();

    let writer = tokio::spawn(write_events(sink, rx, state.registry.shutdown_signal()));

    state.presence.connect(session.clone());
    info!(user = %user, session = %session.id, "socket connected");

    let mut shutdown = state.registry.shutdown_signal();
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = shutdown.changed() => break,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => handle_frame(&state, &session, &text).await,
            Some(Ok(WsMessage::Binary(_))) => {
                let err = ServerError::Validation("binary frames are not supported".into());
                session.send(ServerEvent::error(&err));
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(user = %user, error = %e, "socket read failed");
                break;
            }
        }
    }

    // Out of the registry before the task ends, so nothing routes to a dead
    // session.
    state.presence.disconnect(user, session.id);
    drop(session);
    writer.abort();
    info!(user = %user, "socket disconnected");
}

async fn write_events<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ServerEvent>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) where
    S: futures::Sink<WsMessage> + Unpin,
{
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.changed() => None,
        };
        let Some(event) = event else {
            break;
        };

        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to encode event");
                continue;
            }
        };
        if sink.send(WsMessage::Text(json)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Decode and dispatch one text frame, reporting failures to the session.
pub async fn handle_frame(state: &AppState, session: &SessionHandle, text: &str) {
    if !state.event_limiter.check(&session.user).await {
        session.send(ServerEvent::Error {
            code: "rate_limited".into(),
            error: "Too many events, slow down".into(),
        });
        return;
    }

    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            let err = ServerError::Validation(format!("malformed event: {e}"));
            session.send(ServerEvent::error(&err));
            return;
        }
    };

    let name = event.name();
    let is_send = matches!(event, ClientEvent::SendMessage { .. });
    if let Err(err) = dispatch(state, session, event).await {
        debug!(user = %session.user, event = name, error = %err, "event failed");
        if is_send {
            session.send(ServerEvent::MessageError {
                error: err.public_message(),
            });
        } else {
            session.send(ServerEvent::error(&err));
        }
    }
}

async fn dispatch(state: &AppState, session: &SessionHandle, event: ClientEvent) -> ServerResult<()> {
    let user = session.user;
    match event {
        ClientEvent::SendMessage {
            receiver_id,
            kind,
            content,
            conversation_id,
            metadata,
        } => {
            let req = SendRequest {
                receiver: receiver_id,
                kind,
                content,
                conversation_id,
                metadata,
            };
            state.router.send(session, req).await?;
        }
        ClientEvent::Typing {
            receiver_id,
            conversation_id,
        } => {
            state.presence.typing(user, receiver_id, conversation_id, true);
        }
        ClientEvent::StopTyping {
            receiver_id,
            conversation_id,
        } => {
            state.presence.typing(user, receiver_id, conversation_id, false);
        }
        ClientEvent::MessageDelivered { message_id } => {
            state.router.mark_delivered(user, message_id).await?;
        }
        ClientEvent::MessageRead {
            message_id: Some(message_id),
            ..
        } => {
            state.router.mark_read(user, message_id).await?;
        }
        ClientEvent::MessageRead {
            message_id: None,
            conversation_id: Some(conversation_id),
        } => {
            state.router.mark_conversation_read(user, conversation_id).await?;
        }
        ClientEvent::MessageRead { .. } => {
            return Err(ServerError::Validation(
                "message_read needs a messageId or a conversationId".into(),
            ));
        }
        ClientEvent::RequestSent {
            receiver_id,
            request,
        } => {
            // Relay the stored row, never the client's copy.
            let id = request.id;
            let stored = state.db.call(move |db| db.get_chat_request(id)).await?;
            if stored.sender != user
                || stored.receiver != receiver_id
                || stored.status != ChatRequestStatus::Pending
            {
                return Err(ServerError::Forbidden("not your pending request".into()));
            }
            state.presence.notify_request_received(receiver_id, stored);
        }
        ClientEvent::RequestAccepted {
            sender_id,
            conversation,
        } => {
            let id = conversation.id;
            let stored = state.db.call(move |db| db.get_conversation(id)).await?;
            if !stored.is_between(user, sender_id) {
                return Err(ServerError::Forbidden("not your conversation".into()));
            }
            state.presence.notify_request_accepted(sender_id, stored, user);
        }
    }
    Ok(())
}
