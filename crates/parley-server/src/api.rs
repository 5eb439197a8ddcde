use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{FromRef, Path, Query, State},
    http::Method,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::{
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MAX_REQUEST_NOTE_LENGTH, MAX_SEARCH_RESULTS,
};
use parley_shared::{ChatRequestId, ConversationId, MessageId, TokenSigner, UserId};
use parley_store::{ChatRequest, Conversation, SharedDatabase, UserProfile};

use crate::auth::{AuthService, AuthUser};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::events::MessagePayload;
use crate::gateway::ws_handler;
use crate::presence::PresenceBroadcaster;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDatabase,
    pub registry: ConnectionRegistry,
    pub router: MessageRouter,
    pub presence: PresenceBroadcaster,
    pub auth: AuthService,
    pub http_limiter: RateLimiter<IpAddr>,
    pub event_limiter: RateLimiter<UserId>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire every component around one database and one registry. Must run
    /// inside a tokio runtime.
    pub fn new(config: ServerConfig, db: SharedDatabase, signer: TokenSigner) -> Self {
        let registry = ConnectionRegistry::new();
        let router = MessageRouter::new(db.clone(), registry.clone(), config.max_text_length);
        let presence = PresenceBroadcaster::new(db.clone(), registry.clone());
        let auth = AuthService::new(db.clone(), signer);
        let http_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
        let event_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

        Self {
            db,
            registry,
            router,
            presence,
            auth,
            http_limiter,
            event_limiter,
            config: Arc::new(config),
        }
    }
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/users/me", get(me))
        .route("/users/search", get(search_users))
        .route("/users/:id", get(get_user))
        .route("/requests", post(send_request))
        .route("/requests/pending", get(pending_requests))
        .route("/requests/:id/accept", post(accept_request))
        .route("/requests/:id/reject", post(reject_request))
        .route("/conversations", get(list_conversations))
        .route("/conversations/:id", delete(delete_conversation))
        .route("/conversations/:id/messages", get(list_messages))
        .route("/conversations/:id/read", post(read_conversation))
        .route("/messages/:id", delete(delete_message))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.http_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    username: String,
    password: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
    user: UserProfile,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequestBody {
    receiver_id: UserId,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct AcceptResponse {
    request: ChatRequest,
    conversation: Conversation,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationSummary {
    #[serde(flatten)]
    conversation: Conversation,
    other_user: UserProfile,
    unread_count: u32,
    last_message: Option<MessagePayload>,
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessagePageResponse {
    messages: Vec<MessagePayload>,
    page: u32,
    limit: u32,
    has_more: bool,
}

#[derive(Serialize)]
struct ReadResponse {
    updated: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.registry.session_count(),
    })
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ServerResult<Json<AuthResponse>> {
    let (token, user) = state
        .auth
        .register(&req.username, &req.password, req.display_name.as_deref())
        .await?;
    Ok(Json(AuthResponse { token, user }))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ServerResult<Json<AuthResponse>> {
    let (token, user) = state.auth.login(&req.username, &req.password).await?;
    Ok(Json(AuthResponse {
        token,
        user: with_live_presence(&state, user),
    }))
}

async fn me(State(state): State<AppState>, AuthUser(caller): AuthUser) -> ServerResult<Json<UserProfile>> {
    let profile = state.auth.lookup_user(caller).await?;
    Ok(Json(with_live_presence(&state, profile)))
}

async fn search_users(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Query(query): Query<SearchQuery>,
) -> ServerResult<Json<Vec<UserProfile>>> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Err(ServerError::Validation("search query is empty".into()));
    }
    let found = state
        .db
        .call(move |db| db.search_users(&q, caller, MAX_SEARCH_RESULTS))
        .await?;
    Ok(Json(
        found
            .into_iter()
            .map(|p| with_live_presence(&state, p))
            .collect(),
    ))
}

async fn get_user(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(id): Path<UserId>,
) -> ServerResult<Json<UserProfile>> {
    let profile = state.auth.lookup_user(id).await?;
    Ok(Json(with_live_presence(&state, profile)))
}

async fn send_request(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<ChatRequestBody>,
) -> ServerResult<Json<ChatRequest>> {
    if body.receiver_id == caller {
        return Err(ServerError::Validation("cannot send a chat request to yourself".into()));
    }
    let note = body
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());
    if note
        .as_ref()
        .is_some_and(|m| m.chars().count() > MAX_REQUEST_NOTE_LENGTH)
    {
        return Err(ServerError::Validation(format!(
            "request message must be at most {MAX_REQUEST_NOTE_LENGTH} characters"
        )));
    }

    let receiver = body.receiver_id;
    state.auth.lookup_user(receiver).await?;
    let request = state
        .db
        .call(move |db| db.send_chat_request(caller, receiver, note.as_deref()))
        .await?;

    info!(request = %request.id, sender = %caller, receiver = %receiver, "chat request sent");
    state
        .presence
        .notify_request_received(receiver, request.clone());
    Ok(Json(request))
}

async fn pending_requests(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ServerResult<Json<Vec<ChatRequest>>> {
    let requests = state
        .db
        .call(move |db| db.list_pending_requests_for(caller))
        .await?;
    Ok(Json(requests))
}

async fn accept_request(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<ChatRequestId>,
) -> ServerResult<Json<AcceptResponse>> {
    require_request_receiver(&state, caller, id).await?;
    let (request, conversation) = state
        .db
        .call(move |db| db.accept_chat_request(id))
        .await?;

    info!(request = %id, conversation = %conversation.id, "chat request accepted");
    state
        .presence
        .notify_request_accepted(request.sender, conversation.clone(), caller);
    Ok(Json(AcceptResponse {
        request,
        conversation,
    }))
}

async fn reject_request(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<ChatRequestId>,
) -> ServerResult<Json<ChatRequest>> {
    require_request_receiver(&state, caller, id).await?;
    let request = state.db.call(move |db| db.reject_chat_request(id)).await?;
    Ok(Json(request))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> ServerResult<Json<Vec<ConversationSummary>>> {
    let summaries = state
        .db
        .call(move |db| {
            let conversations = db.list_conversations_for(caller)?;
            let mut out = Vec::with_capacity(conversations.len());
            for conversation in conversations {
                let Some(other) = conversation.other_participant(caller) else {
                    continue;
                };
                let other_user = db.get_user(other)?;
                let last_message = match conversation.last_message_id {
                    Some(id) => db.get_message(id).ok().map(|m| MessagePayload::from(&m)),
                    None => None,
                };
                out.push(ConversationSummary {
                    unread_count: conversation.unread_for(caller),
                    conversation,
                    other_user,
                    last_message,
                });
            }
            Ok(out)
        })
        .await?;

    Ok(Json(
        summaries
            .into_iter()
            .map(|mut s| {
                s.other_user = with_live_presence(&state, s.other_user);
                s
            })
            .collect(),
    ))
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<ConversationId>,
    Query(query): Query<PageQuery>,
) -> ServerResult<Json<MessagePageResponse>> {
    state.router.participant_conversation(caller, id).await?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let result = state
        .db
        .call(move |db| db.list_messages(id, page, limit))
        .await?;

    Ok(Json(MessagePageResponse {
        messages: result.messages.iter().map(MessagePayload::from).collect(),
        page: result.page,
        limit: result.limit,
        has_more: result.has_more,
    }))
}

async fn read_conversation(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<ConversationId>,
) -> ServerResult<Json<ReadResponse>> {
    let changed = state.router.mark_conversation_read(caller, id).await?;
    Ok(Json(ReadResponse {
        updated: changed.len(),
    }))
}

async fn delete_conversation(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<ConversationId>,
) -> ServerResult<Json<serde_json::Value>> {
    state.router.delete_conversation(caller, id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<MessageId>,
) -> ServerResult<Json<MessagePayload>> {
    let message = state.router.delete_message(caller, id).await?;
    Ok(Json(message))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn require_request_receiver(
    state: &AppState,
    caller: UserId,
    id: ChatRequestId,
) -> ServerResult<()> {
    let request = state.db.call(move |db| db.get_chat_request(id)).await?;
    if request.receiver != caller {
        return Err(ServerError::Forbidden(
            "only the receiver can answer a chat request".into(),
        ));
    }
    Ok(())
}

/// The stored `online` flag lags; the registry is authoritative.
fn with_live_presence(state: &AppState, mut profile: UserProfile) -> UserProfile {
    profile.online = state.registry.is_online(profile.id);
    profile
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
