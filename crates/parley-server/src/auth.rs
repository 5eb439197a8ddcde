//! Accounts and session identity.
//!
//! Passwords are hashed with bcrypt on the blocking pool. Sessions are
//! Ed25519-signed tokens (see [`parley_shared::token`]); every authenticated
//! HTTP request and WebSocket upgrade goes through [`AuthService::verify_identity`].

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tracing::{info, warn};

use parley_shared::constants::{PASSWORD_MIN_LEN, USERNAME_MAX_LEN, USERNAME_MIN_LEN};
use parley_shared::{TokenSigner, UserId};
use parley_store::{SharedDatabase, StoreError, UserProfile};

use crate::error::{ServerError, ServerResult};

const DISPLAY_NAME_MAX_LEN: usize = 64;

#[derive(Clone)]
pub struct AuthService {
    db: SharedDatabase,
    signer: TokenSigner,
    bcrypt_cost: u32,
}

impl AuthService {
    pub fn new(db: SharedDatabase, signer: TokenSigner) -> Self {
        Self {
            db,
            signer,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    /// Create an account and sign the first session token.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> ServerResult<(String, UserProfile)> {
        let username = validate_username(username)?;
        if password.chars().count() < PASSWORD_MIN_LEN {
            return Err(ServerError::Validation(format!(
                "password must be at least {PASSWORD_MIN_LEN} characters"
            )));
        }
        let display_name = match display_name.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) if name.chars().count() > DISPLAY_NAME_MAX_LEN => {
                return Err(ServerError::Validation(format!(
                    "display name must be at most {DISPLAY_NAME_MAX_LEN} characters"
                )))
            }
            Some(name) => name.to_string(),
            None => username.clone(),
        };

        let hash = self.hash_password(password.to_string()).await?;
        let profile = self
            .db
            .call(move |db| db.create_user(&username, &display_name, &hash))
            .await?;

        info!(user = %profile.id, username = %profile.username, "account created");
        Ok((self.signer.issue(profile.id), profile))
    }

    /// Check a username/password pair. Unknown users and wrong passwords
    /// produce the same error.
    pub async fn login(&self, username: &str, password: &str) -> ServerResult<(String, UserProfile)> {
        let lookup = username.trim().to_string();
        let credentials = match self.db.call(move |db| db.find_credentials(&lookup)).await {
            Ok(credentials) => credentials,
            Err(StoreError::NotFound) => return Err(invalid_credentials()),
            Err(e) => return Err(e.into()),
        };

        let password = password.to_string();
        let hash = credentials.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?
            .map_err(|e| ServerError::Internal(format!("password verification failed: {e}")))?;

        if !valid {
            warn!(username = %credentials.profile.username, "failed login");
            return Err(invalid_credentials());
        }

        let profile = credentials.profile;
        Ok((self.signer.issue(profile.id), profile))
    }

    /// Resolve a bearer token to the user it was issued for. The user must
    /// still exist.
    pub async fn verify_identity(&self, token: &str) -> ServerResult<UserId> {
        let claims = self.signer.verify(token)?;
        let user = claims.sub;
        let exists = self.db.call(move |db| db.user_exists(user)).await?;
        if !exists {
            return Err(ServerError::Unauthorized("account no longer exists".into()));
        }
        Ok(user)
    }

    pub async fn lookup_user(&self, id: UserId) -> ServerResult<UserProfile> {
        self.db.call(move |db| db.get_user(id)).await.map_err(|e| match e {
            StoreError::NotFound => ServerError::NotFound(format!("user {id} not found")),
            other => other.into(),
        })
    }

    async fn hash_password(&self, password: String) -> ServerResult<String> {
        let cost = self.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?
            .map_err(|e| ServerError::Internal(format!("password hashing failed: {e}")))
    }
}

fn invalid_credentials() -> ServerError {
    ServerError::Unauthorized("invalid username or password".into())
}

fn validate_username(raw: &str) -> ServerResult<String> {
    let username = raw.trim();
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(ServerError::Validation(format!(
            "username must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ServerError::Validation(
            "username may only contain letters, digits, '_' and '.'".into(),
        ));
    }
    Ok(username.to_string())
}

/// Token from `Authorization: Bearer <token>`, falling back to a query
/// parameter (browsers cannot set headers on WebSocket upgrades).
pub fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| {
            query_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        })
}

/// Extractor for handlers that require a signed-in user.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AuthService: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers, None)
            .ok_or_else(|| ServerError::Unauthorized("missing bearer token".into()))?;
        let auth = AuthService::from_ref(state);
        auth.verify_identity(&token).await.map(AuthUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use parley_store::Database;

    const TEST_BCRYPT_COST: u32 = 4;

    fn service() -> AuthService {
        let db = SharedDatabase::new(Database::open_in_memory().unwrap());
        AuthService::new(db, TokenSigner::generate(chrono::Duration::hours(1)))
            .with_bcrypt_cost(TEST_BCRYPT_COST)
    }

    #[tokio::test]
    async fn register_then_login() {
        let auth = service();
        let (token, profile) = auth.register("alice", "correct horse", None).await.unwrap();
        assert_eq!(profile.display_name, "alice");
        assert_eq!(auth.verify_identity(&token).await.unwrap(), profile.id);

        let (_, again) = auth.login("ALICE", "correct horse").await.unwrap();
        assert_eq!(again.id, profile.id);

        let err = auth.login("alice", "wrong password").await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");
        let err = auth.login("nobody", "whatever1").await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[tokio::test]
    async fn register_validates_input() {
        let auth = service();
        for (name, pass) in [("al", "long enough"), ("bad name", "long enough"), ("carol", "short")] {
            let err = auth.register(name, pass, None).await.unwrap_err();
            assert_eq!(err.code(), "validation", "{name}/{pass}");
        }

        auth.register("dave", "long enough", Some("Dave")).await.unwrap();
        let err = auth.register("Dave", "long enough", None).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn foreign_or_orphan_tokens_are_rejected() {
        let auth = service();
        let other = TokenSigner::generate(chrono::Duration::hours(1));
        let err = auth.verify_identity(&other.issue(UserId::new())).await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        let orphan = auth.signer.issue(UserId::new());
        let err = auth.verify_identity(&orphan).await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[tokio::test]
    async fn lookup_unknown_user_is_not_found() {
        let auth = service();
        let err = auth.lookup_user(UserId::new()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers, Some("from-query")).as_deref(), Some("from-query"));
        assert_eq!(bearer_token(&headers, Some("  ")), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(bearer_token(&headers, Some("from-query")).as_deref(), Some("from-header"));
    }
}
