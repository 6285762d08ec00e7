//! Session auth: argon2 password hashing, opaque tokens stored hashed, and
//! an extractor that accepts Bearer, X-API-Key, or a `token` query parameter
//! (EventSource cannot set headers).

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request},
    middleware::Next,
    response::Response,
    Json,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::config::Config;
use crate::db::models::{LoginRequest, LoginResponse, Session, User, UserResponse};
use crate::db::DbPool;
use crate::AppState;

#[derive(Serialize)]
pub struct SetupStatusResponse {
    pub needs_setup: bool,
}

#[derive(Deserialize)]
pub struct SetupRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

/// Only the SHA-256 of a session token is stored.
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_password_strength(password: &str) -> Option<String> {
    if password.len() < 12 {
        return Some("Password must be at least 12 characters".to_string());
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return Some("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Some("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Some("Password must contain at least one digit".to_string());
    }
    if !password.chars().any(|c| !c.is_alphanumeric()) {
        return Some("Password must contain at least one special character".to_string());
    }
    None
}

async fn create_session(
    db: &DbPool,
    config: &Config,
    user_id: &str,
) -> Result<String, ApiError> {
    let token = generate_token();
    let expires_at = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::days(config.auth.session_ttl_days))
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339();
    sqlx::query("INSERT INTO sessions (id, user_id, token_hash, expires_at) VALUES (?, ?, ?, ?)")
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(hash_token(&token))
        .bind(&expires_at)
        .execute(db)
        .await?;
    Ok(token)
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(&request.email)
        .fetch_optional(&state.db)
        .await?;
    let user = user.ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    if !verify_password(&request.password, &user.password_hash) {
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    let token = create_session(&state.db, &state.config, &user.id).await?;
    Ok(Json(LoginResponse {
        token,
        user: UserResponse::from(user),
    }))
}

pub async fn validate(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Result<Json<UserResponse>, ApiError> {
    let (parts, _) = request.into_parts();
    let token =
        extract_token(&parts).ok_or_else(|| ApiError::unauthorized("Missing token"))?;
    let user = get_current_user(&state.db, &state.config, &token).await?;
    Ok(Json(UserResponse::from(user)))
}

/// Middleware guarding `/api`: admin token (constant-time compare) or a
/// valid unexpired session.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let token = extract_token(&parts)
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    let user = get_current_user(&state.db, &state.config, &token).await?;
    parts.extensions.insert(user);
    Ok(next.run(Request::from_parts(parts, body)).await)
}

pub async fn setup_status(State(state): State<Arc<AppState>>) -> Json<SetupStatusResponse> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&state.db)
        .await
        .unwrap_or((0,));
    Json(SetupStatusResponse {
        needs_setup: count.0 == 0,
    })
}

/// First-run setup: creates the initial admin user and logs them in.
pub async fn setup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&state.db)
        .await?;
    if count.0 > 0 {
        return Err(ApiError::forbidden("Setup has already been completed"));
    }

    if request.email.is_empty() || !request.email.contains('@') {
        return Err(ApiError::validation_field("email", "Invalid email address"));
    }
    if let Some(error) = validate_password_strength(&request.password) {
        return Err(ApiError::validation_field("password", error));
    }
    if request.name.trim().is_empty() {
        return Err(ApiError::validation_field("name", "Name is required"));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let password_hash = hash_password(&request.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))?;
    sqlx::query("INSERT INTO users (id, email, password_hash, name, role) VALUES (?, ?, ?, ?, 'admin')")
        .bind(&id)
        .bind(&request.email)
        .bind(&password_hash)
        .bind(&request.name)
        .execute(&state.db)
        .await?;
    tracing::info!("Created admin user during setup: {}", request.email);

    let token = create_session(&state.db, &state.config, &id).await?;
    Ok(Json(LoginResponse {
        token,
        user: UserResponse {
            id,
            email: request.email,
            name: request.name,
            role: "admin".to_string(),
        },
    }))
}

/// Create the configured admin user at startup when none exists yet.
pub async fn ensure_admin_user(db: &DbPool, config: &Config) -> anyhow::Result<()> {
    if config.auth.admin_password.is_empty() {
        return Ok(());
    }
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
        .bind(&config.auth.admin_email)
        .fetch_optional(db)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    let password_hash = hash_password(&config.auth.admin_password)
        .map_err(|e| anyhow::anyhow!("failed to hash admin password: {}", e))?;
    sqlx::query("INSERT INTO users (id, email, password_hash, name, role) VALUES (?, ?, ?, 'Admin', 'admin')")
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&config.auth.admin_email)
        .bind(&password_hash)
        .execute(db)
        .await?;
    tracing::info!("Created admin user {} from config", config.auth.admin_email);
    Ok(())
}

/// Token from Bearer header, X-API-Key header, or `?token=` query parameter.
fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(header) = parts
        .headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
        return Some(header.to_string());
    }
    if let Some(api_key) = parts.headers.get("X-API-Key").and_then(|h| h.to_str().ok()) {
        return Some(api_key.to_string());
    }
    parts.uri.query().and_then(|q| {
        q.split('&').find_map(|pair| {
            let mut kv = pair.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("token"), Some(value)) => Some(value.to_string()),
                _ => None,
            }
        })
    })
}

pub async fn get_current_user(
    pool: &DbPool,
    config: &Config,
    token: &str,
) -> Result<User, ApiError> {
    // Constant-time compare against the configured admin token
    let admin_token = config.auth.admin_token.as_bytes();
    let provided = token.as_bytes();
    if admin_token.len() == provided.len() && bool::from(admin_token.ct_eq(provided)) {
        let now = chrono::Utc::now().to_rfc3339();
        return Ok(User {
            id: "system".to_string(),
            email: "system@localhost".to_string(),
            password_hash: String::new(),
            name: "System Admin".to_string(),
            role: "admin".to_string(),
            created_at: now.clone(),
            updated_at: now,
        });
    }

    let session: Option<Session> = sqlx::query_as(
        "SELECT * FROM sessions WHERE token_hash = ? AND expires_at > datetime('now')",
    )
    .bind(hash_token(token))
    .fetch_optional(pool)
    .await?;
    let session = session.ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&session.user_id)
        .fetch_optional(pool)
        .await?;
    user.ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for User {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // auth_middleware already resolved the user for /api routes
        if let Some(user) = parts.extensions.get::<User>() {
            return Ok(user.clone());
        }
        let token =
            extract_token(parts).ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        get_current_user(&state.db, &state.config, &token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password("correct horse battery staple 1!A").unwrap();
        assert!(verify_password("correct horse battery staple 1!A", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_token_hash_is_stable_and_opaque() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
    }

    #[test]
    fn test_password_strength_rules() {
        assert!(validate_password_strength("short").is_some());
        assert!(validate_password_strength("alllowercase1234!").is_some());
        assert!(validate_password_strength("ALLUPPERCASE1234!").is_some());
        assert!(validate_password_strength("NoDigitsHere!!!!").is_some());
        assert!(validate_password_strength("NoSpecials12345A").is_some());
        assert!(validate_password_strength("Sufficient1Pass!").is_none());
    }

    #[test]
    fn test_extract_token_from_query() {
        let request = axum::http::Request::builder()
            .uri("/api/search/stream?query=ml&token=abc123")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();
        assert_eq!(extract_token(&parts).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_extract_token_prefers_bearer() {
        let request = axum::http::Request::builder()
            .uri("/api/documents?token=query-token")
            .header("Authorization", "Bearer header-token")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();
        assert_eq!(extract_token(&parts).as_deref(), Some("header-token"));
    }
}
