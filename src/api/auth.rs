//! Auth endpoints (spec §6): register, login, refresh, logout.

use axum::extract::{Request, State};
use axum::http::header::USER_AGENT;
use axum::Json;
use sha2::{Digest, Sha256};

use crate::auth::middleware::extract_client_ip;
use crate::auth::tokens;
use crate::auth::{password, ratelimit};
use crate::catalog::users;
use crate::db::models::{LoginInput, PublicUser, RefreshInput, RegisterInput};
use crate::error::{AppError, AppResult};
use crate::AppState;

fn hash_identity(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn request_identity_hashes(request: &Request) -> (String, String) {
    let ip = extract_client_ip(request);
    let ua = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    (hash_identity(&ip), hash_identity(ua))
}

pub async fn register(
    State(state): State<AppState>,
    Json(input): Json<RegisterInput>,
) -> AppResult<(axum::http::StatusCode, Json<PublicUser>)> {
    if input.email.trim().is_empty() || input.username.trim().is_empty() {
        return Err(AppError::Validation("email and username are required".into()));
    }
    if input.password.len() < 8 {
        return Err(AppError::Validation("password must be at least 8 characters".into()));
    }

    let password_hash = password::hash(&input.password)?;
    let user = users::create(&state.db, &input.email, &input.username, &password_hash).await?;

    Ok((axum::http::StatusCode::CREATED, Json(user.into())))
}

#[derive(serde::Serialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Login rate limiting is counted by source IP independent of whether the
/// attempt succeeds (spec §4.7), so the tier check runs before credentials
/// are even looked up.
pub async fn login(
    State(state): State<AppState>,
    request: Request,
) -> AppResult<Json<TokenPairResponse>> {
    let ip = extract_client_ip(&request);
    let mut redis = state.redis.clone();
    let decision = ratelimit::check(&mut redis, &ratelimit::LOGIN_PER_IP, &ip).await;
    if !decision.allowed {
        return Err(AppError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_secs: decision.reset_secs,
        });
    }

    let (ip_hash, ua_hash) = request_identity_hashes(&request);
    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|_| AppError::Validation("invalid request body".into()))?;
    let input: LoginInput =
        serde_json::from_slice(&bytes).map_err(|_| AppError::Validation("invalid request body".into()))?;

    let user = users::find_by_email(&state.db, &input.email)
        .await?
        .ok_or(AppError::Unauthenticated)?;

    if users::is_locked(&user) {
        return Err(AppError::Unauthenticated);
    }

    if !password::verify(&input.password, &user.password_hash) {
        users::record_failed_login(&state.db, &user.id).await?;
        return Err(AppError::Unauthenticated);
    }

    users::record_successful_login(&state.db, &user.id).await?;

    let issued = state.tokens.issue_access_token(&user.id, &user.role)?;
    let refresh_token = tokens::create_family(&state.db, &user.id, &ip_hash, &ua_hash).await?;

    Ok(Json(TokenPairResponse {
        access_token: issued.token,
        refresh_token,
        expires_at: issued.expires_at,
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    request: Request,
) -> AppResult<Json<TokenPairResponse>> {
    let (ip_hash, ua_hash) = request_identity_hashes(&request);
    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|_| AppError::Validation("invalid request body".into()))?;
    let input: RefreshInput =
        serde_json::from_slice(&bytes).map_err(|_| AppError::Validation("invalid request body".into()))?;

    let mut redis = state.redis.clone();
    let rotated = tokens::redeem(&state.db, &mut redis, &input.refresh_token, &ip_hash, &ua_hash).await?;

    let user = users::find_by_id(&state.db, &rotated.user_id)
        .await?
        .ok_or(AppError::Unauthenticated)?;
    let issued = state.tokens.issue_access_token(&user.id, &user.role)?;

    Ok(Json(TokenPairResponse {
        access_token: issued.token,
        refresh_token: rotated.refresh_token,
        expires_at: issued.expires_at,
    }))
}

pub async fn logout(State(state): State<AppState>, request: Request) -> AppResult<axum::http::StatusCode> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthenticated)?;

    let jti = tokens::peek_header_and_jti(header)?;
    let claims = state.tokens.verify_access_token(header)?;
    let expires_at = chrono::DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(chrono::Utc::now);

    let mut redis = state.redis.clone();
    tokens::blacklist_jti(&mut redis, &jti, expires_at).await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
