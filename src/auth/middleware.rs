//! Authorization layer (C8): the fixed order of checks from spec §4.8.
//!
//! `require_auth` performs steps 1–5 (bearer extraction, algorithm pin,
//! blacklist, signature/claims verification, principal population) as axum
//! middleware and inserts a `Principal` into request extensions. Steps 6–7
//! (role gate, ownership gate) are exposed as plain functions rather than
//! generic middleware, because the ownership check needs a resource id that
//! only the handler's path extractor has — see `authorize_owner_or_role`.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};

use crate::auth::ratelimit::{self, Tier, GLOBAL_PER_IP, PER_USER};
use crate::auth::tokens::{self, Principal};
use crate::db::models::Role;
use crate::error::{AppError, AppResult};
use crate::AppState;

fn extract_bearer(request: &Request) -> Option<String> {
    let header = request.headers().get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::to_string)
}

/// The client IP used as the rate limiter's per-IP key. Reads
/// `X-Forwarded-For`'s first hop when present (reverse-proxy deployments),
/// falling back to the socket's peer address.
pub fn extract_client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Runs a single rate-limit tier and maps a denial to `AppError::RateLimited`
/// carrying the `Retry-After` the client should honor (spec §4.7).
async fn enforce_tier(state: &AppState, tier: &Tier, key: &str) -> Result<(), AppError> {
    let mut redis = state.redis.clone();
    let decision = ratelimit::check(&mut redis, tier, key).await;
    if decision.allowed {
        Ok(())
    } else {
        Err(AppError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_secs: decision.reset_secs,
        })
    }
}

/// Global per-IP tier (spec §4.7: "100 req/min"). Applied ahead of every
/// other check, including authentication, so it protects endpoints that
/// reject unauthenticated traffic too.
pub async fn rate_limit_global_ip(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = extract_client_ip(&request);
    enforce_tier(&state, &GLOBAL_PER_IP, &ip).await?;
    Ok(next.run(request).await)
}

/// Per-authenticated-user tier (spec §4.7: "300 req/min"). Must run after a
/// principal-populating layer (`require_auth` or `try_auth`). Spec §4.7
/// enforces this tier for every request generally, including the
/// anonymous-allowed read routes — but it only applies to *authenticated*
/// traffic, so a request with no principal (anonymous read) passes through
/// untouched rather than being rejected as unauthenticated.
pub async fn rate_limit_per_user(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user_id = request.extensions().get::<Principal>().map(|p| p.user_id.clone());
    if let Some(user_id) = user_id {
        enforce_tier(&state, &PER_USER, &user_id).await?;
    }
    Ok(next.run(request).await)
}

/// Steps 1–5 of spec §4.8, shared by `require_auth` (fatal on any failure)
/// and `try_auth` (falls back to anonymous on any failure).
async fn authenticate(state: &AppState, token: &str) -> AppResult<Principal> {
    let jti = tokens::peek_header_and_jti(token)?;
    let mut redis = state.redis.clone();
    if tokens::is_blacklisted(&mut redis, &jti).await {
        return Err(AppError::Unauthenticated);
    }

    let claims = state.tokens.verify_access_token(token)?;
    Ok(Principal {
        user_id: claims.sub,
        role: claims.role,
    })
}

/// Steps 1–5 of spec §4.8. Inserts `Principal` into request extensions on
/// success; handlers retrieve it via `Extension<Principal>`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer(&request).ok_or(AppError::Unauthenticated)?;
    let principal = authenticate(&state, &token).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Like `require_auth` but never rejects the request — a missing or invalid
/// bearer token simply leaves no `Principal` in the request extensions.
/// Used on read endpoints where anonymous callers may still see `public`
/// resources (spec §4.12) but an authenticated caller's ownership/role
/// should be taken into account when present.
pub async fn try_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if let Some(token) = extract_bearer(&request) {
        if let Ok(principal) = authenticate(&state, &token).await {
            request.extensions_mut().insert(principal);
        }
    }
    next.run(request).await
}

/// Step 6: role gate. Compose after `require_auth` as a second middleware
/// layer on routes that need it.
pub async fn require_role(
    required: &'static [Role],
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = request
        .extensions()
        .get::<Principal>()
        .ok_or(AppError::Unauthenticated)?;

    let role = Role::parse(&principal.role).ok_or(AppError::Forbidden)?;
    if !required.contains(&role) {
        return Err(AppError::Forbidden);
    }

    Ok(next.run(request).await)
}

/// Step 7, called inline by handlers once they've already loaded the
/// resource (so a missing resource yields `not_found`, never `forbidden` —
/// spec §4.8: "existence is confirmed before ownership check to prevent
/// enumeration via differential error codes").
///
/// `moderator_bypass` is endpoint-configurable per spec; admin always
/// bypasses regardless of its value.
pub fn authorize_owner_or_role(principal: &Principal, owner_id: &str, moderator_bypass: bool) -> Result<(), AppError> {
    if principal.user_id == owner_id {
        return Ok(());
    }
    match Role::parse(&principal.role) {
        Some(Role::Admin) => Ok(()),
        Some(Role::Moderator) if moderator_bypass => Ok(()),
        _ => Err(AppError::Forbidden),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(user_id: &str, role: &str) -> Principal {
        Principal {
            user_id: user_id.to_string(),
            role: role.to_string(),
        }
    }

    #[test]
    fn owner_is_always_authorized() {
        let p = principal("u1", "user");
        assert!(authorize_owner_or_role(&p, "u1", false).is_ok());
    }

    #[test]
    fn non_owner_non_privileged_is_forbidden() {
        let p = principal("u1", "user");
        assert!(authorize_owner_or_role(&p, "u2", false).is_err());
    }

    #[test]
    fn admin_always_bypasses() {
        let p = principal("u1", "admin");
        assert!(authorize_owner_or_role(&p, "u2", false).is_ok());
    }

    #[test]
    fn moderator_bypass_is_endpoint_configurable() {
        let p = principal("u1", "moderator");
        assert!(authorize_owner_or_role(&p, "u2", false).is_err());
        assert!(authorize_owner_or_role(&p, "u2", true).is_ok());
    }
}
