//! Token service (C6): RS256 access tokens and rotating refresh-token
//! families.
//!
//! Access tokens are verified with a pinned algorithm list of exactly one
//! entry — `jsonwebtoken`'s `Validation` rejects any token whose header
//! declares a different algorithm, including `none`, before a signature
//! check is even attempted. The authorization layer (C8) needs the token's
//! `jti` *before* paying for that signature check, so this module also
//! exposes a signature-blind header/claims peek used only to read `alg` and
//! `jti` for the blacklist short-circuit.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::RefreshTokenRecord;
use crate::error::{AppError, AppResult};
use crate::services::audit;

const ACCESS_TOKEN_TTL: Duration = Duration::minutes(15);
const REFRESH_TOKEN_TTL: Duration = Duration::days(7);
const REFRESH_TOKEN_RAW_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub jti: String,
    pub iss: String,
    pub exp: i64,
    pub iat: i64,
    pub typ: String,
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: String,
}

pub struct IssuedAccessToken {
    pub token: String,
    pub jti: String,
    pub expires_at: chrono::DateTime<Utc>,
}

pub struct RotatedRefresh {
    pub user_id: String,
    pub refresh_token: String,
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_keys: Vec<DecodingKey>,
    issuer: String,
}

impl TokenService {
    pub fn new(private_key_pem: &[u8], public_key_pems: &[Vec<u8>], issuer: String) -> AppResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| AppError::Internal(format!("invalid JWT private key: {e}")))?;

        let decoding_keys = public_key_pems
            .iter()
            .map(|pem| {
                DecodingKey::from_rsa_pem(pem)
                    .map_err(|e| AppError::Internal(format!("invalid JWT public key: {e}")))
            })
            .collect::<AppResult<Vec<_>>>()?;

        if decoding_keys.is_empty() {
            return Err(AppError::Internal("no JWT public keys configured".into()));
        }

        Ok(TokenService {
            encoding_key,
            decoding_keys,
            issuer,
        })
    }

    pub fn issue_access_token(&self, user_id: &str, role: &str) -> AppResult<IssuedAccessToken> {
        let now = Utc::now();
        let expires_at = now + ACCESS_TOKEN_TTL;
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            jti: jti.clone(),
            iss: self.issuer.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            typ: "access".to_string(),
        };

        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("token signing failed: {e}")))?;

        Ok(IssuedAccessToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Verifies signature and standard claims, trying each configured
    /// decoding key in turn — supports zero-downtime key rotation, where the
    /// newest key signs but older keys still verify tokens issued before the
    /// rotation.
    pub fn verify_access_token(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_exp = true;

        for key in &self.decoding_keys {
            if let Ok(data) = decode::<Claims>(token, key, &validation) {
                if data.claims.typ != "access" {
                    return Err(AppError::Unauthenticated);
                }
                return Ok(data.claims);
            }
        }
        Err(AppError::Unauthenticated)
    }
}

/// Reads the JWT header's declared algorithm and the claims' `jti` without
/// verifying the signature — used solely to perform the blacklist check the
/// authorization layer must do *before* paying for a full RS256 verify
/// (spec §4.8 steps 2–3). Any malformed input or a declared algorithm other
/// than RS256 is rejected here, before a blacklist lookup is even issued.
pub fn peek_header_and_jti(token: &str) -> AppResult<String> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(AppError::Unauthenticated)?;
    let payload_b64 = parts.next().ok_or(AppError::Unauthenticated)?;

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| AppError::Unauthenticated)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| AppError::Unauthenticated)?;
    let alg = header.get("alg").and_then(|v| v.as_str()).unwrap_or("");
    if alg != "RS256" {
        return Err(AppError::Unauthenticated);
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AppError::Unauthenticated)?;
    let payload: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| AppError::Unauthenticated)?;
    payload
        .get("jti")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or(AppError::Unauthenticated)
}

fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_raw_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_RAW_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Creates the root refresh token of a new family at login. Returns the raw
/// (unhashed) token to send to the client.
pub async fn create_family(
    pool: &SqlitePool,
    user_id: &str,
    ip_hash: &str,
    user_agent_hash: &str,
) -> AppResult<String> {
    let raw = generate_raw_refresh_token();
    let token_hash = hash_token(&raw);
    let id = Uuid::new_v4().to_string();
    let family_id = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + REFRESH_TOKEN_TTL;

    sqlx::query(
        "INSERT INTO refresh_tokens
            (id, family_id, parent_id, user_id, token_hash, expires_at, ip_hash, user_agent_hash)
         VALUES (?, ?, NULL, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&family_id)
    .bind(user_id)
    .bind(&token_hash)
    .bind(expires_at)
    .bind(ip_hash)
    .bind(user_agent_hash)
    .execute(pool)
    .await?;

    Ok(raw)
}

async fn find_by_hash(pool: &SqlitePool, token_hash: &str) -> AppResult<Option<RefreshTokenRecord>> {
    let record = sqlx::query_as::<_, RefreshTokenRecord>(
        "SELECT id, family_id, parent_id, user_id, token_hash, issued_at, expires_at,
                used_at, revoked_at, ip_hash, user_agent_hash
         FROM refresh_tokens WHERE token_hash = ?",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// True once this family has been revoked. Revocation is a single sentinel
/// key in the key-value store (`refresh:family:{family_id}`) rather than a
/// row scan across the family's tree, per spec §9's explicit guidance to
/// avoid walking the tree on every refresh.
pub async fn is_family_revoked(redis: &mut ConnectionManager, family_id: &str) -> bool {
    redis
        .exists::<_, bool>(format!("refresh:family:{family_id}"))
        .await
        .unwrap_or(false)
}

async fn revoke_family(redis: &mut ConnectionManager, family_id: &str) {
    let ttl_secs = REFRESH_TOKEN_TTL.num_seconds() as u64;
    if let Err(e) = redis
        .set_ex::<_, _, ()>(format!("refresh:family:{family_id}"), "1", ttl_secs)
        .await
    {
        tracing::error!(family_id, "failed to write family revocation sentinel: {e}");
    }
}

/// Redeems a presented refresh token: validates it, detects replay, and
/// rotates it into a child token in the same family. Returns the owning
/// user id so the caller can look up their current role and issue a fresh
/// access token — role is deliberately not cached on the refresh record,
/// since a role change should take effect on the next refresh. Spec §4.6 /
/// P4 / S6.
pub async fn redeem(
    pool: &SqlitePool,
    redis: &mut ConnectionManager,
    presented_raw: &str,
    ip_hash: &str,
    user_agent_hash: &str,
) -> AppResult<RotatedRefresh> {
    let presented_hash = hash_token(presented_raw);
    let record = find_by_hash(pool, &presented_hash)
        .await?
        .ok_or(AppError::Unauthenticated)?;

    if record.expires_at < Utc::now() || record.revoked_at.is_some() {
        return Err(AppError::Unauthenticated);
    }

    if is_family_revoked(redis, &record.family_id).await {
        return Err(AppError::Unauthenticated);
    }

    if record.used_at.is_some() {
        // A second redemption of an already-used token is a replay: the
        // entire family is compromised, not just this one token.
        tracing::error!(family_id = %record.family_id, "refresh token replay detected, revoking family");
        revoke_family(redis, &record.family_id).await;
        sqlx::query("UPDATE refresh_tokens SET revoked_at = ? WHERE family_id = ?")
            .bind(Utc::now())
            .bind(&record.family_id)
            .execute(pool)
            .await?;
        audit::log_action(
            pool,
            &record.user_id,
            "revoke",
            "refresh_token_family",
            &record.family_id,
            &serde_json::json!({ "reason": "replay_detected" }),
        )
        .await;
        return Err(AppError::Unauthenticated);
    }

    if record.ip_hash != ip_hash || record.user_agent_hash != user_agent_hash {
        tracing::warn!(
            family_id = %record.family_id,
            "refresh token redeemed from a different ip/user-agent than it was issued to"
        );
    }

    sqlx::query("UPDATE refresh_tokens SET used_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(&record.id)
        .execute(pool)
        .await?;

    let new_raw = generate_raw_refresh_token();
    let new_hash = hash_token(&new_raw);
    let new_id = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + REFRESH_TOKEN_TTL;

    sqlx::query(
        "INSERT INTO refresh_tokens
            (id, family_id, parent_id, user_id, token_hash, expires_at, ip_hash, user_agent_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&new_id)
    .bind(&record.family_id)
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(&new_hash)
    .bind(expires_at)
    .bind(ip_hash)
    .bind(user_agent_hash)
    .execute(pool)
    .await?;

    Ok(RotatedRefresh {
        user_id: record.user_id,
        refresh_token: new_raw,
    })
}

/// Inserts the access token's jti into the blacklist with a TTL equal to
/// its remaining lifetime — once the token would have expired naturally,
/// there's no reason to keep denying it by jti.
pub async fn blacklist_jti(redis: &mut ConnectionManager, jti: &str, expires_at: chrono::DateTime<Utc>) {
    let ttl_secs = (expires_at - Utc::now()).num_seconds().max(1) as u64;
    if let Err(e) = redis
        .set_ex::<_, _, ()>(format!("blacklist:{jti}"), "1", ttl_secs)
        .await
    {
        tracing::error!(jti, "failed to write blacklist entry: {e}");
    }
}

pub async fn is_blacklisted(redis: &mut ConnectionManager, jti: &str) -> bool {
    redis
        .exists::<_, bool>(format!("blacklist:{jti}"))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> (Vec<u8>, Vec<u8>) {
        (
            include_bytes!("../../tests/fixtures/test_rsa_private.pem").to_vec(),
            include_bytes!("../../tests/fixtures/test_rsa_public.pem").to_vec(),
        )
    }

    fn other_public_key() -> Vec<u8> {
        include_bytes!("../../tests/fixtures/test_rsa_public_other.pem").to_vec()
    }

    #[test]
    fn issues_and_verifies_a_round_trip_token() {
        let (private, public) = test_keys();
        let service = TokenService::new(&private, &[public], "imgvault".to_string()).unwrap();

        let issued = service.issue_access_token("user-1", "user").unwrap();
        let claims = service.verify_access_token(&issued.token).unwrap();

        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.typ, "access");
    }

    #[test]
    fn rejects_a_token_signed_with_an_unrelated_key() {
        let (private, public) = test_keys();
        let signer = TokenService::new(&private, &[public], "imgvault".to_string()).unwrap();
        let issued = signer.issue_access_token("user-1", "user").unwrap();

        // A verifier trusting only a different keypair's public key must
        // reject a token this signer produced.
        let verifier =
            TokenService::new(&private, &[other_public_key()], "imgvault".to_string()).unwrap();
        assert!(verifier.verify_access_token(&issued.token).is_err());
    }

    #[test]
    fn key_rotation_accepts_tokens_signed_by_either_configured_key() {
        let (private, public) = test_keys();
        let signer = TokenService::new(&private, &[public.clone()], "imgvault".to_string()).unwrap();
        let issued = signer.issue_access_token("user-1", "user").unwrap();

        let verifier =
            TokenService::new(&private, &[other_public_key(), public], "imgvault".to_string()).unwrap();
        assert!(verifier.verify_access_token(&issued.token).is_ok());
    }

    #[test]
    fn peek_rejects_non_rs256_algorithms() {
        // Header declaring HS256 instead of RS256.
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"jti":"abc"}"#);
        let token = format!("{header}.{payload}.sig");
        assert!(peek_header_and_jti(&token).is_err());
    }

    #[test]
    fn peek_extracts_jti_from_an_rs256_header() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"jti":"abc-123"}"#);
        let token = format!("{header}.{payload}.sig");
        assert_eq!(peek_header_and_jti(&token).unwrap(), "abc-123");
    }
}
