//! Audit log (spec SPEC_FULL §4.14) — records every state-changing catalog
//! operation: upload accepted, scan result, transcode result, visibility
//! change, delete, role change, token family revocation.
//!
//! Best-effort: a failed audit write is logged but never rolls back the
//! operation that triggered it, matching the teacher's `services::audit`
//! policy.

use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn log_action(
    pool: &SqlitePool,
    user_id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    details: &serde_json::Value,
) {
    let result = sqlx::query(
        "INSERT INTO audit_log (id, user_id, action, entity_type, entity_id, details)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(details.to_string())
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::error!(user_id, action, entity_type, entity_id, "failed to write audit log entry: {e}");
    }
}
