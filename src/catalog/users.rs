//! User persistence: registration, lookup, and the failed-login lockout
//! counters spec §4.2 drives off of (5 failures in a rolling window locks
//! the account for 15 minutes).

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::User;
use crate::error::{AppError, AppResult};

const LOCKOUT_THRESHOLD: i64 = 5;
const LOCKOUT_MINUTES: i64 = 15;

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, username, password_hash, role, status,
                failed_login_count, locked_until, created_at
         FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn find_by_email(pool: &SqlitePool, email: &str) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, username, password_hash, role, status,
                failed_login_count, locked_until, created_at
         FROM users WHERE email = ? COLLATE NOCASE",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Creates a new user with role `user` and status `active`. Returns
/// `AppError::Conflict` on a duplicate email or username rather than
/// surfacing the raw unique-constraint violation.
pub async fn create(pool: &SqlitePool, email: &str, username: &str, password_hash: &str) -> AppResult<User> {
    if find_by_email(pool, email).await?.is_some() {
        return Err(AppError::Conflict("email already registered".into()));
    }

    let id = Uuid::new_v4().to_string();
    let result = sqlx::query(
        "INSERT INTO users (id, email, username, password_hash, role, status)
         VALUES (?, ?, ?, ?, 'user', 'active')",
    )
    .bind(&id)
    .bind(email)
    .bind(username)
    .bind(password_hash)
    .execute(pool)
    .await;

    if let Err(sqlx::Error::Database(db_err)) = &result {
        if db_err.is_unique_violation() {
            return Err(AppError::Conflict("email or username already taken".into()));
        }
    }
    result?;

    find_by_id(pool, &id).await?.ok_or(AppError::Internal("user vanished after insert".into()))
}

/// True if the account is currently locked out of password login.
pub fn is_locked(user: &User) -> bool {
    user.locked_until.map(|until| until > Utc::now()).unwrap_or(false)
}

/// Records a failed login attempt. Once `failed_login_count` reaches the
/// threshold, locks the account for `LOCKOUT_MINUTES` and resets the
/// counter — the lock itself, not an ever-growing counter, is what blocks
/// further attempts.
pub async fn record_failed_login(pool: &SqlitePool, user_id: &str) -> AppResult<()> {
    let count = sqlx::query_scalar::<_, i64>(
        "UPDATE users SET failed_login_count = failed_login_count + 1
         WHERE id = ?
         RETURNING failed_login_count",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    if count >= LOCKOUT_THRESHOLD {
        let locked_until = Utc::now() + Duration::minutes(LOCKOUT_MINUTES);
        sqlx::query("UPDATE users SET locked_until = ?, failed_login_count = 0 WHERE id = ?")
            .bind(locked_until)
            .bind(user_id)
            .execute(pool)
            .await?;
    }

    Ok(())
}

pub async fn record_successful_login(pool: &SqlitePool, user_id: &str) -> AppResult<()> {
    sqlx::query("UPDATE users SET failed_login_count = 0, locked_until = NULL WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_locked_without_a_locked_until_timestamp() {
        let user = User {
            id: "u1".into(),
            email: "a@example.com".into(),
            username: "a".into(),
            password_hash: "x".into(),
            role: "user".into(),
            status: "active".into(),
            failed_login_count: 0,
            locked_until: None,
            created_at: Utc::now(),
        };
        assert!(!is_locked(&user));
    }

    #[test]
    fn locked_while_locked_until_is_in_the_future() {
        let mut user = User {
            id: "u1".into(),
            email: "a@example.com".into(),
            username: "a".into(),
            password_hash: "x".into(),
            role: "user".into(),
            status: "active".into(),
            failed_login_count: 0,
            locked_until: Some(Utc::now() + Duration::minutes(5)),
            created_at: Utc::now(),
        };
        assert!(is_locked(&user));
        user.locked_until = Some(Utc::now() - Duration::minutes(5));
        assert!(!is_locked(&user));
    }
}
