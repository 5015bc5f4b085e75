//! Password hashing via Argon2id with per-password random salts.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;

use crate::error::{AppError, AppResult};

pub fn hash(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("password hash failed: {e}")))
}

/// Returns `true` if `password` matches `encoded`. A malformed hash in
/// storage is treated as a non-match rather than propagated as an error —
/// a corrupt row should deny login, not 500.
pub fn verify(password: &str, encoded: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(encoded) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let encoded = hash("correct horse battery staple").unwrap();
        assert!(verify("correct horse battery staple", &encoded));
        assert!(!verify("wrong password", &encoded));
    }

    #[test]
    fn two_hashes_of_the_same_password_differ() {
        let a = hash("swordfish").unwrap();
        let b = hash("swordfish").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_hash_fails_closed() {
        assert!(!verify("anything", "not-a-real-hash"));
    }
}
