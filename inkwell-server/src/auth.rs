//! The auth boundary: password hashing, Basic-auth parsing, and
//! constant-time verification for snapshot fetch, WebSocket upgrade, and
//! password change.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as base64engine;
use base64::Engine;

/// Hash `password` with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Verify `password` against a previously hashed value. Comparison work
/// happens inside argon2's own verifier, which does not leak timing
/// information about where in the hash bytes diverge.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// Decode an `Authorization: Basic <base64>` header value into
/// `(username, password)`. Returns `None` if the header is missing the
/// `Basic ` prefix, isn't valid base64, isn't valid UTF-8, or has no `:`.
pub fn parse_basic_auth(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64engine.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn parses_basic_header() {
        let encoded = base64engine.encode("team/notes:hunter2");
        let header = format!("Basic {encoded}");
        let (user, pass) = parse_basic_auth(&header).unwrap();
        assert_eq!(user, "team/notes");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(parse_basic_auth("Bearer abc").is_none());
        assert!(parse_basic_auth("Basic not-base64!!").is_none());
    }
}
