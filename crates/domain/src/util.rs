use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::error::DomainError;

const SALT_LENGTH: usize = 32;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn backoff_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(pow);
    delay.min(max_ms)
}

/// Version-5 UUID (OID namespace) used as the externally visible id of
/// accounts, account users and applications.
pub fn public_id(seed: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn digest_password(password: &str, salt: &str, timestamp: &str) -> String {
    let first = sha256_hex(&format!("{password}{salt}"));
    let second = sha256_hex(&format!("{first}{timestamp}"));
    STANDARD.encode(sha256_hex(&format!("{second}passwd")))
}

/// Salts and hashes a password into the stored
/// `base64(base64(salt):base64(timestamp):digest)` form.
pub fn hash_password(password: &str) -> String {
    let mut raw_salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut raw_salt);
    let salt = STANDARD.encode(raw_salt);
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
    let digest = digest_password(password, &salt, &timestamp);
    STANDARD.encode(format!(
        "{}:{}:{digest}",
        STANDARD.encode(&salt),
        STANDARD.encode(&timestamp)
    ))
}

pub fn verify_password(password: &str, stored: &str) -> Result<bool, DomainError> {
    let decoded = STANDARD
        .decode(stored)
        .map_err(|err| DomainError::Corrupt(format!("password hash: {err}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|err| DomainError::Corrupt(format!("password hash: {err}")))?;
    let mut parts = decoded.splitn(3, ':');
    let (Some(salt), Some(timestamp), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(DomainError::Corrupt("password hash has too few parts".into()));
    };
    let salt = decode_text(salt)?;
    let timestamp = decode_text(timestamp)?;
    Ok(digest_password(password, &salt, &timestamp) == digest)
}

fn decode_text(value: &str) -> Result<String, DomainError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|err| DomainError::Corrupt(format!("password hash: {err}")))?;
    String::from_utf8(bytes).map_err(|err| DomainError::Corrupt(format!("password hash: {err}")))
}

/// Resolves the password to store after an update.
///
/// An empty candidate keeps the stored hash, as does a candidate equal to the
/// stored hash or one that verifies against it. Anything else is re-hashed.
pub fn resolve_password(candidate: &str, stored: &str) -> String {
    if candidate.is_empty() || candidate == stored {
        return stored.to_string();
    }
    if !stored.is_empty() && matches!(verify_password(candidate, stored), Ok(true)) {
        return stored.to_string();
    }
    hash_password(candidate)
}
