//! Hashing and randomness helpers.
//!
//! Identity passwords use a salted HMAC-SHA256 keyed by the system secret so they
//! can be re-derived on every login. Client secrets use Argon2id.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const OTP_MIN: u32 = 100_000;
pub const OTP_MAX: u32 = 999_999;

/// Base64 encoded HMAC-SHA256 of `password ‖ salt` keyed by `secret`.
pub fn compute_hmac256(password: &str, salt: &str, secret: &str) -> String {
    let mut mac = keyed(secret);
    mac.update(password.as_bytes());
    mac.update(salt.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of `password` against a hash produced by [`compute_hmac256`].
pub fn verify_hmac256(password: &str, salt: &str, secret: &str, expected: &str) -> bool {
    let Ok(expected) = STANDARD.decode(expected) else {
        return false;
    };
    let mut mac = keyed(secret);
    mac.update(password.as_bytes());
    mac.update(salt.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn keyed(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

/// Fresh hex salt, derived from 32 random bytes.
pub fn generate_salt() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)?;
    let digest = Sha256::digest(bytes);
    Ok(digest[12..].iter().map(|b| format!("{b:02x}")).collect())
}

/// Six digit one-time code.
pub fn generate_otp() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 4];
    getrandom::fill(&mut bytes)?;
    let n = u32::from_le_bytes(bytes) % (OTP_MAX - OTP_MIN + 1);
    Ok((OTP_MIN + n).to_string())
}

/// Hash a client secret using Argon2id.
///
/// Returns the PHC-formatted hash string suitable for storage.
pub fn hash_secret(secret: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(secret.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_secret(secret: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed_hash)
        .is_ok()
}
