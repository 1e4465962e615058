//! Opaque HMAC tokens of the form `key.signature`.
//!
//! Only the signature is ever persisted, so a leaked table cannot be replayed.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::GrantError;

type HmacSha256 = Hmac<Sha256>;

const KEY_BYTES: usize = 32;

#[derive(Clone)]
pub struct HmacTokenStrategy {
    secret: Vec<u8>,
}

impl std::fmt::Debug for HmacTokenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacTokenStrategy").finish_non_exhaustive()
    }
}

impl HmacTokenStrategy {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn sign(&self, key: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(key.as_bytes());
        mac
    }

    /// Returns `(token, signature)`.
    pub fn generate(&self) -> Result<(String, String), GrantError> {
        let mut bytes = [0u8; KEY_BYTES];
        getrandom::fill(&mut bytes).map_err(|e| GrantError::ServerError(e.to_string()))?;
        let key = URL_SAFE_NO_PAD.encode(bytes);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(&key).finalize().into_bytes());
        Ok((format!("{key}.{signature}"), signature))
    }

    /// Recomputes the signature and returns it when the token is authentic.
    pub fn validate<'a>(&self, token: &'a str) -> Result<&'a str, GrantError> {
        let malformed = || GrantError::InvalidRequest("malformed token".into());
        let (key, signature) = token.split_once('.').ok_or_else(malformed)?;
        if key.is_empty() || signature.is_empty() {
            return Err(malformed());
        }
        let raw = URL_SAFE_NO_PAD.decode(signature).map_err(|_| malformed())?;
        self.sign(key)
            .verify_slice(&raw)
            .map_err(|_| GrantError::InvalidGrant("token signature is invalid".into()))?;
        Ok(signature)
    }
}
