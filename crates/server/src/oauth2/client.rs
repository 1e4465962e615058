//! Registered OAuth2 clients.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::oauth2::arguments::Arguments;
use crate::secure;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub id: String,
    pub name: String,
    /// Argon2 PHC string; empty for public clients.
    pub secret_hash: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    /// Space-delimited scope grammar.
    pub scope: String,
    pub audience: Vec<String>,
    pub owner: String,
    pub policy_uri: String,
    pub tos_uri: String,
    pub client_uri: String,
    pub logo_uri: String,
    pub contacts: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl OAuthClient {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            name: name.into(),
            secret_hash: String::new(),
            redirect_uris: Vec::new(),
            grant_types: Vec::new(),
            response_types: Vec::new(),
            scope: String::new(),
            audience: Vec::new(),
            owner: String::new(),
            policy_uri: String::new(),
            tos_uri: String::new(),
            client_uri: String::new(),
            logo_uri: String::new(),
            contacts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Grant types, defaulting to `authorization_code`.
    pub fn grant_types(&self) -> Arguments {
        if self.grant_types.is_empty() {
            return Arguments::from_space_delimited("authorization_code");
        }
        self.grant_types.iter().cloned().collect()
    }

    pub fn scopes(&self) -> Arguments {
        Arguments::from_space_delimited(&self.scope)
    }

    pub fn is_public(&self) -> bool {
        self.secret_hash.is_empty()
    }

    pub fn verify_secret(&self, secret: &str) -> bool {
        !self.is_public() && secure::verify_secret(secret, &self.secret_hash)
    }
}

/// Resolves clients by id. Implemented by every store backend.
#[async_trait]
pub trait ClientManager: Send + Sync {
    async fn get_client(&self, id: &str) -> Result<OAuthClient, StoreError>;

    async fn create_client(&self, client: &OAuthClient) -> Result<(), StoreError>;
}
