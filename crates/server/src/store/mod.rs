//! Persistence of clients, identities and grant artifacts.
//!
//! Two interchangeable backends implement the same traits:
//! - [`sql::SqlStore`] on top of SeaORM (SQLite or Postgres)
//! - [`document::DocumentStore`] on top of the in-process [`DocumentDatabase`]
//!
//! Both flatten requester sets with their own delimiter, see [`codec`].

pub mod codec;
pub mod document;
pub mod sql;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::config::{AppConfig, StorageKind};
use crate::document_db::DocumentDatabase;
use crate::error::StoreError;
use crate::identity::{Identity, IdentityStorage};
use crate::oauth2::client::ClientManager;
use crate::oauth2::requester::{Requester, TokenKind};

pub use document::DocumentStore;
pub use sql::SqlStore;

/// A token row as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredToken {
    pub signature: String,
    pub kind: TokenKind,
    pub expires_at: Option<OffsetDateTime>,
    pub requester: Requester,
}

impl StoredToken {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Storage of authorization codes and tokens, consumed by the protocol engine.
///
/// Deletes are idempotent: removing something already gone is not an error.
#[async_trait]
pub trait GrantStore: ClientManager {
    async fn create_authorization_code(
        &self,
        code: &str,
        requester: &Requester,
    ) -> Result<(), StoreError>;

    /// Fails with [`StoreError::InvalidatedCode`] for a code that was already used.
    async fn get_authorization_code(&self, code: &str) -> Result<Requester, StoreError>;

    async fn invalidate_authorization_code(&self, code: &str) -> Result<(), StoreError>;

    async fn delete_authorization_code(&self, code: &str) -> Result<(), StoreError>;

    /// Persists a token under its signature. The row expiry is the one the session
    /// holds for `kind`.
    async fn create_token(
        &self,
        kind: TokenKind,
        signature: &str,
        requester: &Requester,
    ) -> Result<(), StoreError>;

    async fn get_token(&self, signature: &str) -> Result<StoredToken, StoreError>;

    async fn delete_token(&self, signature: &str) -> Result<(), StoreError>;

    /// Deletes every token issued from `request_id`. Returns how many went.
    async fn revoke_by_request_id(&self, request_id: &str) -> Result<u64, StoreError>;

    /// Verifies a username/password pair. Every mismatch is [`StoreError::NotFound`].
    async fn authenticate(&self, username: &str, secret: &str) -> Result<Identity, StoreError>;
}

/// The configured backend, viewed through both of its roles.
#[derive(Clone)]
pub struct Storage {
    pub grants: Arc<dyn GrantStore>,
    pub identities: Arc<dyn IdentityStorage>,
}

impl Storage {
    pub fn sql(db: Arc<DatabaseConnection>, system_secret: &str) -> Self {
        let store = Arc::new(SqlStore::new(db, system_secret));
        Self {
            grants: store.clone(),
            identities: store,
        }
    }

    pub fn document(db: DocumentDatabase, system_secret: &str) -> Self {
        let store = Arc::new(DocumentStore::new(db, system_secret));
        Self {
            grants: store.clone(),
            identities: store,
        }
    }

    pub fn from_config(config: &AppConfig, db: Arc<DatabaseConnection>) -> Self {
        match config.storage {
            StorageKind::Sql => Self::sql(db, &config.system_secret),
            StorageKind::Document => {
                tracing::warn!(
                    "storage: document keeps every client, identity and token in memory; \
                     all data is lost when the process exits"
                );
                Self::document(DocumentDatabase::new(), &config.system_secret)
            }
        }
    }
}
