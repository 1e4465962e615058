//! OAuth2 token issuance and identity management service.
//!
//! Grant artifacts and identities live behind storage traits with a relational
//! (SeaORM) and a document backend. Identities are reconciled across social
//! providers and direct username/password sign-ups.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::store::Storage;

pub mod api;
pub mod clock;
pub mod config;
pub mod document_db;
pub mod entity;
pub mod error;
pub mod identity;
pub mod oauth2;
pub mod schema;
pub mod secure;
pub mod setup;
pub mod store;

#[derive(Clone)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub storage: Storage,
}
