//! First-start seeding of the root identity and the root client.

use thiserror::Error;

use crate::config::BootstrapConfig;
use crate::error::{IdentityError, StoreError};
use crate::identity::{IdentityFilter, IdentityRepository, NewIdentity};
use crate::oauth2::client::OAuthClient;
use crate::secure;
use crate::store::Storage;

const ROOT_GRANT_TYPES: [&str; 5] = [
    "implicit",
    "refresh_token",
    "authorization_code",
    "password",
    "client_credentials",
];
const ROOT_RESPONSE_TYPES: [&str; 2] = ["code", "token"];
const ROOT_SCOPE: &str = "root offline";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("init root username can not be empty")]
    RootUsernameEmpty,
    #[error("init root password can not be empty")]
    RootPasswordEmpty,
    #[error("init client id can not be empty")]
    ClientIdEmpty,
    #[error("init client secret can not be empty")]
    ClientSecretEmpty,
    #[error("failed to create root identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("failed to create root client: {0}")]
    Store(#[from] StoreError),
    #[error("failed to hash root client secret: {0}")]
    Hash(String),
}

pub struct Bootstrap<'a> {
    storage: &'a Storage,
    config: &'a BootstrapConfig,
    identities: IdentityRepository,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        storage: &'a Storage,
        config: &'a BootstrapConfig,
        system_secret: &str,
    ) -> Result<Self, SetupError> {
        if config.root_username.trim().is_empty() {
            return Err(SetupError::RootUsernameEmpty);
        }
        if config.root_password.trim().is_empty() {
            return Err(SetupError::RootPasswordEmpty);
        }
        if config.client_id.trim().is_empty() {
            return Err(SetupError::ClientIdEmpty);
        }
        if config.client_secret.trim().is_empty() {
            return Err(SetupError::ClientSecretEmpty);
        }
        Ok(Self {
            storage,
            config,
            identities: IdentityRepository::new(storage.identities.clone(), system_secret),
        })
    }

    /// Seeds what is missing and returns the root identity id. The identity and the
    /// client are checked separately, so a half-finished earlier run is completed.
    #[tracing::instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn run(&self) -> Result<String, SetupError> {
        let root_id = self.ensure_root_identity().await?;

        match self.storage.grants.get_client(&self.config.client_id).await {
            Ok(_) => tracing::info!("root client present"),
            Err(StoreError::NotFound) => {
                let client = self.root_client(&root_id)?;
                self.storage.grants.create_client(&client).await?;
                tracing::info!("created root client");
            }
            Err(err) => return Err(err.into()),
        }

        tracing::info!(%root_id, "bootstrap complete");
        Ok(root_id)
    }

    async fn ensure_root_identity(&self) -> Result<String, SetupError> {
        let filter = IdentityFilter {
            username: Some(self.config.root_username.clone()),
            ..IdentityFilter::default()
        }
        .in_client(&self.config.client_id);
        match self.storage.identities.find(&filter).await {
            Ok(root) => {
                tracing::info!(root_id = %root.id, "root identity present");
                return Ok(root.id);
            }
            Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }

        let root = self
            .identities
            .create(
                &self.config.client_id,
                NewIdentity {
                    username: self.config.root_username.clone(),
                    password: self.config.root_password.clone(),
                    email: self.config.root_email.clone(),
                    ..NewIdentity::default()
                },
            )
            .await?
            .identity;
        tracing::info!(root_id = %root.id, "created root identity");
        Ok(root.id)
    }

    fn root_client(&self, owner: &str) -> Result<OAuthClient, SetupError> {
        let mut client = OAuthClient::new(self.config.client_id.as_str(), "root");
        client.secret_hash = secure::hash_secret(&self.config.client_secret)
            .map_err(|e| SetupError::Hash(e.to_string()))?;
        client.redirect_uris = vec![self.config.redirect_uri.clone()];
        client.grant_types = ROOT_GRANT_TYPES.iter().map(|s| s.to_string()).collect();
        client.response_types = ROOT_RESPONSE_TYPES.iter().map(|s| s.to_string()).collect();
        client.scope = ROOT_SCOPE.to_string();
        client.owner = owner.to_string();
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_db::DocumentDatabase;

    const SECRET: &str = "a-system-secret-of-at-least-32-characters";

    fn config() -> BootstrapConfig {
        BootstrapConfig {
            root_username: "admin".into(),
            root_password: "changeme".into(),
            client_id: "root".into(),
            client_secret: "root-secret".into(),
            root_email: "core@localhost".into(),
            redirect_uri: "http://localhost:3846/callback".into(),
        }
    }

    #[test]
    fn empty_fields_are_rejected() {
        let storage = Storage::document(DocumentDatabase::new(), SECRET);
        let mut cfg = config();
        cfg.client_secret = "  ".into();
        assert!(matches!(
            Bootstrap::new(&storage, &cfg, SECRET),
            Err(SetupError::ClientSecretEmpty)
        ));
        let mut cfg = config();
        cfg.root_username = String::new();
        assert!(matches!(
            Bootstrap::new(&storage, &cfg, SECRET),
            Err(SetupError::RootUsernameEmpty)
        ));
    }

    #[tokio::test]
    async fn seeds_root_client_owned_by_root_identity() {
        let storage = Storage::document(DocumentDatabase::new(), SECRET);
        let cfg = config();
        let root_id = Bootstrap::new(&storage, &cfg, SECRET)
            .unwrap()
            .run()
            .await
            .unwrap();

        let client = storage.grants.get_client("root").await.unwrap();
        assert_eq!(client.owner, root_id);
        assert_eq!(client.scope, "root offline");
        assert!(client.grant_types().has("client_credentials"));
        assert!(client.verify_secret("root-secret"));

        let root = storage.grants.authenticate("admin", "changeme").await.unwrap();
        assert_eq!(root.id, root_id);
    }

    #[tokio::test]
    async fn missing_root_client_is_created_for_existing_identity() {
        let storage = Storage::document(DocumentDatabase::new(), SECRET);
        let cfg = config();
        let existing = IdentityRepository::new(storage.identities.clone(), SECRET)
            .create(
                "root",
                NewIdentity {
                    username: "admin".into(),
                    password: "changeme".into(),
                    ..NewIdentity::default()
                },
            )
            .await
            .unwrap()
            .identity;
        assert!(matches!(
            storage.grants.get_client("root").await,
            Err(StoreError::NotFound)
        ));

        let root_id = Bootstrap::new(&storage, &cfg, SECRET)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(root_id, existing.id);

        let client = storage.grants.get_client("root").await.unwrap();
        assert_eq!(client.owner, existing.id);
        assert!(client.verify_secret("root-secret"));
    }
}
