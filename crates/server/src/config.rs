use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Which backend holds clients, identities and grant artifacts.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// SeaORM on `database_url` (SQLite or Postgres).
    #[default]
    Sql,
    /// In-process document collections. Nothing survives a restart, so this is
    /// for tests and throwaway instances only.
    Document,
}

impl StorageKind {
    /// Whether data outlives the process.
    pub fn is_durable(&self) -> bool {
        matches!(self, StorageKind::Sql)
    }
}

/// Token lifetimes, in seconds.
#[derive(Clone, Debug, Deserialize)]
pub struct OAuth2Config {
    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime: i64,
    /// A negative value disables binding a refresh expiry to password grants.
    #[serde(default = "default_refresh_token_lifetime")]
    pub refresh_token_lifetime: i64,
    #[serde(default = "default_refreshed_access_token_lifetime")]
    pub refreshed_access_token_lifetime: i64,
    #[serde(default = "default_client_credentials_lifetime")]
    pub client_credentials_lifetime: i64,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            access_token_lifetime: default_access_token_lifetime(),
            refresh_token_lifetime: default_refresh_token_lifetime(),
            refreshed_access_token_lifetime: default_refreshed_access_token_lifetime(),
            client_credentials_lifetime: default_client_credentials_lifetime(),
        }
    }
}

const DAY: i64 = 86_400;

fn default_access_token_lifetime() -> i64 {
    30 * DAY
}

fn default_refresh_token_lifetime() -> i64 {
    60 * DAY
}

fn default_refreshed_access_token_lifetime() -> i64 {
    45 * DAY
}

fn default_client_credentials_lifetime() -> i64 {
    365 * DAY
}

/// Seed data created on first start.
#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_root_username")]
    pub root_username: String,
    pub root_password: String,
    #[serde(default = "default_root_client_id")]
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_root_email")]
    pub root_email: String,
    #[serde(default = "default_root_redirect_uri")]
    pub redirect_uri: String,
}

fn default_root_username() -> String {
    "admin".to_string()
}

fn default_root_client_id() -> String {
    "root".to_string()
}

fn default_root_email() -> String {
    "core@localhost".to_string()
}

fn default_root_redirect_uri() -> String {
    "http://localhost:3846/callback".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default)]
    pub storage: StorageKind,
    /// Key for the identity password hash and for token signatures.
    pub system_secret: String,
    /// Create tables on start instead of relying on the migration binary.
    #[serde(default)]
    pub auto_create_schema: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub oauth2: OAuth2Config,
    pub bootstrap: BootstrapConfig,
}

fn default_bind_address() -> String {
    "0.0.0.0:3846".to_string()
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system_secret.len() < 32 {
            return Err(ConfigError::Validation(
                "system_secret must be at least 32 characters".into(),
            ));
        }
        if self.oauth2.access_token_lifetime <= 0 {
            return Err(ConfigError::Validation(
                "oauth2.access_token_lifetime must be > 0".into(),
            ));
        }
        if self.bootstrap.root_password.is_empty() || self.bootstrap.client_secret.is_empty() {
            return Err(ConfigError::Validation(
                "bootstrap.root_password and bootstrap.client_secret must be set".into(),
            ));
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any variable matching the key path separated by double underscores
/// (e.g. `BOOTSTRAP__ROOT_PASSWORD`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}
