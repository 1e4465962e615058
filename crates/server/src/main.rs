use oauth_identity_service::AppResources;
use oauth_identity_service::api::start_webserver;
use oauth_identity_service::config::{StorageKind, load_config_or_panic};
use oauth_identity_service::schema::create_sqlite_schema;
use oauth_identity_service::setup::Bootstrap;
use oauth_identity_service::store::Storage;
use sea_orm::Database;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "oauth_identity_service=info,sea_orm=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env is fine; the environment and config.yaml still apply.
    let _ = dotenvy::dotenv();
    initialize_tracing();

    let config = Arc::new(load_config_or_panic());

    let db = Arc::new(Database::connect(&config.database_url).await?);
    if config.auto_create_schema && config.storage == StorageKind::Sql {
        create_sqlite_schema(&db).await?;
        tracing::info!("schema ensured");
    }

    let storage = Storage::from_config(&config, db.clone());
    tracing::info!(storage = ?config.storage, "storage backend selected");

    let root_id = Bootstrap::new(&storage, &config.bootstrap, &config.system_secret)?
        .run()
        .await?;
    tracing::info!(%root_id, "root identity ready");

    start_webserver(AppResources {
        db,
        config,
        storage,
    })
    .await
}
