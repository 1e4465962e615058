use oauth_identity_service::{
    config::BootstrapConfig,
    identity::IdentityFilter,
    schema::create_sqlite_schema,
    setup::Bootstrap,
    store::Storage,
};
use sea_orm::Database;
use std::sync::Arc;

const SECRET: &str = "setup-test-secret-0123456789abcdefghij";

fn bootstrap_config() -> BootstrapConfig {
    BootstrapConfig {
        root_username: "admin".into(),
        root_password: "changeme".into(),
        client_id: "root".into(),
        client_secret: "root-secret".into(),
        root_email: "core@localhost".into(),
        redirect_uri: "http://localhost:3846/callback".into(),
    }
}

#[tokio::test]
async fn second_run_reuses_the_root_identity() {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    create_sqlite_schema(&db).await.expect("schema");
    let storage = Storage::sql(Arc::new(db), SECRET);
    let config = bootstrap_config();

    let first = Bootstrap::new(&storage, &config, SECRET)
        .unwrap()
        .run()
        .await
        .expect("first run");
    let second = Bootstrap::new(&storage, &config, SECRET)
        .unwrap()
        .run()
        .await
        .expect("second run");
    assert_eq!(first, second);

    let root = storage
        .identities
        .find(&IdentityFilter::by_id(&first).in_client("root"))
        .await
        .expect("root identity");
    assert_eq!(root.username.as_deref(), Some("admin"));
    assert_eq!(root.email.as_deref(), Some("core@localhost"));

    let client = storage.grants.get_client("root").await.expect("root client");
    assert_eq!(client.owner, first);
    assert_eq!(client.redirect_uris, vec!["http://localhost:3846/callback"]);
    assert!(client.response_types.iter().any(|t| t == "token"));
}

#[tokio::test]
async fn changed_root_password_is_not_applied_on_restart() {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    create_sqlite_schema(&db).await.expect("schema");
    let storage = Storage::sql(Arc::new(db), SECRET);

    let config = bootstrap_config();
    Bootstrap::new(&storage, &config, SECRET)
        .unwrap()
        .run()
        .await
        .unwrap();

    let mut changed = bootstrap_config();
    changed.root_password = "different".into();
    Bootstrap::new(&storage, &changed, SECRET)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(storage.grants.authenticate("admin", "changeme").await.is_ok());
    assert!(storage.grants.authenticate("admin", "different").await.is_err());
}
