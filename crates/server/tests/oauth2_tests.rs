//! OAuth2 engine and endpoint tests against both storage backends.

use axum::http::StatusCode;
use axum_test::TestServer;
use oauth_identity_service::{
    api,
    config::{AppConfig, BootstrapConfig, OAuth2Config, StorageKind},
    document_db::DocumentDatabase,
    error::GrantError,
    identity::{IdentityRepository, NewIdentity},
    oauth2::{
        OAuth2Engine, OAuth2State, TokenLifetimes,
        client::OAuthClient,
        requester::{FormData, TokenKind},
    },
    schema::create_sqlite_schema,
    secure,
    store::Storage,
};
use sea_orm::Database;
use serde_json::Value;
use std::sync::Arc;

const SECRET: &str = "integration-test-secret-0123456789abcdef";

async fn sql_storage() -> Storage {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    create_sqlite_schema(&db).await.expect("schema");
    Storage::sql(Arc::new(db), SECRET)
}

fn document_storage() -> Storage {
    Storage::document(DocumentDatabase::new(), SECRET)
}

fn acme_client() -> OAuthClient {
    let mut client = OAuthClient::new("acme", "Acme");
    client.secret_hash = secure::hash_secret("acme-secret").expect("hash");
    client.grant_types = vec!["password".into(), "refresh_token".into()];
    client.scope = "root offline".into();
    client
}

async fn seed(storage: &Storage) {
    storage
        .grants
        .create_client(&acme_client())
        .await
        .expect("client");
    IdentityRepository::new(storage.identities.clone(), SECRET)
        .create(
            "acme",
            NewIdentity {
                username: "u".into(),
                password: "p4ssword".into(),
                ..NewIdentity::default()
            },
        )
        .await
        .expect("identity");
}

fn password_form(scope: &str) -> FormData {
    [
        ("grant_type", "password"),
        ("username", "u"),
        ("password", "p4ssword"),
        ("scope", scope),
    ]
    .into_iter()
    .collect()
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        storage: StorageKind::Sql,
        system_secret: SECRET.into(),
        auto_create_schema: true,
        bind_address: "127.0.0.1:0".into(),
        oauth2: OAuth2Config::default(),
        bootstrap: BootstrapConfig {
            root_username: "admin".into(),
            root_password: "changeme".into(),
            client_id: "root".into(),
            client_secret: "root-secret".into(),
            root_email: "core@localhost".into(),
            redirect_uri: "http://localhost:3846/callback".into(),
        },
    }
}

#[tokio::test]
async fn password_grant_with_offline_scope_persists_refresh_token() {
    for storage in [sql_storage().await, document_storage()] {
        seed(&storage).await;
        let engine = OAuth2Engine::new(storage.grants.clone(), SECRET, TokenLifetimes::default());
        let client = engine
            .authenticate_client("acme", "acme-secret")
            .await
            .expect("client auth");

        let response = engine
            .token(client, password_form("offline"))
            .await
            .expect("token");
        assert_eq!(response.scope, "offline");
        assert_eq!(response.token_type, "bearer");

        let refresh = response.refresh_token.expect("refresh token");
        let (_, signature) = refresh.split_once('.').expect("key.signature");
        let stored = storage.grants.get_token(signature).await.expect("stored");
        assert_eq!(stored.kind, TokenKind::RefreshToken);
        assert!(stored.requester.granted_scope.has("offline"));
        assert_eq!(stored.requester.form.get("password"), None);
        assert_eq!(stored.requester.session.username, "u");
    }
}

#[tokio::test]
async fn password_grant_rejects_unlisted_scope_and_bad_credentials() {
    for storage in [sql_storage().await, document_storage()] {
        seed(&storage).await;
        let engine = OAuth2Engine::new(storage.grants.clone(), SECRET, TokenLifetimes::default());
        let client = acme_client();

        let err = engine
            .token(client.clone(), password_form("admin"))
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::InvalidScope(_)));

        let mut form = password_form("offline");
        form.remove("password");
        form.insert("password", "p4sswore");
        let err = engine.token(client, form).await.unwrap_err();
        assert!(matches!(err, GrantError::RequestUnauthorized));
        assert_eq!(err.name(), "request_unauthorized");
    }
}

#[tokio::test]
async fn refresh_token_rows_outlive_access_token_rows() {
    let storage = sql_storage().await;
    seed(&storage).await;
    let engine = OAuth2Engine::new(storage.grants.clone(), SECRET, TokenLifetimes::default());
    let response = engine
        .token(acme_client(), password_form("offline"))
        .await
        .expect("token");

    let access = storage
        .grants
        .get_token(response.access_token.split_once('.').unwrap().1)
        .await
        .unwrap();
    let refresh = storage
        .grants
        .get_token(response.refresh_token.unwrap().split_once('.').unwrap().1)
        .await
        .unwrap();
    assert_eq!(access.requester.id, refresh.requester.id);
    assert!(refresh.expires_at.unwrap() > access.expires_at.unwrap());
}

#[tokio::test]
async fn token_endpoint_over_http() {
    let storage = sql_storage().await;
    seed(&storage).await;
    let server = TestServer::new(api::app(OAuth2State::new(&storage, &test_config()))).unwrap();

    let response = server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "u"),
            ("password", "p4ssword"),
            ("scope", "offline"),
            ("client_id", "acme"),
            ("client_secret", "acme-secret"),
        ])
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    let access_token = body["access_token"].as_str().unwrap().to_string();
    assert!(body["refresh_token"].is_string());
    let expires_in = body["expires_in"].as_i64().unwrap();
    assert!((30 * 86_400 - 5..=30 * 86_400).contains(&expires_in));

    let introspection = server
        .post("/oauth2/introspect")
        .form(&[
            ("token", access_token.as_str()),
            ("client_id", "acme"),
            ("client_secret", "acme-secret"),
        ])
        .await;
    introspection.assert_status_ok();
    let body: Value = introspection.json();
    assert_eq!(body["active"], true);
    assert_eq!(body["client_id"], "acme");
    assert_eq!(body["scope"], "offline");
    assert_eq!(body["username"], "u");

    server
        .post("/oauth2/revoke")
        .form(&[
            ("token", access_token.as_str()),
            ("client_id", "acme"),
            ("client_secret", "acme-secret"),
        ])
        .await
        .assert_status_ok();

    let after = server
        .post("/oauth2/introspect")
        .form(&[
            ("token", access_token.as_str()),
            ("client_id", "acme"),
            ("client_secret", "acme-secret"),
        ])
        .await;
    assert_eq!(after.json::<Value>(), serde_json::json!({ "active": false }));
}

#[tokio::test]
async fn token_endpoint_error_shapes() {
    let storage = document_storage();
    seed(&storage).await;
    let server = TestServer::new(api::app(OAuth2State::new(&storage, &test_config()))).unwrap();

    let bad_client = server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "password"),
            ("client_id", "acme"),
            ("client_secret", "nope"),
        ])
        .await;
    bad_client.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(bad_client.json::<Value>()["error"], "invalid_client");

    let unsupported = server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("client_id", "acme"),
            ("client_secret", "acme-secret"),
        ])
        .await;
    unsupported.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(unsupported.json::<Value>()["error"], "unsupported_grant_type");

    let unknown_revoke = server
        .post("/oauth2/revoke")
        .form(&[
            ("token", "never.issued"),
            ("client_id", "acme"),
            ("client_secret", "acme-secret"),
        ])
        .await;
    unknown_revoke.assert_status_ok();
}
