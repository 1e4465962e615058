//! Table definitions for SQLite, used for local development and tests.
//! Production databases are managed by the `migration` crate.

use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement};

const SQLITE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS oauth_clients (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        secret TEXT NOT NULL DEFAULT '',
        redirect_uris TEXT NOT NULL DEFAULT '',
        grant_types TEXT NOT NULL DEFAULT '',
        response_types TEXT NOT NULL DEFAULT '',
        scope TEXT NOT NULL DEFAULT '',
        audience TEXT NOT NULL DEFAULT '',
        owner TEXT NOT NULL DEFAULT '',
        policy_uri TEXT NOT NULL DEFAULT '',
        tos_uri TEXT NOT NULL DEFAULT '',
        client_uri TEXT NOT NULL DEFAULT '',
        logo_uri TEXT NOT NULL DEFAULT '',
        contacts TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE IF NOT EXISTS oauth_users (
        id TEXT PRIMARY KEY,
        username TEXT NULL,
        password TEXT NOT NULL DEFAULT '',
        salt TEXT NOT NULL DEFAULT '',
        email TEXT NULL,
        phone_prefix TEXT NULL,
        phone TEXT NULL,
        account_type TEXT NOT NULL,
        fb_id TEXT NULL UNIQUE,
        account_kit_id TEXT NULL UNIQUE,
        apple_id TEXT NULL UNIQUE,
        client_id TEXT NOT NULL,
        otp_code TEXT NULL,
        otp_code_expired_at TEXT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(client_id, username)
    );"#,
    r#"CREATE INDEX IF NOT EXISTS idx_oauth_users_email ON oauth_users (email);"#,
    r#"CREATE TABLE IF NOT EXISTS oauth_authorize_codes (
        signature TEXT PRIMARY KEY,
        request_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        requester TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE IF NOT EXISTS oauth_access_tokens (
        signature TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        request_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        token_type TEXT NOT NULL,
        expired_at TEXT NULL,
        requester TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE INDEX IF NOT EXISTS idx_oauth_access_tokens_request_id ON oauth_access_tokens (request_id);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_oauth_access_tokens_owner ON oauth_access_tokens (owner);"#,
];

/// Creates every table on a SQLite connection. Safe to run repeatedly.
pub async fn create_sqlite_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    for sql in SQLITE_SCHEMA {
        db.execute(Statement::from_string(DbBackend::Sqlite, *sql))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Database;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        create_sqlite_schema(&db).await.expect("first run");
        create_sqlite_schema(&db).await.expect("second run");
    }
}
