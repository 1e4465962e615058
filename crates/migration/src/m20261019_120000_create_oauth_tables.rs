//! Creates the four record kinds of the service:
//! - oauth_clients: registered OAuth2 clients
//! - oauth_users: identities
//! - oauth_authorize_codes: authorization codes, keyed by signature
//! - oauth_access_tokens: access and refresh tokens, keyed by signature

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

fn text(col: impl IntoIden) -> ColumnDef {
    ColumnDef::new(col).text().not_null().default("").to_owned()
}

fn nullable(col: impl IntoIden) -> ColumnDef {
    ColumnDef::new(col).string().null().to_owned()
}

fn timestamp(col: impl IntoIden) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp_with_time_zone()
        .not_null()
        .to_owned()
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuthClients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthClients::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuthClients::Name).string().not_null())
                    .col(text(OAuthClients::Secret))
                    .col(text(OAuthClients::RedirectUris))
                    .col(text(OAuthClients::GrantTypes))
                    .col(text(OAuthClients::ResponseTypes))
                    .col(text(OAuthClients::Scope))
                    .col(text(OAuthClients::Audience))
                    .col(text(OAuthClients::Owner))
                    .col(text(OAuthClients::PolicyUri))
                    .col(text(OAuthClients::TosUri))
                    .col(text(OAuthClients::ClientUri))
                    .col(text(OAuthClients::LogoUri))
                    .col(text(OAuthClients::Contacts))
                    .col(timestamp(OAuthClients::CreatedAt))
                    .col(timestamp(OAuthClients::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OAuthUsers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthUsers::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(nullable(OAuthUsers::Username))
                    .col(text(OAuthUsers::Password))
                    .col(text(OAuthUsers::Salt))
                    .col(nullable(OAuthUsers::Email))
                    .col(nullable(OAuthUsers::PhonePrefix))
                    .col(nullable(OAuthUsers::Phone))
                    .col(ColumnDef::new(OAuthUsers::AccountType).string().not_null())
                    .col(nullable(OAuthUsers::FbId).unique_key().to_owned())
                    .col(nullable(OAuthUsers::AccountKitId).unique_key().to_owned())
                    .col(nullable(OAuthUsers::AppleId).unique_key().to_owned())
                    .col(ColumnDef::new(OAuthUsers::ClientId).string().not_null())
                    .col(nullable(OAuthUsers::OtpCode))
                    .col(
                        ColumnDef::new(OAuthUsers::OtpCodeExpiredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(timestamp(OAuthUsers::CreatedAt))
                    .col(timestamp(OAuthUsers::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_users_client_username")
                    .table(OAuthUsers::Table)
                    .col(OAuthUsers::ClientId)
                    .col(OAuthUsers::Username)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_users_email")
                    .table(OAuthUsers::Table)
                    .col(OAuthUsers::Email)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OAuthAuthorizeCodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthAuthorizeCodes::Signature)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OAuthAuthorizeCodes::RequestId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthAuthorizeCodes::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthAuthorizeCodes::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(OAuthAuthorizeCodes::Requester)
                            .text()
                            .not_null(),
                    )
                    .col(timestamp(OAuthAuthorizeCodes::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OAuthAccessTokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthAccessTokens::Signature)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuthAccessTokens::Owner).string().not_null())
                    .col(
                        ColumnDef::new(OAuthAccessTokens::RequestId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthAccessTokens::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthAccessTokens::TokenType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthAccessTokens::ExpiredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OAuthAccessTokens::Requester)
                            .text()
                            .not_null(),
                    )
                    .col(timestamp(OAuthAccessTokens::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_access_tokens_request_id")
                    .table(OAuthAccessTokens::Table)
                    .col(OAuthAccessTokens::RequestId)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_access_tokens_owner")
                    .table(OAuthAccessTokens::Table)
                    .col(OAuthAccessTokens::Owner)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OAuthAccessTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(OAuthAuthorizeCodes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(OAuthUsers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(OAuthClients::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuthClients {
    #[sea_orm(iden = "oauth_clients")]
    Table,
    Id,
    Name,
    Secret,
    RedirectUris,
    GrantTypes,
    ResponseTypes,
    Scope,
    Audience,
    Owner,
    PolicyUri,
    TosUri,
    ClientUri,
    LogoUri,
    Contacts,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum OAuthUsers {
    #[sea_orm(iden = "oauth_users")]
    Table,
    Id,
    Username,
    Password,
    Salt,
    Email,
    PhonePrefix,
    Phone,
    AccountType,
    FbId,
    AccountKitId,
    AppleId,
    ClientId,
    OtpCode,
    OtpCodeExpiredAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum OAuthAuthorizeCodes {
    #[sea_orm(iden = "oauth_authorize_codes")]
    Table,
    Signature,
    RequestId,
    ClientId,
    Active,
    Requester,
    CreatedAt,
}

#[derive(DeriveIden)]
enum OAuthAccessTokens {
    #[sea_orm(iden = "oauth_access_tokens")]
    Table,
    Signature,
    Owner,
    RequestId,
    ClientId,
    TokenType,
    ExpiredAt,
    Requester,
    CreatedAt,
}
