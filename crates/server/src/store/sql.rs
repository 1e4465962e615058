//! Relational backend on SeaORM.

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    QueryFilter, sea_query::Expr,
};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::entity::{oauth_access_token, oauth_authorize_code, oauth_client, oauth_user};
use crate::error::StoreError;
use crate::identity::model::{AccountType, Identity, IdentityField, IdentityFilter};
use crate::identity::storage::IdentityStorage;
use crate::oauth2::client::{ClientManager, OAuthClient};
use crate::oauth2::requester::{Requester, TokenKind};
use crate::secure;
use crate::store::codec::{RequesterCodec, RequesterRecord, SQL_DELIMITER};
use crate::store::{GrantStore, StoredToken};

#[derive(Clone)]
pub struct SqlStore {
    db: Arc<DatabaseConnection>,
    system_secret: String,
    codec: RequesterCodec,
}

impl SqlStore {
    pub fn new(db: Arc<DatabaseConnection>, system_secret: &str) -> Self {
        Self {
            db,
            system_secret: system_secret.to_string(),
            codec: RequesterCodec::sql(),
        }
    }

    fn encode_record(&self, signature: &str, requester: &Requester) -> Result<String, StoreError> {
        let record = self.codec.encode(signature, requester)?;
        Ok(serde_json::to_string(&record)?)
    }

    async fn decode_record(&self, raw: &str) -> Result<Requester, StoreError> {
        let record: RequesterRecord = serde_json::from_str(raw)?;
        self.codec.decode(&record, self).await
    }
}

fn join(values: &[String]) -> String {
    values.join(&SQL_DELIMITER.to_string())
}

fn split(raw: &str) -> Vec<String> {
    raw.split(SQL_DELIMITER)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl From<oauth_client::Model> for OAuthClient {
    fn from(model: oauth_client::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            secret_hash: model.secret,
            redirect_uris: split(&model.redirect_uris),
            grant_types: split(&model.grant_types),
            response_types: split(&model.response_types),
            scope: model.scope,
            audience: split(&model.audience),
            owner: model.owner,
            policy_uri: model.policy_uri,
            tos_uri: model.tos_uri,
            client_uri: model.client_uri,
            logo_uri: model.logo_uri,
            contacts: split(&model.contacts),
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

impl TryFrom<oauth_user::Model> for Identity {
    type Error = StoreError;

    fn try_from(model: oauth_user::Model) -> Result<Self, Self::Error> {
        let account_type = AccountType::parse(&model.account_type).ok_or_else(|| {
            StoreError::Codec(format!("unknown account type {}", model.account_type))
        })?;
        Ok(Self {
            id: model.id,
            username: model.username,
            password: model.password,
            salt: model.salt,
            email: model.email,
            phone_prefix: model.phone_prefix,
            phone: model.phone,
            account_type,
            fb_id: model.fb_id,
            account_kit_id: model.account_kit_id,
            apple_id: model.apple_id,
            client_id: model.client_id,
            otp_code: model.otp_code,
            otp_code_expired_at: model.otp_code_expired_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

fn user_active_model(identity: &Identity) -> oauth_user::ActiveModel {
    oauth_user::ActiveModel {
        id: Set(identity.id.clone()),
        username: Set(identity.username.clone()),
        password: Set(identity.password.clone()),
        salt: Set(identity.salt.clone()),
        email: Set(identity.email.clone()),
        phone_prefix: Set(identity.phone_prefix.clone()),
        phone: Set(identity.phone.clone()),
        account_type: Set(identity.account_type.as_str().to_string()),
        fb_id: Set(identity.fb_id.clone()),
        account_kit_id: Set(identity.account_kit_id.clone()),
        apple_id: Set(identity.apple_id.clone()),
        client_id: Set(identity.client_id.clone()),
        otp_code: Set(identity.otp_code.clone()),
        otp_code_expired_at: Set(identity.otp_code_expired_at),
        created_at: Set(identity.created_at),
        updated_at: Set(identity.updated_at),
    }
}

fn user_column(field: IdentityField) -> oauth_user::Column {
    match field {
        IdentityField::Id => oauth_user::Column::Id,
        IdentityField::Username => oauth_user::Column::Username,
        IdentityField::Email => oauth_user::Column::Email,
        IdentityField::PhonePrefix => oauth_user::Column::PhonePrefix,
        IdentityField::Phone => oauth_user::Column::Phone,
        IdentityField::FbId => oauth_user::Column::FbId,
        IdentityField::AccountKitId => oauth_user::Column::AccountKitId,
        IdentityField::AppleId => oauth_user::Column::AppleId,
        IdentityField::OtpCode => oauth_user::Column::OtpCode,
        IdentityField::ClientId => oauth_user::Column::ClientId,
    }
}

/// `None` when the filter has no conditions.
fn user_condition(filter: &IdentityFilter) -> Option<Condition> {
    let conditions = filter.conditions();
    if conditions.is_empty() {
        return None;
    }
    Some(
        conditions
            .into_iter()
            .fold(Condition::all(), |cond, (field, value)| {
                cond.add(user_column(field).eq(value))
            }),
    )
}

#[async_trait]
impl ClientManager for SqlStore {
    #[tracing::instrument(skip(self))]
    async fn get_client(&self, id: &str) -> Result<OAuthClient, StoreError> {
        oauth_client::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .map(OAuthClient::from)
            .ok_or(StoreError::NotFound)
    }

    #[tracing::instrument(skip(self, client), fields(client_id = %client.id))]
    async fn create_client(&self, client: &OAuthClient) -> Result<(), StoreError> {
        oauth_client::ActiveModel {
            id: Set(client.id.clone()),
            name: Set(client.name.clone()),
            secret: Set(client.secret_hash.clone()),
            redirect_uris: Set(join(&client.redirect_uris)),
            grant_types: Set(join(&client.grant_types)),
            response_types: Set(join(&client.response_types)),
            scope: Set(client.scope.clone()),
            audience: Set(join(&client.audience)),
            owner: Set(client.owner.clone()),
            policy_uri: Set(client.policy_uri.clone()),
            tos_uri: Set(client.tos_uri.clone()),
            client_uri: Set(client.client_uri.clone()),
            logo_uri: Set(client.logo_uri.clone()),
            contacts: Set(join(&client.contacts)),
            created_at: Set(client.created_at),
            updated_at: Set(client.updated_at),
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for SqlStore {
    #[tracing::instrument(skip_all, fields(request_id = %requester.id))]
    async fn create_authorization_code(
        &self,
        code: &str,
        requester: &Requester,
    ) -> Result<(), StoreError> {
        oauth_authorize_code::ActiveModel {
            signature: Set(code.to_string()),
            request_id: Set(requester.id.clone()),
            client_id: Set(requester.client.id.clone()),
            active: Set(true),
            requester: Set(self.encode_record(code, requester)?),
            created_at: Set(OffsetDateTime::now_utc()),
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_authorization_code(&self, code: &str) -> Result<Requester, StoreError> {
        let row = oauth_authorize_code::Entity::find_by_id(code)
            .one(self.db.as_ref())
            .await?
            .ok_or(StoreError::NotFound)?;
        let requester = self.decode_record(&row.requester).await?;
        if !row.active {
            return Err(StoreError::InvalidatedCode(Box::new(requester)));
        }
        Ok(requester)
    }

    #[tracing::instrument(skip_all)]
    async fn invalidate_authorization_code(&self, code: &str) -> Result<(), StoreError> {
        oauth_authorize_code::Entity::update_many()
            .col_expr(oauth_authorize_code::Column::Active, Expr::value(false))
            .filter(oauth_authorize_code::Column::Signature.eq(code))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn delete_authorization_code(&self, code: &str) -> Result<(), StoreError> {
        oauth_authorize_code::Entity::delete_many()
            .filter(oauth_authorize_code::Column::Signature.eq(code))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, signature, requester), fields(request_id = %requester.id))]
    async fn create_token(
        &self,
        kind: TokenKind,
        signature: &str,
        requester: &Requester,
    ) -> Result<(), StoreError> {
        oauth_access_token::ActiveModel {
            signature: Set(signature.to_string()),
            owner: Set(requester.session.subject.clone()),
            request_id: Set(requester.id.clone()),
            client_id: Set(requester.client.id.clone()),
            token_type: Set(kind.as_str().to_string()),
            expired_at: Set(requester.session.expires_at(kind)),
            requester: Set(self.encode_record(signature, requester)?),
            created_at: Set(OffsetDateTime::now_utc()),
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_token(&self, signature: &str) -> Result<StoredToken, StoreError> {
        let row = oauth_access_token::Entity::find_by_id(signature)
            .one(self.db.as_ref())
            .await?
            .ok_or(StoreError::NotFound)?;
        let kind = TokenKind::parse(&row.token_type)
            .ok_or_else(|| StoreError::Codec(format!("unknown token type {}", row.token_type)))?;
        let requester = self.decode_record(&row.requester).await?;
        Ok(StoredToken {
            signature: row.signature,
            kind,
            expires_at: row.expired_at,
            requester,
        })
    }

    #[tracing::instrument(skip_all)]
    async fn delete_token(&self, signature: &str) -> Result<(), StoreError> {
        oauth_access_token::Entity::delete_many()
            .filter(oauth_access_token::Column::Signature.eq(signature))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn revoke_by_request_id(&self, request_id: &str) -> Result<u64, StoreError> {
        let result = oauth_access_token::Entity::delete_many()
            .filter(oauth_access_token::Column::RequestId.eq(request_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    /// Usernames are unique per client only, so every identity holding the name
    /// is tried.
    #[tracing::instrument(skip(self, secret))]
    async fn authenticate(&self, username: &str, secret: &str) -> Result<Identity, StoreError> {
        let models = oauth_user::Entity::find()
            .filter(oauth_user::Column::Username.eq(username))
            .all(self.db.as_ref())
            .await?;
        for model in models {
            let identity = Identity::try_from(model)?;
            if !identity.password.is_empty()
                && secure::verify_hmac256(secret, &identity.salt, &self.system_secret, &identity.password)
            {
                return Ok(identity);
            }
        }
        Err(StoreError::NotFound)
    }
}

#[async_trait]
impl IdentityStorage for SqlStore {
    #[tracing::instrument(skip(self))]
    async fn find(&self, filter: &IdentityFilter) -> Result<Identity, StoreError> {
        let condition = user_condition(filter).ok_or(StoreError::NotFound)?;
        let model = oauth_user::Entity::find()
            .filter(condition)
            .one(self.db.as_ref())
            .await?
            .ok_or(StoreError::NotFound)?;
        Identity::try_from(model)
    }

    #[tracing::instrument(skip(self))]
    async fn find_any(
        &self,
        alternatives: &[IdentityFilter],
    ) -> Result<Option<Identity>, StoreError> {
        let conditions: Vec<Condition> = alternatives.iter().filter_map(user_condition).collect();
        if conditions.is_empty() {
            return Ok(None);
        }
        let any = conditions
            .into_iter()
            .fold(Condition::any(), |cond, alt| cond.add(alt));
        oauth_user::Entity::find()
            .filter(any)
            .one(self.db.as_ref())
            .await?
            .map(Identity::try_from)
            .transpose()
    }

    #[tracing::instrument(skip(self, identity), fields(identity_id = %identity.id))]
    async fn create(&self, identity: &Identity) -> Result<(), StoreError> {
        user_active_model(identity).insert(self.db.as_ref()).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, identity), fields(identity_id = %identity.id))]
    async fn update(&self, identity: &Identity) -> Result<(), StoreError> {
        user_active_model(identity).update(self.db.as_ref()).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, code))]
    async fn consume_otp(&self, id: &str, code: &str) -> Result<bool, StoreError> {
        let result = oauth_user::Entity::update_many()
            .col_expr(oauth_user::Column::OtpCode, Expr::value(Option::<String>::None))
            .col_expr(
                oauth_user::Column::OtpCodeExpiredAt,
                Expr::value(Option::<OffsetDateTime>::None),
            )
            .col_expr(
                oauth_user::Column::UpdatedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth_user::Column::Id.eq(id))
            .filter(oauth_user::Column::OtpCode.eq(code))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let tokens = oauth_access_token::Entity::delete_many()
            .filter(oauth_access_token::Column::Owner.eq(id))
            .exec(self.db.as_ref())
            .await?;
        oauth_user::Entity::delete_many()
            .filter(oauth_user::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        tracing::debug!(tokens = tokens.rows_affected, "deleted identity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth2::arguments::Arguments;
    use crate::oauth2::requester::Session;
    use crate::schema::create_sqlite_schema;
    use sea_orm::Database;
    use time::Duration;

    const SECRET: &str = "a-system-secret-of-at-least-32-characters";

    async fn setup() -> SqlStore {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        create_sqlite_schema(&db).await.expect("schema");
        let store = SqlStore::new(Arc::new(db), SECRET);
        let mut client = OAuthClient::new("acme", "Acme");
        client.grant_types = vec!["password".into(), "refresh_token".into()];
        client.scope = "root offline".into();
        store.create_client(&client).await.expect("client");
        store
    }

    async fn requester(store: &SqlStore) -> Requester {
        let client = store.get_client("acme").await.unwrap();
        let mut session = Session::new("user-1");
        session.set_user_id("user-1");
        session.set_expires_at(
            TokenKind::AccessToken,
            OffsetDateTime::now_utc() + Duration::hours(1),
        );
        let mut requester = Requester::new(client, session);
        requester.requested_scope = Arguments::from_space_delimited("root offline");
        requester.grant_scope("offline");
        requester
    }

    #[tokio::test]
    async fn client_lists_round_trip() {
        let store = setup().await;
        let client = store.get_client("acme").await.unwrap();
        assert_eq!(client.grant_types, vec!["password", "refresh_token"]);
        assert!(client.redirect_uris.is_empty());
        assert!(matches!(
            store.get_client("missing").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn authorization_code_lifecycle() {
        let store = setup().await;
        let requester = requester(&store).await;
        store
            .create_authorization_code("code-1", &requester)
            .await
            .unwrap();
        let loaded = store.get_authorization_code("code-1").await.unwrap();
        assert_eq!(loaded.id, requester.id);

        store.invalidate_authorization_code("code-1").await.unwrap();
        store.invalidate_authorization_code("code-1").await.unwrap();
        match store.get_authorization_code("code-1").await {
            Err(StoreError::InvalidatedCode(inner)) => assert_eq!(inner.id, requester.id),
            other => panic!("expected invalidated code, got {other:?}"),
        }

        store.delete_authorization_code("code-1").await.unwrap();
        store.delete_authorization_code("code-1").await.unwrap();
        assert!(matches!(
            store.get_authorization_code("code-1").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn tokens_are_keyed_by_signature() {
        let store = setup().await;
        let requester = requester(&store).await;
        store
            .create_token(TokenKind::AccessToken, "sig-a", &requester)
            .await
            .unwrap();
        store
            .create_token(TokenKind::RefreshToken, "sig-r", &requester)
            .await
            .unwrap();

        let access = store.get_token("sig-a").await.unwrap();
        assert_eq!(access.kind, TokenKind::AccessToken);
        assert!(access.expires_at.is_some());
        assert!(access.requester.granted_scope.has("offline"));
        // The refresh row keeps its own (unset) expiry.
        assert_eq!(store.get_token("sig-r").await.unwrap().expires_at, None);

        let duplicate = store
            .create_token(TokenKind::AccessToken, "sig-a", &requester)
            .await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

        store.delete_token("sig-a").await.unwrap();
        store.delete_token("sig-a").await.unwrap();
        assert_eq!(store.revoke_by_request_id(&requester.id).await.unwrap(), 1);
        assert_eq!(store.revoke_by_request_id(&requester.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_any_matches_alternatives() {
        let store = setup().await;
        let mut identity = Identity::new("acme", AccountType::External);
        identity.fb_id = Some("fb-1".into());
        identity.email = Some("a@example.com".into());
        store.create(&identity).await.unwrap();

        let by_email = IdentityFilter {
            email: Some("a@example.com".into()),
            ..IdentityFilter::default()
        };
        let by_fb = IdentityFilter {
            fb_id: Some("other".into()),
            ..IdentityFilter::default()
        };
        let found = store.find_any(&[by_fb.clone(), by_email]).await.unwrap();
        assert_eq!(found.map(|i| i.id), Some(identity.id.clone()));
        assert_eq!(store.find_any(&[by_fb]).await.unwrap(), None);
        assert_eq!(store.find_any(&[IdentityFilter::default()]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn provider_ids_are_unique() {
        let store = setup().await;
        let mut first = Identity::new("acme", AccountType::External);
        first.apple_id = Some("apple-1".into());
        store.create(&first).await.unwrap();
        let mut second = Identity::new("acme", AccountType::External);
        second.apple_id = Some("apple-1".into());
        assert!(matches!(
            store.create(&second).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_owned_tokens() {
        let store = setup().await;
        let mut identity = Identity::new("acme", AccountType::Internal);
        identity.id = "user-1".into();
        store.create(&identity).await.unwrap();
        let requester = requester(&store).await;
        store
            .create_token(TokenKind::AccessToken, "sig-owned", &requester)
            .await
            .unwrap();

        store.delete("user-1").await.unwrap();
        assert!(matches!(
            store.get_token("sig-owned").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.find(&IdentityFilter::by_id("user-1")).await,
            Err(StoreError::NotFound)
        ));
    }
}
