//! Document backend on the in-process [`DocumentDatabase`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::document_db::{
    Collection, Document, DocumentDatabase, Filter, from_document, to_document,
};
use crate::error::StoreError;
use crate::identity::model::{Identity, IdentityFilter};
use crate::identity::storage::IdentityStorage;
use crate::oauth2::client::{ClientManager, OAuthClient};
use crate::oauth2::requester::{Requester, TokenKind};
use crate::secure;
use crate::store::codec::{RequesterCodec, RequesterRecord};
use crate::store::{GrantStore, StoredToken};

pub const CLIENTS: &str = "clients";
pub const USERS: &str = "users";
pub const AUTHORIZE_CODES: &str = "authorize_codes";
pub const ACCESS_TOKENS: &str = "access_tokens";

#[derive(Debug, Serialize, Deserialize)]
struct CodeDocument {
    request_id: String,
    client_id: String,
    active: bool,
    requester: RequesterRecord,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenDocument {
    owner: String,
    request_id: String,
    client_id: String,
    token_type: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expired_at: Option<OffsetDateTime>,
    requester: RequesterRecord,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct DocumentStore {
    clients: Arc<Collection>,
    users: Arc<Collection>,
    codes: Arc<Collection>,
    tokens: Arc<Collection>,
    system_secret: String,
    codec: RequesterCodec,
}

impl DocumentStore {
    pub fn new(db: DocumentDatabase, system_secret: &str) -> Self {
        let users = db.collection(USERS);
        users.create_unique_index(&["fb_id"]);
        users.create_unique_index(&["account_kit_id"]);
        users.create_unique_index(&["apple_id"]);
        users.create_unique_index(&["client_id", "username"]);
        Self {
            clients: db.collection(CLIENTS),
            users,
            codes: db.collection(AUTHORIZE_CODES),
            tokens: db.collection(ACCESS_TOKENS),
            system_secret: system_secret.to_string(),
            codec: RequesterCodec::document(),
        }
    }
}

fn identity_filter(filter: &IdentityFilter) -> Option<Filter> {
    let conditions = filter.conditions();
    if conditions.is_empty() {
        return None;
    }
    Some(Filter::And(
        conditions
            .into_iter()
            .map(|(field, value)| Filter::eq(field.name(), value))
            .collect(),
    ))
}

#[async_trait]
impl ClientManager for DocumentStore {
    #[tracing::instrument(skip(self))]
    async fn get_client(&self, id: &str) -> Result<OAuthClient, StoreError> {
        let doc = self
            .clients
            .find_one(&Filter::id(id))
            .ok_or(StoreError::NotFound)?;
        Ok(from_document(doc)?)
    }

    #[tracing::instrument(skip(self, client), fields(client_id = %client.id))]
    async fn create_client(&self, client: &OAuthClient) -> Result<(), StoreError> {
        self.clients.insert_one(to_document(&client.id, client)?)?;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for DocumentStore {
    #[tracing::instrument(skip_all, fields(request_id = %requester.id))]
    async fn create_authorization_code(
        &self,
        code: &str,
        requester: &Requester,
    ) -> Result<(), StoreError> {
        let doc = CodeDocument {
            request_id: requester.id.clone(),
            client_id: requester.client.id.clone(),
            active: true,
            requester: self.codec.encode(code, requester)?,
            created_at: OffsetDateTime::now_utc(),
        };
        self.codes.insert_one(to_document(code, &doc)?)?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_authorization_code(&self, code: &str) -> Result<Requester, StoreError> {
        let doc: CodeDocument = from_document(
            self.codes
                .find_one(&Filter::id(code))
                .ok_or(StoreError::NotFound)?,
        )?;
        let requester = self.codec.decode(&doc.requester, self).await?;
        if !doc.active {
            return Err(StoreError::InvalidatedCode(Box::new(requester)));
        }
        Ok(requester)
    }

    #[tracing::instrument(skip_all)]
    async fn invalidate_authorization_code(&self, code: &str) -> Result<(), StoreError> {
        let mut set = Document::new();
        set.insert("active".into(), Value::Bool(false));
        self.codes.update_one(&Filter::id(code), set)?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn delete_authorization_code(&self, code: &str) -> Result<(), StoreError> {
        self.codes.delete_one(&Filter::id(code));
        Ok(())
    }

    #[tracing::instrument(skip(self, signature, requester), fields(request_id = %requester.id))]
    async fn create_token(
        &self,
        kind: TokenKind,
        signature: &str,
        requester: &Requester,
    ) -> Result<(), StoreError> {
        let doc = TokenDocument {
            owner: requester.session.subject.clone(),
            request_id: requester.id.clone(),
            client_id: requester.client.id.clone(),
            token_type: kind.as_str().to_string(),
            expired_at: requester.session.expires_at(kind),
            requester: self.codec.encode(signature, requester)?,
            created_at: OffsetDateTime::now_utc(),
        };
        self.tokens.insert_one(to_document(signature, &doc)?)?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_token(&self, signature: &str) -> Result<StoredToken, StoreError> {
        let doc: TokenDocument = from_document(
            self.tokens
                .find_one(&Filter::id(signature))
                .ok_or(StoreError::NotFound)?,
        )?;
        let kind = TokenKind::parse(&doc.token_type)
            .ok_or_else(|| StoreError::Codec(format!("unknown token type {}", doc.token_type)))?;
        let requester = self.codec.decode(&doc.requester, self).await?;
        Ok(StoredToken {
            signature: signature.to_string(),
            kind,
            expires_at: doc.expired_at,
            requester,
        })
    }

    #[tracing::instrument(skip_all)]
    async fn delete_token(&self, signature: &str) -> Result<(), StoreError> {
        self.tokens.delete_one(&Filter::id(signature));
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn revoke_by_request_id(&self, request_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .tokens
            .delete_many(&Filter::eq("request_id", request_id)))
    }

    #[tracing::instrument(skip(self, secret))]
    async fn authenticate(&self, username: &str, secret: &str) -> Result<Identity, StoreError> {
        for doc in self.users.find(&Filter::eq("username", username)) {
            let identity: Identity = from_document(doc)?;
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
impl IdentityStorage for DocumentStore {
    #[tracing::instrument(skip(self))]
    async fn find(&self, filter: &IdentityFilter) -> Result<Identity, StoreError> {
        let filter = identity_filter(filter).ok_or(StoreError::NotFound)?;
        let doc = self.users.find_one(&filter).ok_or(StoreError::NotFound)?;
        Ok(from_document(doc)?)
    }

    #[tracing::instrument(skip(self))]
    async fn find_any(
        &self,
        alternatives: &[IdentityFilter],
    ) -> Result<Option<Identity>, StoreError> {
        let any: Vec<Filter> = alternatives.iter().filter_map(identity_filter).collect();
        if any.is_empty() {
            return Ok(None);
        }
        self.users
            .find_one(&Filter::Or(any))
            .map(|doc| from_document(doc).map_err(StoreError::from))
            .transpose()
    }

    #[tracing::instrument(skip(self, identity), fields(identity_id = %identity.id))]
    async fn create(&self, identity: &Identity) -> Result<(), StoreError> {
        self.users.insert_one(to_document(&identity.id, identity)?)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, identity), fields(identity_id = %identity.id))]
    async fn update(&self, identity: &Identity) -> Result<(), StoreError> {
        let replaced = self
            .users
            .replace_one(&Filter::id(&identity.id), to_document(&identity.id, identity)?)?;
        if replaced == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, code))]
    async fn consume_otp(&self, id: &str, code: &str) -> Result<bool, StoreError> {
        let filter = Filter::And(vec![Filter::id(id), Filter::eq("otp_code", code)]);
        let mut set = Document::new();
        set.insert("otp_code".into(), Value::Null);
        set.insert("otp_code_expired_at".into(), Value::Null);
        set.insert(
            "updated_at".into(),
            serde_json::to_value(Rfc3339(OffsetDateTime::now_utc()))?,
        );
        Ok(self.users.update_one(&filter, set)? == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let tokens = self.tokens.delete_many(&Filter::eq("owner", id));
        self.users.delete_one(&Filter::id(id));
        tracing::debug!(tokens, "deleted identity");
        Ok(())
    }
}

#[derive(Serialize)]
struct Rfc3339(#[serde(with = "time::serde::rfc3339")] OffsetDateTime);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::model::AccountType;
    use crate::oauth2::arguments::Arguments;
    use crate::oauth2::requester::Session;

    const SECRET: &str = "a-system-secret-of-at-least-32-characters";

    async fn setup() -> DocumentStore {
        let store = DocumentStore::new(DocumentDatabase::new(), SECRET);
        let mut client = OAuthClient::new("acme", "Acme");
        client.scope = "root offline".into();
        store.create_client(&client).await.unwrap();
        store
    }

    async fn requester(store: &DocumentStore) -> Requester {
        let client = store.get_client("acme").await.unwrap();
        let mut session = Session::new("user-1");
        session.set_user_id("7");
        let mut requester = Requester::new(client, session);
        requester.requested_scope = Arguments::from_space_delimited("root offline");
        requester.grant_scope("root");
        requester.grant_scope("offline");
        requester.form = [("username", "u"), ("password", "p")].into_iter().collect();
        requester
    }

    #[tokio::test]
    async fn token_round_trip_strips_password() {
        let store = setup().await;
        let requester = requester(&store).await;
        store
            .create_token(TokenKind::RefreshToken, "sig-r", &requester)
            .await
            .unwrap();
        let stored = store.get_token("sig-r").await.unwrap();
        assert_eq!(stored.kind, TokenKind::RefreshToken);
        assert_eq!(stored.requester.granted_scope, requester.granted_scope);
        assert_eq!(stored.requester.session.extra, requester.session.extra);
        assert_eq!(stored.requester.form.get("username"), Some("u"));
        assert_eq!(stored.requester.form.get("password"), None);
        // Sets are flattened with the document delimiter.
        let raw = store.tokens.find_one(&Filter::id("sig-r")).unwrap();
        assert_eq!(raw["requester"]["granted_scope"], "root|offline");
    }

    #[tokio::test]
    async fn invalidated_codes_carry_the_requester() {
        let store = setup().await;
        let requester = requester(&store).await;
        store.create_authorization_code("c", &requester).await.unwrap();
        store.invalidate_authorization_code("c").await.unwrap();
        store.invalidate_authorization_code("c").await.unwrap();
        match store.get_authorization_code("c").await {
            Err(StoreError::InvalidatedCode(inner)) => assert_eq!(inner.id, requester.id),
            other => panic!("expected invalidated code, got {other:?}"),
        }
        store.delete_authorization_code("c").await.unwrap();
        store.delete_authorization_code("c").await.unwrap();
    }

    #[tokio::test]
    async fn authenticate_checks_keyed_hash() {
        let store = setup().await;
        let mut identity = Identity::new("acme", AccountType::Internal);
        identity.username = Some("alice".into());
        identity.salt = "salt".into();
        identity.password = secure::compute_hmac256("pw", "salt", SECRET);
        store.create(&identity).await.unwrap();

        assert_eq!(store.authenticate("alice", "pw").await.unwrap().id, identity.id);
        assert!(matches!(
            store.authenticate("alice", "pX").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.authenticate("alicE", "pw").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn otp_consumption_is_compare_and_clear() {
        let store = setup().await;
        let mut identity = Identity::new("acme", AccountType::Internal);
        identity.otp_code = Some("123456".into());
        store.create(&identity).await.unwrap();

        assert!(!store.consume_otp(&identity.id, "654321").await.unwrap());
        assert!(store.consume_otp(&identity.id, "123456").await.unwrap());
        assert!(!store.consume_otp(&identity.id, "123456").await.unwrap());
        let reloaded = store.find(&IdentityFilter::by_id(&identity.id)).await.unwrap();
        assert_eq!(reloaded.otp_code, None);
    }

    #[tokio::test]
    async fn username_unique_per_client() {
        let store = setup().await;
        let mut first = Identity::new("acme", AccountType::Internal);
        first.username = Some("bob".into());
        store.create(&first).await.unwrap();

        let mut other_client = Identity::new("other", AccountType::Internal);
        other_client.username = Some("bob".into());
        store.create(&other_client).await.unwrap();

        let mut clash = Identity::new("acme", AccountType::Internal);
        clash.username = Some("bob".into());
        assert!(matches!(
            store.create(&clash).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
