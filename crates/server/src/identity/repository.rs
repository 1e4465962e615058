//! Identity lookup, creation and reconciliation of provider assertions.
//!
//! Lookups for provider assertions are global, while direct creation and updates
//! check uniqueness inside the owning client only.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{ErrorKey, IdentityError, StoreError};
use crate::identity::model::{
    AccountType, Credential, Identity, IdentityFilter, IdentityUpdate, NewIdentity,
    ProviderAssertion, Resolved,
};
use crate::identity::storage::IdentityStorage;
use crate::secure;

pub const OTP_TTL: Duration = Duration::seconds(60);

/// How many times a create that lost a uniqueness race re-runs the lookup.
const CREATE_ATTEMPTS: usize = 3;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("email pattern compiles")
});

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

/// Source of a provider assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Facebook,
    AccountKit,
    Apple,
    Gmail,
}

impl Provider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "facebook" => Some(Provider::Facebook),
            "account-kit" => Some(Provider::AccountKit),
            "apple" => Some(Provider::Apple),
            "gmail" => Some(Provider::Gmail),
            _ => None,
        }
    }

    fn validate(self, assertion: &ProviderAssertion) -> Result<(), IdentityError> {
        let missing = match self {
            Provider::Facebook if assertion.fb_id.is_empty() => Some(ErrorKey::FbIdCannotBeEmpty),
            Provider::AccountKit if assertion.ak_id.is_empty() => {
                Some(ErrorKey::AkIdCannotBeEmpty)
            }
            Provider::AccountKit => {
                check_email_and_phone(&assertion.phone_prefix, &assertion.phone, &assertion.email)
                    .err()
            }
            Provider::Apple if assertion.apple_id.is_empty() => {
                Some(ErrorKey::AppleIdCannotBeEmpty)
            }
            Provider::Gmail if assertion.email.is_empty() => Some(ErrorKey::EmailCannotBeEmpty),
            _ => None,
        };
        match missing {
            Some(key) => Err(IdentityError::Validation(key)),
            None => Ok(()),
        }
    }

    fn provider_id(self, assertion: &ProviderAssertion) -> Option<&str> {
        let id = match self {
            Provider::Facebook => &assertion.fb_id,
            Provider::AccountKit => &assertion.ak_id,
            Provider::Apple => &assertion.apple_id,
            Provider::Gmail => return None,
        };
        Some(id.as_str()).filter(|id| !id.is_empty())
    }

    fn stored_id(self, identity: &Identity) -> Option<&str> {
        match self {
            Provider::Facebook => identity.fb_id.as_deref(),
            Provider::AccountKit => identity.account_kit_id.as_deref(),
            Provider::Apple => identity.apple_id.as_deref(),
            Provider::Gmail => None,
        }
    }

    fn set_id(self, identity: &mut Identity, id: &str) {
        let slot = match self {
            Provider::Facebook => &mut identity.fb_id,
            Provider::AccountKit => &mut identity.account_kit_id,
            Provider::Apple => &mut identity.apple_id,
            Provider::Gmail => return,
        };
        *slot = Some(id.to_string());
    }

    fn updates_email(self) -> bool {
        matches!(self, Provider::AccountKit | Provider::Apple)
    }

    /// Alternatives of the "or" lookup. Empty contact fields are left out.
    fn lookup(self, assertion: &ProviderAssertion) -> Vec<IdentityFilter> {
        let mut alternatives = Vec::new();
        match self {
            Provider::Facebook => alternatives.push(IdentityFilter {
                fb_id: Some(assertion.fb_id.clone()),
                ..IdentityFilter::default()
            }),
            Provider::AccountKit => alternatives.push(IdentityFilter {
                ak_id: Some(assertion.ak_id.clone()),
                ..IdentityFilter::default()
            }),
            Provider::Apple => alternatives.push(IdentityFilter {
                apple_id: Some(assertion.apple_id.clone()),
                ..IdentityFilter::default()
            }),
            Provider::Gmail => {}
        }
        if !assertion.email.is_empty() {
            alternatives.push(IdentityFilter {
                email: Some(assertion.email.clone()),
                ..IdentityFilter::default()
            });
        }
        if self == Provider::AccountKit && !assertion.phone.is_empty() {
            alternatives.push(IdentityFilter {
                phone_prefix: Some(assertion.phone_prefix.clone()),
                phone: Some(assertion.phone.clone()),
                ..IdentityFilter::default()
            });
        }
        alternatives
    }

    fn new_identity(self, client_id: &str, assertion: &ProviderAssertion) -> Identity {
        let mut identity = Identity::new(client_id, AccountType::External);
        if let Some(id) = self.provider_id(assertion) {
            self.set_id(&mut identity, id);
        }
        identity.email = non_empty(&assertion.email);
        if self == Provider::AccountKit && !assertion.phone.is_empty() {
            identity.phone_prefix = non_empty(&assertion.phone_prefix);
            identity.phone = non_empty(&assertion.phone);
        }
        identity
    }
}

/// A phone needs its prefix; without a phone an email is required.
fn check_email_and_phone(prefix: &str, phone: &str, email: &str) -> Result<(), ErrorKey> {
    if phone.len() > 1 {
        if prefix.is_empty() {
            return Err(ErrorKey::PhonePrefixCannotBeEmpty);
        }
        return Ok(());
    }
    if email.is_empty() {
        return Err(ErrorKey::PhoneAndEmailCannotBeEmpty);
    }
    Ok(())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn trimmed(assertion: ProviderAssertion) -> ProviderAssertion {
    ProviderAssertion {
        fb_id: assertion.fb_id.trim().to_string(),
        ak_id: assertion.ak_id.trim().to_string(),
        apple_id: assertion.apple_id.trim().to_string(),
        email: assertion.email.trim().to_string(),
        phone_prefix: assertion.phone_prefix.trim().to_string(),
        phone: assertion.phone.trim().to_string(),
    }
}

#[derive(Clone)]
pub struct IdentityRepository {
    storage: Arc<dyn IdentityStorage>,
    system_secret: Arc<str>,
    clock: Arc<dyn Clock>,
}

impl IdentityRepository {
    pub fn new(storage: Arc<dyn IdentityStorage>, system_secret: &str) -> Self {
        Self {
            storage,
            system_secret: Arc::from(system_secret),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn hash(&self, password: &str) -> Result<(String, String), IdentityError> {
        let salt = secure::generate_salt().map_err(StoreError::from)?;
        let hash = secure::compute_hmac256(password, &salt, &self.system_secret);
        Ok((salt, hash))
    }

    fn verify(&self, identity: &Identity, password: &str) -> bool {
        secure::verify_hmac256(
            password,
            &identity.salt,
            &self.system_secret,
            &identity.password,
        )
    }

    #[tracing::instrument(skip(self))]
    pub async fn find(&self, filter: &IdentityFilter) -> Result<Identity, IdentityError> {
        if filter.is_empty() {
            return Err(IdentityError::Validation(ErrorKey::InvalidRequest));
        }
        Ok(self.storage.find(filter).await?)
    }

    /// Identity `id` owned by `client_id`.
    pub async fn find_in_client(
        &self,
        client_id: &str,
        id: &str,
    ) -> Result<Identity, IdentityError> {
        self.find(&IdentityFilter::by_id(id).in_client(client_id))
            .await
    }

    /// Creates an internal identity from at least one of username, email or phone.
    /// Those must be unused inside `client_id`; a password is hashed when given.
    #[tracing::instrument(skip(self, new), fields(username = %new.username))]
    pub async fn create(
        &self,
        client_id: &str,
        new: NewIdentity,
    ) -> Result<Resolved, IdentityError> {
        let username = non_empty(&new.username);
        let email = non_empty(&new.email);
        let phone = non_empty(&new.phone);
        let phone_prefix = non_empty(&new.phone_prefix);
        let password = new.password.trim();

        if username.is_none() && email.is_none() && phone.is_none() {
            return Err(IdentityError::Validation(
                ErrorKey::UsernameAndPasswordCannotBeEmpty,
            ));
        }
        if let Some(email) = &email
            && !is_valid_email(email)
        {
            return Err(IdentityError::Validation(ErrorKey::EmailInvalid));
        }
        if phone.is_some() && phone_prefix.is_none() {
            return Err(IdentityError::Validation(ErrorKey::PhonePrefixCannotBeEmpty));
        }

        let alternatives: Vec<IdentityFilter> = [
            username.clone().map(|u| IdentityFilter {
                username: Some(u),
                ..IdentityFilter::default()
            }),
            email.clone().map(|e| IdentityFilter {
                email: Some(e),
                ..IdentityFilter::default()
            }),
            phone.clone().map(|p| IdentityFilter {
                phone: Some(p),
                ..IdentityFilter::default()
            }),
        ]
        .into_iter()
        .flatten()
        .map(|f| f.in_client(client_id))
        .collect();
        if self.storage.find_any(&alternatives).await?.is_some() {
            return Err(IdentityError::Conflict(ErrorKey::UserExisted));
        }

        let mut identity = Identity::new(client_id, AccountType::Internal);
        if !password.is_empty() {
            let (salt, hash) = self.hash(password)?;
            identity.salt = salt;
            identity.password = hash;
        }
        identity.username = username;
        identity.email = email;
        identity.phone_prefix = phone.as_ref().and(phone_prefix);
        identity.phone = phone;

        self.storage.create(&identity).await?;
        tracing::info!(identity_id = %identity.id, client_id, "created identity");
        Ok(Resolved {
            identity,
            is_new: true,
        })
    }

    pub async fn create_with_facebook(
        &self,
        client_id: &str,
        fb_id: &str,
        email: &str,
    ) -> Result<Resolved, IdentityError> {
        let assertion = ProviderAssertion {
            fb_id: fb_id.to_string(),
            email: email.to_string(),
            ..ProviderAssertion::default()
        };
        self.reconcile(client_id, Provider::Facebook, assertion)
            .await
    }

    pub async fn create_with_account_kit(
        &self,
        client_id: &str,
        ak_id: &str,
        email: &str,
        phone_prefix: &str,
        phone: &str,
    ) -> Result<Resolved, IdentityError> {
        let assertion = ProviderAssertion {
            ak_id: ak_id.to_string(),
            email: email.to_string(),
            phone_prefix: phone_prefix.to_string(),
            phone: phone.to_string(),
            ..ProviderAssertion::default()
        };
        self.reconcile(client_id, Provider::AccountKit, assertion)
            .await
    }

    pub async fn create_with_apple(
        &self,
        client_id: &str,
        apple_id: &str,
        email: &str,
    ) -> Result<Resolved, IdentityError> {
        let assertion = ProviderAssertion {
            apple_id: apple_id.to_string(),
            email: email.to_string(),
            ..ProviderAssertion::default()
        };
        self.reconcile(client_id, Provider::Apple, assertion).await
    }

    pub async fn create_with_gmail(
        &self,
        client_id: &str,
        email: &str,
    ) -> Result<Resolved, IdentityError> {
        let assertion = ProviderAssertion {
            email: email.to_string(),
            ..ProviderAssertion::default()
        };
        self.reconcile(client_id, Provider::Gmail, assertion).await
    }

    /// Links the assertion to an existing identity or creates an external one.
    ///
    /// A create that collides with a concurrent one on a provider id re-runs the
    /// lookup and takes the merge path instead.
    #[tracing::instrument(skip(self, assertion))]
    pub async fn reconcile(
        &self,
        client_id: &str,
        provider: Provider,
        assertion: ProviderAssertion,
    ) -> Result<Resolved, IdentityError> {
        let assertion = trimmed(assertion);
        provider.validate(&assertion)?;
        let lookup = provider.lookup(&assertion);

        for _ in 0..CREATE_ATTEMPTS {
            if let Some(existing) = self.storage.find_any(&lookup).await? {
                return self.merge(provider, &assertion, existing).await;
            }
            let identity = provider.new_identity(client_id, &assertion);
            match self.storage.create(&identity).await {
                Ok(()) => {
                    tracing::info!(identity_id = %identity.id, client_id, "created external identity");
                    return Ok(Resolved {
                        identity,
                        is_new: true,
                    });
                }
                Err(StoreError::Conflict(index)) => {
                    tracing::debug!(%index, "identity created concurrently, retrying lookup");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(IdentityError::Conflict(ErrorKey::UserExisted))
    }

    async fn merge(
        &self,
        provider: Provider,
        assertion: &ProviderAssertion,
        mut identity: Identity,
    ) -> Result<Resolved, IdentityError> {
        let wanted = provider.provider_id(assertion);
        let id_differs = wanted.is_some() && provider.stored_id(&identity) != wanted;
        if id_differs || identity.account_type == AccountType::Internal {
            if let Some(id) = wanted {
                provider.set_id(&mut identity, id);
            }
            if provider.updates_email()
                && !assertion.email.is_empty()
                && identity.email.as_deref() != Some(assertion.email.as_str())
            {
                identity.email = Some(assertion.email.clone());
            }
            identity.account_type = AccountType::Both;
            identity.updated_at = self.clock.now();
            self.storage.update(&identity).await?;
            tracing::info!(identity_id = %identity.id, ?provider, "linked provider to identity");
        }
        Ok(Resolved {
            identity,
            is_new: false,
        })
    }

    /// The old password is only checked when one is set.
    #[tracing::instrument(skip(self, old_password, new_password))]
    pub async fn change_password(
        &self,
        client_id: &str,
        id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        let mut identity = self.find_in_client(client_id, id).await?;
        if !identity.password.is_empty() && !self.verify(&identity, old_password) {
            return Err(IdentityError::Validation(ErrorKey::OldPassNotCorrect));
        }
        if new_password.is_empty() {
            return Err(IdentityError::Validation(ErrorKey::InvalidRequest));
        }
        let (salt, hash) = self.hash(new_password)?;
        identity.salt = salt;
        identity.password = hash;
        identity.account_type = identity.account_type.with_password();
        identity.updated_at = self.clock.now();
        self.storage.update(&identity).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, update), fields(identity_id = %update.id))]
    pub async fn update_user(&self, update: IdentityUpdate) -> Result<Identity, IdentityError> {
        let email = update.email.as_deref().map(str::trim);
        let username = update.username.as_deref().map(str::trim);
        let password = update.password.as_deref().filter(|p| !p.is_empty());

        if let Some(email) = email.filter(|e| !e.is_empty())
            && !is_valid_email(email)
        {
            return Err(IdentityError::Validation(ErrorKey::EmailInvalid));
        }
        if username == Some("") {
            return Err(IdentityError::Validation(ErrorKey::UsernameCannotBeEmpty));
        }
        if let Some(password) = password
            && update.password_confirmation.as_deref() != Some(password)
        {
            return Err(IdentityError::Validation(ErrorKey::PassAndConfirmNotMatch));
        }

        let mut identity = self.find_in_client(&update.client_id, &update.id).await?;

        if let Some(email) = email.filter(|e| !e.is_empty()) {
            let filter = IdentityFilter {
                email: Some(email.to_string()),
                ..IdentityFilter::default()
            }
            .in_client(&update.client_id);
            self.ensure_unused(&filter, &identity.id, ErrorKey::EmailExisted)
                .await?;
        }
        if let Some(username) = username {
            let filter = IdentityFilter {
                username: Some(username.to_string()),
                ..IdentityFilter::default()
            }
            .in_client(&update.client_id);
            self.ensure_unused(&filter, &identity.id, ErrorKey::UsernameExisted)
                .await?;
        }

        if let Some(account_type) = update.account_type {
            if account_type != identity.account_type && account_type != AccountType::Both {
                return Err(IdentityError::Validation(ErrorKey::InvalidRequest));
            }
            identity.account_type = account_type;
        }
        if let Some(username) = username {
            identity.username = Some(username.to_string());
        }
        if let Some(email) = email {
            identity.email = non_empty(email);
        }
        if let Some(prefix) = &update.phone_prefix {
            identity.phone_prefix = non_empty(prefix);
        }
        if let Some(phone) = &update.phone {
            identity.phone = non_empty(phone);
        }
        if let Some(fb_id) = &update.fb_id {
            identity.fb_id = non_empty(fb_id);
        }
        if let Some(ak_id) = &update.ak_id {
            identity.account_kit_id = non_empty(ak_id);
        }
        if let Some(apple_id) = &update.apple_id {
            identity.apple_id = non_empty(apple_id);
        }
        if let Some(password) = password {
            let (salt, hash) = self.hash(password)?;
            identity.salt = salt;
            identity.password = hash;
            identity.account_type = identity.account_type.with_password();
        }
        identity.updated_at = self.clock.now();
        self.storage.update(&identity).await?;
        Ok(identity)
    }

    async fn ensure_unused(
        &self,
        filter: &IdentityFilter,
        own_id: &str,
        key: ErrorKey,
    ) -> Result<(), IdentityError> {
        match self.storage.find(filter).await {
            Ok(other) if other.id != own_id => Err(IdentityError::Conflict(key)),
            Ok(_) | Err(StoreError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Attaches a username (and optionally a password) to an identity.
    #[tracing::instrument(skip(self, credential), fields(identity_id = %credential.id))]
    pub async fn set_username_password(&self, credential: Credential) -> Result<(), IdentityError> {
        let username = credential.username.trim();
        if username.is_empty() {
            return Err(IdentityError::Validation(ErrorKey::UsernameCannotBeEmpty));
        }
        let mut identity = self
            .find_in_client(&credential.client_id, &credential.id)
            .await?;
        let filter = IdentityFilter {
            username: Some(username.to_string()),
            ..IdentityFilter::default()
        }
        .in_client(&credential.client_id);
        self.ensure_unused(&filter, &identity.id, ErrorKey::UsernameExisted)
            .await?;

        identity.username = Some(username.to_string());
        if let Some(password) = credential.password.as_deref().filter(|p| !p.is_empty()) {
            let (salt, hash) = self.hash(password)?;
            identity.salt = salt;
            identity.password = hash;
        }
        if let Some(email) = &credential.email {
            identity.email = non_empty(email);
        }
        if let Some(phone) = &credential.phone {
            identity.phone = non_empty(phone);
        }
        if identity.has_username_password() {
            identity.account_type = identity.account_type.with_password();
        }
        identity.updated_at = self.clock.now();
        self.storage.update(&identity).await?;
        Ok(())
    }

    /// Issues a fresh six digit code valid for [`OTP_TTL`].
    #[tracing::instrument(skip(self))]
    pub async fn generate_otp(&self, filter: &IdentityFilter) -> Result<String, IdentityError> {
        let mut identity = self.find(filter).await?;
        let otp = secure::generate_otp().map_err(StoreError::from)?;
        let now = self.clock.now();
        identity.otp_code = Some(otp.clone());
        identity.otp_code_expired_at = Some(now + OTP_TTL);
        identity.updated_at = now;
        self.storage.update(&identity).await?;
        Ok(otp)
    }

    /// Exchanges a code for the identity. An expired code is reported and kept;
    /// a valid one is cleared atomically so it cannot be spent twice.
    #[tracing::instrument(skip(self, filter))]
    pub async fn login_with_otp(&self, filter: &IdentityFilter) -> Result<Identity, IdentityError> {
        let Some(code) = filter.otp_code.as_deref().filter(|c| !c.is_empty()) else {
            return Err(IdentityError::Validation(ErrorKey::InvalidRequest));
        };
        let mut identity = self.find(filter).await?;
        match identity.otp_code_expired_at {
            Some(expires_at) if expires_at >= self.clock.now() => {}
            _ => return Err(IdentityError::Unauthorized(ErrorKey::OtpExpired)),
        }
        if !self.storage.consume_otp(&identity.id, code).await? {
            return Err(IdentityError::NotFound(ErrorKey::DataNotFound));
        }
        identity.otp_code = None;
        identity.otp_code_expired_at = None;
        Ok(identity)
    }

    /// Username, email or phone plus password inside the credential's client.
    /// Unknown identities and wrong passwords fail the same way.
    #[tracing::instrument(skip(self, credential), fields(client_id = %credential.client_id))]
    pub async fn login_with_credential(
        &self,
        credential: Credential,
    ) -> Result<Identity, IdentityError> {
        let Some(password) = credential.password.as_deref().filter(|p| !p.is_empty()) else {
            return Err(IdentityError::Validation(
                ErrorKey::UsernameAndPasswordCannotBeEmpty,
            ));
        };
        let filter = IdentityFilter {
            username: non_empty(&credential.username),
            email: credential.email.as_deref().and_then(non_empty),
            phone: credential.phone.as_deref().and_then(non_empty),
            ..IdentityFilter::default()
        }
        .in_client(&credential.client_id);
        if filter.is_empty() {
            return Err(IdentityError::Validation(
                ErrorKey::UsernameAndPasswordCannotBeEmpty,
            ));
        }
        let identity = match self.storage.find(&filter).await {
            Ok(identity) => identity,
            Err(StoreError::NotFound) => {
                return Err(IdentityError::Unauthorized(ErrorKey::CannotLogin));
            }
            Err(err) => return Err(err.into()),
        };
        if identity.password.is_empty() || !self.verify(&identity, password) {
            return Err(IdentityError::Unauthorized(ErrorKey::CannotLogin));
        }
        Ok(identity)
    }

    /// Removes the identity and every token issued to it.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, client_id: &str, id: &str) -> Result<(), IdentityError> {
        let identity = self.find_in_client(client_id, id).await?;
        self.storage.delete(&identity.id).await?;
        tracing::info!(identity_id = %identity.id, "deleted identity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::document_db::DocumentDatabase;
    use crate::schema::create_sqlite_schema;
    use crate::store::{DocumentStore, SqlStore};
    use sea_orm::Database;
    use time::OffsetDateTime;

    const SECRET: &str = "a-system-secret-of-at-least-32-characters";

    fn document_repo() -> IdentityRepository {
        let store = Arc::new(DocumentStore::new(DocumentDatabase::new(), SECRET));
        IdentityRepository::new(store, SECRET)
    }

    async fn sql_repo() -> IdentityRepository {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        create_sqlite_schema(&db).await.expect("schema");
        let store = Arc::new(SqlStore::new(Arc::new(db), SECRET));
        IdentityRepository::new(store, SECRET)
    }

    fn new_identity(username: &str, password: &str) -> NewIdentity {
        NewIdentity {
            username: username.into(),
            password: password.into(),
            ..NewIdentity::default()
        }
    }

    #[test]
    fn email_pattern() {
        assert!(is_valid_email("someone@example.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("two@@example.com"));
        assert!(!is_valid_email("trailing@-example.com"));
    }

    #[test]
    fn phone_requires_prefix_and_email_is_fallback() {
        assert_eq!(
            check_email_and_phone("", "0901", ""),
            Err(ErrorKey::PhonePrefixCannotBeEmpty)
        );
        assert_eq!(check_email_and_phone("+84", "0901", ""), Ok(()));
        assert_eq!(
            check_email_and_phone("", "", ""),
            Err(ErrorKey::PhoneAndEmailCannotBeEmpty)
        );
        assert_eq!(check_email_and_phone("", "", "a@b.co"), Ok(()));
    }

    #[tokio::test]
    async fn facebook_twice_links_the_same_identity() {
        for repo in [document_repo(), sql_repo().await] {
            let first = repo.create_with_facebook("acme", "fb-1", "").await.unwrap();
            assert!(first.is_new);
            assert_eq!(first.identity.account_type, AccountType::External);
            assert!(!first.has_username_password());

            let second = repo.create_with_facebook("acme", "fb-1", "").await.unwrap();
            assert!(!second.is_new);
            assert_eq!(second.identity.id, first.identity.id);
            assert_eq!(second.identity.account_type, AccountType::External);
        }
    }

    #[tokio::test]
    async fn provider_login_promotes_internal_identity() {
        let repo = document_repo();
        let mut new = new_identity("carol", "pw");
        new.email = "carol@example.com".into();
        let created = repo.create("acme", new).await.unwrap();

        let linked = repo
            .create_with_apple("other-client", "apple-9", "carol@example.com")
            .await
            .unwrap();
        assert!(!linked.is_new);
        assert_eq!(linked.identity.id, created.identity.id);
        assert_eq!(linked.identity.account_type, AccountType::Both);
        assert_eq!(linked.identity.apple_id.as_deref(), Some("apple-9"));
        assert!(linked.has_username_password());

        let stored = repo
            .find(&IdentityFilter::by_id(&created.identity.id))
            .await
            .unwrap();
        assert_eq!(stored.account_type, AccountType::Both);
    }

    #[tokio::test]
    async fn external_identity_becomes_both_with_a_password() {
        let repo = document_repo();
        let resolved = repo.create_with_gmail("acme", "g@example.com").await.unwrap();
        assert_eq!(resolved.identity.account_type, AccountType::External);

        repo.set_username_password(Credential {
            id: resolved.identity.id.clone(),
            client_id: "acme".into(),
            username: "gina".into(),
            password: Some("pw".into()),
            ..Credential::default()
        })
        .await
        .unwrap();
        let stored = repo
            .find_in_client("acme", &resolved.identity.id)
            .await
            .unwrap();
        assert_eq!(stored.account_type, AccountType::Both);

        // A later provider login keeps it linked.
        let again = repo.create_with_gmail("acme", "g@example.com").await.unwrap();
        assert_eq!(again.identity.account_type, AccountType::Both);
        assert!(again.has_username_password());

        // Regressing through an administrative update is refused.
        let err = repo
            .update_user(IdentityUpdate {
                id: stored.id.clone(),
                client_id: "acme".into(),
                account_type: Some(AccountType::External),
                ..IdentityUpdate::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::InvalidRequest);
    }

    #[tokio::test]
    async fn account_kit_validation_and_phone_lookup() {
        let repo = document_repo();
        let err = repo
            .create_with_account_kit("acme", "", "", "", "")
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::AkIdCannotBeEmpty);
        let err = repo
            .create_with_account_kit("acme", "ak-1", "", "", "0901234")
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::PhonePrefixCannotBeEmpty);

        let first = repo
            .create_with_account_kit("acme", "ak-1", "", "+84", "0901234")
            .await
            .unwrap();
        assert!(first.is_new);
        let by_phone = repo
            .create_with_account_kit("acme", "ak-2", "k@example.com", "+84", "0901234")
            .await
            .unwrap();
        assert!(!by_phone.is_new);
        assert_eq!(by_phone.identity.id, first.identity.id);
        assert_eq!(by_phone.identity.account_kit_id.as_deref(), Some("ak-2"));
        assert_eq!(by_phone.identity.email.as_deref(), Some("k@example.com"));
        assert_eq!(by_phone.identity.account_type, AccountType::Both);
    }

    #[tokio::test]
    async fn concurrent_first_logins_converge() {
        for repo in [document_repo(), sql_repo().await] {
            let (a, b) = tokio::join!(
                repo.create_with_apple("acme", "apple-1", ""),
                repo.create_with_apple("acme", "apple-1", "")
            );
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_eq!(a.identity.id, b.identity.id);
            assert!(a.is_new ^ b.is_new);

            let stored = repo
                .find(&IdentityFilter {
                    apple_id: Some("apple-1".into()),
                    ..IdentityFilter::default()
                })
                .await
                .unwrap();
            assert_eq!(stored.id, a.identity.id);
        }
    }

    #[tokio::test]
    async fn sql_duplicate_provider_id_is_a_conflict() {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        create_sqlite_schema(&db).await.expect("schema");
        let store = SqlStore::new(Arc::new(db), SECRET);

        let assertion = ProviderAssertion {
            apple_id: "apple-2".into(),
            ..ProviderAssertion::default()
        };
        let first = Provider::Apple.new_identity("acme", &assertion);
        let second = Provider::Apple.new_identity("beta", &assertion);
        store.create(&first).await.unwrap();
        assert!(matches!(
            store.create(&second).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn direct_creation_is_unique_per_client() {
        for repo in [document_repo(), sql_repo().await] {
            repo.create("acme", new_identity("dave", "pw")).await.unwrap();
            let err = repo
                .create("acme", new_identity("dave", "other"))
                .await
                .unwrap_err();
            assert_eq!(err.key(), ErrorKey::UserExisted);
            assert!(repo.create("beta", new_identity("dave", "pw")).await.is_ok());

            let err = repo
                .create("acme", new_identity("", "pw"))
                .await
                .unwrap_err();
            assert_eq!(err.key(), ErrorKey::UsernameAndPasswordCannotBeEmpty);
        }
    }

    #[tokio::test]
    async fn direct_creation_without_password() {
        for repo in [document_repo(), sql_repo().await] {
            let created = repo
                .create(
                    "acme",
                    NewIdentity {
                        email: "nopass@example.com".into(),
                        ..NewIdentity::default()
                    },
                )
                .await
                .unwrap();
            assert!(created.is_new);
            assert_eq!(created.identity.account_type, AccountType::Internal);
            assert!(created.identity.password.is_empty());
            assert!(created.identity.salt.is_empty());
            assert!(!created.has_username_password());

            let stored = repo
                .find_in_client("acme", &created.identity.id)
                .await
                .unwrap();
            assert_eq!(stored.email.as_deref(), Some("nopass@example.com"));

            // No password means no credential login.
            let err = repo
                .login_with_credential(Credential {
                    client_id: "acme".into(),
                    email: Some("nopass@example.com".into()),
                    password: Some("anything".into()),
                    ..Credential::default()
                })
                .await
                .unwrap_err();
            assert_eq!(err.key(), ErrorKey::CannotLogin);
        }
    }

    #[tokio::test]
    async fn login_with_credential_hides_which_part_was_wrong() {
        let repo = sql_repo().await;
        repo.create("acme", new_identity("erin", "secret")).await.unwrap();

        let credential = |username: &str, password: &str, client: &str| Credential {
            client_id: client.into(),
            username: username.into(),
            password: Some(password.into()),
            ..Credential::default()
        };
        assert!(
            repo.login_with_credential(credential("erin", "secret", "acme"))
                .await
                .is_ok()
        );
        for bad in [
            credential("erin", "secreT", "acme"),
            credential("erim", "secret", "acme"),
            credential("erin", "secret", "beta"),
        ] {
            let err = repo.login_with_credential(bad).await.unwrap_err();
            assert_eq!(err.key(), ErrorKey::CannotLogin);
        }
    }

    #[tokio::test]
    async fn change_password_checks_old_password() {
        let repo = document_repo();
        let created = repo.create("acme", new_identity("finn", "old")).await.unwrap();
        let id = created.identity.id;

        let err = repo
            .change_password("acme", &id, "wrong", "new")
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::OldPassNotCorrect);
        repo.change_password("acme", &id, "old", "new").await.unwrap();

        let login = Credential {
            client_id: "acme".into(),
            username: "finn".into(),
            password: Some("new".into()),
            ..Credential::default()
        };
        assert!(repo.login_with_credential(login).await.is_ok());
    }

    #[tokio::test]
    async fn update_user_validates_and_checks_uniqueness() {
        let repo = document_repo();
        let mut with_email = new_identity("gary", "pw");
        with_email.email = "gary@example.com".into();
        repo.create("acme", with_email).await.unwrap();
        let hana = repo.create("acme", new_identity("hana", "pw")).await.unwrap();

        let update = |email: Option<&str>, password: Option<&str>, confirm: Option<&str>| {
            IdentityUpdate {
                id: hana.identity.id.clone(),
                client_id: "acme".into(),
                email: email.map(String::from),
                password: password.map(String::from),
                password_confirmation: confirm.map(String::from),
                ..IdentityUpdate::default()
            }
        };

        let err = repo
            .update_user(update(Some("not-an-email"), None, None))
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::EmailInvalid);
        let err = repo
            .update_user(update(None, Some("a"), Some("b")))
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::PassAndConfirmNotMatch);
        let err = repo
            .update_user(update(Some("gary@example.com"), None, None))
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::EmailExisted);

        let updated = repo
            .update_user(update(Some("hana@example.com"), Some("n"), Some("n")))
            .await
            .unwrap();
        assert_eq!(updated.email.as_deref(), Some("hana@example.com"));
    }

    #[tokio::test]
    async fn otp_expires_after_sixty_seconds_without_clearing() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let repo = document_repo().with_clock(clock.clone());
        let created = repo.create("acme", new_identity("ivan", "pw")).await.unwrap();
        let filter = IdentityFilter::by_id(&created.identity.id).in_client("acme");

        let otp = repo.generate_otp(&filter).await.unwrap();
        assert_eq!(otp.len(), 6);
        clock.advance(Duration::seconds(61));

        let login = IdentityFilter {
            otp_code: Some(otp.clone()),
            ..filter.clone()
        };
        let err = repo.login_with_otp(&login).await.unwrap_err();
        assert_eq!(err.key(), ErrorKey::OtpExpired);
        let stored = repo.find(&filter).await.unwrap();
        assert_eq!(stored.otp_code.as_deref(), Some(otp.as_str()));
    }

    #[tokio::test]
    async fn otp_can_only_be_used_once() {
        for repo in [document_repo(), sql_repo().await] {
            let created = repo.create("acme", new_identity("jo", "pw")).await.unwrap();
            let filter = IdentityFilter::by_id(&created.identity.id).in_client("acme");
            let otp = repo.generate_otp(&filter).await.unwrap();
            let login = IdentityFilter {
                otp_code: Some(otp),
                ..filter.clone()
            };
            let identity = repo.login_with_otp(&login).await.unwrap();
            assert_eq!(identity.id, created.identity.id);
            assert_eq!(identity.otp_code, None);
            let err = repo.login_with_otp(&login).await.unwrap_err();
            assert_eq!(err.key(), ErrorKey::DataNotFound);

            let err = repo.login_with_otp(&filter).await.unwrap_err();
            assert_eq!(err.key(), ErrorKey::InvalidRequest);
        }
    }

    #[tokio::test]
    async fn delete_is_scoped_to_client() {
        let repo = document_repo();
        let created = repo.create("acme", new_identity("kim", "pw")).await.unwrap();
        let err = repo.delete("beta", &created.identity.id).await.unwrap_err();
        assert_eq!(err.key(), ErrorKey::DataNotFound);
        repo.delete("acme", &created.identity.id).await.unwrap();
        assert!(repo.find_in_client("acme", &created.identity.id).await.is_err());
    }

    #[tokio::test]
    async fn empty_filters_are_rejected() {
        let repo = document_repo();
        let err = repo
            .find(&IdentityFilter::default().in_client("acme"))
            .await
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::InvalidRequest);
    }
}
