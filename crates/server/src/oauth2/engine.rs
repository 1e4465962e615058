//! Token endpoint dispatch, introspection, revocation and bearer checks.

use serde::Serialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use crate::clock::{Clock, SystemClock};
use crate::config::OAuth2Config;
use crate::error::{GrantError, StoreError};
use crate::identity::Identity;
use crate::oauth2::arguments::{Arguments, audience_matches, hierarchic_scope_match};
use crate::oauth2::client::OAuthClient;
use crate::oauth2::password_grant::{self, OFFLINE_SCOPES, PasswordGrantHandler};
use crate::oauth2::requester::{FormData, Requester, Session, TokenKind};
use crate::oauth2::strategy::HmacTokenStrategy;
use crate::store::{GrantStore, StoredToken};

/// Scopes requested on behalf of identities that log in through the user API.
pub const USER_REQUESTED_SCOPE: &str = "root offline";
pub const USER_GRANTED_SCOPE: &str = "offline";

#[derive(Debug, Clone, Copy)]
pub struct TokenLifetimes {
    pub access: Duration,
    /// `None` leaves refresh tokens without an expiry.
    pub refresh: Option<Duration>,
    pub refreshed_access: Duration,
    pub client_credentials: Duration,
}

impl From<&OAuth2Config> for TokenLifetimes {
    fn from(config: &OAuth2Config) -> Self {
        Self {
            access: Duration::seconds(config.access_token_lifetime),
            refresh: (config.refresh_token_lifetime > 0)
                .then(|| Duration::seconds(config.refresh_token_lifetime)),
            refreshed_access: Duration::seconds(config.refreshed_access_token_lifetime),
            client_credentials: Duration::seconds(config.client_credentials_lifetime),
        }
    }
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self::from(&OAuth2Config::default())
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

/// RFC 7662 introspection answer. Inactive tokens carry nothing but `active`.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl IntrospectionResponse {
    fn inactive() -> Self {
        Self::default()
    }

    fn from_token(token: &StoredToken) -> Self {
        let requester = &token.requester;
        let session = &requester.session;
        let extra = |key: &str| session.extra_str(key).map(str::to_string);
        Self {
            active: true,
            client_id: Some(requester.client.id.clone()),
            scope: Some(requester.granted_scope.join(" ")),
            aud: Some(requester.granted_audience.clone().into_vec()),
            exp: token.expires_at.map(OffsetDateTime::unix_timestamp),
            iat: Some(requester.requested_at.unix_timestamp()),
            sub: Some(session.subject.clone()).filter(|s| !s.is_empty()),
            username: Some(session.username.clone()).filter(|u| !u.is_empty()),
            email: extra("email"),
            user_id: extra("user_id"),
            token_type: Some(token.kind.as_str().to_string()),
        }
    }
}

/// Mints tokens and persists them by signature.
#[derive(Clone)]
pub struct TokenIssuer {
    store: Arc<dyn GrantStore>,
    strategy: HmacTokenStrategy,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(store: Arc<dyn GrantStore>, strategy: HmacTokenStrategy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            strategy,
            clock,
        }
    }

    pub fn store(&self) -> &dyn GrantStore {
        self.store.as_ref()
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// The refresh token, when asked for, is stored before the access token.
    pub async fn issue(
        &self,
        requester: &Requester,
        with_refresh: bool,
    ) -> Result<TokenResponse, GrantError> {
        let refresh_token = if with_refresh {
            let (token, signature) = self.strategy.generate()?;
            self.store
                .create_token(TokenKind::RefreshToken, &signature, requester)
                .await?;
            Some(token)
        } else {
            None
        };

        let (access_token, signature) = self.strategy.generate()?;
        self.store
            .create_token(TokenKind::AccessToken, &signature, requester)
            .await?;

        let expires_in = requester
            .session
            .expires_at(TokenKind::AccessToken)
            .map_or(0, |at| (at - self.now()).whole_seconds().max(0));
        tracing::info!(
            client_id = %requester.client.id,
            request_id = %requester.id,
            refresh = with_refresh,
            "issued tokens"
        );
        Ok(TokenResponse {
            access_token,
            token_type: "bearer".to_string(),
            expires_in,
            refresh_token,
            scope: requester.granted_scope.join(" "),
        })
    }
}

/// The protocol engine behind the token, introspection and revocation endpoints.
#[derive(Clone)]
pub struct OAuth2Engine {
    issuer: TokenIssuer,
    strategy: HmacTokenStrategy,
    lifetimes: TokenLifetimes,
    password: PasswordGrantHandler,
}

impl OAuth2Engine {
    pub fn new(store: Arc<dyn GrantStore>, system_secret: &str, lifetimes: TokenLifetimes) -> Self {
        Self::with_clock(store, system_secret, lifetimes, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn GrantStore>,
        system_secret: &str,
        lifetimes: TokenLifetimes,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let strategy = HmacTokenStrategy::new(system_secret);
        let issuer = TokenIssuer::new(store, strategy.clone(), clock);
        Self {
            password: PasswordGrantHandler::new(issuer.clone(), lifetimes),
            issuer,
            strategy,
            lifetimes,
        }
    }

    fn store(&self) -> &dyn GrantStore {
        self.issuer.store()
    }

    /// Resolves and verifies the calling client.
    #[tracing::instrument(skip(self, secret))]
    pub async fn authenticate_client(
        &self,
        client_id: &str,
        secret: &str,
    ) -> Result<OAuthClient, GrantError> {
        let client = match self.store().get_client(client_id).await {
            Ok(client) => client,
            Err(StoreError::NotFound) => return Err(GrantError::InvalidClient),
            Err(err) => return Err(GrantError::ServerError(err.to_string())),
        };
        let authenticated = if client.is_public() {
            secret.is_empty()
        } else {
            client.verify_secret(secret)
        };
        if !authenticated {
            tracing::debug!("client authentication failed");
            return Err(GrantError::InvalidClient);
        }
        Ok(client)
    }

    /// Handles a token request from an authenticated client.
    #[tracing::instrument(skip_all, fields(client_id = %client.id, grant_type = tracing::field::Empty))]
    pub async fn token(
        &self,
        client: OAuthClient,
        form: FormData,
    ) -> Result<TokenResponse, GrantError> {
        let grant_type = form.get("grant_type").unwrap_or_default().to_string();
        tracing::Span::current().record("grant_type", grant_type.as_str());
        match grant_type.as_str() {
            "" => Err(GrantError::InvalidRequest("grant_type is required".into())),
            password_grant::GRANT_TYPE => self.password_grant(client, form).await,
            "refresh_token" => self.refresh_grant(client, form).await,
            "client_credentials" => self.client_credentials_grant(client, form).await,
            _ => Err(GrantError::UnsupportedGrantType),
        }
    }

    fn new_requester(&self, client: OAuthClient, grant_type: &str, form: FormData) -> Requester {
        let mut requester = Requester::new(client, Session::default());
        requester.requested_at = self.issuer.now();
        requester.grant_types = Arguments::from_space_delimited(grant_type);
        requester.requested_scope = Arguments::from_space_delimited(form.get("scope").unwrap_or_default());
        requester.requested_audience =
            Arguments::from_space_delimited(form.get("audience").unwrap_or_default());
        requester.form = form;
        requester
    }

    async fn password_grant(
        &self,
        client: OAuthClient,
        form: FormData,
    ) -> Result<TokenResponse, GrantError> {
        let mut requester = self.new_requester(client, password_grant::GRANT_TYPE, form);
        self.password
            .handle_token_endpoint_request(&mut requester)
            .await?;
        for scope in OFFLINE_SCOPES {
            if requester.requested_scope.has(scope) {
                requester.grant_scope(scope);
            }
        }
        for audience in requester.requested_audience.clone().iter() {
            requester.grant_audience(audience);
        }
        self.password
            .populate_token_endpoint_response(&requester)
            .await
    }

    async fn refresh_grant(
        &self,
        client: OAuthClient,
        mut form: FormData,
    ) -> Result<TokenResponse, GrantError> {
        if !client.grant_types().has("refresh_token") {
            return Err(GrantError::UnauthorizedClient);
        }
        let token = form.get("refresh_token").unwrap_or_default().to_string();
        if token.is_empty() {
            return Err(GrantError::InvalidRequest("refresh_token is required".into()));
        }
        form.remove("refresh_token");

        let signature = self.strategy.validate(&token)?;
        let stored = self.store().get_token(signature).await?;
        let now = self.issuer.now();
        if stored.kind != TokenKind::RefreshToken {
            return Err(GrantError::InvalidGrant("token is not a refresh token".into()));
        }
        if stored.requester.client.id != client.id {
            return Err(GrantError::InvalidGrant(
                "refresh token was issued to another client".into(),
            ));
        }
        if stored.is_expired(now) {
            return Err(GrantError::InvalidGrant("refresh token expired".into()));
        }

        let revoked = self.store().revoke_by_request_id(&stored.requester.id).await?;
        tracing::debug!(request_id = %stored.requester.id, revoked, "rotated refresh token");

        let previous = stored.requester;
        let mut requester = Requester {
            requested_at: now,
            client,
            grant_types: Arguments::from_space_delimited("refresh_token"),
            form,
            ..previous
        };
        requester
            .session
            .set_expires_at(TokenKind::AccessToken, now + self.lifetimes.refreshed_access);
        if let Some(refresh) = self.lifetimes.refresh {
            requester
                .session
                .set_expires_at(TokenKind::RefreshToken, now + refresh);
        }
        self.issuer.issue(&requester, true).await
    }

    async fn client_credentials_grant(
        &self,
        client: OAuthClient,
        form: FormData,
    ) -> Result<TokenResponse, GrantError> {
        if !client.grant_types().has("client_credentials") {
            return Err(GrantError::UnauthorizedClient);
        }
        if client.is_public() {
            return Err(GrantError::InvalidClient);
        }
        let mut requester = self.new_requester(client, "client_credentials", form);
        let allowed = requester.client.scopes();
        for scope in requester.requested_scope.clone().iter() {
            if !hierarchic_scope_match(&allowed, scope) {
                return Err(GrantError::InvalidScope(format!(
                    "the client is not allowed to request scope '{scope}'"
                )));
            }
            requester.grant_scope(scope);
        }
        audience_matches(&requester.client.audience, &requester.requested_audience)
            .map_err(GrantError::InvalidRequest)?;
        for audience in requester.requested_audience.clone().iter() {
            requester.grant_audience(audience);
        }
        requester.session.subject = requester.client.id.clone();
        let now = self.issuer.now();
        requester
            .session
            .set_expires_at(TokenKind::AccessToken, now + self.lifetimes.client_credentials);
        self.issuer.issue(&requester, false).await
    }

    /// Issues tokens for an identity that authenticated through the user API, as
    /// if it had used the password grant of `client_id`.
    #[tracing::instrument(skip(self, identity), fields(identity_id = %identity.id))]
    pub async fn issue_for_identity(
        &self,
        client_id: &str,
        identity: &Identity,
    ) -> Result<TokenResponse, GrantError> {
        let client = match self.store().get_client(client_id).await {
            Ok(client) => client,
            Err(StoreError::NotFound) => return Err(GrantError::InvalidClient),
            Err(err) => return Err(GrantError::ServerError(err.to_string())),
        };
        let form: FormData = [
            ("grant_type", password_grant::GRANT_TYPE),
            ("username", identity.username_or_empty()),
            ("scope", USER_REQUESTED_SCOPE),
        ]
        .into_iter()
        .collect();
        let mut requester = self.new_requester(client, password_grant::GRANT_TYPE, form);
        requester.grant_scope(USER_GRANTED_SCOPE);

        let now = self.issuer.now();
        let session = &mut requester.session;
        session.subject = identity.id.clone();
        session.set_user_id(&identity.id);
        session.set_email(identity.email_or_empty());
        session.set_username(identity.username_or_empty());
        session.set_expires_at(TokenKind::AccessToken, now + self.lifetimes.access);
        if let Some(refresh) = self.lifetimes.refresh {
            session.set_expires_at(TokenKind::RefreshToken, now + refresh);
        }
        self.issuer.issue(&requester, true).await
    }

    /// Looks up a live token. Anything unusable is `None`.
    async fn active_token(&self, token: &str) -> Result<Option<StoredToken>, GrantError> {
        let Ok(signature) = self.strategy.validate(token) else {
            return Ok(None);
        };
        match self.store().get_token(signature).await {
            Ok(stored) if stored.is_expired(self.issuer.now()) => Ok(None),
            Ok(stored) => Ok(Some(stored)),
            Err(StoreError::NotFound) => Ok(None),
            Err(err) => Err(GrantError::ServerError(err.to_string())),
        }
    }

    #[tracing::instrument(skip_all, fields(client_id = %client.id))]
    pub async fn introspect(
        &self,
        client: &OAuthClient,
        token: &str,
    ) -> Result<IntrospectionResponse, GrantError> {
        Ok(match self.active_token(token).await? {
            Some(stored) => IntrospectionResponse::from_token(&stored),
            None => IntrospectionResponse::inactive(),
        })
    }

    /// Revokes everything issued from the token's request (RFC 7009). Unknown
    /// tokens are not an error.
    #[tracing::instrument(skip_all, fields(client_id = %client.id))]
    pub async fn revoke(&self, client: &OAuthClient, token: &str) -> Result<(), GrantError> {
        let Ok(signature) = self.strategy.validate(token) else {
            return Ok(());
        };
        let stored = match self.store().get_token(signature).await {
            Ok(stored) => stored,
            Err(StoreError::NotFound) => return Ok(()),
            Err(err) => return Err(GrantError::ServerError(err.to_string())),
        };
        if stored.requester.client.id != client.id {
            return Err(GrantError::UnauthorizedClient);
        }
        let revoked = self.store().revoke_by_request_id(&stored.requester.id).await?;
        tracing::info!(request_id = %stored.requester.id, revoked, "revoked tokens");
        Ok(())
    }

    /// Requester behind a live access token presented as a bearer credential.
    pub async fn authorize_bearer(&self, token: &str) -> Result<Requester, GrantError> {
        match self.active_token(token).await? {
            Some(stored) if stored.kind == TokenKind::AccessToken => Ok(stored.requester),
            _ => Err(GrantError::RequestUnauthorized),
        }
    }
}
