//! Resource owner password credentials grant (RFC 6749 section 4.3).

use crate::error::{GrantError, StoreError};
use crate::oauth2::arguments::{audience_matches, hierarchic_scope_match};
use crate::oauth2::engine::{TokenIssuer, TokenLifetimes, TokenResponse};
use crate::oauth2::requester::{Requester, TokenKind};

pub const GRANT_TYPE: &str = "password";

/// Scopes that make a grant hand out a refresh token.
pub const OFFLINE_SCOPES: [&str; 2] = ["offline", "offline_access"];

#[derive(Clone)]
pub struct PasswordGrantHandler {
    issuer: TokenIssuer,
    lifetimes: TokenLifetimes,
}

impl PasswordGrantHandler {
    pub fn new(issuer: TokenIssuer, lifetimes: TokenLifetimes) -> Self {
        Self { issuer, lifetimes }
    }

    /// Validates the request and binds the authenticated identity to its session.
    ///
    /// Fails with [`GrantError::UnknownRequest`] when the request is for another grant.
    #[tracing::instrument(skip_all, fields(client_id = %requester.client.id, request_id = %requester.id))]
    pub async fn handle_token_endpoint_request(
        &self,
        requester: &mut Requester,
    ) -> Result<(), GrantError> {
        if !requester.grant_types.exact(GRANT_TYPE) {
            return Err(GrantError::UnknownRequest);
        }
        let client = &requester.client;
        if !client.grant_types().has(GRANT_TYPE) {
            return Err(GrantError::InvalidGrant(
                "the client is not allowed to use the password grant".into(),
            ));
        }

        let allowed = client.scopes();
        if let Some(scope) = requester
            .requested_scope
            .iter()
            .find(|scope| !hierarchic_scope_match(&allowed, scope))
        {
            return Err(GrantError::InvalidScope(format!(
                "the client is not allowed to request scope '{scope}'"
            )));
        }
        audience_matches(&client.audience, &requester.requested_audience)
            .map_err(GrantError::InvalidRequest)?;

        let username = requester.form.get("username").unwrap_or_default().to_string();
        let password = requester.form.get("password").unwrap_or_default().to_string();
        if username.is_empty() || password.is_empty() {
            return Err(GrantError::InvalidRequest(
                "username and password are required".into(),
            ));
        }

        let identity = match self.issuer.store().authenticate(&username, &password).await {
            Ok(identity) => identity,
            Err(StoreError::NotFound) => {
                tracing::debug!("password grant rejected");
                return Err(GrantError::RequestUnauthorized);
            }
            Err(err) => return Err(GrantError::ServerError(err.to_string())),
        };
        requester.form.remove("password");

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
        Ok(())
    }

    /// Issues the access token, preceded by a refresh token when an offline scope
    /// was granted.
    pub async fn populate_token_endpoint_response(
        &self,
        requester: &Requester,
    ) -> Result<TokenResponse, GrantError> {
        if !requester.grant_types.exact(GRANT_TYPE) {
            return Err(GrantError::UnknownRequest);
        }
        let with_refresh = requester.granted_scope.has_one_of(&OFFLINE_SCOPES);
        self.issuer.issue(requester, with_refresh).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::document_db::DocumentDatabase;
    use crate::identity::{IdentityRepository, NewIdentity};
    use crate::oauth2::arguments::Arguments;
    use crate::oauth2::client::{ClientManager, OAuthClient};
    use crate::oauth2::requester::Session;
    use crate::oauth2::strategy::HmacTokenStrategy;
    use crate::store::{DocumentStore, GrantStore};
    use std::sync::Arc;

    const SECRET: &str = "a-system-secret-of-at-least-32-characters";

    async fn setup() -> (PasswordGrantHandler, Arc<DocumentStore>, OAuthClient) {
        let store = Arc::new(DocumentStore::new(DocumentDatabase::new(), SECRET));
        let mut client = OAuthClient::new("acme", "Acme");
        client.grant_types = vec!["password".into(), "refresh_token".into()];
        client.scope = "root offline".into();
        store.create_client(&client).await.unwrap();

        IdentityRepository::new(store.clone(), SECRET)
            .create(
                "acme",
                NewIdentity {
                    username: "alice".into(),
                    password: "wonderland".into(),
                    email: "alice@example.com".into(),
                    ..NewIdentity::default()
                },
            )
            .await
            .unwrap();

        let issuer = TokenIssuer::new(
            store.clone(),
            HmacTokenStrategy::new(SECRET),
            Arc::new(SystemClock),
        );
        (
            PasswordGrantHandler::new(issuer, TokenLifetimes::default()),
            store,
            client,
        )
    }

    fn request(client: &OAuthClient, scope: &str, password: &str) -> Requester {
        let mut requester = Requester::new(client.clone(), Session::default());
        requester.grant_types = Arguments::from_space_delimited("password");
        requester.requested_scope = Arguments::from_space_delimited(scope);
        requester.form = [
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", password),
        ]
        .into_iter()
        .collect();
        requester
    }

    #[tokio::test]
    async fn other_grant_types_are_not_handled() {
        let (handler, _, client) = setup().await;
        let mut requester = request(&client, "offline", "wonderland");
        requester.grant_types = Arguments::from_space_delimited("client_credentials");
        assert!(matches!(
            handler.handle_token_endpoint_request(&mut requester).await,
            Err(GrantError::UnknownRequest)
        ));
    }

    #[tokio::test]
    async fn client_must_allow_password_grant() {
        let (handler, _, mut client) = setup().await;
        client.grant_types = vec!["client_credentials".into()];
        let mut requester = request(&client, "offline", "wonderland");
        assert!(matches!(
            handler.handle_token_endpoint_request(&mut requester).await,
            Err(GrantError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn scopes_follow_the_hierarchy() {
        let (handler, _, client) = setup().await;
        let mut requester = request(&client, "root.read offline", "wonderland");
        handler
            .handle_token_endpoint_request(&mut requester)
            .await
            .unwrap();

        let mut requester = request(&client, "admin", "wonderland");
        assert!(matches!(
            handler.handle_token_endpoint_request(&mut requester).await,
            Err(GrantError::InvalidScope(_))
        ));
    }

    #[tokio::test]
    async fn wrong_password_is_request_unauthorized() {
        let (handler, _, client) = setup().await;
        let mut requester = request(&client, "offline", "wonderlant");
        assert!(matches!(
            handler.handle_token_endpoint_request(&mut requester).await,
            Err(GrantError::RequestUnauthorized)
        ));
        let mut requester = request(&client, "offline", "");
        assert!(matches!(
            handler.handle_token_endpoint_request(&mut requester).await,
            Err(GrantError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn session_is_bound_and_password_dropped() {
        let (handler, _, client) = setup().await;
        let mut requester = request(&client, "offline", "wonderland");
        handler
            .handle_token_endpoint_request(&mut requester)
            .await
            .unwrap();
        assert_eq!(requester.form.get("password"), None);
        assert_eq!(requester.session.username, "alice");
        assert_eq!(
            requester.session.extra_str("email"),
            Some("alice@example.com")
        );
        assert_eq!(
            requester.session.extra_str("user_id"),
            Some(requester.session.subject.as_str())
        );
        assert!(requester.session.expires_at(TokenKind::AccessToken).is_some());
        assert!(requester.session.expires_at(TokenKind::RefreshToken).is_some());
    }

    #[tokio::test]
    async fn refresh_token_only_with_offline_scope() {
        let (handler, store, client) = setup().await;

        let mut requester = request(&client, "offline", "wonderland");
        handler
            .handle_token_endpoint_request(&mut requester)
            .await
            .unwrap();
        requester.grant_scope("offline");
        let response = handler
            .populate_token_endpoint_response(&requester)
            .await
            .unwrap();
        let refresh = response.refresh_token.expect("refresh token issued");
        let signature = refresh.split_once('.').unwrap().1;
        let stored = store.get_token(signature).await.unwrap();
        assert_eq!(stored.kind, TokenKind::RefreshToken);
        assert!(stored.requester.granted_scope.has("offline"));

        let mut requester = request(&client, "root", "wonderland");
        handler
            .handle_token_endpoint_request(&mut requester)
            .await
            .unwrap();
        requester.grant_scope("root");
        let response = handler
            .populate_token_endpoint_response(&requester)
            .await
            .unwrap();
        assert!(response.refresh_token.is_none());
        assert_eq!(response.token_type, "bearer");
    }
}
