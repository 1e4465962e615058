//! Bearer token extractor for the user management endpoints.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::GrantError;
use crate::oauth2::OAuth2State;
use crate::oauth2::requester::Requester;

/// The client on whose behalf a request acts, taken from its access token.
///
/// ```ignore
/// async fn handler(caller: BearerClient) -> String {
///     caller.client_id
/// }
/// ```
#[derive(Debug, Clone)]
pub struct BearerClient {
    pub client_id: String,
    pub requester: Requester,
}

pub(crate) fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<OAuth2State> for BearerClient {
    type Rejection = GrantError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &OAuth2State,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            tracing::debug!("missing bearer token");
            return Err(GrantError::RequestUnauthorized);
        };
        let requester = state.engine.authorize_bearer(token).await?;
        Ok(Self {
            client_id: requester.client.id.clone(),
            requester,
        })
    }
}
