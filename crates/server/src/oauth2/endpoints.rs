//! OAuth2 protocol endpoints:
//! - Token endpoint
//! - Token introspection (RFC 7662)
//! - Token revocation (RFC 7009)

use axum::{
    Form, Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::error::{ErrorResponse, GrantError};
use crate::oauth2::OAUTH2_TAG;
use crate::oauth2::client::OAuthClient;
use crate::oauth2::engine::{IntrospectionResponse, TokenResponse};
use crate::oauth2::requester::FormData;
use crate::oauth2::state::OAuth2State;

pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(token))
        .routes(routes!(introspect))
        .routes(routes!(revoke))
        .with_state(state)
}

/// Token request parameters. Any other field is kept in the request's form snapshot.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<String>,
    /// Space separated.
    pub scope: Option<String>,
    /// Space separated.
    pub audience: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenLookupRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Basic auth first, then the `client_id`/`client_secret` form fields.
pub(crate) fn extract_client_credentials(
    headers: &HeaderMap,
    form: &FormData,
) -> Option<(String, String)> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        && let Ok(decoded) = STANDARD.decode(auth)
        && let Ok(creds) = String::from_utf8(decoded)
        && let Some((id, secret)) = creds.split_once(':')
    {
        return Some((decode_component(id), decode_component(secret)));
    }

    let id = form.get("client_id").filter(|id| !id.is_empty())?;
    let secret = form.get("client_secret").unwrap_or_default();
    Some((id.to_string(), secret.to_string()))
}

/// RFC 6749 section 2.3.1 form-encodes both halves of the Basic credentials.
fn decode_component(raw: &str) -> String {
    url::form_urlencoded::parse(format!("v={raw}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

async fn authenticated_client(
    state: &OAuth2State,
    headers: &HeaderMap,
    form: &FormData,
) -> Result<OAuthClient, GrantError> {
    let (id, secret) = extract_client_credentials(headers, form).ok_or(GrantError::InvalidClient)?;
    state.engine.authenticate_client(&id, &secret).await
}

/// OAuth2 token endpoint.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Issue tokens",
    description = "Issues tokens for the `password`, `refresh_token` and `client_credentials` grants.\n\n\
                   A refresh token is only returned when the `offline` or `offline_access` scope was granted. \
                   Refreshing revokes every token of the original request.\n\n\
                   **Client authentication:** HTTP Basic or `client_id` and `client_secret` in the body.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters"
    ),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid request, grant or scope", body = ErrorResponse),
        (status = 401, description = "Unknown client, bad client secret or wrong resource owner credentials", body = ErrorResponse),
        (status = 403, description = "Client may not use the grant type", body = ErrorResponse),
    )
)]
pub async fn token(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Json<TokenResponse>, GrantError> {
    let form: FormData = form.into_iter().collect();
    let client = authenticated_client(&state, &headers, &form).await?;
    let response = state.engine.token(client, form).await?;
    Ok(Json(response))
}

/// Token introspection endpoint (RFC 7662).
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/introspect",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Introspect Token",
    summary = "Describe a token",
    description = "Returns the metadata of an access or refresh token. Unknown, expired and revoked \
                   tokens answer `{\"active\": false}`.",
    request_body(
        content = TokenLookupRequest,
        content_type = "application/x-www-form-urlencoded",
    ),
    responses(
        (status = 200, description = "Token metadata", body = IntrospectionResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn introspect(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Json<IntrospectionResponse>, GrantError> {
    let form: FormData = form.into_iter().collect();
    let client = authenticated_client(&state, &headers, &form).await?;
    let token = form
        .get("token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GrantError::InvalidRequest("token is required".into()))?;
    Ok(Json(state.engine.introspect(&client, token).await?))
}

/// Token revocation endpoint (RFC 7009).
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/revoke",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Revoke Token",
    summary = "Revoke an access or refresh token",
    description = "Revokes every token issued from the same request as the given one.\n\n\
                   Returns 200 OK even if the token was already revoked or never existed (RFC 7009).",
    request_body(
        content = TokenLookupRequest,
        content_type = "application/x-www-form-urlencoded",
    ),
    responses(
        (status = 200, description = "Token revoked (or was already invalid)"),
        (status = 400, description = "Missing token parameter", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn revoke(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Response, GrantError> {
    let form: FormData = form.into_iter().collect();
    let client = authenticated_client(&state, &headers, &form).await?;
    let token = form
        .get("token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GrantError::InvalidRequest("token is required".into()))?;
    state.engine.revoke(&client, token).await?;
    Ok(StatusCode::OK.into_response())
}
