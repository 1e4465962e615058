//! User management endpoints mounted under `/oauth2`.
//!
//! Every route requires a bearer access token and acts inside the client the token
//! was issued to.

use axum::{
    Form, Json,
    extract::{FromRequest, Path, Query, Request, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::api::auth::BearerClient;
use crate::error::{ErrorKey, ErrorResponse, GrantError, IdentityError, IdentityErrorResponse};
use crate::identity::{
    AccountType, Credential, Identity, IdentityFilter, IdentityUpdate, NewIdentity, Provider,
    Resolved,
};
use crate::oauth2::OAuth2State;

pub const USERS_TAG: &str = "Users";

pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(find_user))
        .routes(routes!(generate_otp))
        .routes(routes!(login_with_otp))
        .routes(routes!(login))
        .routes(routes!(create_user))
        .routes(routes!(get_user, delete_user))
        .routes(routes!(update_user))
        .routes(routes!(change_password))
        .routes(routes!(set_username_password))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Grant(#[from] GrantError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Identity(err) => err.into_response(),
            ApiError::Grant(err) => err.into_response(),
        }
    }
}

/// Success envelope.
#[derive(Debug, Serialize, ToSchema)]
pub struct Data<T> {
    pub data: T,
}

fn data<T>(value: T) -> Json<Data<T>> {
    Json(Data { data: value })
}

/// Request body read as JSON or as a url-encoded form, depending on its content type.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = IdentityError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        let parsed = if is_json {
            Json::<T>::from_request(req, state)
                .await
                .map(|Json(value)| value)
                .map_err(|e| e.body_text())
        } else {
            Form::<T>::from_request(req, state)
                .await
                .map(|Form(value)| value)
                .map_err(|e| e.body_text())
        };
        parsed.map(Payload).map_err(|reason| {
            tracing::debug!(%reason, "rejected request body");
            IdentityError::Validation(ErrorKey::InvalidRequest)
        })
    }
}

/// Public view of an identity. Hashes, salts and OTP codes stay private.
#[derive(Debug, Serialize, ToSchema)]
pub struct IdentityView {
    pub id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone_prefix: Option<String>,
    pub phone: Option<String>,
    pub account_type: AccountType,
    pub fb_id: Option<String>,
    pub account_kit_id: Option<String>,
    pub apple_id: Option<String>,
    pub client_id: String,
    pub has_username_password: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<Identity> for IdentityView {
    fn from(identity: Identity) -> Self {
        Self {
            has_username_password: identity.has_username_password(),
            id: identity.id,
            username: identity.username,
            email: identity.email,
            phone_prefix: identity.phone_prefix,
            phone: identity.phone,
            account_type: identity.account_type,
            fb_id: identity.fb_id,
            account_kit_id: identity.account_kit_id,
            apple_id: identity.apple_id,
            client_id: identity.client_id,
            created_at: identity.created_at,
            updated_at: identity.updated_at,
        }
    }
}

/// Tokens handed to an identity that was created or logged in through this API.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserTokenResponse {
    pub oauth_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub is_new: bool,
    pub has_username_password: bool,
}

async fn user_token(
    state: &OAuth2State,
    caller: &BearerClient,
    resolved: Resolved,
) -> Result<Json<UserTokenResponse>, ApiError> {
    let tokens = state
        .engine
        .issue_for_identity(&caller.client_id, &resolved.identity)
        .await?;
    Ok(Json(UserTokenResponse {
        has_username_password: resolved.has_username_password(),
        oauth_id: resolved.identity.id,
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_in: tokens.expires_in,
        is_new: resolved.is_new,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUserQuery {
    /// `direct` (default), `facebook`, `account-kit`, `gmail` or `apple`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// Fields of every creation type; each type reads the ones it needs.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateUserForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone_prefix: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub fb_id: String,
    #[serde(default)]
    pub ak_id: String,
    #[serde(default)]
    pub apple_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub old_password: String,
    pub new_password: String,
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    post,
    path = "/find-user",
    tag = USERS_TAG,
    operation_id = "Find User",
    summary = "Find an identity of the calling client",
    request_body(content = IdentityFilter, description = "At least one lookup field is required"),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "Matching identity", body = Data<IdentityView>),
        (status = 400, description = "Empty filter", body = IdentityErrorResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
        (status = 404, description = "No match", body = IdentityErrorResponse),
    )
)]
pub async fn find_user(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Payload(filter): Payload<IdentityFilter>,
) -> Result<Json<Data<IdentityView>>, ApiError> {
    let identity = state
        .identities
        .find(&filter.in_client(&caller.client_id))
        .await?;
    Ok(data(identity.into()))
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    post,
    path = "/generate-otp",
    tag = USERS_TAG,
    operation_id = "Generate OTP",
    summary = "Issue a one-time code",
    description = "Generates a six digit code for the matching identity, valid for 60 seconds. \
                   Delivering it to the end-user is up to the caller.",
    request_body(content = IdentityFilter),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "The code", body = Data<String>),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
        (status = 404, description = "No match", body = IdentityErrorResponse),
    )
)]
pub async fn generate_otp(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Payload(filter): Payload<IdentityFilter>,
) -> Result<Json<Data<String>>, ApiError> {
    let otp = state
        .identities
        .generate_otp(&filter.in_client(&caller.client_id))
        .await?;
    Ok(data(otp))
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    post,
    path = "/login-otp",
    tag = USERS_TAG,
    operation_id = "Login With OTP",
    summary = "Exchange a one-time code for tokens",
    request_body(content = IdentityFilter, description = "Must carry `otp_code`"),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "Tokens for the identity", body = UserTokenResponse),
        (status = 401, description = "Expired code or invalid access token", body = IdentityErrorResponse),
        (status = 404, description = "Unknown or already used code", body = IdentityErrorResponse),
    )
)]
pub async fn login_with_otp(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Payload(filter): Payload<IdentityFilter>,
) -> Result<Json<UserTokenResponse>, ApiError> {
    let identity = state
        .identities
        .login_with_otp(&filter.in_client(&caller.client_id))
        .await?;
    let resolved = Resolved {
        identity,
        is_new: false,
    };
    user_token(&state, &caller, resolved).await
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    post,
    path = "/login",
    tag = USERS_TAG,
    operation_id = "Login",
    summary = "Log in with username, email or phone and a password",
    request_body(content = Credential),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "Tokens for the identity", body = UserTokenResponse),
        (status = 401, description = "Wrong credential", body = IdentityErrorResponse),
    )
)]
pub async fn login(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Payload(mut credential): Payload<Credential>,
) -> Result<Json<UserTokenResponse>, ApiError> {
    credential.client_id = caller.client_id.clone();
    let identity = state.identities.login_with_credential(credential).await?;
    let resolved = Resolved {
        identity,
        is_new: false,
    };
    user_token(&state, &caller, resolved).await
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id, kind = ?query.kind))]
#[utoipa::path(
    post,
    path = "/users",
    tag = USERS_TAG,
    operation_id = "Create User",
    summary = "Create or link an identity",
    description = "`direct` creates an internal identity from username, email or phone, with an optional password. \
                   The provider types link the assertion to an existing identity (matching provider id \
                   or email) or create an external one.",
    params(("type" = Option<String>, Query, description = "`direct` (default), `facebook`, `account-kit`, `gmail` or `apple`")),
    request_body(content = CreateUserForm, content_type = "application/x-www-form-urlencoded"),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "Tokens for the identity", body = UserTokenResponse),
        (status = 400, description = "Missing or invalid fields", body = IdentityErrorResponse),
        (status = 409, description = "Identity already exists", body = IdentityErrorResponse),
    )
)]
pub async fn create_user(
    State(state): State<OAuth2State>,
    Query(query): Query<CreateUserQuery>,
    caller: BearerClient,
    Payload(form): Payload<CreateUserForm>,
) -> Result<Json<UserTokenResponse>, ApiError> {
    let client_id = caller.client_id.as_str();
    let repo = &state.identities;
    let kind = query.kind.as_deref().unwrap_or("direct");
    let resolved = match (kind, Provider::parse(kind)) {
        ("direct", _) => {
            let new = NewIdentity {
                username: form.username,
                password: form.password,
                email: form.email,
                phone_prefix: form.phone_prefix,
                phone: form.phone,
            };
            repo.create(client_id, new).await?
        }
        (_, Some(Provider::Facebook)) => {
            repo.create_with_facebook(client_id, &form.fb_id, &form.email)
                .await?
        }
        (_, Some(Provider::AccountKit)) => {
            repo.create_with_account_kit(
                client_id,
                &form.ak_id,
                &form.email,
                &form.phone_prefix,
                &form.phone,
            )
            .await?
        }
        (_, Some(Provider::Gmail)) => repo.create_with_gmail(client_id, &form.email).await?,
        (_, Some(Provider::Apple)) => {
            repo.create_with_apple(client_id, &form.apple_id, &form.email)
                .await?
        }
        (_, None) => return Err(IdentityError::Validation(ErrorKey::InvalidRequest).into()),
    };
    user_token(&state, &caller, resolved).await
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    get,
    path = "/users/{id}",
    tag = USERS_TAG,
    operation_id = "Get User",
    params(("id" = String, Path, description = "Identity id")),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "The identity", body = Data<IdentityView>),
        (status = 404, description = "Unknown in this client", body = IdentityErrorResponse),
    )
)]
pub async fn get_user(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Path(id): Path<String>,
) -> Result<Json<Data<IdentityView>>, ApiError> {
    let identity = state
        .identities
        .find_in_client(&caller.client_id, &id)
        .await?;
    Ok(data(identity.into()))
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    delete,
    path = "/users/{id}",
    tag = USERS_TAG,
    operation_id = "Delete User",
    summary = "Delete an identity and its tokens",
    params(("id" = String, Path, description = "Identity id")),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "Deleted", body = Data<String>),
        (status = 404, description = "Unknown in this client", body = IdentityErrorResponse),
    )
)]
pub async fn delete_user(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Path(id): Path<String>,
) -> Result<Json<Data<&'static str>>, ApiError> {
    state.identities.delete(&caller.client_id, &id).await?;
    Ok(data("ok"))
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    method(put, post),
    path = "/users/{id}/update",
    tag = USERS_TAG,
    operation_id = "Update User",
    params(("id" = String, Path, description = "Identity id")),
    request_body(content = IdentityUpdate),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "The updated identity", body = Data<IdentityView>),
        (status = 400, description = "Invalid fields", body = IdentityErrorResponse),
        (status = 409, description = "Email or username taken in this client", body = IdentityErrorResponse),
    )
)]
pub async fn update_user(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Path(id): Path<String>,
    Payload(mut update): Payload<IdentityUpdate>,
) -> Result<Json<Data<IdentityView>>, ApiError> {
    update.id = id;
    update.client_id = caller.client_id.clone();
    let identity = state.identities.update_user(update).await?;
    Ok(data(identity.into()))
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    method(put, post),
    path = "/users/{id}/change-password",
    tag = USERS_TAG,
    operation_id = "Change Password",
    params(("id" = String, Path, description = "Identity id")),
    request_body(content = ChangePasswordRequest),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "Changed", body = Data<String>),
        (status = 400, description = "Old password is not correct", body = IdentityErrorResponse),
    )
)]
pub async fn change_password(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Path(id): Path<String>,
    Payload(request): Payload<ChangePasswordRequest>,
) -> Result<Json<Data<&'static str>>, ApiError> {
    state
        .identities
        .change_password(
            &caller.client_id,
            &id,
            &request.old_password,
            &request.new_password,
        )
        .await?;
    Ok(data("ok"))
}

#[tracing::instrument(skip_all, fields(client_id = %caller.client_id))]
#[utoipa::path(
    post,
    path = "/users/{id}/set-username-password",
    tag = USERS_TAG,
    operation_id = "Set Username And Password",
    params(("id" = String, Path, description = "Identity id")),
    request_body(content = Credential),
    security(("Bearer" = [])),
    responses(
        (status = 200, description = "Saved", body = Data<String>),
        (status = 409, description = "Username taken in this client", body = IdentityErrorResponse),
    )
)]
pub async fn set_username_password(
    State(state): State<OAuth2State>,
    caller: BearerClient,
    Path(id): Path<String>,
    Payload(mut credential): Payload<Credential>,
) -> Result<Json<Data<&'static str>>, ApiError> {
    credential.id = id;
    credential.client_id = caller.client_id.clone();
    state.identities.set_username_password(credential).await?;
    Ok(data("ok"))
}
