use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sea_orm::{DbErr, SqlErr};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::document_db::DocumentError;
use crate::oauth2::requester::Requester;

/// Failures raised by the grant, client and identity stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    /// The authorization code exists but was invalidated. The decoded requester is
    /// carried so the caller can revoke everything issued from it.
    #[error("authorization code has been invalidated")]
    InvalidatedCode(Box<Requester>),
    #[error("record conflicts with an existing one: {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Codec(String),
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(detail)) => StoreError::Conflict(detail),
            _ => match err {
                DbErr::RecordNotFound(_) | DbErr::RecordNotUpdated => StoreError::NotFound,
                other => StoreError::Backend(other.to_string()),
            },
        }
    }
}

impl From<DocumentError> for StoreError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::DuplicateKey(index) => StoreError::Conflict(index),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

impl From<getrandom::Error> for StoreError {
    fn from(err: getrandom::Error) -> Self {
        StoreError::Backend(format!("random source unavailable: {err}"))
    }
}

/// Stable machine keys reported to clients of the identity endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKey {
    DataNotFound,
    OldPassNotCorrect,
    PassAndConfirmNotMatch,
    UsernameAndPasswordCannotBeEmpty,
    UserExisted,
    UsernameExisted,
    EmailExisted,
    FbIdCannotBeEmpty,
    AkIdCannotBeEmpty,
    AppleIdCannotBeEmpty,
    PhonePrefixCannotBeEmpty,
    EmailCannotBeEmpty,
    PhoneAndEmailCannotBeEmpty,
    EmailInvalid,
    UsernameCannotBeEmpty,
    OtpExpired,
    CannotLogin,
    InvalidRequest,
    Db,
}

impl ErrorKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKey::DataNotFound => "ErrDataNotFound",
            ErrorKey::OldPassNotCorrect => "ErrOldPassNotCorrect",
            ErrorKey::PassAndConfirmNotMatch => "ErrPassAndConfirmNotMatch",
            ErrorKey::UsernameAndPasswordCannotBeEmpty => "ErrUsernameAndPasswordCannotBeEmpty",
            ErrorKey::UserExisted => "ErrUserExisted",
            ErrorKey::UsernameExisted => "ErrUsernameExisted",
            ErrorKey::EmailExisted => "ErrEmailExisted",
            ErrorKey::FbIdCannotBeEmpty => "ErrFbIdCannotBeEmpty",
            ErrorKey::AkIdCannotBeEmpty => "ErrAKIdCannotBeEmpty",
            ErrorKey::AppleIdCannotBeEmpty => "ErrAppleIdCannotBeEmpty",
            ErrorKey::PhonePrefixCannotBeEmpty => "ErrPhonePrefixCannotBeEmpty",
            ErrorKey::EmailCannotBeEmpty => "ErrEmailCannotBeEmpty",
            ErrorKey::PhoneAndEmailCannotBeEmpty => "ErrPhoneAndEmailCannotBeEmpty",
            ErrorKey::EmailInvalid => "ErrEmailInvalid",
            ErrorKey::UsernameCannotBeEmpty => "ErrUsernameCannotBeEmpty",
            ErrorKey::OtpExpired => "ErrOTPExpired",
            ErrorKey::CannotLogin => "ErrCannotLogin",
            ErrorKey::InvalidRequest => "ErrInvalidRequest",
            ErrorKey::Db => "ErrDB",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorKey::DataNotFound => "data not found",
            ErrorKey::OldPassNotCorrect => "old password is not correct",
            ErrorKey::PassAndConfirmNotMatch => "password & password confirmation not match",
            ErrorKey::UsernameAndPasswordCannotBeEmpty => "username and password cannot be empty",
            ErrorKey::UserExisted => "user is existed",
            ErrorKey::UsernameExisted => "username is existed",
            ErrorKey::EmailExisted => "email is existed",
            ErrorKey::FbIdCannotBeEmpty => "Facebook id cannot be empty",
            ErrorKey::AkIdCannotBeEmpty => "AccountKit id cannot be empty",
            ErrorKey::AppleIdCannotBeEmpty => "Apple id cannot be empty",
            ErrorKey::PhonePrefixCannotBeEmpty => "phone prefix cannot be empty",
            ErrorKey::EmailCannotBeEmpty => "email cannot be empty",
            ErrorKey::PhoneAndEmailCannotBeEmpty => "phone or email must be have a value",
            ErrorKey::EmailInvalid => "email is not valid format example@email.com",
            ErrorKey::UsernameCannotBeEmpty => "username cannot be empty",
            ErrorKey::OtpExpired => "otp expired",
            ErrorKey::CannotLogin => "cannot login, wrong credential",
            ErrorKey::InvalidRequest => "invalid request",
            ErrorKey::Db => "something went wrong with the database",
        }
    }
}

impl std::fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures raised by the identity repository.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("{}", .0.message())]
    NotFound(ErrorKey),
    #[error("{}", .0.message())]
    Conflict(ErrorKey),
    #[error("{}", .0.message())]
    Validation(ErrorKey),
    #[error("{}", .0.message())]
    Unauthorized(ErrorKey),
    #[error("identity storage failed: {0}")]
    Backend(#[source] StoreError),
}

impl IdentityError {
    pub fn key(&self) -> ErrorKey {
        match self {
            IdentityError::NotFound(key)
            | IdentityError::Conflict(key)
            | IdentityError::Validation(key)
            | IdentityError::Unauthorized(key) => *key,
            IdentityError::Backend(_) => ErrorKey::Db,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            IdentityError::NotFound(_) => StatusCode::NOT_FOUND,
            IdentityError::Conflict(_) => StatusCode::CONFLICT,
            IdentityError::Validation(_) => StatusCode::BAD_REQUEST,
            IdentityError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            IdentityError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for IdentityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => IdentityError::NotFound(ErrorKey::DataNotFound),
            StoreError::Conflict(_) => IdentityError::Conflict(ErrorKey::UserExisted),
            other => IdentityError::Backend(other),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IdentityErrorResponse {
    pub status_code: u16,
    pub error_key: String,
    pub message: String,
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        if let IdentityError::Backend(err) = &self {
            tracing::error!(error = %err, "identity storage failure");
        }
        let status = self.status();
        let key = self.key();
        (
            status,
            Json(IdentityErrorResponse {
                status_code: status.as_u16(),
                error_key: key.as_str().to_string(),
                message: key.message().to_string(),
            }),
        )
            .into_response()
    }
}

/// OAuth2 protocol failures, named after RFC 6749.
#[derive(Debug, Error)]
pub enum GrantError {
    #[error("the handler is not responsible for this request")]
    UnknownRequest,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("client authentication failed")]
    InvalidClient,
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("the client is not authorized to use this grant type")]
    UnauthorizedClient,
    #[error("the grant type is not supported")]
    UnsupportedGrantType,
    #[error("the request could not be authorized")]
    RequestUnauthorized,
    #[error("server error: {0}")]
    ServerError(String),
}

impl GrantError {
    pub fn name(&self) -> &'static str {
        match self {
            GrantError::UnknownRequest => "unknown_request",
            GrantError::InvalidRequest(_) => "invalid_request",
            GrantError::InvalidClient => "invalid_client",
            GrantError::InvalidGrant(_) => "invalid_grant",
            GrantError::InvalidScope(_) => "invalid_scope",
            GrantError::UnauthorizedClient => "unauthorized_client",
            GrantError::UnsupportedGrantType => "unsupported_grant_type",
            GrantError::RequestUnauthorized => "request_unauthorized",
            GrantError::ServerError(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GrantError::InvalidClient | GrantError::RequestUnauthorized => {
                StatusCode::UNAUTHORIZED
            }
            GrantError::UnauthorizedClient => StatusCode::FORBIDDEN,
            GrantError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            GrantError::InvalidRequest(d)
            | GrantError::InvalidGrant(d)
            | GrantError::InvalidScope(d) => Some(d.clone()),
            // Backend details stay in the logs.
            GrantError::ServerError(_) => None,
            other => Some(other.to_string()),
        }
    }
}

impl From<StoreError> for GrantError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => GrantError::InvalidGrant("not found".into()),
            StoreError::InvalidatedCode(_) => {
                GrantError::InvalidGrant("authorization code has been used".into())
            }
            other => GrantError::ServerError(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for GrantError {
    fn into_response(self) -> Response {
        if let GrantError::ServerError(detail) = &self {
            tracing::error!(error = %detail, "grant processing failed");
        }
        (
            self.status(),
            Json(ErrorResponse {
                error: self.name().to_string(),
                error_description: self.description(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_data_not_found() {
        let err: IdentityError = StoreError::NotFound.into();
        assert_eq!(err.key(), ErrorKey::DataNotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_maps_to_user_existed() {
        let err: IdentityError = StoreError::Conflict("fb_id".into()).into();
        assert_eq!(err.key(), ErrorKey::UserExisted);
    }

    #[test]
    fn backend_failures_report_db_key() {
        let err: IdentityError = StoreError::Backend("connection reset".into()).into();
        assert_eq!(err.key().as_str(), "ErrDB");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn grant_error_names_follow_rfc() {
        assert_eq!(GrantError::InvalidScope("x".into()).name(), "invalid_scope");
        assert_eq!(GrantError::RequestUnauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GrantError::ServerError("db".into()).description(), None);
    }
}
