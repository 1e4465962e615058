//! In-flight OAuth2 request state and the session bound to it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::oauth2::arguments::Arguments;
use crate::oauth2::client::OAuthClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    AccessToken,
    RefreshToken,
    AuthorizeCode,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::AccessToken => "access_token",
            TokenKind::RefreshToken => "refresh_token",
            TokenKind::AuthorizeCode => "authorize_code",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "access_token" => Some(TokenKind::AccessToken),
            "refresh_token" => Some(TokenKind::RefreshToken),
            "authorize_code" => Some(TokenKind::AuthorizeCode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expirations {
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_token: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub authorize_code: Option<OffsetDateTime>,
}

pub const EXTRA_USER_ID: &str = "user_id";
pub const EXTRA_EMAIL: &str = "email";
pub const EXTRA_USERNAME: &str = "username";

/// Session data carried by every grant artifact.
///
/// Unknown fields are ignored on decode and `extra` round-trips untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub expires_at: Expirations,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    pub fn expires_at(&self, kind: TokenKind) -> Option<OffsetDateTime> {
        match kind {
            TokenKind::AccessToken => self.expires_at.access_token,
            TokenKind::RefreshToken => self.expires_at.refresh_token,
            TokenKind::AuthorizeCode => self.expires_at.authorize_code,
        }
    }

    pub fn set_expires_at(&mut self, kind: TokenKind, at: OffsetDateTime) {
        let slot = match kind {
            TokenKind::AccessToken => &mut self.expires_at.access_token,
            TokenKind::RefreshToken => &mut self.expires_at.refresh_token,
            TokenKind::AuthorizeCode => &mut self.expires_at.authorize_code,
        };
        *slot = Some(at);
    }

    pub fn set_user_id(&mut self, id: &str) {
        self.extra.insert(EXTRA_USER_ID.into(), Value::from(id));
    }

    pub fn set_email(&mut self, email: &str) {
        self.extra.insert(EXTRA_EMAIL.into(), Value::from(email));
    }

    pub fn set_username(&mut self, username: &str) {
        self.username = username.to_string();
        self.extra.insert(EXTRA_USERNAME.into(), Value::from(username));
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Ordered snapshot of the submitted form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData(Vec<(String, String)>);

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(k, _)| k != key);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `application/x-www-form-urlencoded` rendering.
    pub fn encode(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.0.iter())
            .finish()
    }

    pub fn decode(raw: &str) -> Self {
        Self(
            url::form_urlencoded::parse(raw.as_bytes())
                .into_owned()
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FormData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The reified state of one OAuth2 request, owned by the artifact it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Requester {
    pub id: String,
    pub requested_at: OffsetDateTime,
    pub client: OAuthClient,
    pub requested_scope: Arguments,
    pub granted_scope: Arguments,
    pub requested_audience: Arguments,
    pub granted_audience: Arguments,
    /// Only meaningful while the request is being processed; never persisted.
    pub grant_types: Arguments,
    pub form: FormData,
    pub session: Session,
}

impl Requester {
    pub fn new(client: OAuthClient, session: Session) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requested_at: OffsetDateTime::now_utc(),
            client,
            requested_scope: Arguments::new(),
            granted_scope: Arguments::new(),
            requested_audience: Arguments::new(),
            granted_audience: Arguments::new(),
            grant_types: Arguments::new(),
            form: FormData::new(),
            session,
        }
    }

    pub fn grant_scope(&mut self, scope: &str) {
        self.granted_scope.append(scope);
    }

    pub fn grant_audience(&mut self, audience: &str) {
        self.granted_audience.append(audience);
    }
}
