use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Logs in with username and password.
    Internal,
    /// Created from a provider assertion.
    External,
    /// Has both a provider link and a password.
    Both,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Internal => "internal",
            AccountType::External => "external",
            AccountType::Both => "both",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "internal" => Some(AccountType::Internal),
            "external" => Some(AccountType::External),
            "both" => Some(AccountType::Both),
            _ => None,
        }
    }

    /// Account type after a password is attached.
    pub fn with_password(self) -> Self {
        match self {
            AccountType::External => AccountType::Both,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: Option<String>,
    pub password: String,
    pub salt: String,
    pub email: Option<String>,
    pub phone_prefix: Option<String>,
    pub phone: Option<String>,
    pub account_type: AccountType,
    pub fb_id: Option<String>,
    pub account_kit_id: Option<String>,
    pub apple_id: Option<String>,
    pub client_id: String,
    pub otp_code: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub otp_code_expired_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Identity {
    pub fn new(client_id: impl Into<String>, account_type: AccountType) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: None,
            password: String::new(),
            salt: String::new(),
            email: None,
            phone_prefix: None,
            phone: None,
            account_type,
            fb_id: None,
            account_kit_id: None,
            apple_id: None,
            client_id: client_id.into(),
            otp_code: None,
            otp_code_expired_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_username_password(&self) -> bool {
        self.username.is_some() && !self.password.is_empty()
    }

    pub fn email_or_empty(&self) -> &str {
        self.email.as_deref().unwrap_or_default()
    }

    pub fn username_or_empty(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }
}

/// Outcome of a create or reconcile call.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub identity: Identity,
    pub is_new: bool,
}

impl Resolved {
    pub fn has_username_password(&self) -> bool {
        self.identity.has_username_password()
    }
}

/// Columns an identity can be looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Id,
    Username,
    Email,
    PhonePrefix,
    Phone,
    FbId,
    AccountKitId,
    AppleId,
    OtpCode,
    ClientId,
}

impl IdentityField {
    /// Column and document key.
    pub fn name(&self) -> &'static str {
        match self {
            IdentityField::Id => "id",
            IdentityField::Username => "username",
            IdentityField::Email => "email",
            IdentityField::PhonePrefix => "phone_prefix",
            IdentityField::Phone => "phone",
            IdentityField::FbId => "fb_id",
            IdentityField::AccountKitId => "account_kit_id",
            IdentityField::AppleId => "apple_id",
            IdentityField::OtpCode => "otp_code",
            IdentityField::ClientId => "client_id",
        }
    }
}

/// Conjunction of identity fields. Unset and empty keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, ToSchema)]
pub struct IdentityFilter {
    pub id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone_prefix: Option<String>,
    pub phone: Option<String>,
    pub fb_id: Option<String>,
    pub ak_id: Option<String>,
    pub apple_id: Option<String>,
    pub otp_code: Option<String>,
    pub client_id: Option<String>,
}

impl IdentityFilter {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn in_client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn conditions(&self) -> Vec<(IdentityField, &str)> {
        [
            (IdentityField::Id, &self.id),
            (IdentityField::Username, &self.username),
            (IdentityField::Email, &self.email),
            (IdentityField::PhonePrefix, &self.phone_prefix),
            (IdentityField::Phone, &self.phone),
            (IdentityField::FbId, &self.fb_id),
            (IdentityField::AccountKitId, &self.ak_id),
            (IdentityField::AppleId, &self.apple_id),
            (IdentityField::OtpCode, &self.otp_code),
            (IdentityField::ClientId, &self.client_id),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(|v| (field, v))
        })
        .collect()
    }

    /// True when no lookup condition is set. The owning client alone does not count.
    pub fn is_empty(&self) -> bool {
        self.conditions()
            .iter()
            .all(|(field, _)| *field == IdentityField::ClientId)
    }
}

/// Administrative update of an identity. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct IdentityUpdate {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_confirmation: Option<String>,
    pub email: Option<String>,
    pub phone_prefix: Option<String>,
    pub phone: Option<String>,
    pub account_type: Option<AccountType>,
    pub fb_id: Option<String>,
    pub ak_id: Option<String>,
    pub apple_id: Option<String>,
}

/// Username/email/phone plus password, scoped to a client.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct Credential {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    pub password: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Fields accepted by direct creation.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct NewIdentity {
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
}

/// Provider assertion presented by a client on behalf of an end-user.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProviderAssertion {
    #[serde(default)]
    pub fb_id: String,
    #[serde(default)]
    pub ak_id: String,
    #[serde(default)]
    pub apple_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone_prefix: String,
    #[serde(default)]
    pub phone: String,
}
