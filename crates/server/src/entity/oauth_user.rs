//! End-user identity entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth_users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Unique together with `client_id`
    pub username: Option<String>,
    pub password: String,
    pub salt: String,
    pub email: Option<String>,
    pub phone_prefix: Option<String>,
    pub phone: Option<String>,
    /// internal, external or both
    pub account_type: String,
    #[sea_orm(unique)]
    pub fb_id: Option<String>,
    #[sea_orm(unique)]
    pub account_kit_id: Option<String>,
    #[sea_orm(unique)]
    pub apple_id: Option<String>,
    pub client_id: String,
    pub otp_code: Option<String>,
    pub otp_code_expired_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
