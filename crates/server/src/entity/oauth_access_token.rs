//! Access and refresh token entity, keyed by signature.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth_access_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub signature: String,
    /// Subject the token was issued to
    pub owner: String,
    pub request_id: String,
    pub client_id: String,
    /// access_token or refresh_token
    pub token_type: String,
    pub expired_at: Option<OffsetDateTime>,
    /// JSON encoded requester record
    pub requester: String,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expired_at.is_some_and(|at| at < now)
    }
}
