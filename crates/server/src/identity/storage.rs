use async_trait::async_trait;

use crate::error::StoreError;
use crate::identity::model::{Identity, IdentityFilter};

/// Identity persistence, implemented by every store backend.
#[async_trait]
pub trait IdentityStorage: Send + Sync {
    /// Identity matching every condition of `filter`. A filter without
    /// conditions matches nothing.
    async fn find(&self, filter: &IdentityFilter) -> Result<Identity, StoreError>;

    /// First identity matching any of `alternatives`.
    async fn find_any(
        &self,
        alternatives: &[IdentityFilter],
    ) -> Result<Option<Identity>, StoreError>;

    /// Inserts a new identity. Unique violations surface as [`StoreError::Conflict`].
    async fn create(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Overwrites the stored identity with the same id.
    async fn update(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Clears the OTP code and expiry only if the stored code still equals `code`.
    /// Returns whether this call performed the clear.
    async fn consume_otp(&self, id: &str, code: &str) -> Result<bool, StoreError>;

    /// Removes the identity and every token issued to it.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
