//! End-user identities: storage, lookup and reconciliation of provider assertions.

pub mod model;
pub mod repository;
pub mod storage;

pub use model::{
    AccountType, Credential, Identity, IdentityFilter, IdentityUpdate, NewIdentity,
    ProviderAssertion, Resolved,
};
pub use repository::{IdentityRepository, Provider};
pub use storage::IdentityStorage;
