//! Shared state of the `/oauth2` router.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::identity::IdentityRepository;
use crate::oauth2::engine::{OAuth2Engine, TokenLifetimes};
use crate::store::Storage;

#[derive(Clone)]
pub struct OAuth2State {
    pub engine: OAuth2Engine,
    pub identities: IdentityRepository,
}

impl OAuth2State {
    pub fn new(storage: &Storage, config: &AppConfig) -> Self {
        Self {
            engine: OAuth2Engine::new(
                storage.grants.clone(),
                &config.system_secret,
                TokenLifetimes::from(&config.oauth2),
            ),
            identities: IdentityRepository::new(storage.identities.clone(), &config.system_secret),
        }
    }

    /// Same wiring with a controllable clock.
    pub fn with_clock(storage: &Storage, config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine: OAuth2Engine::with_clock(
                storage.grants.clone(),
                &config.system_secret,
                TokenLifetimes::from(&config.oauth2),
                clock.clone(),
            ),
            identities: IdentityRepository::new(storage.identities.clone(), &config.system_secret)
                .with_clock(clock),
        }
    }
}
