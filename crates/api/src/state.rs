//! Application state

use std::sync::Arc;

use maturamate_billing::{BillingError, BillingService};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    /// Build state backed by Stripe and Postgres
    pub fn new(pool: PgPool, config: Config) -> Result<Self, BillingError> {
        let billing = BillingService::from_env(pool)?;
        tracing::info!("Stripe billing service initialized");
        Ok(Self::with_billing(config, billing))
    }

    pub fn with_billing(config: Config, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);
        Self {
            config,
            jwt_manager,
            billing: Arc::new(billing),
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
