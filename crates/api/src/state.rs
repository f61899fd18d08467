//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use finflow_billing::BillingService;

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Arc<BillingService>) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }
}
