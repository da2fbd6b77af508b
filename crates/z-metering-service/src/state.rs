//! Application state.

use std::sync::Arc;

use z_metering_engine::MeteringEngine;

use crate::config::ServiceConfig;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The metering engine.
    pub engine: Arc<MeteringEngine>,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(engine: Arc<MeteringEngine>, config: ServiceConfig) -> Self {
        if config.service_api_key.is_none() {
            tracing::warn!("SERVICE_API_KEY not set - service endpoints will reject all requests");
        }
        if config.auth_jwt_secret.is_none() {
            tracing::warn!("AUTH_JWT_SECRET not set - user JWTs will be rejected");
        }

        Self { engine, config }
    }
}
