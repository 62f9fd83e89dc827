use crate::core::rate_limit::RateLimitState;
use crate::shared::config::AppConfig;
use crate::shared::utils::DbPool;
use std::sync::Arc;

/// Schema capabilities resolved once at startup. The free-form post tables are
/// provisioned lazily by the admin collaborator and may not exist yet; every
/// component that touches them checks the flag instead of probing per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub posts: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub capabilities: Capabilities,
    pub rate_limits: Arc<RateLimitState>,
}
