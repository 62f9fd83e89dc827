//! Combines the API routes of all modules into one router.

use axum::{middleware, Router};
use std::sync::Arc;

use crate::core::rate_limit::account_rate_limit_middleware;
use crate::shared::state::AppState;

pub fn configure_api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // The feed read is the heaviest query fan-out in the system; it carries a
    // per-account budget on top of the per-IP one applied globally.
    let feed_reads = crate::feed::configure_feed_read_routes().route_layer(
        middleware::from_fn_with_state(state, account_rate_limit_middleware),
    );

    Router::new()
        .merge(crate::achievements::configure_achievement_routes())
        .merge(feed_reads)
        .merge(crate::feed::configure_feed_interaction_routes())
        .merge(crate::notifications::configure_notification_routes())
}
