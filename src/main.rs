use axum::middleware;
use diesel::prelude::*;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clubserver::api_router::configure_api_routes;
use clubserver::core::rate_limit::{
    ip_rate_limit_middleware, RateLimitState, RateLimitSweeper,
};
use clubserver::shared::config::AppConfig;
use clubserver::shared::principal::principal_middleware;
use clubserver::shared::state::{AppState, Capabilities};
use clubserver::shared::utils::{create_conn, DbPool};

/// Probe optional schema once at startup instead of before every request.
async fn probe_capabilities(pool: &DbPool) -> Capabilities {
    use clubserver::shared::schema::posts;

    let pool = pool.clone();
    let posts_ready = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().ok()?;
        posts::table.count().get_result::<i64>(&mut conn).ok()
    })
    .await
    .ok()
    .flatten()
    .is_some();

    if !posts_ready {
        info!("post tables not provisioned yet, post sources disabled");
    }
    Capabilities { posts: posts_ready }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("clubserver=info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env();
    let pool = create_conn(&config.database_url)?;
    let capabilities = probe_capabilities(&pool).await;

    let rate_limits = Arc::new(RateLimitState::new(config.rate_limit.clone()));
    let sweeper = RateLimitSweeper::start(
        rate_limits.store(),
        Duration::from_secs(config.rate_limit.sweep_interval_secs),
    );

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    let state = Arc::new(AppState {
        conn: pool,
        config,
        capabilities,
        rate_limits,
    });

    // Layers run outermost-first: IP limiting, then principal resolution,
    // then the per-route account limit inside the router.
    let app = configure_api_routes(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            principal_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("clubserver listening on {addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.stop().await;
    info!("shutdown complete");
    Ok(())
}
