//! Sliding-window rate limiting.
//!
//! One counting primitive, three call patterns: a per-IP limiter for anonymous
//! traffic, a per-account limiter for the expensive feed endpoint, and a
//! login-attempt limiter consumed by the auth gateway. Windows live in a
//! process-local store behind [`RateLimitStore`] so a shared external cache
//! can be swapped in without touching the counting logic.

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::shared::principal::AuthUser;
use crate::shared::state::AppState;

/// One counting window for a single key.
#[derive(Debug, Clone, Copy)]
pub struct WindowState {
    pub count: u32,
    /// Millisecond timestamp of the first request in this window.
    pub window_start: i64,
    pub window_ms: i64,
}

impl WindowState {
    pub fn expires_at(&self) -> i64 {
        self.window_start + self.window_ms
    }

    pub fn expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at()
    }
}

/// Window storage. `hit` is the atomic create/reset/increment primitive; a
/// plain get-then-set pair would lose concurrent increments and silently
/// weaken limits.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<WindowState>;
    /// Record one request against `key`: start a fresh window if none exists
    /// or the current one has elapsed, otherwise increment. Returns the
    /// resulting window.
    async fn hit(&self, key: &str, window_ms: i64, now_ms: i64) -> WindowState;
    async fn delete(&self, key: &str);
    /// Drop every window whose lifetime has passed. Memory reclamation only;
    /// a stale window is superseded on its next hit regardless.
    async fn sweep(&self, now_ms: i64) -> usize;
}

/// Process-local store. Not shared across processes; each instance enforces
/// its own budget.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: RwLock<HashMap<String, WindowState>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn get(&self, key: &str) -> Option<WindowState> {
        self.windows.read().await.get(key).copied()
    }

    async fn hit(&self, key: &str, window_ms: i64, now_ms: i64) -> WindowState {
        let mut windows = self.windows.write().await;
        let entry = windows
            .entry(key.to_string())
            .and_modify(|w| {
                if w.expired(now_ms) {
                    *w = WindowState {
                        count: 1,
                        window_start: now_ms,
                        window_ms,
                    };
                } else {
                    w.count += 1;
                }
            })
            .or_insert(WindowState {
                count: 1,
                window_start: now_ms,
                window_ms,
            });
        *entry
    }

    async fn delete(&self, key: &str) {
        self.windows.write().await.remove(key);
    }

    async fn sweep(&self, now_ms: i64) -> usize {
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, w| !w.expired(now_ms));
        before - windows.len()
    }
}

/// Outcome of a rate-limit check. This component never errors; callers decide
/// how to respond to a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_secs: Option<i64>,
}

impl Decision {
    const ALLOW: Decision = Decision {
        allowed: true,
        retry_after_secs: None,
    };
}

/// The shared counting primitive.
pub struct SlidingWindowLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub async fn allow(&self, key: &str, max_requests: u32, window_ms: i64) -> Decision {
        self.allow_at(key, max_requests, window_ms, now_ms()).await
    }

    async fn allow_at(&self, key: &str, max_requests: u32, window_ms: i64, now_ms: i64) -> Decision {
        let window = self.store.hit(key, window_ms, now_ms).await;
        if window.count <= max_requests {
            Decision::ALLOW
        } else {
            Decision {
                allowed: false,
                retry_after_secs: Some(retry_after_secs(&window, now_ms)),
            }
        }
    }
}

fn retry_after_secs(window: &WindowState, now_ms: i64) -> i64 {
    let remaining_ms = (window.expires_at() - now_ms).max(0);
    (remaining_ms + 999) / 1000
}

/// Gate decision for a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginGate {
    Open,
    Locked { retry_after_minutes: i64 },
}

/// Failed-login lockout, keyed by client IP. Failures accumulate in a fixed
/// window; a successful login clears the counter; once the max is reached
/// further attempts are blocked until the window expires on its own.
pub struct LoginLimiter {
    store: Arc<dyn RateLimitStore>,
    max_failures: u32,
    window_ms: i64,
}

impl LoginLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, max_failures: u32, window_ms: i64) -> Self {
        Self {
            store,
            max_failures,
            window_ms,
        }
    }

    pub async fn check(&self, ip: &str) -> LoginGate {
        self.check_at(ip, now_ms()).await
    }

    async fn check_at(&self, ip: &str, now_ms: i64) -> LoginGate {
        match self.store.get(&Self::key(ip)).await {
            Some(w) if !w.expired(now_ms) && w.count >= self.max_failures => {
                let remaining_ms = (w.expires_at() - now_ms).max(0);
                LoginGate::Locked {
                    retry_after_minutes: ((remaining_ms + 59_999) / 60_000).max(1),
                }
            }
            _ => LoginGate::Open,
        }
    }

    pub async fn record_failure(&self, ip: &str) {
        self.record_failure_at(ip, now_ms()).await;
    }

    async fn record_failure_at(&self, ip: &str, now_ms: i64) {
        let window = self.store.hit(&Self::key(ip), self.window_ms, now_ms).await;
        if window.count == self.max_failures {
            info!(ip, "login attempts locked out");
        }
    }

    /// Called on successful authentication.
    pub async fn clear(&self, ip: &str) {
        self.store.delete(&Self::key(ip)).await;
    }

    fn key(ip: &str) -> String {
        format!("login:{ip}")
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Per-IP budget for general API traffic.
    pub api_max_requests: u32,
    pub api_window_ms: i64,
    /// Per-account budget for the feed endpoint.
    pub account_max_requests: u32,
    pub account_window_ms: i64,
    /// Failed-login lockout.
    pub login_max_failures: u32,
    pub login_window_ms: i64,
    pub sweep_interval_secs: u64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            api_max_requests: 120,
            api_window_ms: 60_000,
            account_max_requests: 30,
            account_window_ms: 60_000,
            login_max_failures: 5,
            login_window_ms: 15 * 60_000,
            sweep_interval_secs: 60,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_max_requests: env_u32("RATE_LIMIT_API_MAX", defaults.api_max_requests),
            api_window_ms: env_i64("RATE_LIMIT_API_WINDOW_MS", defaults.api_window_ms),
            account_max_requests: env_u32("RATE_LIMIT_ACCOUNT_MAX", defaults.account_max_requests),
            account_window_ms: env_i64("RATE_LIMIT_ACCOUNT_WINDOW_MS", defaults.account_window_ms),
            login_max_failures: env_u32("RATE_LIMIT_LOGIN_MAX", defaults.login_max_failures),
            login_window_ms: env_i64("RATE_LIMIT_LOGIN_WINDOW_MS", defaults.login_window_ms),
            sweep_interval_secs: std::env::var("RATE_LIMIT_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_interval_secs),
            enabled: std::env::var("RATE_LIMIT_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Rate limit state shared across requests.
pub struct RateLimitState {
    pub config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    limiter: SlidingWindowLimiter,
    login: LoginLimiter,
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        Self::with_store(config, store)
    }

    pub fn with_store(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(Arc::clone(&store)),
            login: LoginLimiter::new(
                Arc::clone(&store),
                config.login_max_failures,
                config.login_window_ms,
            ),
            store,
            config,
        }
    }

    pub async fn allow_ip(&self, ip: &str) -> Decision {
        self.limiter
            .allow(
                &format!("api:{ip}"),
                self.config.api_max_requests,
                self.config.api_window_ms,
            )
            .await
    }

    pub async fn allow_account(&self, user_id: uuid::Uuid) -> Decision {
        self.limiter
            .allow(
                &format!("acct:u:{user_id}"),
                self.config.account_max_requests,
                self.config.account_window_ms,
            )
            .await
    }

    /// For the auth gateway's login flow.
    pub fn login(&self) -> &LoginLimiter {
        &self.login
    }

    pub fn store(&self) -> Arc<dyn RateLimitStore> {
        Arc::clone(&self.store)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Extract client IP from request.
fn get_client_ip(req: &Request) -> String {
    // X-Forwarded-For first (reverse proxies), then X-Real-IP.
    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip) = value.split(',').next() {
                return ip.trim().to_string();
            }
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            return value.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Per-IP limiting for all API traffic.
pub async fn ip_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.rate_limits.config.enabled {
        return next.run(req).await;
    }

    let client_ip = get_client_ip(&req);
    let decision = state.rate_limits.allow_ip(&client_ip).await;
    if decision.allowed {
        next.run(req).await
    } else {
        debug!(ip = %client_ip, "request rejected by IP rate limit");
        throttled_response(decision, "API rate limit exceeded")
    }
}

/// Per-account limiting for the feed. Requests without a principal pass
/// through; rejecting them is the auth layer's job, not this one's.
pub async fn account_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.rate_limits.config.enabled {
        return next.run(req).await;
    }

    let user = match req.extensions().get::<AuthUser>() {
        Some(user) => user.clone(),
        None => return next.run(req).await,
    };

    let decision = state.rate_limits.allow_account(user.id).await;
    if decision.allowed {
        next.run(req).await
    } else {
        debug!(user_id = %user.id, "request rejected by account rate limit");
        throttled_response(decision, "Feed rate limit exceeded. Please slow down.")
    }
}

fn throttled_response(decision: Decision, message: &str) -> Response {
    let retry_after = decision.retry_after_secs.unwrap_or(1).max(1);
    let body = serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": message,
        "retry_after": retry_after
    });

    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            ("Retry-After", retry_after.to_string()),
            ("Content-Type", "application/json".to_string()),
        ],
        body.to_string(),
    )
        .into_response()
}

/// Owned background sweep with an explicit start/stop lifecycle. Delaying or
/// skipping a sweep never affects counting, only memory.
pub struct RateLimitSweeper {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RateLimitSweeper {
    pub fn start(store: Arc<dyn RateLimitStore>, interval: Duration) -> Self {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep(now_ms()).await;
                        if removed > 0 {
                            debug!(removed, "swept expired rate-limit windows");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        Self { handle, shutdown }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (SlidingWindowLimiter, Arc<InMemoryRateLimitStore>) {
        let store = Arc::new(InMemoryRateLimitStore::new());
        (
            SlidingWindowLimiter::new(store.clone() as Arc<dyn RateLimitStore>),
            store,
        )
    }

    #[tokio::test]
    async fn budget_is_enforced_within_a_window() {
        let (limiter, _) = limiter();
        let t0 = 1_000_000;

        for i in 0..3 {
            let d = limiter.allow_at("k", 3, 60_000, t0 + i).await;
            assert!(d.allowed, "request {i} should pass");
        }
        let denied = limiter.allow_at("k", 3, 60_000, t0 + 10).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs.unwrap() > 0);
    }

    #[tokio::test]
    async fn a_fresh_window_starts_after_expiry() {
        let (limiter, _) = limiter();
        let t0 = 1_000_000;

        for _ in 0..4 {
            limiter.allow_at("k", 3, 60_000, t0).await;
        }
        let after = limiter.allow_at("k", 3, 60_000, t0 + 60_000).await;
        assert!(after.allowed);
    }

    #[tokio::test]
    async fn retry_hint_counts_down_to_window_end() {
        let (limiter, _) = limiter();
        let t0 = 0;
        for _ in 0..3 {
            limiter.allow_at("k", 3, 60_000, t0).await;
        }
        let denied = limiter.allow_at("k", 3, 60_000, 45_000).await;
        assert_eq!(denied.retry_after_secs, Some(15));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (limiter, _) = limiter();
        for _ in 0..4 {
            limiter.allow_at("a", 3, 60_000, 0).await;
        }
        assert!(limiter.allow_at("b", 3, 60_000, 0).await.allowed);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_windows() {
        let (limiter, store) = limiter();
        limiter.allow_at("old", 3, 1_000, 0).await;
        limiter.allow_at("live", 3, 60_000, 500).await;

        let removed = store.sweep(2_000).await;
        assert_eq!(removed, 1);
        assert!(store.get("old").await.is_none());
        assert!(store.get("live").await.is_some());
    }

    #[tokio::test]
    async fn login_lockout_blocks_until_window_expires() {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        let login = LoginLimiter::new(store, 3, 120_000);

        assert_eq!(login.check_at("1.2.3.4", 0).await, LoginGate::Open);
        for _ in 0..3 {
            login.record_failure_at("1.2.3.4", 0).await;
        }
        match login.check_at("1.2.3.4", 30_000).await {
            LoginGate::Locked {
                retry_after_minutes,
            } => assert_eq!(retry_after_minutes, 2),
            LoginGate::Open => panic!("expected lockout"),
        }
        // Natural expiry reopens the gate.
        assert_eq!(login.check_at("1.2.3.4", 120_000).await, LoginGate::Open);
    }

    #[tokio::test]
    async fn successful_login_clears_failures() {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        let login = LoginLimiter::new(store, 3, 120_000);

        for _ in 0..3 {
            login.record_failure_at("ip", 0).await;
        }
        login.clear("ip").await;
        assert_eq!(login.check_at("ip", 1).await, LoginGate::Open);
    }
}
