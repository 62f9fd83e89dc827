use crate::core::rate_limit::RateLimitConfig;

/// Process configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub rate_limit: RateLimitConfig,
    /// Max `limit` accepted by paginated endpoints.
    pub max_page_size: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 8080,
            database_url: "postgres://club:@localhost:5432/clubserver".to_string(),
            rate_limit: RateLimitConfig::default(),
            max_page_size: 100,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_host: std::env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.server_port),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            rate_limit: RateLimitConfig::from_env(),
            max_page_size: std::env::var("MAX_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_page_size),
        }
    }
}
