use std::{net::SocketAddr, time::Duration};

pub struct Config {
    pub listen_addr: SocketAddr,
    pub cors_allow: Vec<String>,
    pub request_timeout: Duration,
    /// Whether this deployment owns a standing change-feed subscription.
    /// Request-scoped (serverless) deployments must set this to false.
    pub change_feed_enabled: bool,
    /// Delay before re-opening the change feed after a source error.
    /// Unset means the subscription stays degraded until the process restarts.
    pub change_feed_retry: Option<Duration>,
    /// Buffer capacity of the in-process change-notification channel.
    pub change_feed_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let listen_addr: SocketAddr = std::env::var("AF_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .expect("Invalid AF_LISTEN_ADDR");
        let cors_allow = std::env::var("AF_CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| "*".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let timeout_ms: u64 = std::env::var("AF_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".into())
            .parse()
            .unwrap_or(30000);
        let change_feed_enabled = std::env::var("AF_CHANGE_FEED")
            .map(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("true") || v == "1"
            })
            .unwrap_or(true);
        let change_feed_retry = std::env::var("AF_CHANGE_FEED_RETRY_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis);
        let change_feed_capacity: usize = std::env::var("AF_CHANGE_FEED_CAPACITY")
            .unwrap_or_else(|_| "256".into())
            .parse()
            .unwrap_or(256);
        Self {
            listen_addr,
            cors_allow,
            request_timeout: Duration::from_millis(timeout_ms),
            change_feed_enabled,
            change_feed_retry,
            change_feed_capacity,
        }
    }
}
