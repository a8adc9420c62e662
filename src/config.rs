use std::env;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// Wall-clock cadence of the scheduler's cron tick, in minutes.
    pub cycle_interval_minutes: u32,
    /// Upper bound on feeds being fetched concurrently.
    pub max_concurrent_fetches: usize,
    /// Per-request HTTP timeout.
    pub fetch_timeout: Duration,
    /// Hard cap on a response body's size while streaming it.
    pub fetch_max_body_bytes: u64,
    /// Bind address for the `/metrics` and `/healthz` endpoints.
    pub metrics_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://feedfetchd.db".to_string());

        let cycle_interval_minutes = env::var("FETCH_INTERVAL")
            .unwrap_or_else(|_| "5".to_string())
            .parse()?;

        let max_concurrent_fetches = env::var("FETCH_MAX_CONCURRENT")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;

        let fetch_timeout_secs: u64 = env::var("FETCH_TIMEOUT")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;

        let fetch_max_body_bytes = env::var("FETCH_MAX_SIZE")
            .unwrap_or_else(|_| (5 * 1024 * 1024).to_string())
            .parse()?;

        let metrics_addr: SocketAddr = env::var("METRICS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()?;

        Ok(Config {
            database_url,
            cycle_interval_minutes,
            max_concurrent_fetches,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            fetch_max_body_bytes,
            metrics_addr,
        })
    }
}
