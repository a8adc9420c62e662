pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod metrics;

/// User-Agent sent on every outbound fetch, so operators of fetched origins
/// can see who is polling them and at what version.
pub fn user_agent() -> String {
    format!("feedfetchd/{}", env!("CARGO_PKG_VERSION"))
}
