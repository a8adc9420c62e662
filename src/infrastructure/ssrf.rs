use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;
use reqwest::Client;
use thiserror::Error;
use url::Url;

/// Redirect chains longer than this are treated as misbehaving origins, not
/// followed further.
const MAX_REDIRECTS: usize = 5;

#[derive(Error, Debug)]
pub enum SsrfError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL resolves to a private/internal IP address")]
    PrivateIpAddress,

    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("URL scheme not allowed: {0}")]
    InvalidScheme(String),

    #[error("redirected more than {0} times")]
    TooManyRedirects(usize),
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    // RFC 1918
    if ip.octets()[0] == 10 {
        return true;
    }
    if ip.octets()[0] == 172 && (16..=31).contains(&ip.octets()[1]) {
        return true;
    }
    if ip.octets()[0] == 192 && ip.octets()[1] == 168 {
        return true;
    }
    // 0.0.0.0/8
    if ip.octets()[0] == 0 {
        return true;
    }
    // documentation ranges, not publicly routable
    if (ip.octets()[0] == 192 && ip.octets()[1] == 0 && ip.octets()[2] == 2)
        || (ip.octets()[0] == 198 && ip.octets()[1] == 51 && ip.octets()[2] == 100)
        || (ip.octets()[0] == 203 && ip.octets()[1] == 0 && ip.octets()[2] == 113)
    {
        return true;
    }
    false
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    let segments = ip.segments();
    // fe80::/10
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    // fc00::/7 unique local
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // IPv4-mapped (::ffff:0:0/96) inherits the IPv4 address's privacy
    if let Some(ipv4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&ipv4);
    }
    false
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn check_scheme(url: &Url) -> Result<(), SsrfError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(SsrfError::InvalidScheme(scheme.to_string())),
    }
}

/// Rejects literal IP-in-host URLs that are already known private, without
/// touching the network. The resolver catches hostnames that resolve to a
/// private address; this catches the case where the URL itself names one.
fn check_literal_host(url: &Url) -> Result<(), SsrfError> {
    if let Some(host) = url.host_str() {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(&ip) {
                return Err(SsrfError::PrivateIpAddress);
            }
        }
    }
    Ok(())
}

/// Parses and validates a feed or redirect-target URL: scheme allowlist,
/// literal-IP rejection, then a DNS resolution with every candidate address
/// checked against the private-range table. Called once before the initial
/// request and again, implicitly, by [`SafeResolver`] on every connect
/// (including redirect hops) so a DNS answer that changes between this call
/// and the actual TCP connect can never smuggle a private address through.
pub async fn validate_url(url_str: &str) -> Result<Url, SsrfError> {
    let url = Url::parse(url_str).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;
    check_scheme(&url)?;
    check_literal_host(&url)?;

    let host = url
        .host_str()
        .ok_or_else(|| SsrfError::InvalidUrl("no host in URL".to_string()))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SsrfError::DnsResolutionFailed(e.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(SsrfError::DnsResolutionFailed(
            "no addresses resolved".to_string(),
        ));
    }

    for addr in &addrs {
        if is_private_ip(&addr.ip()) {
            tracing::warn!(url = url_str, ip = %addr.ip(), "SSRF guard rejected resolved address");
            return Err(SsrfError::PrivateIpAddress);
        }
    }

    Ok(url)
}

/// A [`reqwest::dns::Resolve`] that filters out private/internal addresses at
/// the moment a connection is actually opened, for every hostname reqwest
/// needs to dial, including ones introduced mid-chain by a redirect.
#[derive(Debug, Clone, Default)]
pub struct SafeResolver;

impl Resolve for SafeResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();

            let safe: Vec<SocketAddr> = addrs
                .into_iter()
                .filter(|a| !is_private_ip(&a.ip()))
                .collect();

            if safe.is_empty() {
                let err: Box<dyn std::error::Error + Send + Sync> =
                    format!("no public address for host {host}").into();
                return Err(err);
            }

            let boxed: Addrs = Box::new(safe.into_iter());
            Ok(boxed)
        })
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(SsrfError::TooManyRedirects(MAX_REDIRECTS));
        }
        let url = attempt.url();
        if check_scheme(url).is_err() {
            return attempt.error(SsrfError::InvalidScheme(url.scheme().to_string()));
        }
        if check_literal_host(url).is_err() {
            return attempt.error(SsrfError::PrivateIpAddress);
        }
        attempt.follow()
    })
}

/// Builds the single `reqwest::Client` the scheduler hands to every fetch
/// task. Every connection this client opens, including redirect hops, is
/// re-validated against the private-IP table at resolve time.
pub fn new_safe_client(timeout: Duration) -> Result<Client, SsrfError> {
    Client::builder()
        .user_agent(crate::user_agent())
        .timeout(timeout)
        .redirect(redirect_policy())
        .dns_resolver(Arc::new(SafeResolver))
        .build()
        .map_err(|e| SsrfError::InvalidUrl(e.to_string()))
}
