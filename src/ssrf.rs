//! SSRF allow-policy for HTTP/SSE backend URLs (spec.md §4.7): reject a
//! backend `url` that resolves to a loopback/link-local/private/multicast/
//! unspecified address unless the host is explicitly allowlisted.
//!
//! Set once at startup from the loaded config via [`init`] and read from
//! `backend::http` before every connect attempt, mirroring the
//! `config::load_dotenv` one-shot-global pattern rather than threading a
//! config reference through `backend::connect` and every transport struct.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

static POLICY: OnceLock<SsrfConfig> = OnceLock::new();

/// Operator-configured SSRF allow-policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SsrfConfig {
    /// Disable the policy entirely (allow connecting to any resolved
    /// address). Default: false.
    #[serde(default)]
    pub allow_private_networks: bool,

    /// Hostnames exempt from the IP-range check even when it resolves to a
    /// disallowed range (e.g. a loopback test fixture, an internal gateway
    /// deliberately reached over a private network).
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

/// Install the policy once at startup. Later calls are no-ops, matching
/// `load_dotenv`'s `Once` guarantee.
pub fn init(config: SsrfConfig) {
    let _ = POLICY.set(config);
}

fn policy() -> SsrfConfig {
    POLICY.get().cloned().unwrap_or_default()
}

/// Validate `url` against the installed policy before a backend connect.
/// Resolves the host via the async resolver (never blocks the runtime
/// thread) so DNS rebinding to a private address is caught, not just a
/// literal private IP in the config. On success returns the resolved,
/// already-checked addresses so the caller can pin its HTTP client to them —
/// re-resolving the hostname for the real connection would let a rebinding
/// attacker swap in a disallowed address between the check and the connect.
/// Returns an empty vec when the policy or an allow-listed host exempts the
/// URL from pinning.
pub async fn check_url(url: &str) -> Result<Vec<SocketAddr>> {
    let policy = policy();
    if policy.allow_private_networks {
        return Ok(Vec::new());
    }

    let parsed = url::Url::parse(url).with_context(|| format!("invalid backend url: {url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("backend url '{url}' has no host"))?;

    if policy.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        return Ok(Vec::new());
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve backend host '{host}'"))?
        .collect();

    for addr in &addrs {
        let ip = addr.ip();
        if is_disallowed(ip) {
            anyhow::bail!(
                "backend url '{url}' resolves to disallowed address {ip} (loopback/link-local/private/multicast/unspecified); add '{host}' to ssrf.allowed_hosts to permit it"
            );
        }
    }

    Ok(addrs)
}

fn is_disallowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_multicast() || v6.is_unspecified() || v6.is_unique_local()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_loopback_literal() {
        assert!(is_disallowed("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_rejects_private_range() {
        assert!(is_disallowed("10.1.2.3".parse().unwrap()));
        assert!(is_disallowed("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_allows_public_ip() {
        assert!(!is_disallowed("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_rejects_link_local() {
        assert!(is_disallowed("169.254.1.1".parse().unwrap()));
    }
}
