//! Runtime configuration for the Kiwi agent.
//!
//! Kiwi has nothing to persist across restarts. Every value here comes from
//! the CLI and lives only as long as the process.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use kiwi_types::AgentId;
use thiserror::Error;

/// Default long-poll reconnect backoff, used when a watch request fails.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default lease-refresh interval. The lease TTL is always twice this
/// value, so a single missed refresh does not cause expiry.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default cluster API endpoint.
pub const DEFAULT_KUBE_ENDPOINT: &str = "http://127.0.0.1:8080";

/// Default coordination store endpoint.
pub const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:4001";

/// Default coordination store key prefix.
pub const DEFAULT_ETCD_PREFIX: &str = "/kiwi";

/// Default managed interface.
pub const DEFAULT_INTERFACE: &str = "eth0";

/// Default label applied to addresses this agent installs.
pub const DEFAULT_LABEL: &str = "kube";

/// Default managed mangle-table chain name.
pub const DEFAULT_FWCHAIN: &str = "KIWI";

/// Default fwmark applied to matched packets.
pub const DEFAULT_FWMARK: u32 = 1;

/// Fully resolved runtime configuration, built from CLI arguments.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// This agent's identity; used as the lease value for every claim.
    pub agent_id: AgentId,
    /// How often the manager refreshes leases it holds.
    pub refresh_interval: Duration,
    /// How long a watcher sleeps before retrying after a transport error.
    pub reconnect_interval: Duration,
    /// Base URL of the cluster API.
    pub kube_endpoint: String,
    /// Base URL of the coordination store.
    pub etcd_endpoint: String,
    /// Key prefix under which public IP claims live.
    pub etcd_prefix: String,
    /// Network interface addresses are added to and removed from.
    pub interface: String,
    /// Label distinguishing kiwi-managed addresses on `interface`.
    pub label: String,
    /// Name of the managed mangle-table chain.
    pub fwchain: String,
    /// fwmark value applied to matched packets.
    pub fwmark: u32,
    /// CIDR allowlist; `None` means every address is in scope.
    pub cidr_ranges: Option<Vec<Ipv4Network>>,
    /// Skip the interface and firewall drivers entirely (dry-run).
    pub no_driver: bool,
}

/// Errors that can occur while resolving CLI arguments into a
/// [`RuntimeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `--agent-id` was not a valid UUID.
    #[error("invalid agent id: {0}")]
    InvalidAgentId(uuid::Error),

    /// A `--cidr-range` entry did not parse as an IPv4 CIDR.
    #[error("invalid cidr range {0:?}: {1}")]
    InvalidCidr(String, ipnetwork::IpNetworkError),
}

/// Parse the `--cidr-range` list into the allowlist the manager checks
/// new addresses against before claiming them.
pub fn parse_cidr_ranges(raw: &[String]) -> Result<Option<Vec<Ipv4Network>>, ConfigError> {
    if raw.is_empty() {
        return Ok(None);
    }

    let mut nets = Vec::with_capacity(raw.len());
    for entry in raw {
        let net = entry
            .parse::<Ipv4Network>()
            .map_err(|e| ConfigError::InvalidCidr(entry.clone(), e))?;
        nets.push(net);
    }
    Ok(Some(nets))
}

/// Check whether `ip` falls inside the configured allowlist. An absent
/// allowlist admits every address.
pub fn address_is_allowed(ranges: &Option<Vec<Ipv4Network>>, ip: Ipv4Addr) -> bool {
    match ranges {
        None => true,
        Some(nets) => nets.iter().any(|net| net.contains(ip)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cidr_list_allows_everything() {
        let ranges = parse_cidr_ranges(&[]).unwrap();
        assert!(address_is_allowed(&ranges, Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn configured_range_rejects_addresses_outside_it() {
        let ranges = parse_cidr_ranges(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(address_is_allowed(&ranges, Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!address_is_allowed(&ranges, Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        let err = parse_cidr_ranges(&["not-a-cidr".to_string()]);
        assert!(err.is_err());
    }
}
