//! kiwi-types: wire and domain types shared between the Kiwi agent's
//! watchers and its reconciliation manager.
//!
//! This crate has no I/O of its own — it only describes the shapes that
//! cross the boundary between a producer (address watcher, service
//! watcher) and the manager that consumes them.

#![warn(missing_docs)]

pub mod events;

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies this running agent. Generated fresh at startup and never
/// persisted; used as the lease value for every claim this agent holds in
/// the coordination store, which is how a claim is self-identifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Generate a fresh, random agent identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an agent identity from its UUID string form (used for
    /// `--agent-id` overrides and for comparing against the coordination
    /// store's lease value).
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The L4 protocol a service is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Identity of a service, as used to key reconciliation state. A bare
/// newtype over `String` so an accidental comparison against an unrelated
/// string can't silently typecheck.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A cluster-managed service definition, as delivered by the service
/// watcher. Mirrors the wire `{id, protocol, port, publicIPs}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Stable service identity.
    pub id: ServiceId,
    /// L4 protocol this service is reachable over.
    pub protocol: Protocol,
    /// Port the service listens on.
    pub port: u16,
    /// Public IPv4 addresses this service should be reachable on. A
    /// service may reference zero or more; two services may reference the
    /// same address.
    #[serde(rename = "publicIPs", default)]
    pub public_ips: BTreeSet<Ipv4Addr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_round_trips_through_display_and_parse() {
        let id = AgentId::generate();
        let parsed = AgentId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn service_serializes_with_expected_shape() {
        let svc = Service {
            id: "a".into(),
            protocol: Protocol::Tcp,
            port: 80,
            public_ips: [Ipv4Addr::new(10, 0, 0, 1)].into_iter().collect(),
        };
        let json = serde_json::to_string(&svc).unwrap();
        assert!(json.contains("\"TCP\""));
        assert!(json.contains("\"publicIPs\""));
        assert!(json.contains("10.0.0.1"));
    }
}
