//! Typed events produced by the address watcher and the service watcher.
//!
//! An explicit tagged union in place of a handler name computed from the
//! wire action string. These are that union's two halves; the manager
//! merges them into a single `Event` enum of its own (see
//! `kiwi-daemon::manager`).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::Service;

/// The kind of ownership change the coordination store reported for a
/// single public IP key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressEventKind {
    /// The key was created (did not exist before).
    Created,
    /// The key's value was overwritten in place.
    Set,
    /// The key was explicitly deleted (including a `compareAndDelete`,
    /// treated identically to a plain `delete`).
    Deleted,
    /// The key's TTL lease expired.
    Expired,
}

/// A single ownership-change event for one public IP, as produced by the
/// address watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEvent {
    /// What happened to the key.
    pub kind: AddressEventKind,
    /// The public IP the key's final path component decoded to.
    pub ip: Ipv4Addr,
}

/// The kind of change the cluster API reported for a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEventKind {
    /// A new service definition appeared.
    Added,
    /// An existing service definition changed.
    Modified,
    /// A service definition was removed.
    Deleted,
}

/// A single service definition event, as produced by the service watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    /// What happened to the service.
    pub kind: ServiceEventKind,
    /// The service definition as currently known. For `Deleted` this is
    /// the definition being removed; for `Added`/`Modified` it is the new
    /// definition.
    pub service: Service,
}
