//! The reconciliation manager: the core of Kiwi. Merges the two watcher
//! streams and a periodic tick onto one channel, is the sole owner and
//! mutator of the address table, and drives the coordination client plus
//! the two side-effect drivers on every state transition.
//!
//! Dispatch is an explicit [`Event`] enum below with one `match` arm per
//! variant, rather than a handler name computed from a wire action string.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use kiwi_types::events::{AddressEvent, AddressEventKind, ServiceEvent, ServiceEventKind};
use kiwi_types::{AgentId, Service, ServiceId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::address_is_allowed;
use crate::coordination::{CoordinationClient, CoordinationError};
use crate::firewall::FirewallDriver;
use crate::interface::InterfaceDriver;

/// The per-address state the manager maintains. `refcount == services.len()`
/// is an invariant enforced by construction: every mutation goes through
/// [`AddressEntry::insert_service`] / [`AddressEntry::remove_service`]
/// rather than touching the fields directly.
#[derive(Debug, Default, Clone)]
struct AddressEntry {
    claimed: bool,
    services: HashSet<ServiceId>,
}

impl AddressEntry {
    fn refcount(&self) -> u32 {
        self.services.len() as u32
    }

    /// Returns `true` if `id` was newly added. The refcount only moves for
    /// a service not already referencing this address, so duplicate ADDED
    /// events for the same service are idempotent.
    fn insert_service(&mut self, id: ServiceId) -> bool {
        self.services.insert(id)
    }

    /// Returns `true` if `id` was present and removed.
    fn remove_service(&mut self, id: &ServiceId) -> bool {
        self.services.remove(id)
    }
}

/// The single merged event the manager's loop waits on: a tagged union in
/// place of a single queue of loosely typed dicts.
#[derive(Debug)]
pub enum Event {
    /// An ownership-change event from the coordination store.
    Address(AddressEvent),
    /// A service-definition event from the cluster API.
    Service(ServiceEvent),
    /// The periodic lease-refresh tick fired.
    Tick,
    /// A cooperative shutdown was requested.
    Shutdown,
}

/// Everything the manager needs to run: the merged channel, the periodic
/// tick, and a shutdown signal. Constructed by the bootstrap step
/// (`kiwi-daemon::main`) and owned entirely by [`Manager::run`].
pub struct Manager {
    agent_id: AgentId,
    refresh_interval: Duration,
    cidr_ranges: Option<Vec<Ipv4Network>>,
    coordination: Arc<dyn CoordinationClient>,
    interface: Arc<dyn InterfaceDriver>,
    firewall: Arc<dyn FirewallDriver>,

    addresses: HashMap<Ipv4Addr, AddressEntry>,
    /// Previously seen service definitions, keyed by service id, so a
    /// `Modified` event can resolve the actual prior IP set instead of
    /// guessing.
    known_services: HashMap<ServiceId, Service>,
}

impl Manager {
    /// Construct a manager with an empty address table.
    pub fn new(
        agent_id: AgentId,
        refresh_interval: Duration,
        cidr_ranges: Option<Vec<Ipv4Network>>,
        coordination: Arc<dyn CoordinationClient>,
        interface: Arc<dyn InterfaceDriver>,
        firewall: Arc<dyn FirewallDriver>,
    ) -> Self {
        Self {
            agent_id,
            refresh_interval,
            cidr_ranges,
            coordination,
            interface,
            firewall,
            addresses: HashMap::new(),
            known_services: HashMap::new(),
        }
    }

    /// Expose the current claim state for a given address, for tests and
    /// invariant checks.
    #[cfg(test)]
    fn is_claimed(&self, ip: Ipv4Addr) -> bool {
        self.addresses.get(&ip).is_some_and(|e| e.claimed)
    }

    #[cfg(test)]
    fn refcount(&self, ip: Ipv4Addr) -> u32 {
        self.addresses.get(&ip).map(|e| e.refcount()).unwrap_or(0)
    }

    #[cfg(test)]
    fn contains(&self, ip: Ipv4Addr) -> bool {
        self.addresses.contains_key(&ip)
    }

    /// Run the main loop until a [`Event::Shutdown`] is received or the
    /// event channel closes, then run full cleanup: release all claims and
    /// run driver cleanup before exiting.
    ///
    /// Each event is handled to completion before the next is considered,
    /// so the per-IP state machine is single-stepped and there is no
    /// interleaving between handlers.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>, mut ticks: watch::Receiver<()>) {
        info!(agent_id = %self.agent_id, "reconciliation manager starting");

        // The ticker task only drops its sender once shutdown is already
        // underway. Once that happens this branch is disabled rather than
        // re-polled, since a closed `watch::Receiver::changed()` resolves
        // immediately forever and would otherwise spin the loop.
        let mut ticks_open = true;

        loop {
            tokio::select! {
                biased;

                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(Event::Shutdown) | None => break,
                        Some(Event::Address(ev)) => self.on_address_event(ev).await,
                        Some(Event::Service(ev)) => self.on_service_event(ev).await,
                        Some(Event::Tick) => self.refresh_pass().await,
                    }
                }
                changed = ticks.changed(), if ticks_open => {
                    match changed {
                        Ok(()) => self.refresh_pass().await,
                        Err(_) => ticks_open = false,
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn on_address_event(&mut self, event: AddressEvent) {
        match event.kind {
            AddressEventKind::Deleted | AddressEventKind::Expired => {
                self.on_address_deleted_or_expired(event.ip).await;
            }
            AddressEventKind::Created | AddressEventKind::Set => {
                // Informational only — another agent holds (or has just
                // refreshed) the claim.
                debug!(ip = %event.ip, kind = ?event.kind, "address claimed by another agent");
            }
        }
    }

    async fn on_service_event(&mut self, event: ServiceEvent) {
        match event.kind {
            ServiceEventKind::Added => {
                self.known_services.insert(event.service.id.clone(), event.service.clone());
                self.on_service_added(&event.service).await;
            }
            ServiceEventKind::Deleted => {
                self.known_services.remove(&event.service.id);
                self.on_service_deleted(&event.service).await;
            }
            ServiceEventKind::Modified => {
                self.on_service_modified(event.service).await;
            }
        }
    }

    async fn on_service_added(&mut self, svc: &Service) {
        for ip in &svc.public_ips {
            let ip = *ip;

            if !address_is_allowed(&self.cidr_ranges, ip) {
                warn!(%ip, service = %svc.id, "ignoring address outside configured cidr allowlist");
                continue;
            }

            let entry = self.addresses.entry(ip).or_default();
            let newly_referenced = entry.insert_service(svc.id.clone());

            if newly_referenced {
                info!(%ip, service = %svc.id, "adding service to address");
                if let Err(err) = self.firewall.add_service(ip, svc).await {
                    warn!(%ip, service = %svc.id, error = %err, "firewall driver failed to add rule");
                }
            }

            if !self.addresses[&ip].claimed {
                self.try_claim(ip).await;
            }
        }
    }

    async fn on_service_deleted(&mut self, svc: &Service) {
        for ip in &svc.public_ips {
            let ip = *ip;

            let Some(entry) = self.addresses.get_mut(&ip) else {
                continue;
            };

            if entry.remove_service(&svc.id) {
                info!(%ip, service = %svc.id, "removing service from address");
                if let Err(err) = self.firewall.remove_service(ip, svc).await {
                    warn!(%ip, service = %svc.id, error = %err, "firewall driver failed to remove rule");
                }
            }

            if self.addresses[&ip].refcount() == 0 {
                self.remove_address(ip).await;
            }
        }
    }

    /// Delete-then-add against the previous definition when known; add-only
    /// with a debug log when there is nothing to delete.
    async fn on_service_modified(&mut self, svc: Service) {
        match self.known_services.get(&svc.id).cloned() {
            Some(prev) => {
                debug!(service = %svc.id, "modified service has known previous definition, deleting then adding");
                self.on_service_deleted(&prev).await;
            }
            None => {
                debug!(service = %svc.id, "modified service has no known previous definition, treating as add-only");
            }
        }
        self.known_services.insert(svc.id.clone(), svc.clone());
        self.on_service_added(&svc).await;
    }

    /// The fast path for taking over from a dead peer.
    async fn on_address_deleted_or_expired(&mut self, ip: Ipv4Addr) {
        let still_wanted = self.addresses.get(&ip).is_some_and(|e| e.refcount() > 0);
        if still_wanted {
            self.try_claim(ip).await;
        }
    }

    async fn try_claim(&mut self, ip: Ipv4Addr) {
        let ttl = self.refresh_interval * 2;

        match self.coordination.acquire(ip, self.agent_id, ttl).await {
            Ok(()) => {
                info!(%ip, "claimed address");
                if let Some(entry) = self.addresses.get_mut(&ip) {
                    entry.claimed = true;
                }
                if let Err(err) = self.interface.add_address(ip).await {
                    warn!(%ip, error = %err, "interface driver failed to add address, will retry on next refresh");
                }
            }
            Err(CoordinationError::PreconditionFailed) => {
                debug!(%ip, "address already claimed by another agent");
            }
            Err(err) => {
                warn!(%ip, error = %err, "transport failure while claiming address, will retry on next refresh");
            }
        }
    }

    async fn refresh_pass(&mut self) {
        let claimed: Vec<Ipv4Addr> = self
            .addresses
            .iter()
            .filter(|(_, entry)| entry.claimed)
            .map(|(ip, _)| *ip)
            .collect();

        info!(total = self.addresses.len(), claimed = claimed.len(), "starting refresh pass");

        let ttl = self.refresh_interval * 2;
        for ip in claimed {
            match self.coordination.refresh(ip, self.agent_id, ttl).await {
                Ok(()) => debug!(%ip, "refreshed claim"),
                Err(err) => {
                    warn!(%ip, error = %err, "refresh failed, releasing local claim");
                    self.release_address(ip).await;
                }
            }
        }
    }

    /// Clears `claimed`, best-effort releases the coordination-store
    /// lease, removes the interface address. Leaves `refcount`/`services`
    /// untouched so a later event or tick can re-attempt a claim.
    async fn release_address(&mut self, ip: Ipv4Addr) {
        let Some(entry) = self.addresses.get_mut(&ip) else {
            return;
        };
        if !entry.claimed {
            return;
        }
        entry.claimed = false;

        if let Err(err) = self.coordination.release(ip, self.agent_id).await {
            if !matches!(err, CoordinationError::PreconditionFailed) {
                warn!(%ip, error = %err, "failed to release claim in coordination store");
            }
        }

        if let Err(err) = self.interface.remove_address(ip).await {
            warn!(%ip, error = %err, "interface driver failed to remove address");
        }
    }

    /// Release then delete the entry entirely (last service referencing
    /// this address departed).
    async fn remove_address(&mut self, ip: Ipv4Addr) {
        info!(%ip, "removing address entry, no services reference it");
        self.release_address(ip).await;
        self.addresses.remove(&ip);
    }

    /// Release every claim and flush both drivers.
    async fn shutdown(&mut self) {
        info!("shutting down, releasing all claims");

        let ips: Vec<Ipv4Addr> = self.addresses.keys().copied().collect();
        for ip in ips {
            self.release_address(ip).await;
        }

        if let Err(err) = self.firewall.cleanup().await {
            warn!(error = %err, "firewall driver cleanup failed");
        }
        if let Err(err) = self.interface.cleanup().await {
            warn!(error = %err, "interface driver cleanup failed");
        }

        info!("shutdown complete");
    }
}
