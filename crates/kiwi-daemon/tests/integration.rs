// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Scenario tests for the reconciliation manager driven through its public
//! `Manager::run` loop over real `tokio::sync` channels: events arrive on
//! the merged channel the way a running agent would see them, rather than
//! calling handlers directly (that's what `kiwi-daemon/src/manager.rs`'s
//! own `#[cfg(test)]` module already covers).
//!
//! Recording fakes behind a `Mutex`, one owned `Arc` per test, since the
//! manager holds its drivers as trait objects.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiwi_daemon::coordination::{CoordinationClient, CoordinationError, WatchResponse};
use kiwi_daemon::firewall::{FirewallDriver, FirewallDriverError};
use kiwi_daemon::interface::{InterfaceDriver, InterfaceDriverError};
use kiwi_daemon::manager::{Event, Manager};
use kiwi_types::events::{AddressEvent, AddressEventKind, ServiceEvent, ServiceEventKind};
use kiwi_types::{AgentId, Protocol, Service, ServiceId};

#[derive(Default)]
struct FakeCoordination {
    claimed: Mutex<std::collections::HashSet<Ipv4Addr>>,
    deny_acquire: Mutex<std::collections::HashSet<Ipv4Addr>>,
}

#[async_trait::async_trait]
impl CoordinationClient for FakeCoordination {
    async fn watch(&self, _wait_index: Option<u64>) -> Result<WatchResponse, CoordinationError> {
        std::future::pending().await
    }

    async fn acquire(&self, ip: Ipv4Addr, _agent_id: AgentId, _ttl: Duration) -> Result<(), CoordinationError> {
        if self.deny_acquire.lock().unwrap().contains(&ip) {
            return Err(CoordinationError::PreconditionFailed);
        }
        self.claimed.lock().unwrap().insert(ip);
        Ok(())
    }

    async fn refresh(&self, _ip: Ipv4Addr, _agent_id: AgentId, _ttl: Duration) -> Result<(), CoordinationError> {
        Ok(())
    }

    async fn release(&self, ip: Ipv4Addr, _agent_id: AgentId) -> Result<(), CoordinationError> {
        self.claimed.lock().unwrap().remove(&ip);
        Ok(())
    }
}

#[derive(Default)]
struct FakeInterface {
    added: Mutex<Vec<Ipv4Addr>>,
    removed: Mutex<Vec<Ipv4Addr>>,
    swept: Mutex<u32>,
}

#[async_trait::async_trait]
impl InterfaceDriver for FakeInterface {
    async fn add_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
        self.added.lock().unwrap().push(ip);
        Ok(())
    }

    async fn remove_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
        self.removed.lock().unwrap().push(ip);
        Ok(())
    }

    async fn remove_labelled(&self) -> Result<(), InterfaceDriverError> {
        *self.swept.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakeFirewall {
    added: Mutex<Vec<(Ipv4Addr, ServiceId)>>,
    removed: Mutex<Vec<(Ipv4Addr, ServiceId)>>,
    flushed: Mutex<u32>,
}

#[async_trait::async_trait]
impl FirewallDriver for FakeFirewall {
    async fn add_service(&self, address: Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
        self.added.lock().unwrap().push((address, service.id.clone()));
        Ok(())
    }

    async fn remove_service(&self, address: Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
        self.removed.lock().unwrap().push((address, service.id.clone()));
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), FirewallDriverError> {
        *self.flushed.lock().unwrap() += 1;
        Ok(())
    }
}

fn service(id: &str, port: u16, ips: &[Ipv4Addr]) -> Service {
    Service {
        id: ServiceId(id.to_string()),
        protocol: Protocol::Tcp,
        port,
        public_ips: ips.iter().copied().collect(),
    }
}

struct Harness {
    events: tokio::sync::mpsc::Sender<Event>,
    _ticks: tokio::sync::watch::Sender<()>,
    coordination: Arc<FakeCoordination>,
    interface: Arc<FakeInterface>,
    firewall: Arc<FakeFirewall>,
    handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn spawn() -> Self {
        let coordination = Arc::new(FakeCoordination::default());
        let interface = Arc::new(FakeInterface::default());
        let firewall = Arc::new(FakeFirewall::default());

        let manager = Manager::new(
            AgentId::generate(),
            Duration::from_secs(30),
            None,
            coordination.clone(),
            interface.clone(),
            firewall.clone(),
        );

        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
        let (tick_tx, tick_rx) = tokio::sync::watch::channel(());
        let handle = tokio::spawn(manager.run(event_rx, tick_rx));

        Self {
            events: event_tx,
            _ticks: tick_tx,
            coordination,
            interface,
            firewall,
            handle,
        }
    }

    async fn send(&self, event: Event) {
        self.events.send(event).await.unwrap();
        // Give the manager's single-threaded loop a moment to drain the
        // event before assertions run — each handler runs to completion
        // before the next event is considered, so one scheduling yield is
        // enough once the channel delivers it.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn shutdown(self) {
        drop(self.events);
        self.handle.await.unwrap();
    }
}

// S1 — single service, single agent.
#[tokio::test]
async fn s1_single_service_single_agent() {
    let h = Harness::spawn();
    let ip = Ipv4Addr::new(10, 0, 0, 1);

    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Added,
        service: service("a", 80, &[ip]),
    }))
    .await;

    assert!(h.coordination.claimed.lock().unwrap().contains(&ip));
    assert_eq!(h.interface.added.lock().unwrap().as_slice(), &[ip]);
    assert_eq!(h.firewall.added.lock().unwrap().len(), 1);

    h.shutdown().await;
}

// S2 — two services share an IP: one claim, one interface address, two
// firewall rules.
#[tokio::test]
async fn s2_two_services_share_an_address() {
    let h = Harness::spawn();
    let ip = Ipv4Addr::new(1, 2, 3, 4);

    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Added,
        service: service("a", 80, &[ip]),
    }))
    .await;
    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Added,
        service: service("b", 443, &[ip]),
    }))
    .await;

    assert_eq!(h.coordination.claimed.lock().unwrap().len(), 1);
    assert_eq!(h.interface.added.lock().unwrap().len(), 1);
    assert_eq!(h.firewall.added.lock().unwrap().len(), 2);

    h.shutdown().await;
}

// S3 — take-over on peer death: conflict leaves us unclaimed, a subsequent
// Expired event wins the claim.
#[tokio::test]
async fn s3_takeover_on_peer_death() {
    let h = Harness::spawn();
    let ip = Ipv4Addr::new(10, 0, 0, 1);
    h.coordination.deny_acquire.lock().unwrap().insert(ip);

    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Added,
        service: service("a", 80, &[ip]),
    }))
    .await;
    assert!(h.coordination.claimed.lock().unwrap().is_empty());
    assert!(h.interface.added.lock().unwrap().is_empty());

    h.coordination.deny_acquire.lock().unwrap().remove(&ip);
    h.send(Event::Address(AddressEvent { kind: AddressEventKind::Expired, ip })).await;

    assert!(h.coordination.claimed.lock().unwrap().contains(&ip));
    assert_eq!(h.interface.added.lock().unwrap().as_slice(), &[ip]);

    h.shutdown().await;
}

// S5 — CIDR allowlist rejects an out-of-range address.
#[tokio::test]
async fn s5_cidr_allowlist_rejects_out_of_range_address() {
    let coordination = Arc::new(FakeCoordination::default());
    let interface = Arc::new(FakeInterface::default());
    let firewall = Arc::new(FakeFirewall::default());

    let manager = Manager::new(
        AgentId::generate(),
        Duration::from_secs(30),
        Some(vec!["10.0.0.0/8".parse().unwrap()]),
        coordination.clone(),
        interface.clone(),
        firewall.clone(),
    );

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
    let (_tick_tx, tick_rx) = tokio::sync::watch::channel(());
    let handle = tokio::spawn(manager.run(event_rx, tick_rx));

    let ip = Ipv4Addr::new(192, 168, 1, 1);
    event_tx
        .send(Event::Service(ServiceEvent {
            kind: ServiceEventKind::Added,
            service: service("a", 80, &[ip]),
        }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(coordination.claimed.lock().unwrap().is_empty());
    assert!(firewall.added.lock().unwrap().is_empty());

    drop(event_tx);
    handle.await.unwrap();
}

// S6 — modified service releases the old address and claims the new one.
#[tokio::test]
async fn s6_modified_service_moves_claim() {
    let h = Harness::spawn();
    let old_ip = Ipv4Addr::new(1, 1, 1, 1);
    let new_ip = Ipv4Addr::new(2, 2, 2, 2);

    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Added,
        service: service("a", 80, &[old_ip]),
    }))
    .await;
    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Modified,
        service: service("a", 80, &[new_ip]),
    }))
    .await;

    let claimed = h.coordination.claimed.lock().unwrap();
    assert!(!claimed.contains(&old_ip));
    assert!(claimed.contains(&new_ip));
    drop(claimed);

    assert!(h.interface.removed.lock().unwrap().contains(&old_ip));
    assert!(h.interface.added.lock().unwrap().contains(&new_ip));

    h.shutdown().await;
}

// Shutdown releases every outstanding claim and flushes both drivers.
#[tokio::test]
async fn shutdown_releases_claims_and_flushes_drivers() {
    let h = Harness::spawn();
    let ip = Ipv4Addr::new(10, 0, 0, 1);

    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Added,
        service: service("a", 80, &[ip]),
    }))
    .await;
    assert!(h.coordination.claimed.lock().unwrap().contains(&ip));

    let coordination = h.coordination.clone();
    let interface = h.interface.clone();
    let firewall = h.firewall.clone();
    h.shutdown().await;

    assert!(coordination.claimed.lock().unwrap().is_empty());
    assert!(interface.removed.lock().unwrap().contains(&ip));
    assert_eq!(*firewall.flushed.lock().unwrap(), 1);
}

// Service deletion for an address not in the table is a no-op, and deleting
// an unknown service id from a shared address doesn't touch other services.
#[tokio::test]
async fn deleting_unknown_service_is_a_no_op() {
    let h = Harness::spawn();
    let ip = Ipv4Addr::new(10, 0, 0, 1);

    h.send(Event::Service(ServiceEvent {
        kind: ServiceEventKind::Deleted,
        service: service("never-added", 80, &[ip]),
    }))
    .await;

    assert!(h.coordination.claimed.lock().unwrap().is_empty());
    assert!(h.firewall.removed.lock().unwrap().is_empty());

    h.shutdown().await;
}
