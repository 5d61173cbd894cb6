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

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use kiwi_daemon::config::{self, ConfigError, RuntimeConfig};
use kiwi_daemon::coordination::{CoordinationClient, EtcdCoordinationClient};
use kiwi_daemon::firewall::{FirewallDriver, NullFirewallDriver};
use kiwi_daemon::interface::{InterfaceDriver, NullInterfaceDriver};
use kiwi_daemon::manager::{Event, Manager};
use kiwi_daemon::{addresswatcher, servicewatcher};
use kiwi_types::AgentId;

#[cfg(target_os = "linux")]
use kiwi_daemon::firewall::IptablesFirewallDriver;
#[cfg(target_os = "linux")]
use kiwi_daemon::interface::NetlinkInterfaceDriver;

/// Kiwi: claims public IPs for cluster services and programs the local
/// interface and packet filter to match.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Public IP ownership agent for cluster-managed services")]
struct Cli {
    /// This agent's identity. Defaults to a fresh random UUID.
    #[arg(long = "agent-id", visible_alias = "id")]
    agent_id: Option<String>,

    /// Seconds between lease-refresh passes. Lease TTL is always twice this.
    #[arg(long = "refresh-interval", default_value_t = 30)]
    refresh_interval: u64,

    /// Seconds a watcher sleeps before retrying after a transport failure.
    #[arg(long = "reconnect-interval", default_value_t = 5)]
    reconnect_interval: u64,

    /// Base URL of the cluster API.
    #[arg(long = "kube-endpoint", short = 'k', default_value = config::DEFAULT_KUBE_ENDPOINT)]
    kube_endpoint: String,

    /// Base URL of the coordination store.
    #[arg(long = "etcd-endpoint", short = 's', default_value = config::DEFAULT_ETCD_ENDPOINT)]
    etcd_endpoint: String,

    /// Key prefix under which public IP claims live.
    #[arg(long = "etcd-prefix", short = 'p', default_value = config::DEFAULT_ETCD_PREFIX)]
    etcd_prefix: String,

    /// Network interface addresses are added to and removed from.
    #[arg(long = "interface", short = 'i', default_value = config::DEFAULT_INTERFACE)]
    interface: String,

    /// Name of the managed mangle-table chain.
    #[arg(long = "fwchain", default_value = config::DEFAULT_FWCHAIN)]
    fwchain: String,

    /// fwmark value applied to matched packets.
    #[arg(long = "fwmark", default_value_t = config::DEFAULT_FWMARK)]
    fwmark: u32,

    /// CIDR allowlist; repeatable. Addresses outside every range are ignored.
    #[arg(long = "cidr-range", short = 'r')]
    cidr_range: Vec<String>,

    /// Skip the interface and firewall drivers entirely (dry-run).
    #[arg(long = "no-driver", short = 'n')]
    no_driver: bool,

    /// Raise the log level to info.
    #[arg(long = "verbose", short = 'v')]
    verbose: bool,

    /// Raise the log level to debug.
    #[arg(long = "debug", short = 'd')]
    debug: bool,
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

fn resolve_config(cli: &Cli) -> Result<RuntimeConfig, ConfigError> {
    let agent_id = match &cli.agent_id {
        Some(raw) => AgentId::parse(raw).map_err(ConfigError::InvalidAgentId)?,
        None => AgentId::generate(),
    };
    let cidr_ranges = config::parse_cidr_ranges(&cli.cidr_range)?;

    Ok(RuntimeConfig {
        agent_id,
        refresh_interval: Duration::from_secs(cli.refresh_interval),
        reconnect_interval: Duration::from_secs(cli.reconnect_interval),
        kube_endpoint: cli.kube_endpoint.clone(),
        etcd_endpoint: cli.etcd_endpoint.clone(),
        etcd_prefix: cli.etcd_prefix.clone(),
        interface: cli.interface.clone(),
        label: config::DEFAULT_LABEL.to_string(),
        fwchain: cli.fwchain.clone(),
        fwmark: cli.fwmark,
        cidr_ranges,
        no_driver: cli.no_driver,
    })
}

#[cfg(target_os = "linux")]
fn build_drivers(
    config: &RuntimeConfig,
) -> Result<(Arc<dyn InterfaceDriver>, Arc<dyn FirewallDriver>), Box<dyn std::error::Error>> {
    if config.no_driver {
        return Ok((Arc::new(NullInterfaceDriver), Arc::new(NullFirewallDriver)));
    }
    let interface: Arc<dyn InterfaceDriver> = Arc::new(NetlinkInterfaceDriver::new(&config.interface, &config.label)?);
    let firewall: Arc<dyn FirewallDriver> = Arc::new(IptablesFirewallDriver::new(&config.fwchain, config.fwmark)?);
    Ok((interface, firewall))
}

#[cfg(not(target_os = "linux"))]
fn build_drivers(
    _config: &RuntimeConfig,
) -> Result<(Arc<dyn InterfaceDriver>, Arc<dyn FirewallDriver>), Box<dyn std::error::Error>> {
    Ok((Arc::new(NullInterfaceDriver), Arc::new(NullFirewallDriver)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = resolve_config(&cli)?;

    info!(agent_id = %config.agent_id, version = env!("GIT_VERSION"), "starting kiwi");
    info!(kube_endpoint = %config.kube_endpoint, "cluster api configured");
    info!(etcd_endpoint = %config.etcd_endpoint, etcd_prefix = %config.etcd_prefix, "coordination store configured");
    info!(interface = %config.interface, "managing interface");

    let http = reqwest::Client::new();
    let coordination: Arc<dyn CoordinationClient> = Arc::new(EtcdCoordinationClient::new(
        http.clone(),
        config.etcd_endpoint.clone(),
        config.etcd_prefix.clone(),
        config.refresh_interval,
    ));

    let (interface, firewall) = build_drivers(&config)?;

    // A driver that must pre-create shared state (the firewall chain) fails
    // fast here, before any watcher spins up, rather than surfacing as a
    // per-call failure later.
    if !config.no_driver {
        info!("sweeping any addresses left by a previous crash");
        if let Err(err) = interface.remove_labelled().await {
            warn!(error = %err, "startup address sweep failed, continuing");
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    let (tick_tx, tick_rx) = tokio::sync::watch::channel(());

    let address_task = tokio::spawn(run_address_watcher(
        coordination.clone(),
        event_tx.clone(),
        config.reconnect_interval,
        shutdown_rx.clone(),
    ));
    let service_task = tokio::spawn(servicewatcher::run(
        http,
        config.kube_endpoint.clone(),
        service_event_sender(event_tx.clone()),
        config.reconnect_interval,
        shutdown_rx.clone(),
    ));
    let tick_task = tokio::spawn(run_ticker(config.refresh_interval, tick_tx, shutdown_rx.clone()));

    let manager = Manager::new(
        config.agent_id,
        config.refresh_interval,
        config.cidr_ranges.clone(),
        coordination,
        interface,
        firewall,
    );
    let manager_task = tokio::spawn(manager.run(event_rx, tick_rx));

    shutdown_signal().await;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(true);
    drop(event_tx);

    let _ = tokio::join!(address_task, service_task, tick_task, manager_task);
    info!("shutdown complete");
    Ok(())
}

/// Bridge the address watcher's [`kiwi_types::events::AddressEvent`] channel
/// onto the manager's merged [`Event`] channel.
async fn run_address_watcher(
    client: Arc<dyn CoordinationClient>,
    merged: tokio::sync::mpsc::Sender<Event>,
    reconnect_interval: Duration,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let watcher = tokio::spawn(addresswatcher::run(client, tx, reconnect_interval, shutdown));

    while let Some(event) = rx.recv().await {
        if merged.send(Event::Address(event)).await.is_err() {
            break;
        }
    }

    let _ = watcher.await;
}

/// Adapt an `Event` sender into the plain `ServiceEvent` sender
/// `servicewatcher::run` expects, matching `run_address_watcher`'s bridging
/// so both watchers are wired into the manager symmetrically.
fn service_event_sender(
    merged: tokio::sync::mpsc::Sender<Event>,
) -> tokio::sync::mpsc::Sender<kiwi_types::events::ServiceEvent> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if merged.send(Event::Service(event)).await.is_err() {
                break;
            }
        }
    });
    tx
}

async fn run_ticker(
    interval: Duration,
    tick: tokio::sync::watch::Sender<()>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tick.send(()).is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

