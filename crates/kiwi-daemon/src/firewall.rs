//! The firewall driver: marks inbound packets for a claimed service so they
//! can be matched downstream, without touching the `nat` table rules the
//! cluster proxy owns. Drives the `iptables` crate directly rather than
//! shelling out to the binary.

use async_trait::async_trait;
use kiwi_types::{Protocol, Service};
use thiserror::Error;

/// Errors raised by a [`FirewallDriver`]. As with [`crate::interface`],
/// every variant is recoverable: the manager logs and lets the next
/// refresh pass re-converge.
#[derive(Debug, Error)]
pub enum FirewallDriverError {
    /// The underlying `iptables` invocation failed.
    #[error("iptables command failed: {0}")]
    Command(String),
}

/// Applies and removes the mangle-table rule that marks packets destined
/// for a claimed `(address, service)` pair.
#[async_trait]
pub trait FirewallDriver: Send + Sync {
    /// Add the mark rule for `service` on `address`, unless an identical
    /// rule is already present.
    async fn add_service(&self, address: std::net::Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError>;

    /// Remove the mark rule for `service` on `address`.
    async fn remove_service(&self, address: std::net::Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError>;

    /// Flush every rule this driver has installed in its managed chain.
    /// Invoked at startup (recovering from a crash with stale rules still
    /// in place) and at shutdown.
    async fn cleanup(&self) -> Result<(), FirewallDriverError>;
}

/// Render the mangle-table rule for a claimed service: match on destination
/// address, protocol, and port, and mark the packet.
fn rule_for(address: std::net::Ipv4Addr, service: &Service, fwmark: u32) -> String {
    let proto = match service.protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
    };
    format!(
        "-d {address} -p {proto} --dport {port} -m comment --comment {comment} -j MARK --set-mark {fwmark}",
        port = service.port,
        comment = service.id,
    )
}

/// No-op driver for `--no-driver` dry-run mode, so the manager doesn't need
/// an `Option<dyn Driver>` to skip real enforcement.
pub struct NullFirewallDriver;

#[async_trait]
impl FirewallDriver for NullFirewallDriver {
    async fn add_service(&self, address: std::net::Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
        tracing::debug!(%address, service = %service.id, "dry-run: not adding firewall rule");
        Ok(())
    }

    async fn remove_service(&self, address: std::net::Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
        tracing::debug!(%address, service = %service.id, "dry-run: not removing firewall rule");
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), FirewallDriverError> {
        tracing::debug!("dry-run: not flushing firewall chain");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::IptablesFirewallDriver;

#[cfg(target_os = "linux")]
mod linux {
    use std::net::Ipv4Addr;

    use async_trait::async_trait;
    use iptables::IPTables;
    use tracing::info;

    use super::{rule_for, FirewallDriver, FirewallDriverError};
    use kiwi_types::Service;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// `iptables`-crate-backed firewall driver targeting the `mangle`
    /// table, evaluated before the `nat` table's REDIRECT rules so a
    /// service's fwmark is visible to downstream routing decisions.
    pub struct IptablesFirewallDriver {
        ipt: IPTables,
        fwchain: String,
        fwmark: u32,
        rules: Mutex<HashSet<String>>,
    }

    impl IptablesFirewallDriver {
        /// Open the system iptables binding and ensure `fwchain` exists and
        /// is empty.
        pub fn new(fwchain: impl Into<String>, fwmark: u32) -> Result<Self, FirewallDriverError> {
            let ipt = iptables::new(false).map_err(|e| FirewallDriverError::Command(e.to_string()))?;
            let fwchain = fwchain.into();

            let chains = ipt
                .list_chains("mangle")
                .map_err(|e| FirewallDriverError::Command(e.to_string()))?;
            if !chains.contains(&fwchain) {
                info!(chain = %fwchain, "creating mangle chain");
                ipt.new_chain("mangle", &fwchain)
                    .map_err(|e| FirewallDriverError::Command(e.to_string()))?;
            }
            ipt.flush_chain("mangle", &fwchain)
                .map_err(|e| FirewallDriverError::Command(e.to_string()))?;

            Ok(Self {
                ipt,
                fwchain,
                fwmark,
                rules: Mutex::new(HashSet::new()),
            })
        }
    }

    // iptables::IPTables shells out synchronously. Calls are infrequent
    // (one per service add/remove) so they run inline rather than through
    // spawn_blocking.
    #[async_trait]
    impl FirewallDriver for IptablesFirewallDriver {
        async fn add_service(&self, address: Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
            let rule = rule_for(address, service, self.fwmark);

            if self.rules.lock().unwrap().contains(&rule) {
                info!(service = %service.id, %address, "firewall rule already present");
                return Ok(());
            }

            info!(service = %service.id, %address, port = service.port, "adding firewall rule");
            self.ipt
                .append_unique("mangle", &self.fwchain, &rule)
                .map_err(|e| FirewallDriverError::Command(e.to_string()))?;
            self.rules.lock().unwrap().insert(rule);
            Ok(())
        }

        async fn remove_service(&self, address: Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
            let rule = rule_for(address, service, self.fwmark);

            info!(service = %service.id, %address, port = service.port, "removing firewall rule");
            self.ipt
                .delete("mangle", &self.fwchain, &rule)
                .map_err(|e| FirewallDriverError::Command(e.to_string()))?;
            self.rules.lock().unwrap().remove(&rule);
            Ok(())
        }

        async fn cleanup(&self) -> Result<(), FirewallDriverError> {
            info!(chain = %self.fwchain, "flushing all firewall rules");
            self.ipt
                .flush_chain("mangle", &self.fwchain)
                .map_err(|e| FirewallDriverError::Command(e.to_string()))?;
            self.rules.lock().unwrap().clear();
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::IptablesFirewallDriver;

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::net::Ipv4Addr;

    use async_trait::async_trait;
    use kiwi_types::Service;

    use super::{FirewallDriver, FirewallDriverError};

    /// Non-Linux stand-in; Kiwi's firewall driver only runs on Linux.
    pub struct IptablesFirewallDriver;

    impl IptablesFirewallDriver {
        /// Construction always fails off Linux.
        pub fn new(_fwchain: impl Into<String>, _fwmark: u32) -> Result<Self, FirewallDriverError> {
            Err(FirewallDriverError::Command(
                "firewall driver is only supported on linux".into(),
            ))
        }
    }

    #[async_trait]
    impl FirewallDriver for IptablesFirewallDriver {
        async fn add_service(&self, _address: Ipv4Addr, _service: &Service) -> Result<(), FirewallDriverError> {
            unreachable!("IptablesFirewallDriver::new always fails off linux")
        }

        async fn remove_service(&self, _address: Ipv4Addr, _service: &Service) -> Result<(), FirewallDriverError> {
            unreachable!("IptablesFirewallDriver::new always fails off linux")
        }

        async fn cleanup(&self) -> Result<(), FirewallDriverError> {
            unreachable!("IptablesFirewallDriver::new always fails off linux")
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kiwi_types::ServiceId;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tracing::debug;

    #[derive(Default)]
    pub struct RecordingFirewallDriver {
        pub added: Mutex<Vec<String>>,
        pub removed: Mutex<Vec<String>>,
        pub flushed: Mutex<u32>,
    }

    #[async_trait]
    impl FirewallDriver for RecordingFirewallDriver {
        async fn add_service(&self, address: std::net::Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
            self.added.lock().unwrap().push(rule_for(address, service, 1));
            Ok(())
        }

        async fn remove_service(&self, address: std::net::Ipv4Addr, service: &Service) -> Result<(), FirewallDriverError> {
            self.removed.lock().unwrap().push(rule_for(address, service, 1));
            Ok(())
        }

        async fn cleanup(&self) -> Result<(), FirewallDriverError> {
            *self.flushed.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn svc() -> Service {
        Service {
            id: ServiceId("svc-a".into()),
            protocol: Protocol::Tcp,
            port: 443,
            public_ips: Default::default(),
        }
    }

    #[test]
    fn rule_for_embeds_address_protocol_port_and_mark() {
        let rule = rule_for(Ipv4Addr::new(10, 0, 0, 5), &svc(), 7);
        assert!(rule.contains("-d 10.0.0.5"));
        assert!(rule.contains("-p tcp"));
        assert!(rule.contains("--dport 443"));
        assert!(rule.contains("--set-mark 7"));
        assert!(rule.contains("svc-a"));
    }

    #[tokio::test]
    async fn add_and_remove_round_trip_through_recording_driver() {
        let driver = RecordingFirewallDriver::default();
        let address = Ipv4Addr::new(10, 0, 0, 5);
        driver.add_service(address, &svc()).await.unwrap();
        assert_eq!(driver.added.lock().unwrap().len(), 1);

        driver.remove_service(address, &svc()).await.unwrap();
        assert_eq!(driver.removed.lock().unwrap().len(), 1);
        debug!("round trip complete");
    }
}
