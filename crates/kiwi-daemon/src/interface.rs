//! The interface driver: adds and removes `/32` host addresses on a
//! managed interface, tagged with a label so the set of kiwi-managed
//! addresses can be recovered at startup without any on-disk state.
//! Programs addresses via `rtnetlink` rather than shelling out to `ip`.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors raised by an [`InterfaceDriver`]. The manager treats every
/// variant as recoverable and merely logs it: the source of truth is the
/// coordination store and the next refresh pass will re-converge.
#[derive(Debug, Error)]
pub enum InterfaceDriverError {
    /// The underlying netlink request failed.
    #[error("netlink request failed: {0}")]
    Netlink(String),

    /// The managed interface does not exist.
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
}

/// Adds and removes `/32` addresses on a single managed interface.
#[async_trait]
pub trait InterfaceDriver: Send + Sync {
    /// Add `ip/32` to the managed interface, labelled so it can be
    /// recovered by [`InterfaceDriver::remove_labelled`] without persisted
    /// state.
    async fn add_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError>;

    /// Remove `ip/32` from the managed interface. Removing an address that
    /// is not present is not an error.
    async fn remove_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError>;

    /// Enumerate every address currently bearing this driver's label and
    /// remove each one. Invoked at startup for idempotent recovery and at
    /// shutdown.
    async fn remove_labelled(&self) -> Result<(), InterfaceDriverError>;

    /// Equivalent to [`InterfaceDriver::remove_labelled`].
    async fn cleanup(&self) -> Result<(), InterfaceDriverError> {
        self.remove_labelled().await
    }
}

/// Build the `{interface}:{label}` tag netlink stores in the address's
/// `IFA_LABEL` attribute.
fn label_tag(interface: &str, label: &str) -> String {
    format!("{interface}:{label}")
}

/// No-op driver for `--no-driver` dry-run mode. The guard lives in the
/// driver itself so the manager never needs to know whether drivers are
/// real.
pub struct NullInterfaceDriver;

#[async_trait]
impl InterfaceDriver for NullInterfaceDriver {
    async fn add_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
        debug!(%ip, "dry-run: not adding address");
        Ok(())
    }

    async fn remove_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
        debug!(%ip, "dry-run: not removing address");
        Ok(())
    }

    async fn remove_labelled(&self) -> Result<(), InterfaceDriverError> {
        debug!("dry-run: not sweeping labelled addresses");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::NetlinkInterfaceDriver;

#[cfg(target_os = "linux")]
mod linux {
    use std::net::{IpAddr, Ipv4Addr};

    use async_trait::async_trait;
    use futures::TryStreamExt;
    use netlink_packet_route::address::AddressAttribute;
    use rtnetlink::{Handle, new_connection};
    use tracing::{debug, info};

    use super::{InterfaceDriver, InterfaceDriverError, label_tag};

    /// Netlink-backed interface driver for Linux hosts.
    pub struct NetlinkInterfaceDriver {
        handle: Handle,
        interface: String,
        label: String,
    }

    impl NetlinkInterfaceDriver {
        /// Connect to rtnetlink and bind to the given interface/label pair.
        pub fn new(interface: impl Into<String>, label: impl Into<String>) -> Result<Self, InterfaceDriverError> {
            let (conn, handle, _) =
                new_connection().map_err(|e| InterfaceDriverError::Netlink(e.to_string()))?;
            tokio::spawn(conn);
            Ok(Self {
                handle,
                interface: interface.into(),
                label: label.into(),
            })
        }

        async fn link_index(&self) -> Result<u32, InterfaceDriverError> {
            let mut links = self
                .handle
                .link()
                .get()
                .match_name(self.interface.clone())
                .execute();
            let link = links
                .try_next()
                .await
                .map_err(|e| InterfaceDriverError::Netlink(e.to_string()))?
                .ok_or_else(|| InterfaceDriverError::InterfaceNotFound(self.interface.clone()))?;
            Ok(link.header.index)
        }
    }

    #[async_trait]
    impl InterfaceDriver for NetlinkInterfaceDriver {
        async fn add_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
            let index = self.link_index().await?;
            let label = label_tag(&self.interface, &self.label);

            debug!(interface = %self.interface, %ip, %label, "adding address");

            let mut request = self.handle.address().add(index, IpAddr::V4(ip), 32);
            request
                .message_mut()
                .attributes
                .push(AddressAttribute::Label(label));

            request
                .execute()
                .await
                .map_err(|e| InterfaceDriverError::Netlink(e.to_string()))?;

            info!(interface = %self.interface, %ip, "added address to device");
            Ok(())
        }

        async fn remove_address(&self, ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
            let index = self.link_index().await?;

            let existing: Vec<_> = self
                .handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute()
                .try_collect()
                .await
                .map_err(|e| InterfaceDriverError::Netlink(e.to_string()))?;

            for msg in existing {
                let matches = msg.attributes.iter().any(|attr| {
                    matches!(attr, AddressAttribute::Address(IpAddr::V4(addr)) if *addr == ip)
                });
                if matches {
                    self.handle
                        .address()
                        .del(msg)
                        .execute()
                        .await
                        .map_err(|e| InterfaceDriverError::Netlink(e.to_string()))?;
                }
            }

            info!(interface = %self.interface, %ip, "removed address from device");
            Ok(())
        }

        async fn remove_labelled(&self) -> Result<(), InterfaceDriverError> {
            let index = self.link_index().await?;
            let label = label_tag(&self.interface, &self.label);

            let existing: Vec<_> = self
                .handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute()
                .try_collect()
                .await
                .map_err(|e| InterfaceDriverError::Netlink(e.to_string()))?;

            let mut removed = 0usize;
            for msg in existing {
                let has_label = msg
                    .attributes
                    .iter()
                    .any(|attr| matches!(attr, AddressAttribute::Label(l) if *l == label));
                if has_label {
                    self.handle
                        .address()
                        .del(msg)
                        .execute()
                        .await
                        .map_err(|e| InterfaceDriverError::Netlink(e.to_string()))?;
                    removed += 1;
                }
            }

            debug!(interface = %self.interface, %label, removed, "swept labelled addresses");
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::NetlinkInterfaceDriver;

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::net::Ipv4Addr;

    use async_trait::async_trait;

    use super::{InterfaceDriver, InterfaceDriverError};

    /// Non-Linux stand-in; Kiwi's interface driver only runs on Linux.
    pub struct NetlinkInterfaceDriver;

    impl NetlinkInterfaceDriver {
        /// Construction always fails off Linux.
        pub fn new(_interface: impl Into<String>, _label: impl Into<String>) -> Result<Self, InterfaceDriverError> {
            Err(InterfaceDriverError::Netlink(
                "interface driver is only supported on linux".into(),
            ))
        }
    }

    #[async_trait]
    impl InterfaceDriver for NetlinkInterfaceDriver {
        async fn add_address(&self, _ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
            unreachable!("NetlinkInterfaceDriver::new always fails off linux")
        }

        async fn remove_address(&self, _ip: Ipv4Addr) -> Result<(), InterfaceDriverError> {
            unreachable!("NetlinkInterfaceDriver::new always fails off linux")
        }

        async fn remove_labelled(&self) -> Result<(), InterfaceDriverError> {
            unreachable!("NetlinkInterfaceDriver::new always fails off linux")
        }
    }
}
