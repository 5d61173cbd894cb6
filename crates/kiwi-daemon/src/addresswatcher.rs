//! The address watcher: long-polls the coordination store and turns raw
//! watch responses into typed [`AddressEvent`]s on a channel. Runs as a
//! plain `tokio::spawn`ed task feeding an `mpsc::Sender`, one of two
//! independent producers feeding a single manager (see `crate::manager`).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use kiwi_types::events::{AddressEvent, AddressEventKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::coordination::{CoordinationClient, WatchAction, WatchResponse};

/// Runs until `shutdown` fires, pushing [`AddressEvent`]s onto `tx`.
/// Reconnects after `reconnect_interval` on a transport error. A malformed
/// event (unparseable key, unrecognized action) is logged and skipped
/// without reconnecting — `wait_index` still advances past it, since the
/// coordination store already told us what the next index is.
pub async fn run(
    client: Arc<dyn CoordinationClient>,
    tx: mpsc::Sender<AddressEvent>,
    reconnect_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut wait_index: Option<u64> = None;

    loop {
        if *shutdown.borrow() {
            return;
        }

        debug!(?wait_index, "watching addresses");

        tokio::select! {
            result = client.watch(wait_index) => {
                match result {
                    Ok(response) => {
                        // Advance before interpreting: a bad key or
                        // unknown action must not pin waitIndex at the
                        // same value forever, or the same long-poll
                        // response would be re-delivered on every retry.
                        wait_index = Some(response.next_wait_index);

                        if let Some(event) = interpret(&response) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        error!(%err, "address watch request failed");
                        tokio::select! {
                            _ = tokio::time::sleep(reconnect_interval) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
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

/// Decode a raw watch response into a typed [`AddressEvent`], logging and
/// returning `None` for a key whose final path component isn't a dotted-quad
/// IPv4 address or an action this client doesn't recognize — the coordination
/// store's subtree may hold unrelated keys, and its action vocabulary may
/// grow. Either is skipped, not treated as a failure.
fn interpret(response: &WatchResponse) -> Option<AddressEvent> {
    let Some(address) = response.key.rsplit('/').next() else {
        warn!(key = %response.key, "watch event key had no path component, skipping");
        return None;
    };

    let Ok(ip) = address.parse::<Ipv4Addr>() else {
        warn!(%address, "watch event key is not a dotted-quad ipv4 address, skipping");
        return None;
    };

    let Some(action) = WatchAction::parse(&response.raw_action) else {
        warn!(action = %response.raw_action, %ip, "unrecognized watch action, skipping");
        return None;
    };

    let kind = match action {
        WatchAction::Create => AddressEventKind::Created,
        WatchAction::Set => AddressEventKind::Set,
        WatchAction::Delete | WatchAction::CompareAndDelete => AddressEventKind::Deleted,
        WatchAction::Expire => AddressEventKind::Expired,
    };

    Some(AddressEvent { kind, ip })
}
