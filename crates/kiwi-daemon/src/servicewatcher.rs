//! The service watcher: streams the cluster API's service watch endpoint
//! and turns each decoded object into a typed [`ServiceEvent`] on a
//! channel. The wire framing only has to deliver whole events, never
//! partial JSON, so this splits `reqwest`'s chunked byte stream on
//! newlines rather than parsing a length-prefixed frame.

use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use kiwi_types::Service;
use kiwi_types::events::{ServiceEvent, ServiceEventKind};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Errors specific to decoding the service watch stream.
#[derive(Debug, Error)]
pub enum ServiceWatchError {
    /// The HTTP request failed outright.
    #[error("request to cluster api failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A line of the stream was not valid JSON.
    #[error("failed to decode watch event: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum WireEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: WireEventType,
    object: Service,
}

/// Runs until `shutdown` fires, pushing [`ServiceEvent`]s onto `tx`.
/// Unconditionally reconnects after `reconnect_interval` whenever the
/// stream ends or errors.
pub async fn run(
    client: Client,
    kube_endpoint: String,
    tx: mpsc::Sender<ServiceEvent>,
    reconnect_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("{kube_endpoint}/api/v1beta1/watch/services");

    loop {
        if *shutdown.borrow() {
            return;
        }

        debug!(%url, "connecting to service watch");

        tokio::select! {
            result = stream_once(&client, &url, &tx) => {
                if let Err(err) = result {
                    error!(%err, "service watch stream ended");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        warn!("reconnecting to service watch");
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

async fn stream_once(
    client: &Client,
    url: &str,
    tx: &mpsc::Sender<ServiceEvent>,
) -> Result<(), ServiceWatchError> {
    let response = client.get(url).send().await?;
    let response = response.error_for_status()?;

    let mut stream = response.bytes_stream();
    let mut buf = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);

        while let Some(line) = take_line(&mut buf) {
            if line.is_empty() {
                continue;
            }

            let wire: WireEvent = serde_json::from_slice(&line)?;
            let kind = match wire.event_type {
                WireEventType::Added => ServiceEventKind::Added,
                WireEventType::Modified => ServiceEventKind::Modified,
                WireEventType::Deleted => ServiceEventKind::Deleted,
            };

            debug!(service = %wire.object.id, ?kind, "received service event");

            if tx
                .send(ServiceEvent {
                    kind,
                    service: wire.object,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Pull one newline-delimited line out of `buf`, leaving any remainder in
/// place. Returns `None` once `buf` holds no complete line.
fn take_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let line = buf.split_to(pos);
    buf.split_to(1); // drop the newline itself
    Some(line)
}
