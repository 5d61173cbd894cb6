//! The coordination client: CAS+TTL leases against an etcd-v2-shaped
//! key/value store, keyed by public IP under `{prefix}/publicips/{address}`.
//!
//! Wraps etcd's v2 HTTP API (`PUT`/`DELETE` with `prevExist`/`prevValue`/
//! `ttl` query parameters) behind a typed client with a dedicated error
//! type, instead of inline `reqwest` calls scattered through callers.

use std::net::Ipv4Addr;
use std::time::Duration;

use kiwi_types::AgentId;
use reqwest::{Client, StatusCode};
use thiserror::Error;

/// Errors raised by a [`CoordinationClient`] operation.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The HTTP request itself failed (connection refused, timed out, …).
    #[error("request to coordination store failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The store rejected the CAS precondition. Logged at debug level by
    /// callers: this is the expected outcome when another agent holds the
    /// claim.
    #[error("compare-and-swap precondition failed")]
    PreconditionFailed,

    /// The store returned a response this client could not interpret.
    #[error("unexpected response from coordination store: {0}")]
    Protocol(String),
}

/// One polled or long-polled change under `{prefix}/publicips`, reported in
/// as close to raw form as the transport allows: the caller (the address
/// watcher) is the one that decides whether `key`/`action` are well-formed,
/// because only it can both log-and-skip a malformed event *and* still
/// advance past it. Bundling "I couldn't make sense of this" into the same
/// error as "the request itself failed" would leave `wait_index` pinned at
/// the same value forever, since a long-poll re-returns the same change for
/// an unchanged `waitIndex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    /// The action etcd reported, verbatim and not yet validated against
    /// [`WatchAction`].
    pub raw_action: String,
    /// The full key path of the node that changed, not yet split into a
    /// public IP.
    pub key: String,
    /// The index to resume watching from on the next call
    /// (`modifiedIndex + 1`). Always present on an `Ok` result, even when
    /// `raw_action`/`key` turn out to be unusable.
    pub next_wait_index: u64,
}

/// The kind of change a watch response reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// Key created (did not previously exist).
    Create,
    /// Key value overwritten in place.
    Set,
    /// Key explicitly removed.
    Delete,
    /// Key explicitly removed via a compare-and-delete (treated the same
    /// as [`WatchAction::Delete`]).
    CompareAndDelete,
    /// Key's TTL lease expired.
    Expire,
}

impl WatchAction {
    /// Parse etcd's (case-insensitive) action name. Returns `None` for
    /// anything unrecognized so the caller can log-and-skip rather than
    /// treat an unknown action as a transport failure.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "create" => Some(WatchAction::Create),
            "set" => Some(WatchAction::Set),
            "delete" => Some(WatchAction::Delete),
            "compareanddelete" => Some(WatchAction::CompareAndDelete),
            "expire" => Some(WatchAction::Expire),
            _ => None,
        }
    }
}

/// A strongly-consistent key/value store offering CAS and TTL leases over
/// public IP ownership.
#[async_trait::async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Long-poll for the next change under `{prefix}/publicips`, resuming
    /// from `wait_index` if given. Blocks until a change occurs or the
    /// underlying request errors. Deliberately untimed (unlike
    /// `acquire`/`refresh`/`release`) but must remain cancellable by the
    /// caller.
    async fn watch(&self, wait_index: Option<u64>) -> Result<WatchResponse, CoordinationError>;

    /// Attempt to acquire the lease for `ip` on behalf of `agent_id`,
    /// failing if any value is already present (`prevExist=false`).
    /// Succeeds only if no other agent currently holds the claim.
    async fn acquire(&self, ip: Ipv4Addr, agent_id: AgentId, ttl: Duration) -> Result<(), CoordinationError>;

    /// Refresh a lease this agent already holds (`prevValue=agent_id`),
    /// extending its TTL.
    async fn refresh(&self, ip: Ipv4Addr, agent_id: AgentId, ttl: Duration) -> Result<(), CoordinationError>;

    /// Release a lease this agent holds (`prevValue=agent_id`).
    async fn release(&self, ip: Ipv4Addr, agent_id: AgentId) -> Result<(), CoordinationError>;
}

/// `reqwest`-backed [`CoordinationClient`] talking to an etcd v2 HTTP API.
pub struct EtcdCoordinationClient {
    client: Client,
    endpoint: String,
    prefix: String,
    /// Hard timeout applied to `acquire`/`refresh`/`release`, roughly equal
    /// to the refresh interval, so a stuck call can't prevent the manager's
    /// refresh pass from ever completing. `watch` is exempt — it long-polls
    /// by design — but stays cancellable via the caller's `select!`.
    request_timeout: Duration,
}

impl EtcdCoordinationClient {
    /// Build a client bound to `endpoint` (e.g. `http://127.0.0.1:4001`)
    /// and `prefix` (e.g. `/kiwi`), timing out `acquire`/`refresh`/`release`
    /// calls after `request_timeout`.
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        prefix: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            prefix: prefix.into(),
            request_timeout,
        }
    }

    fn keys_url(&self) -> String {
        format!("{}/v2/keys{}/publicips", self.endpoint, self.prefix)
    }

    fn key_url(&self, ip: Ipv4Addr) -> String {
        format!("{}/{}", self.keys_url(), ip)
    }
}

#[async_trait::async_trait]
impl CoordinationClient for EtcdCoordinationClient {
    async fn watch(&self, wait_index: Option<u64>) -> Result<WatchResponse, CoordinationError> {
        let mut query = vec![("recursive", "true".to_string()), ("wait", "true".to_string())];
        if let Some(index) = wait_index {
            query.push(("waitIndex", index.to_string()));
        }

        let response = self.client.get(self.keys_url()).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "watch failed with status {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json().await?;
        let node = &body["node"];

        // `modifiedIndex` is the one field we can't do without: with no
        // index to resume from, the next call would have to replay from
        // the start. Everything else below is intentionally best-effort —
        // an unusable `key` or `action` is the address watcher's problem to
        // log and skip, not this client's problem to fail transport-style.
        let modified_index = node["modifiedIndex"]
            .as_u64()
            .ok_or_else(|| CoordinationError::Protocol("node.modifiedIndex missing".into()))?;

        let key = node["key"].as_str().unwrap_or_default().to_string();
        let raw_action = body["action"].as_str().unwrap_or_default().to_string();

        Ok(WatchResponse {
            raw_action,
            key,
            next_wait_index: modified_index + 1,
        })
    }

    async fn acquire(&self, ip: Ipv4Addr, agent_id: AgentId, ttl: Duration) -> Result<(), CoordinationError> {
        let response = self
            .client
            .put(self.key_url(ip))
            .query(&[("prevExist", "false".to_string()), ("ttl", ttl.as_secs().to_string())])
            .form(&[("value", agent_id.to_string())])
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Err(CoordinationError::PreconditionFailed);
        }
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "acquire failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn refresh(&self, ip: Ipv4Addr, agent_id: AgentId, ttl: Duration) -> Result<(), CoordinationError> {
        let response = self
            .client
            .put(self.key_url(ip))
            .query(&[
                ("prevValue", agent_id.to_string()),
                ("ttl", ttl.as_secs().to_string()),
            ])
            .form(&[("value", agent_id.to_string())])
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Err(CoordinationError::PreconditionFailed);
        }
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "refresh failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn release(&self, ip: Ipv4Addr, agent_id: AgentId) -> Result<(), CoordinationError> {
        let response = self
            .client
            .delete(self.key_url(ip))
            .query(&[("prevValue", agent_id.to_string())])
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Err(CoordinationError::PreconditionFailed);
        }
        if !response.status().is_success() {
            return Err(CoordinationError::Protocol(format!(
                "release failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_url_joins_endpoint_prefix_and_address() {
        let client = EtcdCoordinationClient::new(Client::new(), "http://etcd:4001", "/kiwi", Duration::from_secs(30));
        assert_eq!(
            client.key_url(Ipv4Addr::new(10, 0, 0, 1)),
            "http://etcd:4001/v2/keys/kiwi/publicips/10.0.0.1"
        );
    }

    #[test]
    fn keys_url_has_no_trailing_address() {
        let client = EtcdCoordinationClient::new(Client::new(), "http://etcd:4001", "/kiwi", Duration::from_secs(30));
        assert_eq!(client.keys_url(), "http://etcd:4001/v2/keys/kiwi/publicips");
    }

    #[test]
    fn watch_action_parse_is_case_insensitive() {
        assert_eq!(WatchAction::parse("Expire"), Some(WatchAction::Expire));
        assert_eq!(WatchAction::parse("COMPAREANDDELETE"), Some(WatchAction::CompareAndDelete));
    }

    #[test]
    fn watch_action_parse_rejects_unknown_action() {
        assert_eq!(WatchAction::parse("renew"), None);
    }
}
