// SPDX-License-Identifier: Apache-2.0

//! etcd-backed register: announce-and-keepalive registrations, prefix
//! watches with an eager initial fetch, and ordinal slot queries.

use super::{IndexParser, Register, WatchHandler, max_parsed_index};
use crate::transports::etcd::Client;
use crate::{Result, error};
use async_trait::async_trait;
use etcd_client::EventType;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause between attempts when re-establishing a lost lease. Keeps the
/// recovery loop from spinning hot against an unreachable store.
const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Register backed by an external etcd cluster.
pub struct EtcdRegister {
    client: Client,
    /// One keepalive driver task per live registration, each cancelled
    /// through its own child token. Owned by this instance, no
    /// process-wide state.
    records: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

impl EtcdRegister {
    pub async fn new(
        endpoints: Vec<String>,
        op_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        if endpoints.is_empty() {
            return Err(error!("etcd register requires at least one endpoint"));
        }
        let client = Client::new(endpoints, op_timeout).await?;
        Ok(Self::with_client(client, cancel))
    }

    pub fn with_client(client: Client, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            client,
            records: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// The underlying coordination client, shared with the singleton
    /// elector.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Keeps `key` registered until cancelled. When the keepalive stream
    /// ends the old lease is presumed gone, so a fresh lease and put are
    /// established from scratch; retries are unbounded. The registration is
    /// absent from the cluster's view during the gap.
    async fn keep_registered(
        client: Client,
        key: String,
        value: String,
        ttl: i64,
        mut lease_id: i64,
        cancel: CancellationToken,
    ) {
        loop {
            if let Err(e) = client.keep_alive(lease_id, ttl, &cancel).await {
                tracing::warn!(key = %key, error = %e, "keepalive attach failed");
            }
            if cancel.is_cancelled() {
                return;
            }
            tracing::warn!(key = %key, "lease lost, re-registering");
            loop {
                let attempt = async {
                    let id = client.grant(ttl).await?;
                    client.put(&key, &value, id).await?;
                    crate::OK(id)
                };
                match attempt.await {
                    Ok(id) => {
                        tracing::info!(key = %key, lease_id = id, "re-registered");
                        lease_id = id;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "re-register failed, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = async {
                                tokio::time::sleep(RETRY_PAUSE).await;
                                // the store may be unreachable, not just slow
                                client.recover().await;
                            } => {}
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Register for EtcdRegister {
    async fn register(&self, key: &str, value: &str, ttl: i64) -> Result<()> {
        if ttl <= 0 {
            return self.client.put(key, value, 0).await;
        }

        // grant + put happen synchronously so construction-time failures
        // surface to the caller; renewal continues in the background
        let lease_id = self.client.grant(ttl).await?;
        self.client.put(key, value, lease_id).await?;

        let child = self.cancel.child_token();
        if let Some(old) = self.records.lock().insert(key.to_string(), child.clone()) {
            old.cancel();
        }

        let client = self.client.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::spawn(Self::keep_registered(client, key, value, ttl, lease_id, child));
        Ok(())
    }

    async fn unregister(&self, key: &str) -> Result<()> {
        if let Some(token) = self.records.lock().remove(key) {
            token.cancel();
        }
        self.client.delete(key).await
    }

    async fn watch(&self, key_prefix: &str, handler: WatchHandler) -> Result<()> {
        // eager fetch first so late subscribers observe current state
        for (k, v) in self.client.get_prefix(key_prefix).await? {
            handler(&k, &v, false);
        }

        let (watcher, mut stream) = self.client.watch_prefix(key_prefix).await?;
        let cancel = self.cancel.child_token();
        let prefix = key_prefix.to_string();
        tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                let resp = tokio::select! {
                    _ = cancel.cancelled() => return,
                    resp = stream.next() => resp,
                };
                let resp = match resp {
                    Some(Ok(resp)) => resp,
                    Some(Err(e)) => {
                        tracing::warn!(prefix = %prefix, error = %e, "watch stream failed");
                        return;
                    }
                    None => return,
                };
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let (key, value) = match (kv.key_str(), kv.value_str()) {
                        (Ok(k), Ok(v)) => (k, v),
                        _ => {
                            tracing::warn!(prefix = %prefix, "non-utf8 watch event, skipping");
                            continue;
                        }
                    };
                    match event.event_type() {
                        EventType::Put => handler(key, value, false),
                        EventType::Delete => handler(key, "", true),
                    }
                }
            }
        });
        Ok(())
    }

    async fn last_prefixed_index(
        &self,
        key_prefix: &str,
        parser: IndexParser<'_>,
    ) -> Result<i64> {
        let kvs = self.client.get_prefix(key_prefix).await?;
        Ok(max_parsed_index(kvs.iter().map(|(k, _)| k.as_str()), parser))
    }
}

impl Drop for EtcdRegister {
    fn drop(&mut self) {
        for token in self.records.lock().values() {
            token.cancel();
        }
    }
}
