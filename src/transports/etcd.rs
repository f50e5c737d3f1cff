// SPDX-License-Identifier: Apache-2.0

//! etcd transport: connection management plus the coordination primitives
//! (lease grant/keepalive, prefix queries, watch streams, non-blocking
//! locks) the registration backends and the singleton elector are built on.

use crate::{ErrorContext, Result, error};
use etcd_client::{
    Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
    WatchStream, Watcher,
};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Manages the etcd client connection with reconnection support.
pub struct Connector {
    /// The actual etcd client, protected by RwLock for safe updates during
    /// reconnection.
    client: RwLock<etcd_client::Client>,
    endpoints: Vec<String>,
    connect_options: Option<ConnectOptions>,
    /// Initial backoff duration for reconnection attempts.
    pub initial_backoff: Duration,
    /// Maximum backoff duration for reconnection attempts.
    pub max_backoff: Duration,
}

impl Connector {
    /// Create a new connector with an established connection.
    pub async fn new(
        endpoints: Vec<String>,
        connect_options: Option<ConnectOptions>,
    ) -> Result<Arc<Self>> {
        let client = Self::connect(&endpoints, &connect_options).await?;

        Ok(Arc::new(Self {
            client: RwLock::new(client),
            endpoints,
            connect_options,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }))
    }

    async fn connect(
        endpoints: &[String],
        connect_options: &Option<ConnectOptions>,
    ) -> Result<etcd_client::Client> {
        etcd_client::Client::connect(endpoints.to_vec(), connect_options.clone())
            .await
            .with_context(|| {
                format!(
                    "unable to connect to etcd at {}; check etcd server status",
                    endpoints.join(", ")
                )
            })
    }

    /// Get a clone of the current etcd client.
    pub fn get_client(&self) -> etcd_client::Client {
        self.client.read().clone()
    }

    /// Reconnect with capped exponential backoff, giving up at `deadline`.
    pub async fn reconnect(&self, deadline: std::time::Instant) -> Result<()> {
        tracing::warn!("reconnecting to etcd at: {:?}", self.endpoints);

        let mut backoff = self.initial_backoff;

        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(error!("unable to reconnect to etcd: deadline exceeded"));
            }
            let remaining = deadline.saturating_duration_since(now);
            backoff = std::cmp::min(std::cmp::min(backoff, remaining / 2), self.max_backoff);
            sleep(backoff).await;

            match Self::connect(&self.endpoints, &self.connect_options).await {
                Ok(new_client) => {
                    tracing::info!("reconnected to etcd");
                    let mut client_guard = self.client.write();
                    *client_guard = new_client;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("reconnection failed (remaining time: {remaining:?}): {e}");
                    backoff *= 2;
                }
            }
        }
    }
}

/// Thin coordination-primitive layer over a [`Connector`]. Every round trip
/// is bounded by the configured operation timeout.
#[derive(Clone)]
pub struct Client {
    connector: Arc<Connector>,
    op_timeout: Duration,
}

impl Client {
    pub async fn new(endpoints: Vec<String>, op_timeout: Duration) -> Result<Self> {
        let connector = Connector::new(endpoints, None).await?;
        Ok(Self {
            connector,
            op_timeout,
        })
    }

    fn etcd(&self) -> etcd_client::Client {
        self.connector.get_client()
    }

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = std::result::Result<T, etcd_client::Error>>,
    ) -> Result<T> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| error!("etcd {what} timed out after {:?}", self.op_timeout))?
            .with_context(|| format!("etcd {what} failed"))
    }

    /// Grant a lease of `ttl` seconds and return its id.
    pub async fn grant(&self, ttl: i64) -> Result<i64> {
        let mut client = self.etcd();
        let resp = self
            .bounded("lease grant", client.lease_grant(ttl, None))
            .await?;
        Ok(resp.id())
    }

    /// Put `key` to `value`, bound to `lease_id` when it is positive.
    pub async fn put(&self, key: &str, value: &str, lease_id: i64) -> Result<()> {
        let options = (lease_id > 0).then(|| PutOptions::new().with_lease(lease_id));
        let mut client = self.etcd();
        self.bounded("put", client.put(key, value, options)).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.etcd();
        let resp = self.bounded("get", client.get(key, None)).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut client = self.etcd();
        let resp = self
            .bounded(
                "prefix get",
                client.get(prefix, Some(GetOptions::new().with_prefix())),
            )
            .await?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            out.push((kv.key_str()?.to_string(), kv.value_str()?.to_string()));
        }
        Ok(out)
    }

    /// Count-only existence check for an exact key.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut client = self.etcd();
        let resp = self
            .bounded(
                "exists",
                client.get(key, Some(GetOptions::new().with_count_only())),
            )
            .await?;
        Ok(resp.count() > 0)
    }

    /// Idempotent delete.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.etcd();
        self.bounded("delete", client.delete(key, None)).await?;
        Ok(())
    }

    /// Open a prefixed watch stream. The initial snapshot is the caller's
    /// responsibility (fetch before attaching).
    pub async fn watch_prefix(&self, prefix: &str) -> Result<(Watcher, WatchStream)> {
        let mut client = self.etcd();
        self.bounded(
            "watch",
            client.watch(prefix, Some(WatchOptions::new().with_prefix())),
        )
        .await
    }

    /// Re-establish the underlying connection after repeated operation
    /// failures. Failure to reconnect is logged; callers retry their
    /// operation regardless.
    pub async fn recover(&self) {
        let deadline = std::time::Instant::now() + self.op_timeout;
        if let Err(e) = self.connector.reconnect(deadline).await {
            tracing::warn!(error = %e, "etcd reconnect failed");
        }
    }

    /// Drive renewals for `lease_id` until the store reports the lease gone
    /// or `cancel` fires. A return means the lease must be presumed lost;
    /// the caller re-establishes registration from scratch.
    pub async fn keep_alive(
        &self,
        lease_id: i64,
        ttl: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut client = self.etcd();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .context("attach keepalive stream")?;

        // renew at a third of the ttl so a missed round trip is survivable
        let period = Duration::from_secs((ttl.max(3) as u64) / 3);
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {}
            }
            if let Err(e) = keeper.keep_alive().await {
                tracing::warn!(lease_id, error = %e, "keepalive send failed");
                return Ok(());
            }
            // the response wait stays cancellable too
            let resp = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                resp = stream.message() => resp,
            };
            match resp {
                Ok(Some(resp)) if resp.ttl() > 0 => {}
                Ok(Some(_)) => {
                    tracing::warn!(lease_id, "lease expired");
                    return Ok(());
                }
                Ok(None) | Err(_) => {
                    tracing::warn!(lease_id, "keepalive stream closed");
                    return Ok(());
                }
            }
        }
    }

    /// Non-blocking acquisition of the named lock: either acquired
    /// immediately or `Ok(None)`, never waits on contention. The lock is a
    /// key created under a `ttl`-second lease through a single
    /// create-revision transaction, so the serialization point is the
    /// store, not this client.
    pub async fn try_lock(&self, name: &str, ttl: i64) -> Result<Option<LockGuard>> {
        let lease_id = self.grant(ttl).await?;
        let mut client = self.etcd();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(name, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                name,
                "",
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let resp = match self.bounded("lock txn", client.txn(txn)).await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(e);
            }
        };
        if resp.succeeded() {
            Ok(Some(LockGuard {
                client,
                key: name.to_string(),
                lease_id,
                released: false,
            }))
        } else {
            let _ = client.lease_revoke(lease_id).await;
            Ok(None)
        }
    }
}

/// Held lock. `release` tears down the lock key and its lease
/// deterministically; dropping without releasing does the same best-effort
/// on a background task.
pub struct LockGuard {
    client: etcd_client::Client,
    key: String,
    lease_id: i64,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let mut client = self.client.clone();
        let _ = client.delete(self.key.as_str(), None).await;
        client
            .lease_revoke(self.lease_id)
            .await
            .context("revoke lock lease")?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // without a runtime the lock is left to lapse with its lease ttl
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut client = self.client.clone();
        let lease_id = self.lease_id;
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            let _ = client.delete(key, None).await;
            let _ = client.lease_revoke(lease_id).await;
        });
    }
}
