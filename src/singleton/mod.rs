// SPDX-License-Identifier: Apache-2.0

//! Singleton election: among N cooperating processes registering the same
//! named resource set, at most one actively maintains it at a time, with
//! automatic failover when the current maintainer disappears.
//!
//! The protocol is check → compete → maintain → renew. A short-TTL
//! distributed lock serializes the takeover decision so two processes that
//! both observe a missing status key cannot both claim it; the lock, not
//! the status-key write, is the serialization point.

use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

mod etcd;
mod mock;

pub use mock::SharedMockCoordination;

const DEFAULT_TTL: i64 = 5;
const DEFAULT_LOCK_TTL: i64 = 10;
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// A held distributed lock; released explicitly on every exit path.
#[async_trait]
pub trait Lock: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// The coordination primitives the elector is built on. Implemented by the
/// etcd transport client and by [`SharedMockCoordination`] for tests.
#[async_trait]
pub trait Coordination: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Grant a lease of `ttl` seconds, returning its id.
    async fn grant(&self, ttl: i64) -> Result<i64>;
    /// Put bound to `lease_id` when positive.
    async fn put(&self, key: &str, value: &str, lease_id: i64) -> Result<()>;
    /// Non-blocking: acquired immediately or `Ok(None)`, never waits on
    /// contention.
    async fn try_lock(&self, name: &str, ttl: i64) -> Result<Option<Box<dyn Lock>>>;
    /// Returns when the lease is presumed gone or `cancel` fires.
    async fn keep_alive(&self, lease_id: i64, ttl: i64, cancel: &CancellationToken)
    -> Result<()>;
    /// Give the backend a chance to repair its connection between failed
    /// attempts. The default does nothing.
    async fn recover(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonState {
    Unknown,
    Following,
    Leading,
}

/// Elects and maintains a single active owner for a named resource set.
///
/// The status key's value is this process's host identity, carried on the
/// same lease as the resource keys, so crash detection and ownership
/// reporting come from one liveness signal.
pub struct SingletonService {
    coordination: Arc<dyn Coordination>,
    name: String,
    host: String,
    kvs: Mutex<HashMap<String, String>>,
    ttl: i64,
    lock_ttl: i64,
    check_interval: Duration,
    retry_pause: Duration,
    state: Mutex<SingletonState>,
    lease_id: AtomicI64,
    cancel: CancellationToken,
}

impl SingletonService {
    pub fn new(
        coordination: Arc<dyn Coordination>,
        name: impl Into<String>,
        host: impl Into<String>,
        kvs: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            coordination,
            name: name.into(),
            host: host.into(),
            kvs: Mutex::new(kvs),
            ttl: DEFAULT_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            retry_pause: RETRY_PAUSE,
            state: Mutex::new(SingletonState::Unknown),
            lease_id: AtomicI64::new(0),
            cancel,
        }
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    /// NOTE: a lock ttl shorter than the round trips of a full takeover
    /// leaves a window where two processes can both believe they won. That
    /// window exists in the protocol; pick a lock ttl comfortably above the
    /// store's operation latency.
    pub fn with_lock_ttl(mut self, lock_ttl: i64) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Pause between failed re-registration attempts.
    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    fn status_key(&self) -> String {
        format!("/singleton-service/status/{}", self.name)
    }

    fn lock_name(&self) -> String {
        format!("/lockers/{}", self.name)
    }

    pub fn state(&self) -> SingletonState {
        *self.state.lock()
    }

    fn set_state(&self, state: SingletonState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(name = %self.name, ?state, "singleton state changed");
            *current = state;
        }
    }

    /// Spawn the election loop and return a handle to the service.
    pub fn start(self) -> Arc<Self> {
        let service = Arc::new(self);
        let runner = service.clone();
        tokio::spawn(async move { runner.run().await });
        service
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.tick().await {
                Ok(true) => {
                    self.maintain().await;
                    if self.cancel.is_cancelled() {
                        return;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "singleton check failed");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(self.check_interval) => {}
            }
        }
    }

    /// One election tick. `Ok(true)` means this process just became the
    /// maintainer.
    async fn tick(&self) -> Result<bool> {
        if self.coordination.exists(&self.status_key()).await? {
            self.set_state(SingletonState::Following);
            return Ok(false);
        }

        if self.state() == SingletonState::Unknown {
            // nobody has claimed the resource yet, claim it directly
            return match self.register_singleton().await {
                Ok(()) => Ok(true),
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "initial claim failed");
                    Ok(false)
                }
            };
        }

        // the maintainer disappeared; race for takeover behind the lock
        let Some(lock) = self
            .coordination
            .try_lock(&self.lock_name(), self.lock_ttl)
            .await?
        else {
            // another follower got there first, retry next tick
            return Ok(false);
        };

        // re-check under the lock in case a racer registered between the
        // check and the acquisition
        let still_missing = !self
            .coordination
            .exists(&self.status_key())
            .await
            .unwrap_or(true);
        let mut won = false;
        if still_missing {
            match self.register_singleton().await {
                Ok(()) => won = true,
                Err(e) => {
                    tracing::warn!(name = %self.name, error = %e, "takeover failed");
                }
            }
        }
        if let Err(e) = lock.release().await {
            tracing::warn!(name = %self.name, error = %e, "lock release failed");
        }
        if !won {
            self.set_state(SingletonState::Following);
        }
        Ok(won)
    }

    /// Leading: stay on the keepalive stream; when it ends, the lease is
    /// presumed gone and the whole registration is re-established from
    /// scratch (fresh lease, fresh puts, fresh keepalive). The process stays
    /// the logical leader, only the resource generation changes.
    async fn maintain(&self) {
        self.set_state(SingletonState::Leading);
        tracing::info!(name = %self.name, host = %self.host, "maintaining singleton");
        loop {
            let lease_id = self.lease_id.load(Ordering::Acquire);
            if let Err(e) = self
                .coordination
                .keep_alive(lease_id, self.ttl, &self.cancel)
                .await
            {
                tracing::warn!(name = %self.name, error = %e, "keepalive attach failed");
            }
            if self.cancel.is_cancelled() {
                return;
            }
            tracing::warn!(name = %self.name, "singleton lease lost, re-registering");
            loop {
                match self.register_singleton().await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(
                            name = %self.name,
                            error = %e,
                            "singleton re-register failed, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = async {
                                sleep(self.retry_pause).await;
                                self.coordination.recover().await;
                            } => {}
                        }
                    }
                }
            }
        }
    }

    /// Grant a lease, put the status key (value = this host's identity) and
    /// every resource key under it.
    async fn register_singleton(&self) -> Result<()> {
        let lease_id = self.coordination.grant(self.ttl).await?;
        self.coordination
            .put(&self.status_key(), &self.host, lease_id)
            .await?;
        let kvs: Vec<(String, String)> = self
            .kvs
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in kvs {
            self.coordination.put(&k, &v, lease_id).await?;
        }
        self.lease_id.store(lease_id, Ordering::Release);
        Ok(())
    }

    /// Best-effort, point-in-time: does the status key currently name
    /// `identity` as the maintainer?
    pub async fn is_host(&self, identity: &str) -> bool {
        matches!(
            self.coordination.get(&self.status_key()).await,
            Ok(Some(v)) if v == identity
        )
    }

    /// Update one resource key's value. Re-put under the current lease only
    /// when this process is Leading; otherwise the update is local
    /// bookkeeping until it becomes Leading.
    pub async fn refresh_kv(&self, key: &str, value: &str) -> Result<()> {
        self.kvs
            .lock()
            .insert(key.to_string(), value.to_string());
        let lease_id = self.lease_id.load(Ordering::Acquire);
        if self.state() == SingletonState::Leading && lease_id > 0 {
            self.coordination.put(key, value, lease_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    fn service(
        coordination: &SharedMockCoordination,
        name: &str,
        host: &str,
        kvs: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Arc<SingletonService> {
        SingletonService::new(Arc::new(coordination.clone()), name, host, kvs, cancel)
            .with_check_interval(TICK)
            .with_retry_pause(TICK)
            .start()
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn test_first_starter_leads_second_follows() {
        let mock = SharedMockCoordination::default();
        let cancel = CancellationToken::new();

        let kvs = HashMap::from([("dev/rpc/backend/api/auth/h1".to_string(), "h1".to_string())]);
        let s1 = service(&mock, "auth", "h1", kvs, cancel.clone());
        {
            let s1 = s1.clone();
            wait_until("s1 leading", move || s1.state() == SingletonState::Leading).await;
        }

        let s2 = service(&mock, "auth", "h2", HashMap::new(), cancel.clone());
        {
            let s2 = s2.clone();
            wait_until("s2 following", move || {
                s2.state() == SingletonState::Following
            })
            .await;
        }

        assert!(s1.is_host("h1").await);
        assert!(!s2.is_host("h2").await);
        // the resource keys ride the leader's lease
        assert_eq!(
            mock.value_of("dev/rpc/backend/api/auth/h1"),
            Some("h1".to_string())
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failover_to_follower() {
        let mock = SharedMockCoordination::default();
        let cancel1 = CancellationToken::new();
        let cancel2 = CancellationToken::new();

        let s1 = service(&mock, "auth", "h1", HashMap::new(), cancel1.clone());
        {
            let s1 = s1.clone();
            wait_until("s1 leading", move || s1.state() == SingletonState::Leading).await;
        }
        let s2 = service(&mock, "auth", "h2", HashMap::new(), cancel2.clone());
        {
            let s2 = s2.clone();
            wait_until("s2 following", move || {
                s2.state() == SingletonState::Following
            })
            .await;
        }

        // leader stops renewing; its lease expires and the status key goes
        cancel1.cancel();
        mock.kill_lease_of("/singleton-service/status/auth");

        {
            let s2 = s2.clone();
            wait_until("s2 takes over", move || {
                s2.state() == SingletonState::Leading
            })
            .await;
        }
        assert!(s2.is_host("h2").await);
        assert!(!s2.is_host("h1").await);
        cancel2.cancel();
    }

    #[tokio::test]
    async fn test_follower_stays_following_under_lock_contention() {
        let mock = SharedMockCoordination::default();
        let cancel1 = CancellationToken::new();
        let cancel2 = CancellationToken::new();

        let s1 = service(&mock, "auth", "h1", HashMap::new(), cancel1.clone());
        {
            let s1 = s1.clone();
            wait_until("s1 leading", move || s1.state() == SingletonState::Leading).await;
        }
        let s2 = service(&mock, "auth", "h2", HashMap::new(), cancel2.clone());
        {
            let s2 = s2.clone();
            wait_until("s2 following", move || {
                s2.state() == SingletonState::Following
            })
            .await;
        }

        // the leader goes away, and somebody else holds the takeover lock
        // when its status key vanishes
        cancel1.cancel();
        let hold = mock.hold_lock("/lockers/auth");
        mock.kill_lease_of("/singleton-service/status/auth");

        sleep(Duration::from_millis(100)).await;
        assert_eq!(s2.state(), SingletonState::Following);

        // once the lock is released the follower takes over
        drop(hold);
        {
            let s2 = s2.clone();
            wait_until("s2 takes over", move || {
                s2.state() == SingletonState::Leading
            })
            .await;
        }
        assert!(s2.is_host("h2").await);
        cancel2.cancel();
    }

    #[tokio::test]
    async fn test_refresh_kv_puts_only_when_leading() {
        let mock = SharedMockCoordination::default();
        let cancel1 = CancellationToken::new();
        let cancel2 = CancellationToken::new();

        let s1 = service(&mock, "auth", "h1", HashMap::new(), cancel1.clone());
        {
            let s1 = s1.clone();
            wait_until("s1 leading", move || s1.state() == SingletonState::Leading).await;
        }
        let s2 = service(&mock, "auth", "h2", HashMap::new(), cancel2.clone());
        {
            let s2 = s2.clone();
            wait_until("s2 following", move || {
                s2.state() == SingletonState::Following
            })
            .await;
        }

        // follower: local bookkeeping only
        s2.refresh_kv("res/k", "from-follower").await.unwrap();
        assert_eq!(mock.value_of("res/k"), None);

        // leader: re-put under the live lease
        s1.refresh_kv("res/k", "from-leader").await.unwrap();
        assert_eq!(mock.value_of("res/k"), Some("from-leader".to_string()));

        // on failover the follower's cached value is registered with it
        cancel1.cancel();
        mock.kill_lease_of("/singleton-service/status/auth");
        {
            let s2 = s2.clone();
            wait_until("s2 takes over", move || {
                s2.state() == SingletonState::Leading
            })
            .await;
        }
        assert_eq!(mock.value_of("res/k"), Some("from-follower".to_string()));
        cancel2.cancel();
    }

    #[tokio::test]
    async fn test_reregister_asks_backend_to_recover_between_failures() {
        let mock = SharedMockCoordination::default();
        let cancel = CancellationToken::new();

        let s1 = service(&mock, "auth", "h1", HashMap::new(), cancel.clone());
        {
            let s1 = s1.clone();
            wait_until("s1 leading", move || s1.state() == SingletonState::Leading).await;
        }

        // writes start failing, then the lease dies: re-registration keeps
        // retrying and asks the backend to repair itself between attempts
        mock.fail_puts(true);
        mock.kill_lease_of("/singleton-service/status/auth");
        {
            let mock = mock.clone();
            wait_until("recover attempted", move || mock.recover_calls() > 0).await;
        }
        assert_eq!(mock.value_of("/singleton-service/status/auth"), None);

        mock.fail_puts(false);
        {
            let mock = mock.clone();
            wait_until("status restored", move || {
                mock.value_of("/singleton-service/status/auth").is_some()
            })
            .await;
        }
        assert_eq!(s1.state(), SingletonState::Leading);
        assert!(s1.is_host("h1").await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_leader_reregisters_after_lease_loss() {
        let mock = SharedMockCoordination::default();
        let cancel = CancellationToken::new();

        let kvs = HashMap::from([("res/a".to_string(), "v".to_string())]);
        let s1 = service(&mock, "auth", "h1", kvs, cancel.clone());
        {
            let s1 = s1.clone();
            wait_until("s1 leading", move || s1.state() == SingletonState::Leading).await;
        }

        // the lease dies but the leader is still running: it re-registers
        // from scratch and stays Leading
        mock.kill_lease_of("/singleton-service/status/auth");
        {
            let mock = mock.clone();
            wait_until("status key restored", move || {
                mock.value_of("/singleton-service/status/auth").is_some()
            })
            .await;
        }
        assert_eq!(s1.state(), SingletonState::Leading);
        assert!(s1.is_host("h1").await);
        assert_eq!(mock.value_of("res/a"), Some("v".to_string()));
        cancel.cancel();
    }
}
