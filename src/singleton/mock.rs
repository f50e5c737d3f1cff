// SPDX-License-Identifier: Apache-2.0

//! Shared in-memory coordination for tests: deterministic leases, locks and
//! lease-expiry injection, so election scenarios run without a store.

use super::{Coordination, Lock};
use crate::{Result, raise};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockState {
    /// key -> (value, lease id; 0 = no lease)
    entries: HashMap<String, (String, i64)>,
    live_leases: HashSet<i64>,
    /// lock name -> owning lease
    locks: HashMap<String, i64>,
    next_lease: i64,
    fail_puts: bool,
}

/// In-memory [`Coordination`] shared by every clone, so multiple
/// "processes" in one test observe the same store.
#[derive(Clone, Default)]
pub struct SharedMockCoordination {
    state: Arc<Mutex<MockState>>,
    /// Wakes keepalive waiters whenever a lease dies.
    lease_events: Arc<Notify>,
    recover_calls: Arc<AtomicUsize>,
}

impl SharedMockCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_of(&self, key: &str) -> Option<String> {
        self.state.lock().entries.get(key).map(|(v, _)| v.clone())
    }

    /// Kill the lease the given key is bound to, dropping every key bound
    /// to it, as the store would on expiry. No-op for unleased or missing
    /// keys.
    pub fn kill_lease_of(&self, key: &str) {
        let lease_id = match self.state.lock().entries.get(key) {
            Some((_, lease_id)) if *lease_id > 0 => *lease_id,
            _ => return,
        };
        self.kill_lease(lease_id);
    }

    /// Simulate expiry of a lease: its keys vanish and keepalive waiters
    /// are woken.
    pub fn kill_lease(&self, lease_id: i64) {
        {
            let mut state = self.state.lock();
            state.live_leases.remove(&lease_id);
            state.entries.retain(|_, (_, l)| *l != lease_id);
            state.locks.retain(|_, l| *l != lease_id);
        }
        self.lease_events.notify_waiters();
    }

    /// Make every subsequent `put` fail, to exercise recovery paths.
    pub fn fail_puts(&self, fail: bool) {
        self.state.lock().fail_puts = fail;
    }

    /// How many times a caller asked the backend to repair itself.
    pub fn recover_calls(&self) -> usize {
        self.recover_calls.load(Ordering::SeqCst)
    }

    /// Hold the named lock until the returned guard is dropped, to exercise
    /// contention paths.
    pub fn hold_lock(&self, name: &str) -> MockLock {
        let lease_id = {
            let mut state = self.state.lock();
            state.next_lease += 1;
            let lease_id = state.next_lease;
            state.live_leases.insert(lease_id);
            state.locks.insert(name.to_string(), lease_id);
            lease_id
        };
        MockLock {
            coordination: self.clone(),
            name: name.to_string(),
            lease_id,
            released: false,
        }
    }

    fn unlock(&self, name: &str, lease_id: i64) {
        let mut state = self.state.lock();
        if state.locks.get(name) == Some(&lease_id) {
            state.locks.remove(name);
        }
        state.live_leases.remove(&lease_id);
    }
}

pub struct MockLock {
    coordination: SharedMockCoordination,
    name: String,
    lease_id: i64,
    released: bool,
}

#[async_trait]
impl Lock for MockLock {
    async fn release(mut self: Box<Self>) -> Result<()> {
        self.released = true;
        self.coordination.unlock(&self.name, self.lease_id);
        Ok(())
    }
}

impl Drop for MockLock {
    fn drop(&mut self) {
        if !self.released {
            self.coordination.unlock(&self.name, self.lease_id);
        }
    }
}

#[async_trait]
impl Coordination for SharedMockCoordination {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().entries.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value_of(key))
    }

    async fn grant(&self, _ttl: i64) -> Result<i64> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        let lease_id = state.next_lease;
        state.live_leases.insert(lease_id);
        Ok(lease_id)
    }

    async fn put(&self, key: &str, value: &str, lease_id: i64) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_puts {
            raise!("injected put failure");
        }
        if lease_id > 0 && !state.live_leases.contains(&lease_id) {
            raise!("lease {lease_id} not found");
        }
        state
            .entries
            .insert(key.to_string(), (value.to_string(), lease_id));
        Ok(())
    }

    async fn try_lock(&self, name: &str, _ttl: i64) -> Result<Option<Box<dyn Lock>>> {
        let lease_id = {
            let mut state = self.state.lock();
            if state.locks.contains_key(name) {
                return Ok(None);
            }
            state.next_lease += 1;
            let lease_id = state.next_lease;
            state.live_leases.insert(lease_id);
            state.locks.insert(name.to_string(), lease_id);
            lease_id
        };
        Ok(Some(Box::new(MockLock {
            coordination: self.clone(),
            name: name.to_string(),
            lease_id,
            released: false,
        })))
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
        _ttl: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let died = self.lease_events.notified();
            tokio::pin!(died);
            // register the waiter before the liveness check; an expiry
            // between the check and the await would otherwise be missed
            died.as_mut().enable();
            if !self.state.lock().live_leases.contains(&lease_id) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = died => {}
            }
        }
    }

    async fn recover(&self) {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
    }
}
