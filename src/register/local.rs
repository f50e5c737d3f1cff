// SPDX-License-Identifier: Apache-2.0

//! In-memory backend with the same external contract as the etcd one.
//! Single-process substitute for tests and standalone operation.

use super::{IndexParser, Register, WatchHandler, max_parsed_index};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

struct LocalEntry {
    value: String,
    ttl: i64,
    expire_at: Option<Instant>,
}

#[derive(Default)]
struct LocalState {
    entries: HashMap<String, LocalEntry>,
    watchers: Vec<(String, WatchHandler)>,
}

impl LocalState {
    fn matching_handlers(&self, key: &str) -> Vec<WatchHandler> {
        self.watchers
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

/// In-memory register. Entries with a positive ttl are removed by a
/// background sweep once their deadline passes, notifying matching
/// watchers with a delete event.
pub struct LocalRegister {
    state: Arc<Mutex<LocalState>>,
    cancel: CancellationToken,
}

impl LocalRegister {
    pub fn new(cancel: CancellationToken) -> Arc<Self> {
        Self::with_sweep_interval(cancel, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(cancel: CancellationToken, interval: Duration) -> Arc<Self> {
        let register = Arc::new(Self {
            state: Arc::new(Mutex::new(LocalState::default())),
            cancel: cancel.clone(),
        });
        Self::spawn_sweep(register.state.clone(), cancel, interval);
        register
    }

    fn spawn_sweep(state: Arc<Mutex<LocalState>>, cancel: CancellationToken, interval: Duration) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let now = Instant::now();
                let expired: Vec<String> = {
                    let state = state.lock();
                    state
                        .entries
                        .iter()
                        .filter(|(_, e)| {
                            e.ttl > 0 && e.expire_at.map(|at| at <= now).unwrap_or(false)
                        })
                        .map(|(k, _)| k.clone())
                        .collect()
                };
                for key in expired {
                    tracing::debug!(key = %key, "local entry expired");
                    Self::remove_and_notify(&state, &key);
                }
            }
        });
    }

    // Handlers run outside the lock so they may call back into the register.
    fn remove_and_notify(state: &Arc<Mutex<LocalState>>, key: &str) {
        let handlers = {
            let mut state = state.lock();
            if state.entries.remove(key).is_none() {
                return;
            }
            state.matching_handlers(key)
        };
        for handler in handlers {
            handler(key, "", true);
        }
    }
}

#[async_trait]
impl Register for LocalRegister {
    async fn register(&self, key: &str, value: &str, ttl: i64) -> Result<()> {
        let expire_at = (ttl > 0).then(|| Instant::now() + Duration::from_secs(ttl as u64));
        let handlers = {
            let mut state = self.state.lock();
            state.entries.insert(
                key.to_string(),
                LocalEntry {
                    value: value.to_string(),
                    ttl,
                    expire_at,
                },
            );
            state.matching_handlers(key)
        };
        for handler in handlers {
            handler(key, value, false);
        }
        Ok(())
    }

    async fn unregister(&self, key: &str) -> Result<()> {
        Self::remove_and_notify(&self.state, key);
        Ok(())
    }

    async fn watch(&self, key_prefix: &str, handler: WatchHandler) -> Result<()> {
        // snapshot current entries, then attach for live events
        let snapshot: Vec<(String, String)> = {
            let mut state = self.state.lock();
            state
                .watchers
                .push((key_prefix.to_string(), handler.clone()));
            state
                .entries
                .iter()
                .filter(|(k, _)| k.starts_with(key_prefix))
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect()
        };
        for (k, v) in snapshot {
            handler(&k, &v, false);
        }
        Ok(())
    }

    async fn last_prefixed_index(
        &self,
        key_prefix: &str,
        parser: IndexParser<'_>,
    ) -> Result<i64> {
        let state = self.state.lock();
        let keys = state
            .entries
            .keys()
            .filter(|k| k.starts_with(key_prefix))
            .map(String::as_str);
        Ok(max_parsed_index(keys, parser))
    }
}
