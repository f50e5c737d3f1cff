// SPDX-License-Identifier: Apache-2.0

//! The register backend contract and its implementations.
//!
//! Callers hold an `Arc<dyn Register>` and never a concrete backend; the
//! etcd, in-memory and no-op variants are substitutable at construction
//! time.

use crate::Result;
use crate::registration::RegistrationSpec;
use async_trait::async_trait;
use std::sync::Arc;

mod etcd;
mod local;
mod null;

pub use etcd::EtcdRegister;
pub use local::LocalRegister;
pub use null::NullRegister;

/// Watch callback: `(key, value, is_delete)`. Delete events carry an empty
/// value.
pub type WatchHandler = Arc<dyn Fn(&str, &str, bool) + Send + Sync>;

/// Parser applied to the final `/` segment of each matching key when
/// scanning for the highest allocated ordinal. `None` skips the key.
pub type IndexParser<'a> = &'a (dyn Fn(&str) -> Option<i64> + Send + Sync);

/// Capability contract every registration backend satisfies.
#[async_trait]
pub trait Register: Send + Sync {
    /// Upsert `key` to `value`. With `ttl > 0` the entry expires after
    /// `ttl` seconds unless kept alive by the backend; `ttl <= 0` means no
    /// expiry.
    async fn register(&self, key: &str, value: &str, ttl: i64) -> Result<()>;

    /// Idempotent removal; a missing key is not an error.
    async fn unregister(&self, key: &str) -> Result<()>;

    /// Deliver one call per key currently under `key_prefix`
    /// (is_delete=false), then live change events on a background task for
    /// the lifetime of the backend. Does not block past the initial
    /// snapshot.
    async fn watch(&self, key_prefix: &str, handler: WatchHandler) -> Result<()>;

    /// Maximum parsed index among keys under `key_prefix`, or -1 if none
    /// match. Used to allocate ordinal slots (max + 1).
    async fn last_prefixed_index(
        &self,
        key_prefix: &str,
        parser: IndexParser<'_>,
    ) -> Result<i64>;
}

/// Register every key/value pair of a descriptor, invoking `observe` per
/// written key for observability.
pub async fn register_all(
    register: &dyn Register,
    spec: &RegistrationSpec,
    observe: Option<&(dyn Fn(&str) + Send + Sync)>,
) -> Result<()> {
    for (k, v) in spec.kvs() {
        register.register(&k, &v, spec.ttl).await?;
        tracing::debug!(key = %k, value = %v, "registered");
        if let Some(cb) = observe {
            cb(&k);
        }
    }
    Ok(())
}

/// Unregister every key of a descriptor, invoking `observe` per removed
/// key.
pub async fn unregister_all(
    register: &dyn Register,
    spec: &RegistrationSpec,
    observe: Option<&(dyn Fn(&str) + Send + Sync)>,
) -> Result<()> {
    for k in spec.kvs().into_keys() {
        register.unregister(&k).await?;
        tracing::debug!(key = %k, "unregistered");
        if let Some(cb) = observe {
            cb(&k);
        }
    }
    Ok(())
}

/// Max index across `keys`, parsing each key's final path segment.
pub(crate) fn max_parsed_index<'a>(
    keys: impl Iterator<Item = &'a str>,
    parser: IndexParser<'_>,
) -> i64 {
    let mut max = -1;
    for key in keys {
        if let Some(i) = key.rsplit('/').next().and_then(parser) {
            max = max.max(i);
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::{EndType, RegType, ServerInfo, ServerType};
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_max_parsed_index() {
        let keys = ["app/worker/1", "app/worker/3", "app/worker/x"];
        let parser = |s: &str| s.parse::<i64>().ok();
        assert_eq!(max_parsed_index(keys.iter().copied(), &parser), 3);
        assert_eq!(max_parsed_index([].iter().copied(), &parser), -1);
    }

    #[tokio::test]
    async fn test_register_all_iterates_kvs() {
        let register = LocalRegister::new(CancellationToken::new());
        let spec = RegistrationSpec::with_values(
            "dev",
            RegType::Rpc,
            ServerInfo {
                id: "auth".to_string(),
                name: "auth".to_string(),
                server_type: ServerType::Rpc,
                end_type: EndType::Backend,
            },
            "127.0.0.1:90",
            std::collections::HashMap::from([
                ("m1".to_string(), "v1".to_string()),
                ("m2".to_string(), "v2".to_string()),
            ]),
            0,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let observe = move |k: &str| seen2.lock().push(k.to_string());
        register_all(register.as_ref(), &spec, Some(&observe))
            .await
            .unwrap();
        assert_eq!(seen.lock().len(), 2);

        unregister_all(register.as_ref(), &spec, None).await.unwrap();
        let parser = |_: &str| Some(0);
        assert_eq!(
            register
                .last_prefixed_index(&spec.key(), &parser)
                .await
                .unwrap(),
            -1
        );
    }
}
