// SPDX-License-Identifier: Apache-2.0

use super::{IndexParser, Register, WatchHandler};
use crate::Result;
use async_trait::async_trait;

/// No-op backend used when the process runs with registration disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRegister;

#[async_trait]
impl Register for NullRegister {
    async fn register(&self, _key: &str, _value: &str, _ttl: i64) -> Result<()> {
        Ok(())
    }

    async fn unregister(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, _key_prefix: &str, _handler: WatchHandler) -> Result<()> {
        Ok(())
    }

    async fn last_prefixed_index(
        &self,
        _key_prefix: &str,
        _parser: IndexParser<'_>,
    ) -> Result<i64> {
        Ok(0)
    }
}
