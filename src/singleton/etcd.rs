// SPDX-License-Identifier: Apache-2.0

use super::{Coordination, Lock};
use crate::Result;
use crate::transports::etcd::{Client, LockGuard};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
impl Lock for LockGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        LockGuard::release(*self).await
    }
}

#[async_trait]
impl Coordination for Client {
    async fn exists(&self, key: &str) -> Result<bool> {
        Client::exists(self, key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Client::get(self, key).await
    }

    async fn grant(&self, ttl: i64) -> Result<i64> {
        Client::grant(self, ttl).await
    }

    async fn put(&self, key: &str, value: &str, lease_id: i64) -> Result<()> {
        Client::put(self, key, value, lease_id).await
    }

    async fn try_lock(&self, name: &str, ttl: i64) -> Result<Option<Box<dyn Lock>>> {
        Ok(Client::try_lock(self, name, ttl)
            .await?
            .map(|guard| Box::new(guard) as Box<dyn Lock>))
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
        ttl: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Client::keep_alive(self, lease_id, ttl, cancel).await
    }

    async fn recover(&self) {
        Client::recover(self).await
    }
}
