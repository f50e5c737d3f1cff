// SPDX-License-Identifier: Apache-2.0

//! Backend selection and etcd connection configuration.
//!
//! Configuration is loaded from serde defaults merged with `REGC_`-prefixed
//! environment variables. List-valued variables use TOML syntax, e.g.
//! `REGC_ETCD_ENDPOINTS='["http://a:2379", "http://b:2379"]'`.

use crate::register::{EtcdRegister, LocalRegister, NullRegister, Register};
use crate::{Result, error, raise};
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const KIND_ENV: &str = "REGC_REGISTER";
const ETCD_ENV_PREFIX: &str = "REGC_ETCD_";

/// Which register backend a process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// External etcd cluster (the production choice).
    Etcd,
    /// In-memory, single-process.
    Local,
    /// Registration disabled.
    None,
}

impl Default for RegisterKind {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Etcd => write!(f, "etcd"),
            Self::Local => write!(f, "local"),
            Self::None => write!(f, "none"),
        }
    }
}

impl FromStr for RegisterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "etcd" => Ok(Self::Etcd),
            "local" => Ok(Self::Local),
            "none" => Ok(Self::None),
            _ => Err(error!(
                "invalid register kind: '{s}'. valid options are: 'etcd', 'local', 'none'"
            )),
        }
    }
}

impl RegisterKind {
    /// Read the kind from `REGC_REGISTER`, falling back to the default.
    pub fn from_env() -> Self {
        std::env::var(KIND_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// Connection settings for the etcd backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Bound on each coordination round trip, in seconds.
    pub op_timeout_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            op_timeout_secs: 5,
        }
    }
}

impl EtcdConfig {
    /// Defaults merged with `REGC_ETCD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ETCD_ENV_PREFIX))
            .extract()
            .map_err(|e| error!("invalid etcd config: {e}"))
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

/// Construct the configured backend. Callers hold only the trait handle.
pub async fn build_register(
    kind: RegisterKind,
    config: &EtcdConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn Register>> {
    match kind {
        RegisterKind::None => Ok(Arc::new(NullRegister)),
        RegisterKind::Local => Ok(LocalRegister::new(cancel) as Arc<dyn Register>),
        RegisterKind::Etcd => {
            if config.endpoints.is_empty() {
                raise!("etcd register requires at least one endpoint");
            }
            let register =
                EtcdRegister::new(config.endpoints.clone(), config.op_timeout(), cancel).await?;
            Ok(register as Arc<dyn Register>)
        }
    }
}
