// SPDX-License-Identifier: Apache-2.0

//! Registration descriptors and the hierarchical key scheme.
//!
//! Keys are `/`-joined path segments:
//! `app-id/reg-type/end-type/server-type/server-id/host`, optionally with a
//! fixed `action` segment between the server type and the server id. A
//! descriptor is pure data; [`RegistrationSpec::kvs`] materializes the final
//! key/value pairs a backend writes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// What kind of surface is being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegType {
    Http,
    Rpc,
    Doc,
    Tcp,
    Wss,
    Udp,
}

impl fmt::Display for RegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::Rpc => "rpc",
            Self::Doc => "doc",
            Self::Tcp => "tcp",
            Self::Wss => "wss",
            Self::Udp => "udp",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RegType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "rpc" => Ok(Self::Rpc),
            "doc" => Ok(Self::Doc),
            "tcp" => Ok(Self::Tcp),
            "wss" => Ok(Self::Wss),
            "udp" => Ok(Self::Udp),
            _ => Err(anyhow::anyhow!("invalid registration type: '{s}'")),
        }
    }
}

/// Whether the server faces the backend or the frontend of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndType {
    Backend,
    Frontend,
}

impl fmt::Display for EndType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend => write!(f, "backend"),
            Self::Frontend => write!(f, "frontend"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerType {
    Api,
    Rpc,
    Tcp,
    Wss,
    Udp,
    TcpHdl,
    WssHdl,
    UdpHdl,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Api => "api",
            Self::Rpc => "rpc",
            Self::Tcp => "tcp",
            Self::Wss => "wss",
            Self::Udp => "udp",
            Self::TcpHdl => "tcp-hdl",
            Self::WssHdl => "wss-hdl",
            Self::UdpHdl => "udp-hdl",
        };
        write!(f, "{s}")
    }
}

/// Identity of the server being registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub server_type: ServerType,
    pub end_type: EndType,
}

/// Payload of a registration: either a single value stored at the
/// descriptor's key, or one value per map key suffixed onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationValue {
    Single(String),
    Map(HashMap<String, String>),
}

/// How the hierarchical namespace for a descriptor is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPrefixStrategy {
    /// `app-id/reg-type/end-type/server-type`
    #[default]
    Default,
    /// Same, with a fixed `action` segment appended.
    Action,
}

/// Immutable description of one registration.
///
/// Empty required fields yield empty key segments; guarding against that is
/// the caller's responsibility, the scheme itself does no validation.
#[derive(Debug, Clone)]
pub struct RegistrationSpec {
    pub app_id: String,
    pub reg_type: RegType,
    pub server: ServerInfo,
    pub host: String,
    /// Seconds the announcement stays alive without renewal. `<= 0` means
    /// no expiry.
    pub ttl: i64,
    pub value: RegistrationValue,
    pub key_prefix: KeyPrefixStrategy,
}

impl RegistrationSpec {
    /// Descriptor announcing a single value at its key.
    pub fn single(
        app_id: impl Into<String>,
        reg_type: RegType,
        server: ServerInfo,
        host: impl Into<String>,
        value: impl Into<String>,
        ttl: i64,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            reg_type,
            server,
            host: host.into(),
            ttl,
            value: RegistrationValue::Single(value.into()),
            key_prefix: KeyPrefixStrategy::Default,
        }
    }

    /// Descriptor announcing one value per map key under its key.
    pub fn with_values(
        app_id: impl Into<String>,
        reg_type: RegType,
        server: ServerInfo,
        host: impl Into<String>,
        values: HashMap<String, String>,
        ttl: i64,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            reg_type,
            server,
            host: host.into(),
            ttl,
            value: RegistrationValue::Map(values),
            key_prefix: KeyPrefixStrategy::Default,
        }
    }

    pub fn with_prefix_strategy(mut self, strategy: KeyPrefixStrategy) -> Self {
        self.key_prefix = strategy;
        self
    }

    /// Hierarchical namespace for this descriptor.
    pub fn prefix(&self) -> String {
        let base = format!(
            "{}/{}/{}/{}",
            self.app_id, self.reg_type, self.server.end_type, self.server.server_type
        );
        match self.key_prefix {
            KeyPrefixStrategy::Default => base,
            KeyPrefixStrategy::Action => format!("{base}/action"),
        }
    }

    /// Full key: `prefix/server-id/host`, with a leading `/` trimmed.
    pub fn key(&self) -> String {
        let key = format!("{}/{}/{}", self.prefix(), self.server.id, self.host);
        match key.strip_prefix('/') {
            Some(trimmed) => trimmed.to_string(),
            None => key,
        }
    }

    /// The key/value pairs a backend writes for this descriptor.
    pub fn kvs(&self) -> HashMap<String, String> {
        let key = self.key();
        match &self.value {
            RegistrationValue::Single(v) => HashMap::from([(key, v.clone())]),
            RegistrationValue::Map(values) => values
                .iter()
                .map(|(k, v)| (format!("{key}/{k}"), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerInfo {
        ServerInfo {
            id: "auth".to_string(),
            name: "auth server".to_string(),
            server_type: ServerType::Api,
            end_type: EndType::Backend,
        }
    }

    #[test]
    fn test_default_prefix_key() {
        let spec = RegistrationSpec::single(
            "dev",
            RegType::Http,
            server(),
            "127.0.0.1:80",
            "127.0.0.1:80",
            5,
        );
        assert_eq!(spec.prefix(), "dev/http/backend/api");
        assert_eq!(spec.key(), "dev/http/backend/api/auth/127.0.0.1:80");
    }

    #[test]
    fn test_action_prefix() {
        let spec = RegistrationSpec::single("dev", RegType::Rpc, server(), "h", "h", 5)
            .with_prefix_strategy(KeyPrefixStrategy::Action);
        assert_eq!(spec.prefix(), "dev/rpc/backend/api/action");
        assert_eq!(spec.key(), "dev/rpc/backend/api/action/auth/h");
    }

    #[test]
    fn test_empty_app_id_trims_leading_slash() {
        let spec = RegistrationSpec::single("", RegType::Http, server(), "h", "h", 0);
        assert_eq!(spec.key(), "http/backend/api/auth/h");
    }

    #[test]
    fn test_kvs_single_value() {
        let spec = RegistrationSpec::single("dev", RegType::Http, server(), "h", "addr", 5);
        let kvs = spec.kvs();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs.get(&spec.key()).map(String::as_str), Some("addr"));
    }

    #[test]
    fn test_kvs_value_map() {
        let values = HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let spec =
            RegistrationSpec::with_values("dev", RegType::Http, server(), "h", values.clone(), 5);
        let kvs = spec.kvs();
        assert_eq!(kvs.len(), values.len());
        for (k, v) in &values {
            let key = format!("{}/{}", spec.key(), k);
            assert_eq!(kvs.get(&key), Some(v));
        }
    }

    #[test]
    fn test_server_info_json_shape() {
        let json = serde_json::to_value(server()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "auth",
                "name": "auth server",
                "server_type": "api",
                "end_type": "backend",
            })
        );
        let back: ServerInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, server());
    }

    #[test]
    fn test_type_strings() {
        assert_eq!(RegType::Http.to_string(), "http");
        assert_eq!("wss".parse::<RegType>().unwrap(), RegType::Wss);
        assert_eq!(ServerType::TcpHdl.to_string(), "tcp-hdl");
        assert_eq!(EndType::Frontend.to_string(), "frontend");
        assert!("bogus".parse::<RegType>().is_err());
    }
}
