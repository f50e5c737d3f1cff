// SPDX-License-Identifier: Apache-2.0

//! regcenter
//!
//! A toolkit for networked server processes that need to announce
//! themselves to a cluster, discover peers, and keep exactly one active
//! maintainer for resources that must be owned by a single process.
//!
//! The crate is organized around a small [`register::Register`] capability
//! trait with three backends (etcd, in-memory, no-op), a hierarchical key
//! scheme derived from [`registration::RegistrationSpec`], and a
//! [`singleton::SingletonService`] that layers leader election on top of a
//! lease-bound status key and a non-blocking distributed lock.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod config;
pub mod logging;
pub mod register;
pub mod registration;
pub mod singleton;
pub mod transports;

pub use config::{EtcdConfig, RegisterKind, build_register};
pub use register::{Register, WatchHandler};
pub use registration::{RegType, RegistrationSpec, ServerInfo};
pub use singleton::SingletonService;
pub use tokio_util::sync::CancellationToken;
