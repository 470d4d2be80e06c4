//! etcd store backend for etcdform.
//!
//! This module provides the connection side of the provider:
//! - Transport construction with timeouts, keep-alive and mutual TLS
//! - Endpoint normalization and the store client factory
//! - A `KeysApi` implementation over the v2 keys HTTP API with
//!   per-endpoint failover

pub mod client;
pub mod config;
pub mod transport;

pub use client::{Credentials, EtcdClient};
pub use config::{normalize_endpoints, EtcdConfig, Scheme, DEFAULT_ENDPOINTS};
pub use transport::{TlsContext, TlsFiles, Transport, TransportBuilder, TransportSettings};
