//! Key-value store access for etcdform.
//!
//! This crate provides a trait-based interface over the etcd v2 keys API
//! and two implementations of it:
//! - [`EtcdClient`]: HTTP(S) client bound to one or more etcd endpoints
//! - [`MemoryStore`]: in-process store with the same index and
//!   precondition semantics, used in tests
//!
//! # Design Principles
//! - Preconditions are expressed in the request options, never emulated
//!   with a read followed by a write
//! - Unified error semantics: both stores map failures onto the same
//!   `etcdform_common::Error` kinds
//! - No retries: transient failures are surfaced to the caller

pub mod etcd;
pub mod keys;
pub mod memory;

pub use etcd::{EtcdClient, EtcdConfig, Scheme, TlsContext, Transport, TransportBuilder};
pub use keys::{DeleteOptions, GetOptions, KeysApi, KeysResponse, Node, PrevExist, SetOptions};
pub use memory::MemoryStore;
