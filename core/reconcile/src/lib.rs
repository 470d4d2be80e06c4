//! Resource reconciliation for etcdform.
//!
//! This crate turns declarative resource definitions into store
//! operations:
//! - Per-resource CRUD behind the [`Resource`] trait (keys, discovery trees)
//! - Plans: the ordered operations that converge a resource, computed
//!   without touching the store
//! - Drift detection against the last observed state
//! - A lifecycle state machine and a persistent state file

pub mod conflict;
pub mod discovery;
pub mod keys;
pub mod lifecycle;
pub mod plan;
pub mod resource;
pub mod state;
pub mod tree;

pub use conflict::{detect_drift, ensure_unchanged, Drift};
pub use discovery::{DiscoveryConfig, DiscoveryResource, DiscoveryState, EntryState};
pub use keys::{KeyConfig, KeyResource, KeyState};
pub use lifecycle::{converge, plan_for, Action, Phase, TrackedResource};
pub use plan::{ApplyOutcome, Applied, Operation, Plan};
pub use resource::Resource;
pub use state::StateStore;
