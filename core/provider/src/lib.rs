//! Provider façade for etcdform.
//!
//! Decodes the provider configuration, builds the store client and
//! dispatches declared resources to their reconcilers by type name:
//! - `etcd_keys`: a single key
//! - `etcd_discovery`: a directory of service discovery entries

pub mod config;
pub mod provider;
pub mod registry;
pub mod schema;

pub use config::ProviderConfig;
pub use provider::{Provider, ResourceDecl, ResourceResult};
pub use registry::{create_default_registry, ResourceHandler, ResourceRegistry, TypedHandler};
pub use schema::{AttributeSchema, ConfigSchema, OptionSchema, ResourceSchema, ValueKind};
