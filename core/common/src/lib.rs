//! Common utilities and types shared across etcdform crates.
//!
//! This crate provides the error taxonomy used by every layer and the
//! validated key path type, so that malformed input is rejected before any
//! request reaches the store.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{KeyPath, Secret};
