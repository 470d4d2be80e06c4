//! Resource trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use etcdform_common::{KeyPath, Result};

use crate::plan::Plan;

/// A declarative resource managed in the store.
///
/// `Config` is the desired state written by the user, `State` what was
/// last observed in the store. Every resource is identified by a single
/// path, and every write is guarded by a precondition on the version
/// recorded in `State`.
#[async_trait]
pub trait Resource: Send + Sync {
    type Config: Serialize + DeserializeOwned + Send + Sync;
    type State: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Resource type name (e.g., "etcd_keys").
    fn type_name(&self) -> &'static str;

    /// Validate the configuration and return the path it manages.
    ///
    /// # Errors
    /// - `InvalidInput` for a malformed path, value or TTL
    fn path(&self, config: &Self::Config) -> Result<KeyPath>;

    /// Operations that take the store from `observed` to `desired`.
    ///
    /// Pure: no request is sent. An empty plan means the resource has
    /// converged.
    fn plan(&self, observed: Option<&Self::State>, desired: Option<&Self::Config>) -> Result<Plan>;

    /// Whether `config` may take over a path that exists but is not tracked.
    fn overwrites_existing(&self, _config: &Self::Config) -> bool {
        false
    }

    /// Read the resource, `None` when it does not exist.
    async fn read(&self, path: &KeyPath) -> Result<Option<Self::State>>;

    /// Create the resource.
    ///
    /// # Errors
    /// - `AlreadyExists` if the path exists and overwriting was not requested
    async fn create(&self, config: &Self::Config) -> Result<Self::State>;

    /// Update the resource from `prior`.
    ///
    /// # Errors
    /// - `Conflict` if the store changed since `prior` was read
    async fn update(&self, prior: &Self::State, config: &Self::Config) -> Result<Self::State>;

    /// Delete the resource. Deleting an absent resource succeeds.
    ///
    /// # Errors
    /// - `Conflict` if the store changed since `prior` was read
    async fn delete(&self, prior: &Self::State) -> Result<()>;
}
