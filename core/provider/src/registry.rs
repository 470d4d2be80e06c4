//! Resource registry for dispatch by type name.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use etcdform_common::{Error, KeyPath, Result};
use etcdform_reconcile::{
    converge, plan_for, Action, DiscoveryResource, KeyResource, Plan, Resource, TrackedResource,
};
use etcdform_store::KeysApi;

/// A resource type with its configuration and state erased to JSON.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Validate a configuration and return the path it manages.
    fn path_of(&self, config: &Value) -> Result<KeyPath>;

    async fn read(&self, path: &KeyPath) -> Result<Option<Value>>;

    /// Read the resource and compute its plan. `desired = None` plans a
    /// deletion.
    async fn plan(
        &self,
        tracked: &mut TrackedResource<Value>,
        desired: Option<&Value>,
    ) -> Result<Plan>;

    /// Read the resource and converge it.
    async fn converge(
        &self,
        tracked: &mut TrackedResource<Value>,
        desired: Option<&Value>,
    ) -> Result<Action>;
}

/// Adapter from a typed [`Resource`] to a [`ResourceHandler`].
pub struct TypedHandler<R> {
    resource: R,
}

impl<R: Resource> TypedHandler<R> {
    pub fn new(resource: R) -> Self {
        Self { resource }
    }

    fn decode_config(&self, config: &Value) -> Result<R::Config> {
        serde_json::from_value(config.clone()).map_err(|e| {
            Error::InvalidInput(format!(
                "invalid {} configuration: {}",
                self.resource.type_name(),
                e
            ))
        })
    }
}

#[async_trait]
impl<R: Resource + 'static> ResourceHandler for TypedHandler<R> {
    fn type_name(&self) -> &'static str {
        self.resource.type_name()
    }

    fn path_of(&self, config: &Value) -> Result<KeyPath> {
        self.resource.path(&self.decode_config(config)?)
    }

    async fn read(&self, path: &KeyPath) -> Result<Option<Value>> {
        match self.resource.read(path).await? {
            Some(state) => Ok(Some(serde_json::to_value(state)?)),
            None => Ok(None),
        }
    }

    async fn plan(
        &self,
        tracked: &mut TrackedResource<Value>,
        desired: Option<&Value>,
    ) -> Result<Plan> {
        let config = desired.map(|c| self.decode_config(c)).transpose()?;
        let mut typed = tracked.decode::<R::State>()?;
        let result = plan_for(&self.resource, &mut typed, config.as_ref()).await;
        *tracked = typed.to_value()?;
        result
    }

    async fn converge(
        &self,
        tracked: &mut TrackedResource<Value>,
        desired: Option<&Value>,
    ) -> Result<Action> {
        let config = desired.map(|c| self.decode_config(c)).transpose()?;
        let mut typed = tracked.decode::<R::State>()?;
        let result = converge(&self.resource, &mut typed, config.as_ref()).await;
        *tracked = typed.to_value()?;
        result
    }
}

/// Registry of resource handlers.
///
/// Resource types are resolved by name, so new types can be added
/// without touching the dispatch code.
pub struct ResourceRegistry {
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl ResourceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its type name.
    ///
    /// # Errors
    /// - Returns error if the type name is already registered
    pub fn register(&mut self, handler: Arc<dyn ResourceHandler>) -> Result<()> {
        let name = handler.type_name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Resource type '{}' is already registered",
                name
            )));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Resolve a handler by type name.
    ///
    /// # Errors
    /// - Resource type not registered
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ResourceHandler>> {
        self.handlers.get(name).cloned().ok_or_else(|| {
            Error::InvalidInput(format!("Resource type '{}' is not supported", name))
        })
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with `etcd_keys` and `etcd_discovery` bound to `store`.
pub fn create_default_registry(store: Arc<dyn KeysApi>) -> Result<ResourceRegistry> {
    let mut registry = ResourceRegistry::new();
    registry.register(Arc::new(TypedHandler::new(KeyResource::new(store.clone()))))?;
    registry.register(Arc::new(TypedHandler::new(DiscoveryResource::new(store))))?;
    Ok(registry)
}
