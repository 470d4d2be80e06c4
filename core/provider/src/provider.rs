//! Provider: configured store plus resource dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use etcdform_common::{Error, KeyPath, Result};
use etcdform_reconcile::{Action, Plan, StateStore, TrackedResource};
use etcdform_store::{GetOptions, KeysApi, Node};

use crate::config::ProviderConfig;
use crate::registry::{create_default_registry, ResourceRegistry};
use crate::schema::ConfigSchema;

/// A declared resource: its type name and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub config: Value,
}

impl ResourceDecl {
    pub fn new(resource_type: impl Into<String>, config: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            config,
        }
    }
}

/// Outcome of converging one resource.
#[derive(Debug)]
pub struct ResourceResult {
    pub resource_type: String,
    pub path: KeyPath,
    pub result: Result<Action>,
}

/// Configured provider.
pub struct Provider {
    store: Arc<dyn KeysApi>,
    registry: ResourceRegistry,
}

impl Provider {
    /// Decode the provider configuration and connect to the store.
    ///
    /// # Errors
    /// - `Config`/`Tls` for invalid options or TLS material
    pub fn configure(config: Value) -> Result<Self> {
        let config = ProviderConfig::from_value(config)?;
        info!("initializing etcd client");
        let client = config.to_etcd_config()?.client()?;
        Self::with_store(Arc::new(client))
    }

    /// Build a provider over an existing store.
    pub fn with_store(store: Arc<dyn KeysApi>) -> Result<Self> {
        let registry = create_default_registry(store.clone())?;
        Ok(Self { store, registry })
    }

    pub fn store(&self) -> &Arc<dyn KeysApi> {
        &self.store
    }

    pub fn schema() -> ConfigSchema {
        ConfigSchema::provider()
    }

    /// Read a single node, `None` when absent.
    pub async fn get(&self, path: &KeyPath) -> Result<Option<Node>> {
        let response = self.store.try_get(path, &GetOptions::default()).await?;
        Ok(response.map(|r| r.node))
    }

    /// Read the observed state of a resource, `None` when absent.
    ///
    /// # Errors
    /// - `InvalidInput` for an unknown resource type
    /// - `Store` when the path holds the wrong kind of node
    pub async fn read(&self, resource_type: &str, path: &KeyPath) -> Result<Option<Value>> {
        self.registry.resolve(resource_type)?.read(path).await
    }

    /// Resolve every declaration to its type and path, rejecting
    /// duplicates before any request is sent.
    fn resolve_all(&self, decls: &[ResourceDecl]) -> Result<Vec<(String, KeyPath)>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(decls.len());
        for decl in decls {
            let handler = self.registry.resolve(&decl.resource_type)?;
            let path = handler.path_of(&decl.config)?;
            let key = StateStore::key(&decl.resource_type, &path);
            if !seen.insert(key.clone()) {
                return Err(Error::InvalidInput(format!("{} is declared twice", key)));
            }
            resolved.push((decl.resource_type.clone(), path));
        }
        Ok(resolved)
    }

    /// Tracked resources that are no longer declared.
    fn orphans(&self, state: &StateStore, declared: &[(String, KeyPath)]) -> Vec<TrackedResource<Value>> {
        let declared: HashSet<String> = declared
            .iter()
            .map(|(t, p)| StateStore::key(t, p))
            .collect();
        state
            .entries()
            .filter(|t| !declared.contains(&StateStore::key(&t.resource_type, &t.path)))
            .cloned()
            .collect()
    }

    /// Plan every declared resource, and the deletion of tracked resources
    /// that are no longer declared.
    pub async fn plan(&self, state: &mut StateStore, decls: &[ResourceDecl]) -> Result<Vec<Plan>> {
        let resolved = self.resolve_all(decls)?;
        let orphans = self.orphans(state, &resolved);
        let mut plans = Vec::new();

        for (decl, (resource_type, path)) in decls.iter().zip(resolved) {
            let handler = self.registry.resolve(&resource_type)?;
            let mut tracked = state.get_or_new(&resource_type, &path);
            let plan = handler.plan(&mut tracked, Some(&decl.config)).await;
            state.insert(tracked);
            plans.push(plan?);
        }
        for mut tracked in orphans {
            let handler = self.registry.resolve(&tracked.resource_type)?;
            let plan = handler.plan(&mut tracked, None).await;
            state.insert(tracked);
            plans.push(plan?);
        }
        Ok(plans)
    }

    /// Converge every declared resource and delete tracked resources that
    /// are no longer declared.
    ///
    /// Resources are independent: a failure is recorded for its resource
    /// and the remaining ones are still converged.
    pub async fn apply(&self, state: &mut StateStore, decls: &[ResourceDecl]) -> Result<Vec<ResourceResult>> {
        let resolved = self.resolve_all(decls)?;
        let orphans = self.orphans(state, &resolved);
        let mut results = Vec::new();

        for (decl, (resource_type, path)) in decls.iter().zip(resolved) {
            let tracked = state.get_or_new(&resource_type, &path);
            results.push(self.converge_one(state, tracked, Some(&decl.config)).await);
        }
        for tracked in orphans {
            results.push(self.converge_one(state, tracked, None).await);
        }
        Ok(results)
    }

    /// Delete every declared resource.
    pub async fn destroy(&self, state: &mut StateStore, decls: &[ResourceDecl]) -> Result<Vec<ResourceResult>> {
        let resolved = self.resolve_all(decls)?;
        let mut results = Vec::new();
        for (resource_type, path) in resolved {
            let tracked = state.get_or_new(&resource_type, &path);
            results.push(self.converge_one(state, tracked, None).await);
        }
        Ok(results)
    }

    async fn converge_one(
        &self,
        state: &mut StateStore,
        mut tracked: TrackedResource<Value>,
        desired: Option<&Value>,
    ) -> ResourceResult {
        let resource_type = tracked.resource_type.clone();
        let path = tracked.path.clone();

        let result = match self.registry.resolve(&resource_type) {
            Ok(handler) => handler.converge(&mut tracked, desired).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(action) => info!(resource = %resource_type, path = %path, action = %action, "converged"),
            Err(e) => warn!(resource = %resource_type, path = %path, error = %e, "failed"),
        }
        state.insert(tracked);

        ResourceResult {
            resource_type,
            path,
            result,
        }
    }
}
