//! Service discovery tree resource (`etcd_discovery`).
//!
//! A discovery resource owns a directory and the set of keys below it.
//! Entry keys are relative to the directory and may contain `/` to address
//! nested nodes. Anything found below the directory that is not declared
//! is removed on update.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use etcdform_common::{Error, KeyPath, Result};
use etcdform_store::keys::codes;
use etcdform_store::{GetOptions, KeysApi, Node};

use crate::conflict::ensure_unchanged;
use crate::plan::{Applied, Operation, Plan};
use crate::resource::Resource;
use crate::tree;

pub const TYPE_NAME: &str = "etcd_discovery";

/// Desired state of a discovery directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub path: String,
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
    /// Time to live of the directory in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl DiscoveryConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            ttl: None,
        }
    }

    pub fn entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Observed value and version of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    pub value: String,
    pub version: u64,
}

/// Observed state of a discovery directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub path: KeyPath,
    /// Leaf entries keyed by their path relative to the directory.
    pub entries: BTreeMap<String, EntryState>,
    /// Modified index of the directory node.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl DiscoveryState {
    fn empty(path: KeyPath) -> Self {
        Self {
            path,
            entries: BTreeMap::new(),
            version: 0,
            ttl: None,
        }
    }

    fn from_node(path: &KeyPath, node: &Node) -> Result<Self> {
        if !node.dir {
            return Err(Error::Store {
                code: codes::NOT_DIR,
                message: "Not a directory".to_string(),
                cause: path.to_string(),
            });
        }

        let mut state = Self::empty(path.clone());
        state.version = node.modified_index;
        state.ttl = node.ttl.and_then(|t| u64::try_from(t).ok());

        for leaf in node.leaves() {
            let leaf_path = leaf.path()?;
            match leaf_path.strip_prefix(path) {
                Some(relative) if !relative.is_root() => {
                    state.entries.insert(
                        relative.to_relative_string(),
                        EntryState {
                            value: leaf.value.clone().unwrap_or_default(),
                            version: leaf.modified_index,
                        },
                    );
                }
                _ => debug!(key = %leaf.key, "ignoring node outside of {}", path),
            }
        }
        Ok(state)
    }

    /// Fold applied operations into the state.
    fn apply(mut self, applied: &[Applied]) -> Self {
        for Applied { operation, node } in applied {
            match operation {
                Operation::CreateDir { .. } | Operation::UpdateDir { .. } => {
                    if let Some(node) = node {
                        self.version = node.modified_index;
                        self.ttl = node.ttl.and_then(|t| u64::try_from(t).ok());
                    }
                }
                Operation::CreateKey { path, value, .. } | Operation::UpdateKey { path, value, .. } => {
                    if let (Some(relative), Some(node)) = (path.strip_prefix(&self.path), node) {
                        self.entries.insert(
                            relative.to_relative_string(),
                            EntryState {
                                value: node.value.clone().unwrap_or_else(|| value.clone()),
                                version: node.modified_index,
                            },
                        );
                    }
                }
                Operation::DeleteKey { path, .. } => {
                    if let Some(relative) = path.strip_prefix(&self.path) {
                        self.entries.remove(&relative.to_relative_string());
                    }
                }
                Operation::DeleteDir { .. } | Operation::PruneDir { .. } => {}
            }
        }
        self
    }
}

/// Reconciler for discovery directories.
pub struct DiscoveryResource {
    store: Arc<dyn KeysApi>,
}

impl DiscoveryResource {
    pub fn new(store: Arc<dyn KeysApi>) -> Self {
        Self { store }
    }

    async fn apply(&self, plan: Plan) -> Result<Vec<Applied>> {
        plan.execute(self.store.as_ref()).await.into_result()
    }

    fn validate_entries(path: &KeyPath, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut keys = Vec::with_capacity(entries.len());
        for key in entries.keys() {
            let relative = KeyPath::parse(key).map_err(|e| e.for_path(path))?;
            if relative.is_root() || relative.to_relative_string() != *key {
                return Err(Error::InvalidInput(format!(
                    "{}: entry key '{}' must be a relative path without leading or trailing '/'",
                    path, key
                )));
            }
            keys.push(relative);
        }

        // A key cannot be both a value and a directory.
        for (i, a) in keys.iter().enumerate() {
            if let Some(b) = keys[i + 1..]
                .iter()
                .find(|b| a.starts_with(b) || b.starts_with(a))
            {
                return Err(Error::InvalidInput(format!(
                    "{}: entry '{}' is nested below entry '{}'",
                    path,
                    b.to_relative_string().max(a.to_relative_string()),
                    b.to_relative_string().min(a.to_relative_string())
                )));
            }
        }
        Ok(())
    }

    /// Re-read the directory and fail if it drifted from `prior`.
    async fn snapshot(&self, prior: &DiscoveryState) -> Result<Option<DiscoveryState>> {
        let Some(snapshot) = self.read(&prior.path).await? else {
            return Ok(None);
        };
        ensure_unchanged(&prior.path, &prior.entries, &snapshot.entries)?;
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl Resource for DiscoveryResource {
    type Config = DiscoveryConfig;
    type State = DiscoveryState;

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn path(&self, config: &DiscoveryConfig) -> Result<KeyPath> {
        let path = KeyPath::parse(&config.path)?;
        if path.is_root() {
            return Err(Error::InvalidInput(
                "the root directory cannot be managed as a discovery tree".to_string(),
            ));
        }
        if config.ttl == Some(0) {
            return Err(Error::InvalidInput(format!(
                "{}: ttl must be at least one second",
                path
            )));
        }
        Self::validate_entries(&path, &config.entries)?;
        Ok(path)
    }

    fn plan(
        &self,
        observed: Option<&DiscoveryState>,
        desired: Option<&DiscoveryConfig>,
    ) -> Result<Plan> {
        let path = match (desired, observed) {
            (Some(config), _) => self.path(config)?,
            (None, Some(state)) => state.path.clone(),
            (None, None) => return Err(Error::InvalidInput("nothing to plan".to_string())),
        };
        let mut plan = Plan::new(TYPE_NAME, path.clone());

        match (observed, desired) {
            (None, Some(config)) => {
                plan.push(Operation::CreateDir {
                    path: path.clone(),
                    ttl: config.ttl,
                });
                plan.operations
                    .extend(tree::diff(&path, &config.entries, &BTreeMap::new())?);
            }
            (Some(state), Some(config)) => {
                if state.path != path {
                    return Err(Error::InvalidInput(format!(
                        "{}: state belongs to {}",
                        path, state.path
                    )));
                }
                if state.ttl.is_some() != config.ttl.is_some() {
                    plan.push(Operation::UpdateDir {
                        path: path.clone(),
                        ttl: config.ttl,
                    });
                }
                plan.operations
                    .extend(tree::diff(&path, &config.entries, &state.entries)?);
            }
            (Some(_), None) => plan.push(Operation::DeleteDir { path }),
            (None, None) => {}
        }

        Ok(plan)
    }

    async fn read(&self, path: &KeyPath) -> Result<Option<DiscoveryState>> {
        let response = self.store.try_get(path, &GetOptions::recursive()).await?;
        response
            .map(|r| DiscoveryState::from_node(path, &r.node))
            .transpose()
    }

    async fn create(&self, config: &DiscoveryConfig) -> Result<DiscoveryState> {
        let path = self.path(config)?;
        let applied = self.apply(self.plan(None, Some(config))?).await?;
        let state = DiscoveryState::empty(path.clone()).apply(&applied);
        info!(path = %path, entries = state.entries.len(), "discovery tree created");
        Ok(state)
    }

    async fn update(
        &self,
        prior: &DiscoveryState,
        config: &DiscoveryConfig,
    ) -> Result<DiscoveryState> {
        let path = self.path(config)?;
        if prior.path != path {
            return Err(Error::InvalidInput(format!(
                "{}: state belongs to {}",
                path, prior.path
            )));
        }

        let snapshot = self.snapshot(prior).await?.ok_or_else(|| {
            Error::Conflict(format!("{} was removed since it was last read", path))
        })?;

        let plan = self.plan(Some(&snapshot), Some(config))?;
        if plan.is_empty() {
            return Ok(snapshot);
        }
        let applied = self.apply(plan).await?;
        let state = snapshot.apply(&applied);
        info!(path = %path, operations = applied.len(), "discovery tree updated");
        Ok(state)
    }

    async fn delete(&self, prior: &DiscoveryState) -> Result<()> {
        let Some(snapshot) = self.snapshot(prior).await? else {
            debug!(path = %prior.path, "discovery tree already absent");
            return Ok(());
        };
        self.apply(self.plan(Some(&snapshot), None)?).await?;
        info!(path = %prior.path, "discovery tree deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etcdform_store::{MemoryStore, SetOptions};

    fn setup() -> (MemoryStore, DiscoveryResource) {
        let store = MemoryStore::new();
        let resource = DiscoveryResource::new(Arc::new(store.clone()));
        (store, resource)
    }

    fn path(p: &str) -> KeyPath {
        KeyPath::parse(p).unwrap()
    }

    fn values(state: &DiscoveryState) -> Vec<(&str, &str)> {
        state
            .entries
            .iter()
            .map(|(k, e)| (k.as_str(), e.value.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let (_, resource) = setup();
        let config = DiscoveryConfig::new("/services/web")
            .entry("a", "1")
            .entry("nodes/n1", "10.0.0.1");

        let created = resource.create(&config).await.unwrap();
        assert_eq!(values(&created), vec![("a", "1"), ("nodes/n1", "10.0.0.1")]);

        let read = resource.read(&path("/services/web")).await.unwrap().unwrap();
        assert_eq!(read.entries, created.entries);
        assert_eq!(read.version, created.version);
    }

    #[tokio::test]
    async fn test_create_existing_directory_fails() {
        let (store, resource) = setup();
        store
            .set(&path("/d/x"), Some("1"), &SetOptions::default())
            .await
            .unwrap();

        let err = resource
            .create(&DiscoveryConfig::new("/d").entry("a", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_creates_and_deletes_only_what_differs() {
        let (store, resource) = setup();
        let created = resource
            .create(&DiscoveryConfig::new("/d").entry("a", "1").entry("c", "3"))
            .await
            .unwrap();
        let a_version = created.entries["a"].version;

        let updated = resource
            .update(
                &created,
                &DiscoveryConfig::new("/d").entry("a", "1").entry("b", "2"),
            )
            .await
            .unwrap();

        assert_eq!(values(&updated), vec![("a", "1"), ("b", "2")]);
        assert_eq!(updated.entries["a"].version, a_version);

        let read = resource.read(&path("/d")).await.unwrap().unwrap();
        assert_eq!(read.entries, updated.entries);
        assert!(store
            .try_get(&path("/d/c"), &GetOptions::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_prunes_emptied_directories() {
        let (store, resource) = setup();
        let created = resource
            .create(
                &DiscoveryConfig::new("/d")
                    .entry("web/n1", "1")
                    .entry("db/n1", "2"),
            )
            .await
            .unwrap();

        resource
            .update(&created, &DiscoveryConfig::new("/d").entry("db/n1", "2"))
            .await
            .unwrap();

        assert!(store
            .try_get(&path("/d/web"), &GetOptions::default())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .try_get(&path("/d/db"), &GetOptions::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_update_after_drift_is_conflict() {
        let (store, resource) = setup();
        let created = resource
            .create(&DiscoveryConfig::new("/d").entry("a", "1"))
            .await
            .unwrap();
        store
            .set(&path("/d/a"), Some("changed elsewhere"), &SetOptions::default())
            .await
            .unwrap();

        let err = resource
            .update(&created, &DiscoveryConfig::new("/d").entry("a", "2"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let read = resource.read(&path("/d")).await.unwrap().unwrap();
        assert_eq!(read.entries["a"].value, "changed elsewhere");
    }

    #[tokio::test]
    async fn test_update_of_removed_directory_is_conflict() {
        let (store, resource) = setup();
        let created = resource
            .create(&DiscoveryConfig::new("/d").entry("a", "1"))
            .await
            .unwrap();
        store
            .delete(&path("/d"), &etcdform_store::DeleteOptions::recursive_dir())
            .await
            .unwrap();

        let err = resource
            .update(&created, &DiscoveryConfig::new("/d").entry("a", "1"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_directory_ttl() {
        let (_, resource) = setup();
        let created = resource
            .create(&DiscoveryConfig::new("/d").entry("a", "1"))
            .await
            .unwrap();
        assert_eq!(created.ttl, None);

        let updated = resource
            .update(
                &created,
                &DiscoveryConfig::new("/d").entry("a", "1").with_ttl(120),
            )
            .await
            .unwrap();
        assert_eq!(updated.ttl, Some(120));
        assert_eq!(updated.entries, created.entries);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_is_idempotent() {
        let (store, resource) = setup();
        let created = resource
            .create(&DiscoveryConfig::new("/d").entry("a", "1").entry("x/y", "2"))
            .await
            .unwrap();

        resource.delete(&created).await.unwrap();
        assert!(store
            .try_get(&path("/d"), &GetOptions::default())
            .await
            .unwrap()
            .is_none());

        resource.delete(&created).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_after_drift_is_conflict() {
        let (store, resource) = setup();
        let created = resource
            .create(&DiscoveryConfig::new("/d").entry("a", "1"))
            .await
            .unwrap();
        store
            .set(&path("/d/intruder"), Some("x"), &SetOptions::default())
            .await
            .unwrap();

        let err = resource.delete(&created).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store
            .try_get(&path("/d/a"), &GetOptions::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_read_of_a_key_is_an_error() {
        let (store, resource) = setup();
        store
            .set(&path("/k"), Some("1"), &SetOptions::default())
            .await
            .unwrap();

        let err = resource.read(&path("/k")).await.unwrap_err();
        assert!(matches!(err, Error::Store { code: 104, .. }));
    }

    #[tokio::test]
    async fn test_entry_can_turn_into_a_directory() {
        let (_, resource) = setup();
        let created = resource
            .create(&DiscoveryConfig::new("/d").entry("web", "1"))
            .await
            .unwrap();

        let config = DiscoveryConfig::new("/d").entry("web/n1", "1");
        let updated = resource.update(&created, &config).await.unwrap();
        assert_eq!(values(&updated), vec![("web/n1", "1")]);

        let read = resource.read(&path("/d")).await.unwrap().unwrap();
        assert_eq!(read.entries, updated.entries);
        assert!(resource.plan(Some(&read), Some(&config)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_can_turn_into_an_entry() {
        let (_, resource) = setup();
        let created = resource
            .create(
                &DiscoveryConfig::new("/d")
                    .entry("web/n1", "1")
                    .entry("web/n2", "2"),
            )
            .await
            .unwrap();

        let config = DiscoveryConfig::new("/d").entry("web", "3");
        let updated = resource.update(&created, &config).await.unwrap();
        assert_eq!(values(&updated), vec![("web", "3")]);

        let read = resource.read(&path("/d")).await.unwrap().unwrap();
        assert_eq!(read.entries, updated.entries);
    }

    #[test]
    fn test_entry_validation() {
        let (_, resource) = setup();

        let nested = DiscoveryConfig::new("/d").entry("web", "1").entry("web/n1", "2");
        let err = resource.path(&nested).unwrap_err();
        assert!(err.to_string().contains("'web/n1' is nested below entry 'web'"));

        for key in ["/abs", "trailing/", "a//b", "..", ""] {
            let config = DiscoveryConfig::new("/d").entry(key, "1");
            assert!(resource.path(&config).is_err(), "{:?} should be rejected", key);
        }

        let siblings = DiscoveryConfig::new("/d").entry("web", "1").entry("website", "2");
        resource.path(&siblings).unwrap();
    }

    #[test]
    fn test_plan_for_new_tree() {
        let (_, resource) = setup();
        let plan = resource
            .plan(None, Some(&DiscoveryConfig::new("/d").entry("a", "1").with_ttl(30)))
            .unwrap();

        let rendered: Vec<String> = plan.operations.iter().map(|op| op.to_string()).collect();
        assert_eq!(rendered, vec!["+ /d/ (ttl 30s)", "+ /d/a = \"1\""]);
    }
}
