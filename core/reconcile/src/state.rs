//! Persistent state of every tracked resource.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

use etcdform_common::{Error, KeyPath, Result};

use crate::lifecycle::{Phase, TrackedResource};

/// Tracked resources keyed by `type:path`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStore {
    resources: BTreeMap<String, TrackedResource<Value>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(resource_type: &str, path: &KeyPath) -> String {
        format!("{}:{}", resource_type, path)
    }

    pub fn get(&self, resource_type: &str, path: &KeyPath) -> Option<&TrackedResource<Value>> {
        self.resources.get(&Self::key(resource_type, path))
    }

    /// Get the tracked entry, or a fresh `Unknown` one.
    pub fn get_or_new(&self, resource_type: &str, path: &KeyPath) -> TrackedResource<Value> {
        self.get(resource_type, path)
            .cloned()
            .unwrap_or_else(|| TrackedResource::new(resource_type, path.clone()))
    }

    /// Insert or replace an entry. Absent resources are dropped.
    pub fn insert(&mut self, tracked: TrackedResource<Value>) {
        let key = Self::key(&tracked.resource_type, &tracked.path);
        if tracked.phase() == Phase::Absent && tracked.last_error.is_none() {
            self.resources.remove(&key);
        } else {
            self.resources.insert(key, tracked);
        }
    }

    pub fn remove(&mut self, resource_type: &str, path: &KeyPath) -> Option<TrackedResource<Value>> {
        self.resources.remove(&Self::key(resource_type, path))
    }

    pub fn entries(&self) -> impl Iterator<Item = &TrackedResource<Value>> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Entries whose last convergence failed.
    pub fn failed(&self) -> Vec<&TrackedResource<Value>> {
        self.resources
            .values()
            .filter(|t| t.last_error.is_some())
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load from a file. A missing file is an empty state.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path).await {
            Ok(content) => Self::from_json(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file, starting empty");
                Ok(Self::new())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Save to a file, replacing it atomically.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.to_json()?).await?;
        fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), resources = self.len(), "state saved");
        Ok(())
    }
}
