//! Plans: ordered store operations that converge one resource.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use etcdform_common::{Error, KeyPath, Result};
use etcdform_store::keys::codes;
use etcdform_store::{DeleteOptions, KeysApi, Node, PrevExist, SetOptions};

/// A single store operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Write a new key. Without `overwrite` the write fails if the key exists.
    CreateKey {
        path: KeyPath,
        value: String,
        ttl: Option<u64>,
        overwrite: bool,
    },
    /// Compare-and-swap a key on its last known version.
    UpdateKey {
        path: KeyPath,
        value: String,
        ttl: Option<u64>,
        version: u64,
    },
    /// Compare-and-delete a key on its last known version.
    DeleteKey { path: KeyPath, version: u64 },
    CreateDir { path: KeyPath, ttl: Option<u64> },
    /// Refresh the TTL of an existing directory.
    UpdateDir { path: KeyPath, ttl: Option<u64> },
    /// Remove a directory and everything below it.
    DeleteDir { path: KeyPath },
    /// Remove a directory if it is empty.
    PruneDir { path: KeyPath },
}

impl Operation {
    pub fn path(&self) -> &KeyPath {
        match self {
            Operation::CreateKey { path, .. }
            | Operation::UpdateKey { path, .. }
            | Operation::DeleteKey { path, .. }
            | Operation::CreateDir { path, .. }
            | Operation::UpdateDir { path, .. }
            | Operation::DeleteDir { path }
            | Operation::PruneDir { path } => path,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Operation::DeleteKey { .. } | Operation::DeleteDir { .. } | Operation::PruneDir { .. }
        )
    }

    /// Apply the operation.
    ///
    /// Returns the node reported by the store, or `None` when a delete
    /// found nothing to remove.
    pub async fn apply<K: KeysApi + ?Sized>(&self, store: &K) -> Result<Option<Node>> {
        debug!(operation = %self, "applying");
        let response = match self {
            Operation::CreateKey {
                path,
                value,
                ttl,
                overwrite,
            } => {
                let opts = if *overwrite {
                    SetOptions::default()
                } else {
                    SetOptions::create()
                };
                store.set(path, Some(value), &opts.with_ttl(*ttl)).await
            }
            Operation::UpdateKey {
                path,
                value,
                ttl,
                version,
            } => {
                let opts = SetOptions::compare_and_swap(*version).with_ttl(*ttl);
                store.set(path, Some(value), &opts).await
            }
            Operation::DeleteKey { path, version } => {
                store
                    .delete(path, &DeleteOptions::compare_and_delete(*version))
                    .await
            }
            Operation::CreateDir { path, ttl } => {
                let opts = SetOptions::create().as_dir().with_ttl(*ttl);
                store.set(path, None, &opts).await
            }
            Operation::UpdateDir { path, ttl } => {
                let opts = SetOptions {
                    ttl: *ttl,
                    dir: true,
                    prev_exist: PrevExist::MustExist,
                    prev_index: None,
                };
                store.set(path, None, &opts).await
            }
            Operation::DeleteDir { path } => {
                store.delete(path, &DeleteOptions::recursive_dir()).await
            }
            Operation::PruneDir { path } => {
                store.delete(path, &DeleteOptions::empty_dir()).await
            }
        };

        match response {
            Ok(response) => Ok(Some(response.node)),
            Err(e) if e.is_not_found() && self.is_delete() => {
                debug!(path = %self.path(), "already absent");
                Ok(None)
            }
            Err(Error::Store { code, .. })
                if code == codes::DIR_NOT_EMPTY && matches!(self, Operation::PruneDir { .. }) =>
            {
                debug!(path = %self.path(), "directory still in use, kept");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn fmt_ttl(ttl: &Option<u64>) -> String {
    ttl.map(|t| format!(" (ttl {}s)", t)).unwrap_or_default()
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateKey {
                path,
                value,
                ttl,
                overwrite,
            } => {
                write!(f, "+ {} = {:?}{}", path, value, fmt_ttl(ttl))?;
                if *overwrite {
                    write!(f, " (overwrite)")?;
                }
                Ok(())
            }
            Operation::UpdateKey {
                path,
                value,
                ttl,
                version,
            } => write!(
                f,
                "~ {} = {:?}{} [version {}]",
                path,
                value,
                fmt_ttl(ttl),
                version
            ),
            Operation::DeleteKey { path, version } => {
                write!(f, "- {} [version {}]", path, version)
            }
            Operation::CreateDir { path, ttl } => write!(f, "+ {}/{}", path, fmt_ttl(ttl)),
            Operation::UpdateDir { path, ttl } => write!(f, "~ {}/{}", path, fmt_ttl(ttl)),
            Operation::DeleteDir { path } => write!(f, "- {}/ (recursive)", path),
            Operation::PruneDir { path } => write!(f, "- {}/ (if empty)", path),
        }
    }
}

/// Operations that converge one resource, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub resource_type: String,
    pub path: KeyPath,
    pub operations: Vec<Operation>,
}

/// An operation that reached the store.
#[derive(Debug, Clone)]
pub struct Applied {
    pub operation: Operation,
    /// Node returned by the store; `None` for deletes that were no-ops.
    pub node: Option<Node>,
}

/// Result of executing a plan.
///
/// Operations are applied in order and execution stops at the first
/// failure, so `applied` is always a prefix of the plan.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub applied: Vec<Applied>,
    pub failure: Option<(Operation, Error)>,
}

impl ApplyOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }

    /// Convert into the applied operations, or the first failure with the
    /// failing path in its message.
    pub fn into_result(self) -> Result<Vec<Applied>> {
        match self.failure {
            None => Ok(self.applied),
            Some((operation, error)) => {
                warn!(
                    path = %operation.path(),
                    applied = self.applied.len(),
                    error = %error,
                    "plan stopped at a failing operation"
                );
                Err(error.for_path(operation.path()))
            }
        }
    }
}

impl Plan {
    pub fn new(resource_type: impl Into<String>, path: KeyPath) -> Self {
        Self {
            resource_type: resource_type.into(),
            path,
            operations: Vec::new(),
        }
    }

    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Apply every operation in order, stopping at the first failure.
    pub async fn execute<K: KeysApi + ?Sized>(&self, store: &K) -> ApplyOutcome {
        let mut applied = Vec::with_capacity(self.operations.len());
        for operation in &self.operations {
            match operation.apply(store).await {
                Ok(node) => applied.push(Applied {
                    operation: operation.clone(),
                    node,
                }),
                Err(e) => {
                    return ApplyOutcome {
                        applied,
                        failure: Some((operation.clone(), e)),
                    }
                }
            }
        }
        ApplyOutcome {
            applied,
            failure: None,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{} {}: no changes", self.resource_type, self.path);
        }
        write!(f, "{} {}:", self.resource_type, self.path)?;
        for operation in &self.operations {
            write!(f, "\n  {}", operation)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etcdform_store::{GetOptions, MemoryStore};

    fn path(p: &str) -> KeyPath {
        KeyPath::parse(p).unwrap()
    }

    fn create(p: &str, value: &str) -> Operation {
        Operation::CreateKey {
            path: path(p),
            value: value.to_string(),
            ttl: None,
            overwrite: false,
        }
    }

    #[test]
    fn test_display() {
        let plan = Plan::new("etcd_keys", path("/a")).with_operations(vec![
            Operation::CreateKey {
                path: path("/a"),
                value: "1".to_string(),
                ttl: Some(30),
                overwrite: false,
            },
            Operation::DeleteKey {
                path: path("/b"),
                version: 4,
            },
        ]);
        assert_eq!(
            plan.to_string(),
            "etcd_keys /a:\n  + /a = \"1\" (ttl 30s)\n  - /b [version 4]"
        );
        assert_eq!(
            Plan::new("etcd_keys", path("/a")).to_string(),
            "etcd_keys /a: no changes"
        );
    }

    #[tokio::test]
    async fn test_execute_stops_at_first_failure() {
        let store = MemoryStore::new();
        let plan = Plan::new("etcd_discovery", path("/d")).with_operations(vec![
            create("/d/a", "1"),
            create("/d/a", "again"),
            create("/d/b", "2"),
        ]);

        let outcome = plan.execute(&store).await;
        assert!(!outcome.is_complete());
        assert_eq!(outcome.applied.len(), 1);

        let err = outcome.into_result().unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(err.to_string().contains("/d/a"));

        let b = store
            .try_get(&path("/d/b"), &GetOptions::default())
            .await
            .unwrap();
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn test_deletes_of_absent_paths_are_noops() {
        let store = MemoryStore::new();
        let plan = Plan::new("etcd_keys", path("/a")).with_operations(vec![
            Operation::DeleteKey {
                path: path("/a"),
                version: 3,
            },
            Operation::DeleteDir { path: path("/d") },
            Operation::PruneDir { path: path("/e") },
        ]);

        let applied = plan.execute(&store).await.into_result().unwrap();
        assert_eq!(applied.len(), 3);
        assert!(applied.iter().all(|a| a.node.is_none()));
    }

    #[tokio::test]
    async fn test_prune_keeps_non_empty_directory() {
        let store = MemoryStore::new();
        create("/d/sub/a", "1").apply(&store).await.unwrap();

        let node = Operation::PruneDir { path: path("/d/sub") }
            .apply(&store)
            .await
            .unwrap();
        assert!(node.is_none());
        assert!(store
            .try_get(&path("/d/sub/a"), &GetOptions::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_stale_update_is_a_conflict() {
        let store = MemoryStore::new();
        let node = create("/a", "1").apply(&store).await.unwrap().unwrap();

        let update = Operation::UpdateKey {
            path: path("/a"),
            value: "2".to_string(),
            ttl: None,
            version: node.modified_index + 10,
        };
        let err = update.apply(&store).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
