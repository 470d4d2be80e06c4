//! In-memory keys store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use etcdform_common::{Error, KeyPath, Result};

use crate::keys::{
    codes, error_for_code, DeleteOptions, GetOptions, KeysApi, KeysResponse, Node, PrevExist,
    SetOptions,
};

/// In-memory storage entry.
#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    dir: bool,
    ttl: Option<u64>,
    created_index: u64,
    modified_index: u64,
}

#[derive(Debug, Default)]
struct Inner {
    index: u64,
    entries: BTreeMap<KeyPath, Entry>,
}

impl Inner {
    fn to_node(path: &KeyPath, entry: &Entry) -> Node {
        Node {
            key: path.to_string_path(),
            value: entry.value.clone(),
            dir: entry.dir,
            nodes: Vec::new(),
            created_index: entry.created_index,
            modified_index: entry.modified_index,
            ttl: entry.ttl.map(|t| t as i64),
            expiration: None,
        }
    }

    fn children(&self, path: &KeyPath) -> Vec<KeyPath> {
        let depth = path.components().len() + 1;
        self.entries
            .keys()
            .filter(|k| k.components().len() == depth && k.starts_with(path))
            .cloned()
            .collect()
    }

    fn node(&self, path: &KeyPath, recursive: bool) -> Option<Node> {
        let mut node = if path.is_root() {
            Node {
                dir: true,
                ..Default::default()
            }
        } else {
            Self::to_node(path, self.entries.get(path)?)
        };

        if node.dir {
            for child in self.children(path) {
                let child_node = if recursive {
                    self.node(&child, true)
                } else {
                    self.entries.get(&child).map(|e| Self::to_node(&child, e))
                };
                node.nodes.extend(child_node);
            }
        }
        Some(node)
    }
}

/// In-memory keys store.
///
/// Implements the same index, precondition and directory rules as the
/// etcd v2 keys API. Data is lost on drop. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.read().map(|inner| inner.index).unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Io(std::io::Error::other("memory store lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Io(std::io::Error::other("memory store lock poisoned")))
    }
}

fn check_prev_index(path: &KeyPath, existing: Option<&Entry>, prev_index: u64) -> Result<()> {
    match existing {
        None => Err(error_for_code(
            codes::KEY_NOT_FOUND,
            "Key not found",
            &path.to_string_path(),
        )),
        Some(entry) if entry.modified_index != prev_index => Err(error_for_code(
            codes::TEST_FAILED,
            "Compare failed",
            &format!("[{} != {}]", prev_index, entry.modified_index),
        )),
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl KeysApi for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, path: &KeyPath, opts: &GetOptions) -> Result<KeysResponse> {
        let inner = self.read()?;
        let node = inner.node(path, opts.recursive).ok_or_else(|| {
            error_for_code(codes::KEY_NOT_FOUND, "Key not found", &path.to_string_path())
        })?;

        Ok(KeysResponse {
            action: "get".to_string(),
            node,
            prev_node: None,
            index: Some(inner.index),
        })
    }

    async fn set(
        &self,
        path: &KeyPath,
        value: Option<&str>,
        opts: &SetOptions,
    ) -> Result<KeysResponse> {
        let key = path.to_string_path();
        if path.is_root() {
            return Err(error_for_code(codes::ROOT_READ_ONLY, "Root is read only", "/"));
        }
        if opts.dir == value.is_some() {
            return Err(Error::InvalidInput(format!(
                "{}: a write needs either a value or the directory flag",
                key
            )));
        }

        let mut inner = self.write()?;
        let existing = inner.entries.get(path).cloned();

        match (opts.prev_exist, &existing) {
            (PrevExist::MustNotExist, Some(_)) => {
                return Err(error_for_code(codes::NODE_EXIST, "Key already exists", &key));
            }
            (PrevExist::MustExist, None) => {
                return Err(error_for_code(codes::KEY_NOT_FOUND, "Key not found", &key));
            }
            _ => {}
        }
        if let Some(prev_index) = opts.prev_index {
            check_prev_index(path, existing.as_ref(), prev_index)?;
        }
        if let Some(entry) = &existing {
            if entry.dir && !(opts.dir && opts.prev_exist == PrevExist::MustExist) {
                return Err(error_for_code(codes::NOT_FILE, "Not a file", &key));
            }
            if !entry.dir && opts.dir {
                return Err(error_for_code(codes::NOT_DIR, "Not a directory", &key));
            }
        }

        let mut ancestors = Vec::new();
        let mut cursor = path.parent();
        while let Some(ancestor) = cursor {
            if ancestor.is_root() {
                break;
            }
            match inner.entries.get(&ancestor) {
                Some(entry) if !entry.dir => {
                    return Err(error_for_code(
                        codes::NOT_DIR,
                        "Not a directory",
                        &ancestor.to_string_path(),
                    ));
                }
                Some(_) => {}
                None => ancestors.push(ancestor.clone()),
            }
            cursor = ancestor.parent();
        }

        inner.index += 1;
        let index = inner.index;
        for ancestor in ancestors {
            inner.entries.insert(
                ancestor,
                Entry {
                    value: None,
                    dir: true,
                    ttl: None,
                    created_index: index,
                    modified_index: index,
                },
            );
        }

        let entry = Entry {
            value: value.map(String::from),
            dir: opts.dir,
            ttl: opts.ttl,
            created_index: existing.as_ref().map_or(index, |e| e.created_index),
            modified_index: index,
        };
        let node = Inner::to_node(path, &entry);
        inner.entries.insert(path.clone(), entry);

        let action = if opts.prev_index.is_some() {
            "compareAndSwap"
        } else {
            match opts.prev_exist {
                PrevExist::MustNotExist => "create",
                PrevExist::MustExist => "update",
                PrevExist::Any => "set",
            }
        };

        Ok(KeysResponse {
            action: action.to_string(),
            node,
            prev_node: existing.map(|e| Inner::to_node(path, &e)),
            index: Some(index),
        })
    }

    async fn delete(&self, path: &KeyPath, opts: &DeleteOptions) -> Result<KeysResponse> {
        let key = path.to_string_path();
        if path.is_root() {
            return Err(error_for_code(codes::ROOT_READ_ONLY, "Root is read only", "/"));
        }

        let mut inner = self.write()?;
        let existing = inner
            .entries
            .get(path)
            .cloned()
            .ok_or_else(|| error_for_code(codes::KEY_NOT_FOUND, "Key not found", &key))?;

        if let Some(prev_index) = opts.prev_index {
            check_prev_index(path, Some(&existing), prev_index)?;
        }
        if existing.dir {
            if !(opts.dir || opts.recursive) {
                return Err(error_for_code(codes::NOT_FILE, "Not a file", &key));
            }
            if !opts.recursive && !inner.children(path).is_empty() {
                return Err(error_for_code(
                    codes::DIR_NOT_EMPTY,
                    "Directory not empty",
                    &key,
                ));
            }
        }

        inner.entries.retain(|k, _| !k.starts_with(path));
        inner.index += 1;
        let index = inner.index;

        Ok(KeysResponse {
            action: if opts.prev_index.is_some() {
                "compareAndDelete".to_string()
            } else {
                "delete".to_string()
            },
            node: Node {
                key,
                dir: existing.dir,
                created_index: existing.created_index,
                modified_index: index,
                ..Default::default()
            },
            prev_node: Some(Inner::to_node(path, &existing)),
            index: Some(index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> KeyPath {
        KeyPath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        let created = store
            .set(&path("/a"), Some("1"), &SetOptions::create())
            .await
            .unwrap();
        assert_eq!(created.action, "create");
        assert_eq!(created.node.modified_index, 1);

        let read = store.get(&path("/a"), &GetOptions::default()).await.unwrap();
        assert_eq!(read.node.value.as_deref(), Some("1"));
        assert_eq!(read.node.modified_index, 1);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = MemoryStore::new();
        store.set(&path("/a"), Some("1"), &SetOptions::create()).await.unwrap();

        let err = store
            .set(&path("/a"), Some("2"), &SetOptions::create())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        let v1 = store
            .set(&path("/a"), Some("1"), &SetOptions::default())
            .await
            .unwrap()
            .node
            .modified_index;

        let v2 = store
            .set(&path("/a"), Some("2"), &SetOptions::compare_and_swap(v1))
            .await
            .unwrap();
        assert_eq!(v2.action, "compareAndSwap");
        assert_eq!(v2.prev_node.unwrap().value.as_deref(), Some("1"));

        let stale = store
            .set(&path("/a"), Some("3"), &SetOptions::compare_and_swap(v1))
            .await
            .unwrap_err();
        assert!(stale.is_conflict());
    }

    #[tokio::test]
    async fn test_parents_created_and_listed() {
        let store = MemoryStore::new();
        store
            .set(&path("/dir/sub/b"), Some("2"), &SetOptions::default())
            .await
            .unwrap();
        store
            .set(&path("/dir/a"), Some("1"), &SetOptions::default())
            .await
            .unwrap();

        let shallow = store.get(&path("/dir"), &GetOptions::default()).await.unwrap();
        assert_eq!(shallow.node.nodes.len(), 2);
        assert!(shallow.node.nodes.iter().all(|n| n.nodes.is_empty()));

        let deep = store.get(&path("/dir"), &GetOptions::recursive()).await.unwrap();
        let keys: Vec<&str> = deep.node.leaves().iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/dir/a", "/dir/sub/b"]);
    }

    #[tokio::test]
    async fn test_set_under_file_fails() {
        let store = MemoryStore::new();
        store.set(&path("/a"), Some("1"), &SetOptions::default()).await.unwrap();

        let err = store
            .set(&path("/a/b"), Some("2"), &SetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { code: 104, .. }));
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let store = MemoryStore::new();
        store.set(&path("/dir/a"), Some("1"), &SetOptions::default()).await.unwrap();

        let not_file = store
            .delete(&path("/dir"), &DeleteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(not_file, Error::Store { code: 102, .. }));

        let not_empty = store
            .delete(&path("/dir"), &DeleteOptions::empty_dir())
            .await
            .unwrap_err();
        assert!(matches!(not_empty, Error::Store { code: 108, .. }));

        store
            .delete(&path("/dir"), &DeleteOptions::recursive_dir())
            .await
            .unwrap();
        assert!(store
            .try_get(&path("/dir/a"), &GetOptions::default())
            .await
            .unwrap()
            .is_none());

        let missing = store
            .delete(&path("/dir"), &DeleteOptions::recursive_dir())
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_compare_and_delete_stale() {
        let store = MemoryStore::new();
        let v1 = store
            .set(&path("/a"), Some("1"), &SetOptions::default())
            .await
            .unwrap()
            .node
            .modified_index;
        store.set(&path("/a"), Some("2"), &SetOptions::default()).await.unwrap();

        let err = store
            .delete(&path("/a"), &DeleteOptions::compare_and_delete(v1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_root_is_read_only() {
        let store = MemoryStore::new();
        let err = store
            .set(&KeyPath::root(), Some("x"), &SetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { code: 107, .. }));

        let root = store.get(&KeyPath::root(), &GetOptions::default()).await.unwrap();
        assert!(root.node.dir);
    }
}
