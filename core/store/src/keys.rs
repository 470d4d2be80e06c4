//! Keys API trait definition.
//!
//! Mirrors the etcd v2 keys API: every node carries the index at which it
//! was created and last modified, and writes can be guarded by
//! preconditions on existence or on the modified index.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use etcdform_common::{Error, KeyPath, Result};

/// Error codes reported by the store in the `errorCode` field.
pub mod codes {
    pub const KEY_NOT_FOUND: u32 = 100;
    pub const TEST_FAILED: u32 = 101;
    pub const NOT_FILE: u32 = 102;
    pub const NOT_DIR: u32 = 104;
    pub const NODE_EXIST: u32 = 105;
    pub const ROOT_READ_ONLY: u32 = 107;
    pub const DIR_NOT_EMPTY: u32 = 108;
}

/// Map a store error code onto the common error kinds.
///
/// Key-not-found, compare-failed and node-exists get their own kinds so
/// that callers can treat absence and conflicts without string matching.
pub fn error_for_code(code: u32, message: &str, cause: &str) -> Error {
    match code {
        codes::KEY_NOT_FOUND => Error::NotFound(format!("{}: {}", cause, message)),
        codes::TEST_FAILED => Error::Conflict(format!("{} ({})", message, cause)),
        codes::NODE_EXIST => Error::AlreadyExists(format!("{}: {}", cause, message)),
        _ => Error::Store {
            code,
            message: message.to_string(),
            cause: cause.to_string(),
        },
    }
}

/// A key or directory as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Absolute key. Empty for the root directory.
    #[serde(default)]
    pub key: String,
    /// Value, absent for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Whether this node is a directory.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    /// Children, populated for directories on get.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    /// Store index at which the node was created.
    #[serde(default)]
    pub created_index: u64,
    /// Store index of the last modification; the version used in preconditions.
    #[serde(default)]
    pub modified_index: u64,
    /// Remaining time to live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

impl Node {
    /// Parsed key of this node.
    pub fn path(&self) -> Result<KeyPath> {
        KeyPath::parse(&self.key)
    }

    /// All non-directory descendants, depth first.
    pub fn leaves(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }
}

fn collect_leaves<'a>(node: &'a Node, out: &mut Vec<&'a Node>) {
    if !node.dir {
        out.push(node);
        return;
    }
    for child in &node.nodes {
        collect_leaves(child, out);
    }
}

/// Response to a keys API call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysResponse {
    /// Action performed (`get`, `set`, `create`, `compareAndSwap`, ...).
    pub action: String,
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,
    /// Store index at response time (`X-Etcd-Index` header).
    #[serde(skip)]
    pub index: Option<u64>,
}

/// Existence precondition for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrevExist {
    /// No existence check.
    #[default]
    Any,
    /// Write only if the key exists (update).
    MustExist,
    /// Write only if the key does not exist (create).
    MustNotExist,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub recursive: bool,
    pub sorted: bool,
}

impl GetOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            sorted: true,
        }
    }
}

/// Options for a set operation.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<u64>,
    pub dir: bool,
    pub prev_exist: PrevExist,
    /// Compare-and-swap on the modified index.
    pub prev_index: Option<u64>,
}

impl SetOptions {
    /// Create-only write.
    pub fn create() -> Self {
        Self {
            prev_exist: PrevExist::MustNotExist,
            ..Default::default()
        }
    }

    /// Write guarded by the last known modified index.
    pub fn compare_and_swap(prev_index: u64) -> Self {
        Self {
            prev_index: Some(prev_index),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Option<u64>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn as_dir(mut self) -> Self {
        self.dir = true;
        self
    }
}

/// Options for a delete operation.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Compare-and-delete on the modified index.
    pub prev_index: Option<u64>,
    pub recursive: bool,
    pub dir: bool,
}

impl DeleteOptions {
    pub fn compare_and_delete(prev_index: u64) -> Self {
        Self {
            prev_index: Some(prev_index),
            ..Default::default()
        }
    }

    /// Remove a directory and everything below it.
    pub fn recursive_dir() -> Self {
        Self {
            prev_index: None,
            recursive: true,
            dir: true,
        }
    }

    /// Remove a directory only if it is empty.
    pub fn empty_dir() -> Self {
        Self {
            prev_index: None,
            recursive: false,
            dir: true,
        }
    }
}

/// Keys API implemented by every store backend.
///
/// Implementations must be safe to share between concurrent
/// reconciliations: they hold no per-call mutable state.
#[async_trait]
pub trait KeysApi: Send + Sync {
    /// Backend name (e.g., "etcd", "memory").
    fn name(&self) -> &str;

    /// Read a key or directory.
    ///
    /// # Errors
    /// - `NotFound` if the path does not exist
    /// - Network/timeout errors
    async fn get(&self, path: &KeyPath, opts: &GetOptions) -> Result<KeysResponse>;

    /// Write a key, or a directory when `opts.dir` is set (`value` must
    /// then be `None`).
    ///
    /// # Errors
    /// - `AlreadyExists` when `PrevExist::MustNotExist` and the key exists
    /// - `NotFound` when `PrevExist::MustExist` or `prev_index` and the key is absent
    /// - `Conflict` when `prev_index` does not match the modified index
    async fn set(
        &self,
        path: &KeyPath,
        value: Option<&str>,
        opts: &SetOptions,
    ) -> Result<KeysResponse>;

    /// Delete a key or directory.
    ///
    /// # Errors
    /// - `NotFound` if the path does not exist
    /// - `Conflict` when `prev_index` does not match the modified index
    /// - `Store` 108 when deleting a non-empty directory without `recursive`
    async fn delete(&self, path: &KeyPath, opts: &DeleteOptions) -> Result<KeysResponse>;

    /// Read a path, mapping absence to `None`.
    async fn try_get(&self, path: &KeyPath, opts: &GetOptions) -> Result<Option<KeysResponse>> {
        match self.get(path, opts).await {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
