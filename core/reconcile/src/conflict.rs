//! Drift detection between the last observed and the current remote tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use etcdform_common::{Error, KeyPath, Result};

use crate::discovery::EntryState;

/// An entry that changed remotely since it was last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Drift {
    /// Entry appeared remotely.
    Added { key: String, version: u64 },
    /// Entry was written remotely (its version moved).
    Modified {
        key: String,
        expected: u64,
        found: u64,
    },
    /// Entry disappeared remotely.
    Removed { key: String, version: u64 },
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Drift::Added { key, version } => write!(f, "{} added at version {}", key, version),
            Drift::Modified {
                key,
                expected,
                found,
            } => write!(f, "{} modified [{} != {}]", key, expected, found),
            Drift::Removed { key, version } => {
                write!(f, "{} removed (was version {})", key, version)
            }
        }
    }
}

/// Compare entry versions, sorted by key.
pub fn detect_drift(
    prior: &BTreeMap<String, EntryState>,
    remote: &BTreeMap<String, EntryState>,
) -> Vec<Drift> {
    let mut drift = Vec::new();

    for (key, known) in prior {
        match remote.get(key) {
            None => drift.push(Drift::Removed {
                key: key.clone(),
                version: known.version,
            }),
            Some(current) if current.version != known.version => drift.push(Drift::Modified {
                key: key.clone(),
                expected: known.version,
                found: current.version,
            }),
            Some(_) => {}
        }
    }
    for (key, current) in remote {
        if !prior.contains_key(key) {
            drift.push(Drift::Added {
                key: key.clone(),
                version: current.version,
            });
        }
    }

    drift.sort_by(|a, b| drift_key(a).cmp(drift_key(b)));
    drift
}

fn drift_key(drift: &Drift) -> &str {
    match drift {
        Drift::Added { key, .. } | Drift::Modified { key, .. } | Drift::Removed { key, .. } => key,
    }
}

/// Fail with `Conflict` if any entry below `path` drifted.
pub fn ensure_unchanged(
    path: &KeyPath,
    prior: &BTreeMap<String, EntryState>,
    remote: &BTreeMap<String, EntryState>,
) -> Result<()> {
    let drift = detect_drift(prior, remote);
    if drift.is_empty() {
        return Ok(());
    }

    let details: Vec<String> = drift.iter().map(|d| d.to_string()).collect();
    Err(Error::Conflict(format!(
        "{} changed since it was last read: {}",
        path,
        details.join(", ")
    )))
}
