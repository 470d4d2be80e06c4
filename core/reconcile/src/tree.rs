//! Diff of a desired entry tree against an observed one.

use std::collections::{BTreeMap, BTreeSet};

use etcdform_common::{KeyPath, Result};

use crate::discovery::EntryState;
use crate::plan::Operation;

/// Operations that turn `observed` into `desired` below `base`.
///
/// Keys are relative to `base`. Creates come first, then updates, then
/// deletes, each sorted by key. Entries whose value already matches are
/// left alone. Directories left empty by the deletes are pruned last,
/// deepest first.
///
/// A create whose path is an observed key being removed, or lies above or
/// below one, cannot succeed while that key is there. Such deletes, and the
/// prunes of the directories they empty at or below the created path, run
/// before every create.
pub fn diff(
    base: &KeyPath,
    desired: &BTreeMap<String, String>,
    observed: &BTreeMap<String, EntryState>,
) -> Result<Vec<Operation>> {
    let mut creates = Vec::new();
    let mut created = Vec::new();
    let mut updates = Vec::new();

    for (key, value) in desired {
        let relative = KeyPath::parse(key)?;
        let path = base.join_path(&relative);
        match observed.get(key) {
            None => {
                creates.push(Operation::CreateKey {
                    path,
                    value: value.clone(),
                    ttl: None,
                    overwrite: false,
                });
                created.push(relative);
            }
            Some(entry) if entry.value != *value => updates.push(Operation::UpdateKey {
                path,
                value: value.clone(),
                ttl: None,
                version: entry.version,
            }),
            Some(_) => {}
        }
    }

    let desired_paths = desired
        .keys()
        .map(|k| KeyPath::parse(k))
        .collect::<Result<Vec<_>>>()?;

    let mut early_deletes = Vec::new();
    let mut deletes = Vec::new();
    let mut emptied = BTreeSet::new();
    for (key, entry) in observed {
        if desired.contains_key(key) {
            continue;
        }
        let relative = KeyPath::parse(key)?;
        let operation = Operation::DeleteKey {
            path: base.join_path(&relative),
            version: entry.version,
        };
        if created
            .iter()
            .any(|p| p.starts_with(&relative) || relative.starts_with(p))
        {
            early_deletes.push(operation);
        } else {
            deletes.push(operation);
        }

        // A directory stays in use while a desired key lies strictly below it.
        let mut parent = relative.parent();
        while let Some(dir) = parent.filter(|p| !p.is_root()) {
            if !desired_paths.iter().any(|p| p.starts_with(&dir) && *p != dir) {
                emptied.insert(dir.clone());
            }
            parent = dir.parent();
        }
    }

    let (early_prunes, prunes): (Vec<KeyPath>, Vec<KeyPath>) = emptied
        .into_iter()
        .partition(|dir| created.iter().any(|p| dir.starts_with(p)));

    let mut operations = early_deletes;
    operations.extend(prune_operations(base, early_prunes));
    operations.extend(creates);
    operations.extend(updates);
    operations.extend(deletes);
    operations.extend(prune_operations(base, prunes));
    Ok(operations)
}

/// Prunes ordered deepest first, then by path.
fn prune_operations(base: &KeyPath, mut dirs: Vec<KeyPath>) -> Vec<Operation> {
    dirs.sort_by(|a, b| {
        b.components()
            .len()
            .cmp(&a.components().len())
            .then_with(|| a.cmp(b))
    });
    dirs.into_iter()
        .map(|dir| Operation::PruneDir {
            path: base.join_path(&dir),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> KeyPath {
        KeyPath::parse("/discovery").unwrap()
    }

    fn desired(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn observed(entries: &[(&str, &str, u64)]) -> BTreeMap<String, EntryState> {
        entries
            .iter()
            .map(|(k, v, version)| {
                (
                    k.to_string(),
                    EntryState {
                        value: v.to_string(),
                        version: *version,
                    },
                )
            })
            .collect()
    }

    fn path(p: &str) -> KeyPath {
        KeyPath::parse(p).unwrap()
    }

    #[test]
    fn test_create_and_delete_leave_matching_entries_alone() {
        let ops = diff(
            &base(),
            &desired(&[("a", "1"), ("b", "2")]),
            &observed(&[("a", "1", 3), ("c", "3", 4)]),
        )
        .unwrap();

        assert_eq!(
            ops,
            vec![
                Operation::CreateKey {
                    path: path("/discovery/b"),
                    value: "2".to_string(),
                    ttl: None,
                    overwrite: false,
                },
                Operation::DeleteKey {
                    path: path("/discovery/c"),
                    version: 4,
                },
            ]
        );
    }

    #[test]
    fn test_ordering_creates_updates_deletes() {
        let ops = diff(
            &base(),
            &desired(&[("z", "new"), ("m", "changed"), ("a", "new")]),
            &observed(&[("m", "old", 5), ("b", "gone", 6), ("y", "gone", 7)]),
        )
        .unwrap();

        let rendered: Vec<String> = ops.iter().map(|op| op.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "+ /discovery/a = \"new\"",
                "+ /discovery/z = \"new\"",
                "~ /discovery/m = \"changed\" [version 5]",
                "- /discovery/b [version 6]",
                "- /discovery/y [version 7]",
            ]
        );
    }

    #[test]
    fn test_converged_tree_is_empty() {
        let ops = diff(
            &base(),
            &desired(&[("a", "1"), ("web/1", "10.0.0.1")]),
            &observed(&[("a", "1", 3), ("web/1", "10.0.0.1", 4)]),
        )
        .unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_emptied_directories_are_pruned_deepest_first() {
        let ops = diff(
            &base(),
            &desired(&[("web/keep", "1")]),
            &observed(&[
                ("web/keep", "1", 2),
                ("web/old/x", "1", 3),
                ("db/primary/host", "h", 4),
            ]),
        )
        .unwrap();

        let prunes: Vec<String> = ops
            .iter()
            .filter(|op| matches!(op, Operation::PruneDir { .. }))
            .map(|op| op.path().to_string())
            .collect();
        assert_eq!(
            prunes,
            vec![
                "/discovery/db/primary",
                "/discovery/web/old",
                "/discovery/db",
            ]
        );
    }

    #[test]
    fn test_key_becoming_a_directory_deletes_first() {
        let ops = diff(
            &base(),
            &desired(&[("a", "1"), ("web/n1", "1")]),
            &observed(&[("a", "1", 2), ("web", "1", 3), ("z", "old", 4)]),
        )
        .unwrap();

        let rendered: Vec<String> = ops.iter().map(|op| op.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "- /discovery/web [version 3]",
                "+ /discovery/web/n1 = \"1\"",
                "- /discovery/z [version 4]",
            ]
        );
    }

    #[test]
    fn test_directory_becoming_a_key_prunes_first() {
        let ops = diff(
            &base(),
            &desired(&[("web", "1")]),
            &observed(&[("web/a/x", "1", 3), ("web/b", "2", 4), ("old/y", "3", 5)]),
        )
        .unwrap();

        let rendered: Vec<String> = ops.iter().map(|op| op.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "- /discovery/web/a/x [version 3]",
                "- /discovery/web/b [version 4]",
                "- /discovery/web/a/ (if empty)",
                "- /discovery/web/ (if empty)",
                "+ /discovery/web = \"1\"",
                "- /discovery/old/y [version 5]",
                "- /discovery/old/ (if empty)",
            ]
        );
    }
}
