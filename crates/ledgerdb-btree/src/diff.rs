//! Two-way and three-way tree diffing (spec §3 `EntryChange`/`ThreeWayChange`,
//! spec §4.4's merge-resolution inputs).
//!
//! Both diffs work over the flattened, in-order contents of each tree
//! rather than pruning identical subtrees by `ObjectIdentifier` —
//! simpler to get right, at the cost of always reading every entry of
//! both sides rather than only the ones that changed. Page contents in
//! this system are expected to stay small enough that this is not a
//! practical concern; a future optimization could prune by comparing
//! child identifiers before recursing.

use std::collections::BTreeMap;

use ledgerdb_types::Result;

use crate::{full_contents, Entry, EntryChange, NodeStore};
use ledgerdb_objects::ObjectIdentifier;

/// A change to one key across three versions of a tree: the common
/// ancestor (`base`), and the two versions being merged (`left`,
/// `right`). `None` means the key was absent in that version.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ThreeWayChange {
    pub key: Vec<u8>,
    pub base: Option<Entry>,
    pub left: Option<Entry>,
    pub right: Option<Entry>,
}

impl ThreeWayChange {
    /// True when both sides changed the key away from `base`, to
    /// different results — the case `MergeResolver` must hand to a
    /// conflict resolver rather than auto-merge.
    pub fn is_conflict(&self) -> bool {
        self.left != self.base && self.right != self.base && self.left != self.right
    }
}

/// Produces the ordered list of adds/removals that turn `left`'s
/// contents into `right`'s.
pub fn diff_two_way(
    store: &dyn NodeStore,
    left: Option<&ObjectIdentifier>,
    right: Option<&ObjectIdentifier>,
) -> Result<Vec<EntryChange>> {
    let left_entries = full_contents(store, left)?;
    let right_entries = full_contents(store, right)?;
    let mut changes = Vec::new();
    let mut li = 0usize;
    let mut ri = 0usize;
    while li < left_entries.len() || ri < right_entries.len() {
        match (left_entries.get(li), right_entries.get(ri)) {
            (Some(l), Some(r)) if l.key == r.key => {
                if l.object_identifier != r.object_identifier || l.priority != r.priority {
                    changes.push(EntryChange {
                        entry: r.clone(),
                        deleted: false,
                    });
                }
                li += 1;
                ri += 1;
            }
            (Some(l), Some(r)) if l.key < r.key => {
                changes.push(EntryChange {
                    entry: l.clone(),
                    deleted: true,
                });
                li += 1;
            }
            (Some(_), Some(r)) => {
                changes.push(EntryChange {
                    entry: r.clone(),
                    deleted: false,
                });
                ri += 1;
            }
            (Some(l), None) => {
                changes.push(EntryChange {
                    entry: l.clone(),
                    deleted: true,
                });
                li += 1;
            }
            (None, Some(r)) => {
                changes.push(EntryChange {
                    entry: r.clone(),
                    deleted: false,
                });
                ri += 1;
            }
            (None, None) => unreachable!(),
        }
    }
    Ok(changes)
}

/// Produces one [`ThreeWayChange`] per key that differs from `base` in
/// `left`, in `right`, or in both — the input `MergeResolver` walks to
/// auto-merge non-conflicting keys and hand conflicting ones to a
/// conflict resolver.
pub fn diff_three_way(
    store: &dyn NodeStore,
    base: Option<&ObjectIdentifier>,
    left: Option<&ObjectIdentifier>,
    right: Option<&ObjectIdentifier>,
) -> Result<Vec<ThreeWayChange>> {
    let base_map = as_map(full_contents(store, base)?);
    let left_map = as_map(full_contents(store, left)?);
    let right_map = as_map(full_contents(store, right)?);

    let mut keys: Vec<Vec<u8>> = base_map
        .keys()
        .chain(left_map.keys())
        .chain(right_map.keys())
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();

    let mut changes = Vec::new();
    for key in keys {
        let base_entry = base_map.get(&key).cloned();
        let left_entry = left_map.get(&key).cloned();
        let right_entry = right_map.get(&key).cloned();
        if left_entry != base_entry || right_entry != base_entry {
            changes.push(ThreeWayChange {
                key,
                base: base_entry,
                left: left_entry,
                right: right_entry,
            });
        }
    }
    Ok(changes)
}

fn as_map(entries: Vec<Entry>) -> BTreeMap<Vec<u8>, Entry> {
    entries.into_iter().map(|e| (e.key.clone(), e)).collect()
}
