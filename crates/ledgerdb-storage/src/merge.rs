//! Automatic and delegated conflict resolution (spec §4.4 "MergeResolver"),
//! grounded on the original implementation's three-way diff plus a
//! pluggable `ConflictResolver`.
//!
//! Keys that only one side changed relative to the common ancestor
//! merge automatically. Keys both sides changed, to different results,
//! are conflicts: they are handed to a [`ConflictResolver`]. The
//! built-in [`DefaultToLeftResolver`] resolves every conflict by
//! keeping the left branch's value — a deliberate, documented choice
//! (spec leaves the non-delegated default unspecified) rather than an
//! invented third policy.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use ledgerdb_btree::{diff::diff_three_way, diff::ThreeWayChange, Entry, EntryChange, NodeStore};
use ledgerdb_objects::ObjectIdentifier;
use ledgerdb_types::{CommitId, Result, Status};

use crate::commit::Commit;

/// What to do with one conflicting key.
pub enum ConflictResolution {
    UseLeft,
    UseRight,
    /// Supply an explicit merged entry.
    Merge(Entry),
    /// Delete the key outright.
    Delete,
}

/// Decides how to resolve keys that both merge parents changed,
/// differently, relative to their common ancestor.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &ThreeWayChange) -> ConflictResolution;
}

/// The built-in default: keeps the left branch's value for every conflict.
pub struct DefaultToLeftResolver;

impl ConflictResolver for DefaultToLeftResolver {
    fn resolve(&self, _conflict: &ThreeWayChange) -> ConflictResolution {
        ConflictResolution::UseLeft
    }
}

/// Looks commits up by id — the thing [`find_merge_base`] walks parent
/// links over. Implemented by `PageStorage` for real use; a plain
/// `HashMap` stands in for it in tests.
pub trait CommitLookup {
    fn get_commit(&self, id: &CommitId) -> Result<Commit>;
}

/// What two divergent heads turn out to be related by (spec §4.5 step
/// 1): either one is a lineal ancestor of the other, in which case no
/// three-way merge is needed at all, or they share some other most
/// recent common ancestor that a three-way diff must run against.
pub enum MergeBase {
    /// `stale` is an ancestor of `current`; the head set should simply
    /// drop `stale` rather than compute a merge commit.
    FastForward { stale: CommitId, current: CommitId },
    /// The most recent commit reachable from both heads.
    CommonAncestor(CommitId),
}

/// Determines how `left` and `right` relate in the commit graph,
/// grounded on spec §4.5 step 1's "prune a lineally related head before
/// three-way merge" rule. Walks `parents`, using `generation` (`1 +
/// max(parent generations)`) to prune a branch once it can no longer
/// reach the commit being searched for.
pub fn find_merge_base(lookup: &dyn CommitLookup, left: CommitId, right: CommitId) -> Result<MergeBase> {
    if left == right {
        return Ok(MergeBase::FastForward { stale: left, current: right });
    }
    if is_ancestor(lookup, left, right)? {
        return Ok(MergeBase::FastForward { stale: left, current: right });
    }
    if is_ancestor(lookup, right, left)? {
        return Ok(MergeBase::FastForward { stale: right, current: left });
    }
    let left_ancestors = ancestor_generations(lookup, left)?;
    let right_ancestors = ancestor_generations(lookup, right)?;
    let mut best: Option<(CommitId, u64)> = None;
    for (id, generation) in &left_ancestors {
        if let Some(other_generation) = right_ancestors.get(id) {
            let generation = *generation.min(other_generation);
            let better = match best {
                None => true,
                Some((_, best_generation)) => generation > best_generation,
            };
            if better {
                best = Some((*id, generation));
            }
        }
    }
    best.map(|(id, _)| MergeBase::CommonAncestor(id))
        .ok_or(Status::IllegalState("merge heads share no common ancestor"))
}

/// True if `ancestor` is reachable by following `descendant`'s parent
/// links (including `ancestor == descendant`).
fn is_ancestor(lookup: &dyn CommitLookup, ancestor: CommitId, descendant: CommitId) -> Result<bool> {
    let ancestor_generation = lookup.get_commit(&ancestor)?.generation;
    let mut frontier = vec![descendant];
    let mut visited = HashSet::new();
    while let Some(id) = frontier.pop() {
        if id == ancestor {
            return Ok(true);
        }
        if !visited.insert(id) {
            continue;
        }
        let commit = lookup.get_commit(&id)?;
        if commit.generation <= ancestor_generation {
            continue;
        }
        frontier.extend(commit.parents.iter().copied());
    }
    Ok(false)
}

/// Every commit reachable from `start` (`start` included), mapped to its generation.
fn ancestor_generations(lookup: &dyn CommitLookup, start: CommitId) -> Result<HashMap<CommitId, u64>> {
    let mut out = HashMap::new();
    let mut frontier = vec![start];
    while let Some(id) = frontier.pop() {
        if out.contains_key(&id) {
            continue;
        }
        let commit = lookup.get_commit(&id)?;
        out.insert(id, commit.generation);
        frontier.extend(commit.parents.iter().copied());
    }
    Ok(out)
}

/// Computes the change set that merges `right` into `left`, given their
/// common ancestor `base`, resolving conflicts with `resolver`.
pub fn merge_three_way(
    store: &dyn NodeStore,
    base: Option<&ObjectIdentifier>,
    left: Option<&ObjectIdentifier>,
    right: Option<&ObjectIdentifier>,
    resolver: &dyn ConflictResolver,
) -> Result<Vec<EntryChange>> {
    let diffs = diff_three_way(store, base, left, right)?;
    let mut changes = Vec::with_capacity(diffs.len());
    for change in diffs {
        if !change.is_conflict() {
            let winner = if change.left != change.base {
                change.left.clone()
            } else {
                change.right.clone()
            };
            changes.push(to_entry_change(change.key, winner));
            continue;
        }
        match resolver.resolve(&change) {
            ConflictResolution::UseLeft => changes.push(to_entry_change(change.key, change.left)),
            ConflictResolution::UseRight => changes.push(to_entry_change(change.key, change.right)),
            ConflictResolution::Merge(entry) => changes.push(EntryChange {
                entry,
                deleted: false,
            }),
            ConflictResolution::Delete => changes.push(to_entry_change(change.key, None)),
        }
    }
    Ok(changes)
}

fn to_entry_change(key: Vec<u8>, winner: Option<Entry>) -> EntryChange {
    match winner {
        Some(entry) => EntryChange {
            entry,
            deleted: false,
        },
        None => EntryChange {
            entry: Entry {
                key,
                object_identifier: ObjectIdentifier::new(
                    0,
                    0,
                    ledgerdb_objects::ObjectDigest::compute(
                        b"",
                        ledgerdb_objects::ObjectType::Blob,
                        ledgerdb_objects::PieceKind::Inline,
                    ),
                ),
                priority: ledgerdb_types::KeyPriority::Eager,
            },
            deleted: true,
        },
    }
}

/// Retries `f` with exponential backoff while it returns
/// `Status::NotConnectedError`/`Status::NetworkError` — the conditions
/// under which a delegated conflict resolver can legitimately be
/// retried, grounded on the original implementation's
/// `ConflictResolverClient` reconnect-and-retry loop.
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = self.initial_delay;
        let mut attempt = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(Status::NotConnectedError) | Err(Status::NetworkError) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(Status::NetworkError);
                    }
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerdb_btree::BTreeNode;
    use ledgerdb_objects::{ObjectDigest, ObjectType, PieceKind};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MemNodeStore {
        nodes: Mutex<HashMap<Vec<u8>, BTreeNode>>,
    }

    impl NodeStore for MemNodeStore {
        fn get_node(&self, id: &ObjectIdentifier) -> Result<BTreeNode> {
            self.nodes
                .lock()
                .get(id.object_digest().as_bytes())
                .cloned()
                .ok_or(Status::InternalNotFound)
        }

        fn put_node(&self, node: &BTreeNode) -> Result<ObjectIdentifier> {
            let encoded = node.encode();
            let digest = ObjectDigest::compute(&encoded, ObjectType::TreeNode, PieceKind::Chunk);
            let id = ObjectIdentifier::new(0, 0, digest);
            self.nodes
                .lock()
                .insert(id.object_digest().as_bytes().to_vec(), node.clone());
            Ok(id)
        }
    }

    fn entry(key: &[u8], tag: &[u8]) -> Entry {
        let digest = ObjectDigest::compute(tag, ObjectType::Blob, PieceKind::Inline);
        Entry {
            key: key.to_vec(),
            object_identifier: ObjectIdentifier::new(0, 0, digest),
            priority: ledgerdb_types::KeyPriority::Eager,
        }
    }

    #[test]
    fn non_conflicting_changes_auto_merge() {
        let store = MemNodeStore::default();
        let base = ledgerdb_btree::apply_changes(
            &store,
            None,
            &[EntryChange { entry: entry(b"k1", b"base"), deleted: false }],
        )
        .unwrap();
        let left = ledgerdb_btree::apply_changes(
            &store,
            base.as_ref(),
            &[EntryChange { entry: entry(b"k2", b"left-only"), deleted: false }],
        )
        .unwrap();

        let changes =
            merge_three_way(&store, base.as_ref(), left.as_ref(), base.as_ref(), &DefaultToLeftResolver).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entry.key, b"k2");
    }

    #[test]
    fn conflicts_default_to_left() {
        let store = MemNodeStore::default();
        let base = ledgerdb_btree::apply_changes(
            &store,
            None,
            &[EntryChange { entry: entry(b"k", b"base"), deleted: false }],
        )
        .unwrap();
        let left = ledgerdb_btree::apply_changes(
            &store,
            base.as_ref(),
            &[EntryChange { entry: entry(b"k", b"left"), deleted: false }],
        )
        .unwrap();
        let right = ledgerdb_btree::apply_changes(
            &store,
            base.as_ref(),
            &[EntryChange { entry: entry(b"k", b"right"), deleted: false }],
        )
        .unwrap();

        let changes =
            merge_three_way(&store, base.as_ref(), left.as_ref(), right.as_ref(), &DefaultToLeftResolver).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0]
            .entry
            .object_identifier
            .object_digest()
            .verify(b"left"));
    }

    #[test]
    fn retry_policy_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 3,
        };
        let result: Result<()> = policy.run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Status::NetworkError)
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[derive(Default)]
    struct MemCommitLookup {
        commits: HashMap<CommitId, Commit>,
    }

    impl MemCommitLookup {
        fn insert(&mut self, commit: Commit) -> CommitId {
            let id = commit.id;
            self.commits.insert(id, commit);
            id
        }

        fn commit(id: CommitId, parents: Vec<CommitId>, generation: u64) -> Commit {
            Commit {
                id,
                parents,
                timestamp_ns: 0,
                generation,
                root_node: None,
            }
        }
    }

    impl CommitLookup for MemCommitLookup {
        fn get_commit(&self, id: &CommitId) -> Result<Commit> {
            self.commits.get(id).cloned().ok_or(Status::InternalNotFound)
        }
    }

    fn commit_id(tag: u8) -> CommitId {
        CommitId::new([tag; 32])
    }

    #[test]
    fn find_merge_base_fast_forwards_a_direct_ancestor() {
        let mut lookup = MemCommitLookup::default();
        let root = commit_id(1);
        let child = commit_id(2);
        lookup.insert(MemCommitLookup::commit(root, vec![], 0));
        lookup.insert(MemCommitLookup::commit(child, vec![root], 1));

        match find_merge_base(&lookup, root, child).unwrap() {
            MergeBase::FastForward { stale, current } => {
                assert_eq!(stale, root);
                assert_eq!(current, child);
            }
            MergeBase::CommonAncestor(_) => panic!("expected a fast-forward"),
        }
    }

    #[test]
    fn find_merge_base_fast_forwards_regardless_of_argument_order() {
        let mut lookup = MemCommitLookup::default();
        let root = commit_id(1);
        let grandchild = commit_id(3);
        let child = commit_id(2);
        lookup.insert(MemCommitLookup::commit(root, vec![], 0));
        lookup.insert(MemCommitLookup::commit(child, vec![root], 1));
        lookup.insert(MemCommitLookup::commit(grandchild, vec![child], 2));

        match find_merge_base(&lookup, grandchild, root).unwrap() {
            MergeBase::FastForward { stale, current } => {
                assert_eq!(stale, root);
                assert_eq!(current, grandchild);
            }
            MergeBase::CommonAncestor(_) => panic!("expected a fast-forward"),
        }
    }

    #[test]
    fn find_merge_base_finds_the_common_ancestor_of_true_siblings() {
        let mut lookup = MemCommitLookup::default();
        let root = commit_id(1);
        let left = commit_id(2);
        let right = commit_id(3);
        lookup.insert(MemCommitLookup::commit(root, vec![], 0));
        lookup.insert(MemCommitLookup::commit(left, vec![root], 1));
        lookup.insert(MemCommitLookup::commit(right, vec![root], 1));

        match find_merge_base(&lookup, left, right).unwrap() {
            MergeBase::CommonAncestor(id) => assert_eq!(id, root),
            MergeBase::FastForward { .. } => panic!("siblings are not lineally related"),
        }
    }

    #[test]
    fn find_merge_base_picks_the_most_recent_shared_ancestor() {
        let mut lookup = MemCommitLookup::default();
        let root = commit_id(1);
        let mid = commit_id(2);
        let left = commit_id(3);
        let right = commit_id(4);
        lookup.insert(MemCommitLookup::commit(root, vec![], 0));
        lookup.insert(MemCommitLookup::commit(mid, vec![root], 1));
        lookup.insert(MemCommitLookup::commit(left, vec![mid], 2));
        lookup.insert(MemCommitLookup::commit(right, vec![mid], 2));

        match find_merge_base(&lookup, left, right).unwrap() {
            MergeBase::CommonAncestor(id) => assert_eq!(id, mid),
            MergeBase::FastForward { .. } => panic!("siblings are not lineally related"),
        }
    }
}
