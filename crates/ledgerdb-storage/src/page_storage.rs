//! `PageStorage`: the public storage contract for one page (spec
//! §4.3), tying `PageDb` persistence, content-addressed object
//! storage, the commit graph and journals together.

use std::sync::Arc;

use ledgerdb_btree::{
    diff::{diff_three_way, diff_two_way, ThreeWayChange},
    full_contents, BTreeNode, Entry, EntryChange, NodeStore,
};
use ledgerdb_io::FileIo;
use ledgerdb_objects::split::split_data_source;
use ledgerdb_objects::{
    ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory, ObjectReader, ObjectType, Piece, PieceKind,
};
use ledgerdb_pagedb::keys::{self, ObjectStatus};
use ledgerdb_pagedb::PageDb;
use ledgerdb_types::{ChangeSource, CommitId, KeyPriority, PruningPolicy, Result, Status, MAX_INLINE_DIGEST_CONTENT};
use tracing::{debug, warn};

use crate::commit::{Commit, CommitFactory};
use crate::journal::{Journal, JournalKind};
use crate::merge::CommitLookup;

/// Ambient configuration for one `PageStorage` (spec's "Repository
/// options" carried down to page scope).
#[derive(Clone, Debug, Default)]
pub struct PageStorageOptions {
    pub pruning_policy: PruningPolicy,
}

/// Adapts `PageDb` to `ledgerdb_btree::NodeStore`: nodes are stored
/// under the `objects/` prefix just like any other piece, addressed by
/// the digest of their encoded bytes.
struct PageDbNodeStore {
    db: Arc<PageDb>,
}

impl NodeStore for PageDbNodeStore {
    fn get_node(&self, id: &ObjectIdentifier) -> Result<BTreeNode> {
        if let Some(inline) = id.object_digest().inline_content() {
            return BTreeNode::decode(inline);
        }
        let key = keys::object_key(id.object_digest().as_bytes());
        let bytes = self.db.get(&key)?.ok_or(Status::InternalNotFound)?;
        if !id.object_digest().verify(&bytes) {
            return Err(Status::ObjectDigestMismatch);
        }
        BTreeNode::decode(&bytes)
    }

    fn put_node(&self, node: &BTreeNode) -> Result<ObjectIdentifier> {
        let encoded = node.encode();
        let piece_kind = if encoded.len() <= MAX_INLINE_DIGEST_CONTENT {
            PieceKind::Inline
        } else {
            PieceKind::Chunk
        };
        let digest = ObjectDigest::compute(&encoded, ObjectType::TreeNode, piece_kind);
        if piece_kind != PieceKind::Inline {
            let key = keys::object_key(digest.as_bytes());
            let mut batch = self.db.batch();
            batch.put(key, encoded);
            self.db.commit_batch(batch)?;
        }
        Ok(ObjectIdentifier::new(0, 0, digest))
    }
}

/// Keys returned per page by `get_keys`/`get_entries`/`get_entries_inline`.
const SNAPSHOT_PAGE_SIZE: usize = 256;

/// Opaque cursor into a paginated snapshot read, wrapping the last key
/// already returned. Callers must not construct or inspect it; it only
/// round-trips through a subsequent call to the same method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinuationToken(pub Vec<u8>);

/// One entry from `get_entries_inline`: the `Eager` entries carry their
/// dereferenced bytes, `Lazy` entries come back with `value: None`.
#[derive(Clone, Debug)]
pub struct InlinedEntry {
    pub entry: Entry,
    pub value: Option<Vec<u8>>,
}

/// A read-only, paginated view of one commit's contents (spec §6's
/// `PageSnapshot`).
pub struct PageSnapshot<'a> {
    storage: &'a PageStorage,
    commit: Commit,
}

impl<'a> PageSnapshot<'a> {
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    pub fn get_keys(
        &self,
        key_prefix: &[u8],
        token: Option<&ContinuationToken>,
    ) -> Result<(Vec<Vec<u8>>, Option<ContinuationToken>)> {
        self.storage.get_keys(&self.commit, key_prefix, token)
    }

    pub fn get_entries(
        &self,
        key_prefix: &[u8],
        token: Option<&ContinuationToken>,
    ) -> Result<(Vec<Entry>, Option<ContinuationToken>)> {
        self.storage.get_entries(&self.commit, key_prefix, token)
    }

    pub fn get_entries_inline(
        &self,
        key_prefix: &[u8],
        token: Option<&ContinuationToken>,
    ) -> Result<(Vec<InlinedEntry>, Option<ContinuationToken>)> {
        self.storage.get_entries_inline(&self.commit, key_prefix, token)
    }
}

/// Filters `entries` down to `key_prefix`, skips past anything at or
/// before `token`, and slices off one page, reporting a token for the
/// next call if entries remain beyond it. `entries` must already be
/// sorted by key.
fn paginate_entries(
    mut entries: Vec<Entry>,
    key_prefix: &[u8],
    token: Option<&ContinuationToken>,
) -> (Vec<Entry>, Option<ContinuationToken>) {
    entries.retain(|entry| entry.key.starts_with(key_prefix));
    let start = match token {
        Some(token) => entries.partition_point(|entry| entry.key <= token.0),
        None => 0,
    };
    let remaining = &entries[start..];
    let take = remaining.len().min(SNAPSHOT_PAGE_SIZE);
    let next = if remaining.len() > take {
        remaining[..take].last().map(|entry| ContinuationToken(entry.key.clone()))
    } else {
        None
    };
    (remaining[..take].to_vec(), next)
}

/// The storage backing one page: one `PageDb`, one object store, one
/// commit graph.
pub struct PageStorage {
    db: Arc<PageDb>,
    node_store: PageDbNodeStore,
    identifiers: Arc<ObjectIdentifierFactory>,
    options: PageStorageOptions,
}

impl PageStorage {
    /// Opens (creating if absent) the storage backing a page over `io`.
    pub fn open(io: Arc<dyn FileIo>, options: PageStorageOptions) -> Result<Self> {
        let db = Arc::new(PageDb::open(io)?);
        let node_store = PageDbNodeStore { db: Arc::clone(&db) };
        let storage = Self {
            db,
            node_store,
            identifiers: Arc::new(ObjectIdentifierFactory::new()),
            options,
        };
        let first_key = keys::commit_key(&CommitId::FIRST);
        if storage.db.get(&first_key)?.is_none() {
            let mut batch = storage.db.batch();
            batch.put(first_key, CommitFactory::first_commit().encode());
            storage.db.commit_batch(batch)?;
        }
        debug!(pruning = ?storage.options.pruning_policy, "page_storage.open");
        Ok(storage)
    }

    pub fn pruning_policy(&self) -> PruningPolicy {
        self.options.pruning_policy
    }

    // --- Commit graph -------------------------------------------------

    /// Every commit with no committed descendant, per spec's head-set
    /// invariant.
    pub fn get_head_commits(&self) -> Result<Vec<CommitId>> {
        let rows = self.db.scan_prefix(keys::HEADS_PREFIX);
        let mut heads = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let id_bytes = &key[keys::HEADS_PREFIX.len()..];
            let mut arr = [0u8; 32];
            arr.copy_from_slice(id_bytes);
            heads.push(CommitId::new(arr));
        }
        Ok(heads)
    }

    pub fn get_commit(&self, id: &CommitId) -> Result<Commit> {
        let bytes = self
            .db
            .get(&keys::commit_key(id))?
            .ok_or(Status::InternalNotFound)?;
        Commit::decode(&bytes)
    }

    /// Opens a journal for a simple (one-parent) commit.
    pub fn start_commit(&self, base: CommitId) -> Journal {
        Journal::simple(base)
    }

    /// Opens a journal recording the result of merging `other` into `base`.
    pub fn start_merge_commit(&self, base: CommitId, other: CommitId) -> Journal {
        Journal::merge(base, other)
    }

    /// Commits `journal`'s recorded changes, suppressing the commit
    /// entirely if it would be a no-op (spec §4.4).
    pub fn commit_journal(&self, mut journal: Journal) -> Result<Commit> {
        let (base_id, other_id) = match journal.kind().clone() {
            JournalKind::Simple { base } => (base, None),
            JournalKind::Merge { base, other } => (base, Some(other)),
        };
        let base_commit = self.get_commit(&base_id)?;
        let mut parents = vec![base_commit.clone()];
        if let Some(other_id) = other_id {
            parents.push(self.get_commit(&other_id)?);
        }

        let starting_root = if journal.is_cleared() {
            None
        } else {
            base_commit.root_node.clone()
        };
        let changes = journal.take_changes()?;
        let new_root = ledgerdb_btree::apply_changes(&self.node_store, starting_root.as_ref(), &changes)?;

        if parents.len() == 1 && new_root == base_commit.root_node {
            debug!(commit = %base_commit.id, "page_storage.commit_journal.no_op");
            return Ok(base_commit);
        }

        let commit = CommitFactory::from_parents(&parents, new_root);
        self.persist_commit(&commit, &parents)?;
        self.promote_referenced_objects(&commit)?;
        Ok(commit)
    }

    fn persist_commit(&self, commit: &Commit, parents: &[Commit]) -> Result<()> {
        let mut batch = self.db.batch();
        batch.put(keys::commit_key(&commit.id), commit.encode());
        for parent in parents {
            batch.delete(keys::head_key(&parent.id));
        }
        batch.put(keys::head_key(&commit.id), commit.timestamp_ns.to_be_bytes().to_vec());
        if parents.len() == 2 {
            batch.put(keys::merge_key(&parents[0].id, &parents[1].id, &commit.id), Vec::new());
        }
        batch.put(
            keys::unsynced_commit_key(&commit.id),
            commit.generation.to_be_bytes().to_vec(),
        );
        self.db.commit_batch(batch)
    }

    /// Every object newly reachable from `commit`'s root moves from
    /// `Transient` to `Local` — it is now referenced by a committed
    /// tree and will survive until sync (or pruning) says otherwise.
    fn promote_referenced_objects(&self, commit: &Commit) -> Result<()> {
        let Some(root) = commit.root_node.as_ref() else {
            return Ok(());
        };
        let entries = full_contents(&self.node_store, Some(root))?;
        let mut batch = self.db.batch();
        for entry in &entries {
            let digest = entry.object_identifier.object_digest();
            if digest.inline_content().is_some() {
                continue;
            }
            batch.delete(keys::object_status_key(ObjectStatus::Transient, digest.as_bytes()));
            batch.put(keys::object_status_key(ObjectStatus::Local, digest.as_bytes()), Vec::new());
        }
        self.db.commit_batch(batch)
    }

    /// Incorporates commits received from a sync delegate, per spec
    /// §4.3's `AddCommitsFromSync`. A commit whose parents aren't all
    /// known locally yet is skipped rather than buffered (a
    /// simplification relative to the original's
    /// `MergingIntegrationCommitQueue` pending-commit buffer), and its
    /// unknown parent ids are collected into the returned list so the
    /// caller can re-request them from the sync delegate, per the
    /// documented `AddCommitsFromSync` contract.
    pub fn add_commits_from_sync(&self, incoming: Vec<(Vec<u8>, ChangeSource)>) -> Result<Vec<CommitId>> {
        let mut missing = Vec::new();
        for (bytes, source) in incoming {
            let commit = Commit::decode(&bytes)?;
            if self.db.contains(&keys::commit_key(&commit.id)) {
                continue;
            }
            let mut has_missing_parent = false;
            for parent in &commit.parents {
                if !self.db.contains(&keys::commit_key(parent)) {
                    warn!(commit = %commit.id, parent = %parent, "page_storage.add_commits_from_sync.missing_parent");
                    missing.push(*parent);
                    has_missing_parent = true;
                }
            }
            if has_missing_parent {
                continue;
            }
            let mut batch = self.db.batch();
            batch.put(keys::commit_key(&commit.id), commit.encode());
            for parent in &commit.parents {
                if self.db.contains(&keys::head_key(parent)) {
                    batch.delete(keys::head_key(parent));
                }
            }
            batch.put(keys::head_key(&commit.id), commit.timestamp_ns.to_be_bytes().to_vec());
            if source != ChangeSource::Local {
                batch.delete(keys::unsynced_commit_key(&commit.id));
            }
            self.db.commit_batch(batch)?;
            self.promote_referenced_objects(&commit)?;
        }
        missing.sort();
        missing.dedup();
        Ok(missing)
    }

    // --- Object store ---------------------------------------------------

    /// Splits and stores `content` as a new object, returning its root
    /// identifier. New pieces start life `Transient`; they are promoted
    /// to `Local` once a commit actually references them.
    pub fn add_object_from_local(&self, content: &[u8], object_type: ObjectType) -> Result<ObjectIdentifier> {
        let mut tokens = Vec::new();
        let identifiers = &self.identifiers;
        let result = split_data_source(content, object_type, |digest| {
            let (id, token) = identifiers.make(0, 0, digest);
            tokens.push(token);
            id
        });
        for piece in &result.pieces {
            let digest = piece.identifier.object_digest();
            if digest.inline_content().is_some() {
                continue;
            }
            let key = keys::object_key(digest.as_bytes());
            if self.db.get(&key)?.is_none() {
                let mut batch = self.db.batch();
                batch.put(key, piece.piece.encode());
                batch.put(keys::object_status_key(ObjectStatus::Transient, digest.as_bytes()), Vec::new());
                self.db.commit_batch(batch)?;
            }
        }
        drop(tokens);
        Ok(result.root)
    }

    /// Reads one stored piece. Inline digests have no stored piece;
    /// callers go through [`Self::get_object`]/[`Self::get_object_part`] instead.
    pub fn get_piece(&self, id: &ObjectIdentifier) -> Result<Piece> {
        if id.object_digest().inline_content().is_some() {
            return Err(Status::InvalidArgument("inline digests have no stored piece"));
        }
        let key = keys::object_key(id.object_digest().as_bytes());
        let bytes = self.db.get(&key)?.ok_or(Status::InternalNotFound)?;
        if !id.object_digest().verify(&bytes) {
            return Err(Status::ObjectDigestMismatch);
        }
        Piece::decode(id.object_digest().piece_kind(), &bytes)
    }

    /// Reassembles an object's full content.
    pub fn get_object(&self, id: &ObjectIdentifier) -> Result<Vec<u8>> {
        let get_piece = |id: &ObjectIdentifier| self.get_piece(id);
        ObjectReader::new(&get_piece).read_whole(id)
    }

    /// Reassembles `len` bytes of an object's content starting at `offset`.
    pub fn get_object_part(&self, id: &ObjectIdentifier, offset: u64, len: u64) -> Result<Vec<u8>> {
        let get_piece = |id: &ObjectIdentifier| self.get_piece(id);
        ObjectReader::new(&get_piece).read_part(id, offset, len)
    }

    /// Deletes a digest's stored piece, provided nothing in this
    /// process still holds a live `ObjectIdentifier` for it and no
    /// persisted tree still references it.
    pub fn delete_object(&self, digest: &ObjectDigest) -> Result<()> {
        if !self.identifiers.is_discardable(digest) {
            return Err(Status::IllegalState("object has live in-process references"));
        }
        let still_referenced = !self.db.scan_prefix(&keys::ref_scan_prefix(digest.as_bytes())).is_empty();
        if still_referenced {
            return Ok(());
        }
        let mut batch = self.db.batch();
        batch.delete(keys::object_key(digest.as_bytes()));
        for status in [ObjectStatus::Transient, ObjectStatus::Local, ObjectStatus::Synced] {
            batch.delete(keys::object_status_key(status, digest.as_bytes()));
        }
        self.db.commit_batch(batch)
    }

    /// True if `digest` is inline or is a piece already stored on this
    /// page — the validity check `PutReference` runs against a caller's
    /// identifier before accepting it into a journal.
    pub fn contains_object(&self, digest: &ObjectDigest) -> bool {
        digest.inline_content().is_some() || self.db.contains(&keys::object_key(digest.as_bytes()))
    }

    // --- Content reads --------------------------------------------------

    pub fn get_commit_contents(&self, commit: &Commit) -> Result<Vec<Entry>> {
        full_contents(&self.node_store, commit.root_node.as_ref())
    }

    pub fn get_entry_from_commit(&self, commit: &Commit, key: &[u8]) -> Result<Option<Entry>> {
        Ok(self
            .get_commit_contents(commit)?
            .into_iter()
            .find(|entry| entry.key == key))
    }

    /// The set of adds/removals that turn `left`'s content into `right`'s.
    pub fn diff_commits(&self, left: &Commit, right: &Commit) -> Result<Vec<EntryChange>> {
        diff_two_way(&self.node_store, left.root_node.as_ref(), right.root_node.as_ref())
    }

    /// Per-key differences of `left` and `right` against their common
    /// `base`, per spec §4.3's `GetThreeWayContentsDiff` — the same
    /// input a `MergeResolver` walks, exposed directly so a caller can
    /// inspect a pending merge's conflicts without driving the merge
    /// itself.
    pub fn diff_commits_three_way(&self, base: &Commit, left: &Commit, right: &Commit) -> Result<Vec<ThreeWayChange>> {
        diff_three_way(
            &self.node_store,
            base.root_node.as_ref(),
            left.root_node.as_ref(),
            right.root_node.as_ref(),
        )
    }

    /// Exposes the underlying tree store for callers (the merge
    /// resolver) that need three-way diffing or direct tree mutation.
    pub fn node_store(&self) -> &dyn NodeStore {
        &self.node_store
    }

    // --- Snapshots --------------------------------------------------------

    /// Opens a read-only view of `commit`'s contents (spec §6's
    /// `PageSnapshot`), through which `GetKeys`/`GetEntries`/`GetEntriesInline`
    /// run paginated, prefix-filtered reads.
    pub fn snapshot(&self, commit: CommitId) -> Result<PageSnapshot<'_>> {
        let commit = self.get_commit(&commit)?;
        Ok(PageSnapshot { storage: self, commit })
    }

    /// The keys under `key_prefix` in `commit`'s contents, one page at a
    /// time. Pass back the returned token to continue after the last key
    /// of the previous page; `None` means there is nothing more to read.
    pub fn get_keys(
        &self,
        commit: &Commit,
        key_prefix: &[u8],
        token: Option<&ContinuationToken>,
    ) -> Result<(Vec<Vec<u8>>, Option<ContinuationToken>)> {
        let (entries, next) = self.get_entries(commit, key_prefix, token)?;
        Ok((entries.into_iter().map(|entry| entry.key).collect(), next))
    }

    /// The entries (key plus object identifier, not dereferenced) under
    /// `key_prefix` in `commit`'s contents, one page at a time.
    pub fn get_entries(
        &self,
        commit: &Commit,
        key_prefix: &[u8],
        token: Option<&ContinuationToken>,
    ) -> Result<(Vec<Entry>, Option<ContinuationToken>)> {
        let mut entries = self.get_commit_contents(commit)?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(paginate_entries(entries, key_prefix, token))
    }

    /// Like [`Self::get_entries`], but resolves the actual bytes behind
    /// every `Eager` entry inline. `Lazy` entries come back with `value:
    /// None` — a caller wanting their bytes calls `get_object` itself,
    /// per spec's inline/lazy value split.
    pub fn get_entries_inline(
        &self,
        commit: &Commit,
        key_prefix: &[u8],
        token: Option<&ContinuationToken>,
    ) -> Result<(Vec<InlinedEntry>, Option<ContinuationToken>)> {
        let (entries, next) = self.get_entries(commit, key_prefix, token)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let value = match entry.priority {
                KeyPriority::Eager => Some(self.get_object(&entry.object_identifier)?),
                KeyPriority::Lazy => None,
            };
            out.push(InlinedEntry { entry, value });
        }
        Ok((out, next))
    }

    // --- Merge support ----------------------------------------------------

    /// Determines how two divergent heads relate (spec §4.5 step 1):
    /// lineally related heads fast-forward, otherwise the caller gets
    /// back their most recent common ancestor to three-way merge against.
    pub fn merge_base(&self, left: CommitId, right: CommitId) -> Result<crate::merge::MergeBase> {
        crate::merge::find_merge_base(self, left, right)
    }

    /// Drops a head that turned out to be a lineal ancestor of another
    /// head from the head set (spec §4.5 step 1's fast-forward prune).
    /// Idempotent: pruning a commit that isn't currently a head is a no-op.
    pub fn prune_stale_head(&self, stale: &CommitId) -> Result<()> {
        let mut batch = self.db.batch();
        batch.delete(keys::head_key(stale));
        self.db.commit_batch(batch)
    }

    // --- Sync bookkeeping -------------------------------------------------

    pub fn mark_commit_synced(&self, id: &CommitId) -> Result<()> {
        let mut batch = self.db.batch();
        batch.delete(keys::unsynced_commit_key(id));
        self.db.commit_batch(batch)
    }

    pub fn mark_piece_synced(&self, digest: &ObjectDigest) -> Result<()> {
        let mut batch = self.db.batch();
        for status in [ObjectStatus::Transient, ObjectStatus::Local] {
            batch.delete(keys::object_status_key(status, digest.as_bytes()));
        }
        batch.put(keys::object_status_key(ObjectStatus::Synced, digest.as_bytes()), Vec::new());
        self.db.commit_batch(batch)
    }

    /// True once no commit remains in the `unsynced/commits/` set.
    pub fn is_synced(&self) -> bool {
        self.db.scan_prefix(keys::UNSYNCED_COMMITS_PREFIX).is_empty()
    }

    pub fn is_online(&self) -> bool {
        self.db.is_page_online()
    }

    pub fn mark_online(&self) -> Result<()> {
        let mut batch = self.db.batch();
        batch.put(keys::PAGE_ONLINE_KEY.to_vec(), vec![1]);
        self.db.commit_batch(batch)
    }

    /// True if the page has exactly one head and that head's content is empty.
    pub fn is_empty(&self) -> Result<bool> {
        let heads = self.get_head_commits()?;
        if heads.len() != 1 {
            return Ok(false);
        }
        Ok(self.get_commit(&heads[0])?.root_node.is_none())
    }

    pub fn set_sync_metadata(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = self.db.batch();
        batch.put(keys::sync_metadata_key(key), value.to_vec());
        self.db.commit_batch(batch)
    }

    pub fn get_sync_metadata(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(&keys::sync_metadata_key(key))
    }
}

impl CommitLookup for PageStorage {
    fn get_commit(&self, id: &CommitId) -> Result<Commit> {
        // Resolves to `PageStorage`'s inherent `get_commit` above:
        // inherent methods take priority over trait methods of the same
        // name, so this does not recurse.
        self.get_commit(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerdb_io::MemFileIo;
    use ledgerdb_types::KeyPriority;

    fn open_storage() -> PageStorage {
        let io = Arc::new(MemFileIo::new());
        PageStorage::open(io, PageStorageOptions::default()).unwrap()
    }

    #[test]
    fn first_commit_is_the_sole_initial_head() {
        let storage = open_storage();
        let heads = storage.get_head_commits().unwrap();
        assert_eq!(heads, vec![CommitId::FIRST]);
        assert!(storage.is_empty().unwrap());
    }

    #[test]
    fn committing_a_put_creates_a_new_head_and_retires_the_parent() {
        let storage = open_storage();
        let value_id = storage.add_object_from_local(b"hello", ObjectType::Blob).unwrap();
        let mut journal = storage.start_commit(CommitId::FIRST);
        journal.put(b"k".to_vec(), value_id, KeyPriority::Eager).unwrap();
        let commit = storage.commit_journal(journal).unwrap();

        let heads = storage.get_head_commits().unwrap();
        assert_eq!(heads, vec![commit.id]);
        let contents = storage.get_commit_contents(&commit).unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].key, b"k");
    }

    #[test]
    fn empty_journal_commit_is_suppressed() {
        let storage = open_storage();
        let journal = storage.start_commit(CommitId::FIRST);
        let commit = storage.commit_journal(journal).unwrap();
        assert_eq!(commit.id, CommitId::FIRST);
        assert_eq!(storage.get_head_commits().unwrap(), vec![CommitId::FIRST]);
    }

    #[test]
    fn large_value_round_trips_through_split_and_reassembly() {
        let storage = open_storage();
        let content = vec![0x7Au8; 500 * 1024];
        let id = storage.add_object_from_local(&content, ObjectType::Blob).unwrap();
        let read_back = storage.get_object(&id).unwrap();
        assert_eq!(read_back, content);
    }

    #[test]
    fn merge_commit_records_both_parents() {
        let storage = open_storage();
        let a_value = storage.add_object_from_local(b"a", ObjectType::Blob).unwrap();
        let mut journal_a = storage.start_commit(CommitId::FIRST);
        journal_a.put(b"a".to_vec(), a_value, KeyPriority::Eager).unwrap();
        let commit_a = storage.commit_journal(journal_a).unwrap();

        let b_value = storage.add_object_from_local(b"b", ObjectType::Blob).unwrap();
        let mut journal_b = storage.start_commit(CommitId::FIRST);
        journal_b.put(b"b".to_vec(), b_value, KeyPriority::Eager).unwrap();
        let commit_b = storage.commit_journal(journal_b).unwrap();

        let merge_value = storage.add_object_from_local(b"merged", ObjectType::Blob).unwrap();
        let mut merge_journal = storage.start_merge_commit(commit_a.id, commit_b.id);
        merge_journal
            .put(b"merged".to_vec(), merge_value, KeyPriority::Eager)
            .unwrap();
        let merge_commit = storage.commit_journal(merge_journal).unwrap();

        assert_eq!(merge_commit.parents.len(), 2);
        assert_eq!(storage.get_head_commits().unwrap(), vec![merge_commit.id]);
    }

    #[test]
    fn object_with_live_reference_is_not_deleted() {
        let storage = open_storage();
        let content = vec![0x99u8; 200 * 1024];
        let id = storage.add_object_from_local(&content, ObjectType::Blob).unwrap();
        // add_object_from_local already dropped its tokens; re-derive one to hold it live.
        let (_, token) = storage.identifiers.make(0, 0, id.object_digest().clone());
        storage.delete_object(id.object_digest()).unwrap_err();
        drop(token);
        storage.delete_object(id.object_digest()).unwrap();
    }

    #[test]
    fn add_commits_from_sync_reports_missing_parents_instead_of_erroring() {
        let storage = open_storage();
        let unknown_parent = CommitId::new([7u8; 32]);
        let orphan = crate::commit::CommitFactory::from_parents(
            &[Commit {
                id: unknown_parent,
                parents: vec![],
                timestamp_ns: 0,
                generation: 0,
                root_node: None,
            }],
            None,
        );

        let missing = storage
            .add_commits_from_sync(vec![(orphan.encode(), ChangeSource::P2p)])
            .unwrap();
        assert_eq!(missing, vec![unknown_parent]);
        // The orphan itself was not accepted: it is still absent from the graph.
        assert!(storage.get_commit(&orphan.id).is_err());
    }

    #[test]
    fn add_commits_from_sync_accepts_a_commit_once_its_parent_is_present() {
        let storage = open_storage();
        let value = storage.add_object_from_local(b"hello", ObjectType::Blob).unwrap();
        let mut journal = storage.start_commit(CommitId::FIRST);
        journal.put(b"k".to_vec(), value, KeyPriority::Eager).unwrap();
        let local_commit = storage.commit_journal(journal).unwrap();

        let synced_child = crate::commit::CommitFactory::from_parents(&[local_commit.clone()], local_commit.root_node.clone());
        let missing = storage
            .add_commits_from_sync(vec![(synced_child.encode(), ChangeSource::P2p)])
            .unwrap();
        assert!(missing.is_empty());
        assert_eq!(storage.get_head_commits().unwrap(), vec![synced_child.id]);
    }

    #[test]
    fn merge_base_fast_forwards_when_one_head_is_an_ancestor() {
        let storage = open_storage();
        let value = storage.add_object_from_local(b"v", ObjectType::Blob).unwrap();
        let mut journal = storage.start_commit(CommitId::FIRST);
        journal.put(b"k".to_vec(), value, KeyPriority::Eager).unwrap();
        let child = storage.commit_journal(journal).unwrap();

        match storage.merge_base(CommitId::FIRST, child.id).unwrap() {
            crate::merge::MergeBase::FastForward { stale, current } => {
                assert_eq!(stale, CommitId::FIRST);
                assert_eq!(current, child.id);
            }
            crate::merge::MergeBase::CommonAncestor(_) => panic!("expected a fast-forward"),
        }
    }

    #[test]
    fn prune_stale_head_removes_it_from_the_head_set() {
        let storage = open_storage();
        let value = storage.add_object_from_local(b"v", ObjectType::Blob).unwrap();
        let mut journal = storage.start_commit(CommitId::FIRST);
        journal.put(b"k".to_vec(), value, KeyPriority::Eager).unwrap();
        let child = storage.commit_journal(journal).unwrap();

        // `commit_journal` already retired `CommitId::FIRST`'s head row; reinstate
        // it here to exercise pruning as if sync had left both ids heads.
        let mut batch = storage.db.batch();
        batch.put(keys::head_key(&CommitId::FIRST), vec![0u8; 8]);
        storage.db.commit_batch(batch).unwrap();
        assert_eq!(storage.get_head_commits().unwrap().len(), 2);

        storage.prune_stale_head(&CommitId::FIRST).unwrap();
        assert_eq!(storage.get_head_commits().unwrap(), vec![child.id]);
    }

    #[test]
    fn get_entries_paginates_and_filters_by_prefix() {
        let storage = open_storage();
        let mut journal = storage.start_commit(CommitId::FIRST);
        for i in 0..3u8 {
            let value = storage.add_object_from_local(&[i], ObjectType::Blob).unwrap();
            journal.put(vec![b'a', i], value, KeyPriority::Eager).unwrap();
        }
        let other_value = storage.add_object_from_local(b"other", ObjectType::Blob).unwrap();
        journal.put(b"z".to_vec(), other_value, KeyPriority::Eager).unwrap();
        let commit = storage.commit_journal(journal).unwrap();

        let (entries, token) = storage.get_entries(&commit, b"a", None).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(token.is_none());
        assert!(entries.iter().all(|e| e.key.starts_with(b"a")));
    }

    #[test]
    fn get_entries_inline_dereferences_only_eager_entries() {
        let storage = open_storage();
        let eager_value = storage.add_object_from_local(b"eager", ObjectType::Blob).unwrap();
        let lazy_value = storage.add_object_from_local(b"lazy", ObjectType::Blob).unwrap();
        let mut journal = storage.start_commit(CommitId::FIRST);
        journal.put(b"e".to_vec(), eager_value, KeyPriority::Eager).unwrap();
        journal.put(b"l".to_vec(), lazy_value, KeyPriority::Lazy).unwrap();
        let commit = storage.commit_journal(journal).unwrap();

        let (entries, _) = storage.get_entries_inline(&commit, b"", None).unwrap();
        let eager = entries.iter().find(|e| e.entry.key == b"e").unwrap();
        let lazy = entries.iter().find(|e| e.entry.key == b"l").unwrap();
        assert_eq!(eager.value.as_deref(), Some(&b"eager"[..]));
        assert!(lazy.value.is_none());
    }

    #[test]
    fn diff_commits_three_way_reports_both_sides_changes() {
        let storage = open_storage();
        let base = storage.commit_journal(storage.start_commit(CommitId::FIRST)).unwrap();

        let left_value = storage.add_object_from_local(b"left", ObjectType::Blob).unwrap();
        let mut left_journal = storage.start_commit(base.id);
        left_journal.put(b"k".to_vec(), left_value, KeyPriority::Eager).unwrap();
        let left = storage.commit_journal(left_journal).unwrap();

        let right_value = storage.add_object_from_local(b"right", ObjectType::Blob).unwrap();
        let mut right_journal = storage.start_commit(base.id);
        right_journal.put(b"k".to_vec(), right_value, KeyPriority::Eager).unwrap();
        let right = storage.commit_journal(right_journal).unwrap();

        let diffs = storage.diff_commits_three_way(&base, &left, &right).unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].is_conflict());
    }
}
