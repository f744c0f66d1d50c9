//! `LedgerManager` (spec §4.2): owns every currently-open page of one
//! ledger, opening `PageStorage` on demand, coalescing connections
//! through `PageConnectionNotifier`, and answering the two eviction
//! predicates `DiskCleanupManager` needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ledgerdb_admin::PageUsageDb;
use ledgerdb_concurrency::IoWorker;
use ledgerdb_io::{FileIo, StdFileIo};
use ledgerdb_objects::ObjectIdentifier;
use ledgerdb_storage::{merge_three_way, Commit, DefaultToLeftResolver, Journal, MergeBase, PageStorage, PageStorageOptions};
use ledgerdb_types::{CommitId, KeyPriority, LedgerName, PageId, Result, Status};
use parking_lot::Mutex;
use tracing::debug;

use crate::availability::PageAvailabilityManager;
use crate::connection::{ConnectionEvent, PageConnectionNotifier};

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn page_dir(content_dir: &Path, ledger_name: &LedgerName, page_id: &PageId) -> PathBuf {
    content_dir.join(hex(ledger_name.as_bytes())).join(page_id.to_string())
}

struct PageBinding {
    storage: Arc<PageStorage>,
    notifier: PageConnectionNotifier,
    /// The explicit (client-started) transaction currently open on this
    /// page, if any (spec §4.4's `OPEN` journal state). Only one may be
    /// open at a time; a second `StartTransaction` is rejected with
    /// `TRANSACTION_ALREADY_IN_PROGRESS`.
    explicit_txn: Mutex<Option<Journal>>,
}

/// The outcome of one of the two close/sync predicates `LedgerManager`
/// answers for eviction. `PageOpened` means "someone opened the page
/// while you were asking" — the caller should treat the candidate as
/// not currently evictable rather than racing the opener.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ClosedCheck {
    Yes,
    No,
    PageOpened,
}

/// Owns every page of one ledger that this process currently has open.
pub struct LedgerManager {
    ledger_name: LedgerName,
    content_dir: PathBuf,
    pages: Mutex<HashMap<PageId, Arc<PageBinding>>>,
    io_worker: IoWorker,
    availability: PageAvailabilityManager,
    usage_db: Option<Arc<PageUsageDb>>,
    options: PageStorageOptions,
}

impl LedgerManager {
    pub fn new(
        ledger_name: LedgerName,
        content_dir: PathBuf,
        usage_db: Option<Arc<PageUsageDb>>,
        options: PageStorageOptions,
    ) -> Self {
        Self {
            ledger_name,
            content_dir,
            pages: Mutex::new(HashMap::new()),
            io_worker: IoWorker::new(),
            availability: PageAvailabilityManager::new(),
            usage_db,
            options,
        }
    }

    pub fn ledger_name(&self) -> &LedgerName {
        &self.ledger_name
    }

    /// Opens (or returns the already-open) page, per spec's `GetPage`.
    /// New requests against a page whose storage is mid-deletion block
    /// until the deletion completes (spec's `PageDelayingFacade`).
    pub fn get_page(self: &Arc<Self>, page_id: PageId) -> Result<PageHandle> {
        if self.availability.is_busy(&page_id) {
            return Err(Status::IllegalState("page storage is being deleted; retry"));
        }
        let binding = {
            let mut pages = self.pages.lock();
            if let Some(existing) = pages.get(&page_id) {
                Arc::clone(existing)
            } else {
                let storage = self.open_page_storage(&page_id)?;
                let binding = Arc::new(PageBinding {
                    storage,
                    notifier: PageConnectionNotifier::new(),
                    explicit_txn: Mutex::new(None),
                });
                pages.insert(page_id, Arc::clone(&binding));
                binding
            }
        };
        if binding.notifier.external_open() == ConnectionEvent::Opened {
            if let Some(usage) = &self.usage_db {
                usage
                    .mark_opened(self.ledger_name.as_bytes(), &page_id)
                    .map_err(|e| Status::InternalIoError(e.to_string()))?;
            }
            debug!(page = %page_id, "ledger_manager.page_opened");
        }
        Ok(PageHandle {
            manager: Arc::clone(self),
            page_id,
            binding,
        })
    }

    fn open_page_storage(&self, page_id: &PageId) -> Result<Arc<PageStorage>> {
        let dir = page_dir(&self.content_dir, &self.ledger_name, page_id);
        let options = self.options.clone();
        self.io_worker.submit(move || -> Result<Arc<PageStorage>> {
            std::fs::create_dir_all(&dir).map_err(|e| Status::InternalIoError(e.to_string()))?;
            let file = StdFileIo::open(dir.join("page.db")).map_err(|e| Status::InternalIoError(e.to_string()))?;
            let io: Arc<dyn FileIo> = Arc::new(file);
            Ok(Arc::new(PageStorage::open(io, options)?))
        })
    }

    fn release(&self, page_id: PageId, binding: &PageBinding) {
        if binding.notifier.external_close() == ConnectionEvent::Unused {
            self.pages.lock().remove(&page_id);
            if let Some(usage) = &self.usage_db {
                if let Err(err) = usage.mark_unused(self.ledger_name.as_bytes(), &page_id) {
                    tracing::warn!(page = %page_id, error = %err, "ledger_manager.mark_unused_failed");
                }
            }
            debug!(page = %page_id, "ledger_manager.page_unused");
        }
    }

    /// True (to the precision this check can be taken without the page
    /// open) iff `page_id` is closed and every commit/object on it has
    /// been synced.
    pub fn page_is_closed_and_synced(&self, page_id: &PageId) -> Result<ClosedCheck> {
        if self.pages.lock().contains_key(page_id) {
            return Ok(ClosedCheck::PageOpened);
        }
        let storage = self.open_page_storage(page_id)?;
        if self.pages.lock().contains_key(page_id) {
            return Ok(ClosedCheck::PageOpened);
        }
        Ok(if storage.is_synced() { ClosedCheck::Yes } else { ClosedCheck::No })
    }

    /// True iff `page_id` is closed, was never brought online, and has
    /// no content — the "this page was created but abandoned offline"
    /// eviction case.
    pub fn page_is_closed_offline_and_empty(&self, page_id: &PageId) -> Result<ClosedCheck> {
        if self.pages.lock().contains_key(page_id) {
            return Ok(ClosedCheck::PageOpened);
        }
        let storage = self.open_page_storage(page_id)?;
        if self.pages.lock().contains_key(page_id) {
            return Ok(ClosedCheck::PageOpened);
        }
        Ok(if !storage.is_online() && storage.is_empty()? {
            ClosedCheck::Yes
        } else {
            ClosedCheck::No
        })
    }

    /// Deletes a closed page's on-disk storage, per spec's
    /// `DeletePageStorage`. Rejects a page that is currently open;
    /// callers are expected to have already confirmed eviction safety.
    pub fn delete_page_storage(&self, page_id: &PageId) -> Result<()> {
        if self.pages.lock().contains_key(page_id) {
            return Err(Status::IllegalState("cannot delete storage for an open page"));
        }
        self.availability.mark_busy(*page_id);
        let dir = page_dir(&self.content_dir, &self.ledger_name, page_id);
        let result = match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Status::InternalIoError(e.to_string())),
        };
        if result.is_ok() {
            if let Some(usage) = &self.usage_db {
                usage
                    .mark_evicted(self.ledger_name.as_bytes(), page_id)
                    .map_err(|e| Status::InternalIoError(e.to_string()))?;
            }
        }
        for waiter in self.availability.mark_available(page_id) {
            waiter();
        }
        result
    }
}

/// A held-open page, returned by [`LedgerManager::get_page`]. Dropping
/// it releases this caller's connection; once the last connection
/// (external or internal) drops, the page is marked unused in the
/// usage db and its in-memory binding is freed.
pub struct PageHandle {
    manager: Arc<LedgerManager>,
    page_id: PageId,
    binding: Arc<PageBinding>,
}

impl PageHandle {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn storage(&self) -> &PageStorage {
        &self.binding.storage
    }

    /// The page's one live head, merging divergent heads down to a
    /// single one first if sync left more than one (spec §4.5: a
    /// mutation that finds divergent heads drives the merge itself
    /// rather than failing).
    fn single_head(&self) -> Result<CommitId> {
        self.resolve_divergent_heads()
    }

    /// Blocks (spec's `WaitForConflictResolution`) until this page has
    /// exactly one head, running whatever merges are needed to get there.
    pub fn wait_for_conflict_resolution(&self) -> Result<()> {
        self.resolve_divergent_heads().map(|_| ())
    }

    fn resolve_divergent_heads(&self) -> Result<CommitId> {
        loop {
            let heads = self.binding.storage.get_head_commits()?;
            match heads.as_slice() {
                [] => return Err(Status::IllegalState("page has no heads")),
                [only] => return Ok(*only),
                [left, right, ..] => self.merge_one_step(*left, *right)?,
            }
        }
    }

    /// Resolves one pair of divergent heads: a fast-forward relation
    /// just prunes the stale head, otherwise the pair's common ancestor
    /// drives a three-way merge commit (spec §4.5's `MergeResolver`,
    /// using the built-in default resolver for any conflicting keys).
    fn merge_one_step(&self, left: CommitId, right: CommitId) -> Result<()> {
        match self.binding.storage.merge_base(left, right)? {
            MergeBase::FastForward { stale, .. } => self.binding.storage.prune_stale_head(&stale),
            MergeBase::CommonAncestor(base_id) => {
                let base = self.binding.storage.get_commit(&base_id)?;
                let left_commit = self.binding.storage.get_commit(&left)?;
                let right_commit = self.binding.storage.get_commit(&right)?;
                let changes = merge_three_way(
                    self.binding.storage.node_store(),
                    base.root_node.as_ref(),
                    left_commit.root_node.as_ref(),
                    right_commit.root_node.as_ref(),
                    &DefaultToLeftResolver,
                )?;
                let mut journal = self.binding.storage.start_merge_commit(left, right);
                for change in changes {
                    if change.deleted {
                        journal.delete(change.entry.key)?;
                    } else {
                        journal.put(change.entry.key, change.entry.object_identifier, change.entry.priority)?;
                    }
                }
                self.binding.storage.commit_journal(journal)?;
                Ok(())
            }
        }
    }

    /// A single put committed immediately as its own commit (spec's
    /// "implicit" journal flavor: open, mutate, commit, all in one call).
    pub fn put_implicit(&self, key: Vec<u8>, object_identifier: ObjectIdentifier, priority: KeyPriority) -> Result<Commit> {
        self.validate_reference(&object_identifier)?;
        let mut journal = self.binding.storage.start_commit(self.single_head()?);
        journal.put(key, object_identifier, priority)?;
        self.binding.storage.commit_journal(journal)
    }

    /// Rejects identifiers that don't name content actually stored on
    /// this page (spec's `PutReference` validity check, `REFERENCE_NOT_FOUND`).
    fn validate_reference(&self, object_identifier: &ObjectIdentifier) -> Result<()> {
        if self.binding.storage.contains_object(object_identifier.object_digest()) {
            Ok(())
        } else {
            Err(Status::ReferenceNotFound)
        }
    }

    /// A single delete committed immediately, mirroring [`Self::put_implicit`].
    pub fn delete_implicit(&self, key: Vec<u8>) -> Result<Commit> {
        let mut journal = self.binding.storage.start_commit(self.single_head()?);
        journal.delete(key)?;
        self.binding.storage.commit_journal(journal)
    }

    /// Opens an explicit transaction (spec's `StartTransaction`).
    /// Rejected with `TRANSACTION_ALREADY_IN_PROGRESS` if one is
    /// already open on this page.
    pub fn start_transaction(&self) -> Result<()> {
        let mut txn = self.binding.explicit_txn.lock();
        if txn.is_some() {
            return Err(Status::TransactionAlreadyInProgress);
        }
        *txn = Some(self.binding.storage.start_commit(self.single_head()?));
        Ok(())
    }

    /// Records a put against the currently open explicit transaction.
    pub fn put(&self, key: Vec<u8>, object_identifier: ObjectIdentifier, priority: KeyPriority) -> Result<()> {
        self.validate_reference(&object_identifier)?;
        let mut txn = self.binding.explicit_txn.lock();
        let journal = txn.as_mut().ok_or(Status::NoTransactionInProgress)?;
        journal.put(key, object_identifier, priority)
    }

    /// Records a delete against the currently open explicit transaction.
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        let mut txn = self.binding.explicit_txn.lock();
        let journal = txn.as_mut().ok_or(Status::NoTransactionInProgress)?;
        journal.delete(key)
    }

    /// Commits the currently open explicit transaction (spec's `Commit`).
    pub fn commit_transaction(&self) -> Result<Commit> {
        let journal = self
            .binding
            .explicit_txn
            .lock()
            .take()
            .ok_or(Status::NoTransactionInProgress)?;
        self.binding.storage.commit_journal(journal)
    }

    /// Discards the currently open explicit transaction without
    /// committing it (spec's `Rollback`).
    pub fn rollback_transaction(&self) -> Result<()> {
        let mut txn = self.binding.explicit_txn.lock();
        if txn.take().is_none() {
            return Err(Status::NoTransactionInProgress);
        }
        Ok(())
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.manager.release(self.page_id, &self.binding);
    }
}
