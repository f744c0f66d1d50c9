//! `Repository` (spec §4.1): the top-level per-device handle onto every
//! ledger stored under one content directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ledgerdb_admin::{CleanupReport, DiskCleanupManager, EvictionDelegate, PageUsageDb};
use ledgerdb_io::StdFileIo;
use ledgerdb_pagedb::PageDb;
use ledgerdb_storage::PageStorageOptions;
use ledgerdb_types::{LedgerName, PageId, Result, Status};
use parking_lot::Mutex;
use tracing::info;

use crate::ledger_manager::{ClosedCheck, LedgerManager};

/// Ambient configuration for a `Repository` and every ledger it opens.
#[derive(Clone, Debug, Default)]
pub struct RepositoryOptions {
    pub page_storage: PageStorageOptions,
}

/// The per-device root handle onto this repository's ledgers (spec
/// §4.1). Cheap to `duplicate`: every clone shares the same ledger map,
/// usage db and cleanup manager.
pub struct Repository {
    content_dir: PathBuf,
    ledgers: Mutex<HashMap<LedgerName, Arc<LedgerManager>>>,
    usage_db: Arc<PageUsageDb>,
    cleanup: DiskCleanupManager,
    closing: AtomicBool,
    options: RepositoryOptions,
}

impl Repository {
    /// Opens (creating if absent) the repository rooted at `content_dir`.
    /// Any page left marked "open" in the usage db from a prior process
    /// is treated as closed as of now (spec's crash-recovery convention).
    pub fn open(content_dir: PathBuf, options: RepositoryOptions) -> Result<Self> {
        std::fs::create_dir_all(&content_dir).map_err(|e| Status::InternalIoError(e.to_string()))?;
        let usage_file = StdFileIo::open(content_dir.join("usage.db")).map_err(|e| Status::InternalIoError(e.to_string()))?;
        let usage_pagedb = Arc::new(PageDb::open(Arc::new(usage_file))?);
        let usage_db = Arc::new(PageUsageDb::open(usage_pagedb));
        let recovered = usage_db.mark_all_closed_on_start().map_err(|e| Status::InternalIoError(e.to_string()))?;
        if recovered > 0 {
            info!(recovered, "repository.open.recovered_stale_usage_rows");
        }

        // Re-discover ledgers left on disk by a prior process: the usage db
        // alone already makes eviction candidates visible across restarts,
        // but without this a freshly-started repository has no `LedgerManager`
        // for a ledger until something calls `GetLedger` on it by name, so a
        // cleanup sweep run before that first call would see nothing to do.
        let mut ledgers = HashMap::new();
        for name in discover_ledger_names(&content_dir) {
            let manager = Arc::new(LedgerManager::new(
                name.clone(),
                content_dir.clone(),
                Some(Arc::clone(&usage_db)),
                options.page_storage.clone(),
            ));
            ledgers.insert(name, manager);
        }

        Ok(Self {
            content_dir,
            ledgers: Mutex::new(ledgers),
            cleanup: DiskCleanupManager::new(Arc::clone(&usage_db)),
            usage_db,
            closing: AtomicBool::new(false),
            options,
        })
    }

    /// Returns (creating if absent) the named ledger's manager (spec's `GetLedger`).
    pub fn get_ledger(&self, ledger_name: LedgerName) -> Result<Arc<LedgerManager>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Status::IllegalState("repository is closing"));
        }
        if ledger_name.as_bytes().is_empty() {
            return Err(Status::InvalidArgument("ledger name must not be empty"));
        }
        Ok(self.ledger_manager_for(ledger_name))
    }

    fn ledger_manager_for(&self, ledger_name: LedgerName) -> Arc<LedgerManager> {
        let mut ledgers = self.ledgers.lock();
        if let Some(existing) = ledgers.get(&ledger_name) {
            return Arc::clone(existing);
        }
        let manager = Arc::new(LedgerManager::new(
            ledger_name.clone(),
            self.content_dir.clone(),
            Some(Arc::clone(&self.usage_db)),
            self.options.page_storage.clone(),
        ));
        ledgers.insert(ledger_name, Arc::clone(&manager));
        manager
    }

    /// Runs one LRU eviction sweep over every ledger this repository knows
    /// about (spec's `DiskCleanUp`).
    pub fn disk_clean_up(&self, max_candidates: usize) -> Result<CleanupReport> {
        self.cleanup
            .run_cleanup(self, max_candidates)
            .map_err(|e| Status::InternalIoError(e.to_string()))
    }

    /// Marks the repository closing: further `get_ledger` calls fail with
    /// `ILLEGAL_STATE`, matching spec's `Close`. Already-open ledgers and
    /// pages are unaffected.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

impl EvictionDelegate for Repository {
    fn is_evictable(&self, ledger_name: &[u8], page_id: &PageId) -> ledgerdb_types::Result<bool> {
        let manager = self.ledger_manager_for(LedgerName::new(ledger_name.to_vec()));
        if manager.page_is_closed_and_synced(page_id)? == ClosedCheck::Yes {
            return Ok(true);
        }
        Ok(manager.page_is_closed_offline_and_empty(page_id)? == ClosedCheck::Yes)
    }

    fn delete_page_storage(&self, ledger_name: &[u8], page_id: &PageId) -> ledgerdb_types::Result<()> {
        self.ledger_manager_for(LedgerName::new(ledger_name.to_vec())).delete_page_storage(page_id)
    }
}

/// Lists the ledger names with an existing directory under `content_dir`,
/// decoding each entry's hex-encoded name back to raw bytes. Non-directory
/// entries (such as `usage.db`) and names that fail to decode are skipped.
fn discover_ledger_names(content_dir: &Path) -> Vec<LedgerName> {
    let Ok(entries) = std::fs::read_dir(content_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().and_then(hex_decode).map(LedgerName::new))
        .collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_ledger_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path().to_path_buf(), RepositoryOptions::default()).unwrap();
        assert!(matches!(
            repo.get_ledger(LedgerName::new(Vec::new())),
            Err(Status::InvalidArgument(_))
        ));
    }

    #[test]
    fn get_ledger_returns_the_same_manager_twice() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path().to_path_buf(), RepositoryOptions::default()).unwrap();
        let a = repo.get_ledger(LedgerName::new(b"notes".to_vec())).unwrap();
        let b = repo.get_ledger(LedgerName::new(b"notes".to_vec())).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn closing_rejects_further_get_ledger_calls() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path().to_path_buf(), RepositoryOptions::default()).unwrap();
        repo.close();
        assert!(matches!(
            repo.get_ledger(LedgerName::new(b"notes".to_vec())),
            Err(Status::IllegalState(_))
        ));
    }

    #[test]
    fn reopening_a_repository_discovers_ledgers_left_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = Repository::open(dir.path().to_path_buf(), RepositoryOptions::default()).unwrap();
            let ledger = repo.get_ledger(LedgerName::new(b"notes".to_vec())).unwrap();
            ledger.get_page(PageId::new([9u8; 16])).unwrap();
        }
        // Fresh `Repository`, simulating a process restart: nobody has
        // called `get_ledger("notes")` yet, but its directory exists.
        let repo = Repository::open(dir.path().to_path_buf(), RepositoryOptions::default()).unwrap();
        assert!(repo.is_evictable(b"notes", &PageId::new([9u8; 16])).is_ok());
    }
}
