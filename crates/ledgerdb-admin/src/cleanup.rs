//! `DiskCleanupManager` (spec §4.7): evicts closed, no-longer-needed
//! page storage in least-recently-used order, grounded on the original
//! implementation's `PageEvictionManagerImpl` LRU sweep and on the
//! teacher's `sombra-admin::vacuum` shape of "one report struct per
//! administrative run".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ledgerdb_types::PageId;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AdminError, Result};
use crate::usage_db::PageUsageDb;

/// Answers the two questions `DiskCleanupManager` cannot answer on its
/// own: whether a candidate page is safe to delete, and how to delete
/// it. Implemented by `ledgerdb-catalog`'s `Repository`; kept as a
/// trait here so `ledgerdb-admin` never depends on the catalog crate.
pub trait EvictionDelegate {
    /// True iff the page is currently closed and either fully synced or
    /// offline-and-empty (spec's eviction predicate).
    fn is_evictable(&self, ledger_name: &[u8], page_id: &PageId) -> ledgerdb_types::Result<bool>;

    /// Deletes the page's on-disk storage. Called only after
    /// `is_evictable` returned `true` for the same candidate.
    fn delete_page_storage(&self, ledger_name: &[u8], page_id: &PageId) -> ledgerdb_types::Result<()>;
}

/// One eviction-sweep result.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub candidates_considered: usize,
    pub evicted: Vec<String>,
    pub skipped_became_open: usize,
}

/// Runs LRU-ordered eviction sweeps over a `PageUsageDb`, refusing to
/// run two sweeps concurrently (spec: "concurrent cleanups are
/// rejected with ILLEGAL_STATE").
pub struct DiskCleanupManager {
    usage_db: Arc<PageUsageDb>,
    running: AtomicBool,
}

impl DiskCleanupManager {
    pub fn new(usage_db: Arc<PageUsageDb>) -> Self {
        Self {
            usage_db,
            running: AtomicBool::new(false),
        }
    }

    /// Runs one sweep, considering at most `max_candidates` closed pages.
    pub fn run_cleanup(&self, delegate: &dyn EvictionDelegate, max_candidates: usize) -> Result<CleanupReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AdminError::IllegalState("a cleanup sweep is already running"));
        }
        let result = self.run_cleanup_inner(delegate, max_candidates);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_cleanup_inner(&self, delegate: &dyn EvictionDelegate, max_candidates: usize) -> Result<CleanupReport> {
        let candidates = self.usage_db.least_recently_used_closed()?;
        let mut evicted = Vec::new();
        let mut skipped_became_open = 0usize;

        for entry in candidates.iter().take(max_candidates) {
            match delegate.is_evictable(&entry.ledger_name, &entry.page_id)? {
                true => {
                    delegate.delete_page_storage(&entry.ledger_name, &entry.page_id)?;
                    self.usage_db.mark_evicted(&entry.ledger_name, &entry.page_id)?;
                    let label = format!(
                        "{}/{}",
                        String::from_utf8_lossy(&entry.ledger_name),
                        entry.page_id
                    );
                    info!(page = %label, "disk_cleanup.evicted");
                    evicted.push(label);
                }
                false => {
                    warn!("disk_cleanup.candidate_became_open");
                    skipped_became_open += 1;
                }
            }
        }

        Ok(CleanupReport {
            candidates_considered: candidates.len().min(max_candidates),
            evicted,
            skipped_became_open,
        })
    }
}
