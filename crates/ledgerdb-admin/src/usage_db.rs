//! `PageUsageDb` (spec §4.7): a key-partitioned store, separate from any
//! page's own `PageDb`, recording when each `(ledger, page)` pair was
//! last closed. Reuses `ledgerdb-pagedb`'s `PageDb` engine under a
//! distinct logical keyspace rather than re-implementing an
//! append-log — the same "one durable engine, many row conventions"
//! shape `ledgerdb-storage` uses for page content.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ledgerdb_pagedb::PageDb;
use ledgerdb_types::{PageId, PAGE_ID_SIZE};

use crate::error::Result;

const USAGE_PREFIX: &[u8] = b"usage/";
/// Sentinel timestamp meaning "currently open".
const OPEN_SENTINEL: u64 = 0;

fn usage_key(ledger_name: &[u8], page_id: &PageId) -> Vec<u8> {
    let mut key = Vec::with_capacity(USAGE_PREFIX.len() + ledger_name.len() + 1 + PAGE_ID_SIZE);
    key.extend_from_slice(USAGE_PREFIX);
    key.extend_from_slice(ledger_name);
    key.push(b'/');
    key.extend_from_slice(page_id.as_bytes());
    key
}

fn split_key(key: &[u8]) -> Option<(Vec<u8>, PageId)> {
    let rest = key.strip_prefix(USAGE_PREFIX)?;
    if rest.len() < PAGE_ID_SIZE + 1 {
        return None;
    }
    let split_at = rest.len() - PAGE_ID_SIZE - 1;
    let ledger_name = rest[..split_at].to_vec();
    let mut id_bytes = [0u8; PAGE_ID_SIZE];
    id_bytes.copy_from_slice(&rest[split_at + 1..]);
    Some((ledger_name, PageId::new(id_bytes)))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        .max(1)
}

/// One usage-db row: which page, and how long it has sat closed.
#[derive(Clone, Debug)]
pub struct UsageEntry {
    pub ledger_name: Vec<u8>,
    pub page_id: PageId,
    pub last_closed_ms: u64,
}

/// The persisted record of when every known page was last closed.
pub struct PageUsageDb {
    db: Arc<PageDb>,
}

impl PageUsageDb {
    pub fn open(db: Arc<PageDb>) -> Self {
        Self { db }
    }

    /// Marks a page open (spec's `timestamp == 0` convention).
    pub fn mark_opened(&self, ledger_name: &[u8], page_id: &PageId) -> Result<()> {
        let mut batch = self.db.batch();
        batch.put(usage_key(ledger_name, page_id), OPEN_SENTINEL.to_be_bytes().to_vec());
        self.db.commit_batch(batch)?;
        Ok(())
    }

    /// Marks a page unused as of now.
    pub fn mark_unused(&self, ledger_name: &[u8], page_id: &PageId) -> Result<()> {
        let mut batch = self.db.batch();
        batch.put(usage_key(ledger_name, page_id), now_ms().to_be_bytes().to_vec());
        self.db.commit_batch(batch)?;
        Ok(())
    }

    /// Removes a page's row entirely, once its storage has been evicted.
    pub fn mark_evicted(&self, ledger_name: &[u8], page_id: &PageId) -> Result<()> {
        let mut batch = self.db.batch();
        batch.delete(usage_key(ledger_name, page_id));
        self.db.commit_batch(batch)?;
        Ok(())
    }

    /// Run once at process start: every page left marked "open" belongs
    /// to a session that crashed mid-run, so it is now closed as of now.
    pub fn mark_all_closed_on_start(&self) -> Result<usize> {
        let stale: Vec<UsageEntry> = self
            .all_entries()?
            .into_iter()
            .filter(|e| e.last_closed_ms == OPEN_SENTINEL)
            .collect();
        let timestamp = now_ms();
        let mut batch = self.db.batch();
        for entry in &stale {
            batch.put(
                usage_key(&entry.ledger_name, &entry.page_id),
                timestamp.to_be_bytes().to_vec(),
            );
        }
        self.db.commit_batch(batch)?;
        Ok(stale.len())
    }

    fn all_entries(&self) -> Result<Vec<UsageEntry>> {
        let mut entries = Vec::new();
        for (key, value) in self.db.scan_prefix(USAGE_PREFIX) {
            let Some((ledger_name, page_id)) = split_key(&key) else {
                continue;
            };
            let last_closed_ms = u64::from_be_bytes(value.try_into().unwrap_or([0u8; 8]));
            entries.push(UsageEntry {
                ledger_name,
                page_id,
                last_closed_ms,
            });
        }
        Ok(entries)
    }

    /// Closed pages (timestamp != 0), oldest-closed first — the
    /// candidate order `DiskCleanupManager` evicts in.
    pub fn least_recently_used_closed(&self) -> Result<Vec<UsageEntry>> {
        let mut entries: Vec<UsageEntry> = self
            .all_entries()?
            .into_iter()
            .filter(|e| e.last_closed_ms != OPEN_SENTINEL)
            .collect();
        entries.sort_by_key(|e| e.last_closed_ms);
        Ok(entries)
    }
}
