#![forbid(unsafe_code)]
//! `PageDb`: the persistent, key-partitioned backing store behind one
//! `PageStorage` (spec §4.6). Exposes a generic `get`/`scan_prefix`/
//! atomic-`Batch` surface; the logical "rows" (heads, commits, objects,
//! ...) are just key-building conventions layered on top by
//! `ledgerdb-storage`, via the [`keys`] module.
//!
//! Durability is a single append-only log (see [`log`]), replayed into
//! an in-memory sorted index on open — the same "replay-to-rebuild"
//! shape as the teacher's `sombra_wal`, generalized from fixed-size
//! page frames to variable-length batches.

mod log;
pub mod keys;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ledgerdb_bytes::{write_length_prefixed, Cursor};
use ledgerdb_io::FileIo;
use ledgerdb_types::{CommitId, Result, Status};
use parking_lot::RwLock;
use tracing::debug;

use log::PageLog;

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;

/// One mutation within a batch.
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An accumulating set of mutations, committed atomically by
/// [`PageDb::commit_batch`]. Mirrors `PageDb::Batch` in spec §4.6.
#[derive(Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a `Put`.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Put(key.into(), value.into()));
        self
    }

    /// Stages a `Delete`.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Delete(key.into()));
        self
    }

    /// True if no mutations have been staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for op in &self.ops {
            match op {
                Op::Put(k, v) => {
                    buf.push(TAG_PUT);
                    write_length_prefixed(&mut buf, k);
                    write_length_prefixed(&mut buf, v);
                }
                Op::Delete(k) => {
                    buf.push(TAG_DELETE);
                    write_length_prefixed(&mut buf, k);
                }
            }
        }
        buf
    }

    fn decode(payload: &[u8]) -> Result<Vec<Op>> {
        let mut cursor = Cursor::new(payload);
        let mut ops = Vec::new();
        while cursor.remaining() > 0 {
            let tag = *cursor
                .take(1)
                .map_err(|_| Status::FormatError("truncated batch tag"))?
                .first()
                .unwrap();
            let key = cursor
                .read_length_prefixed()
                .map_err(|_| Status::FormatError("truncated batch key"))?
                .to_vec();
            match tag {
                TAG_PUT => {
                    let value = cursor
                        .read_length_prefixed()
                        .map_err(|_| Status::FormatError("truncated batch value"))?
                        .to_vec();
                    ops.push(Op::Put(key, value));
                }
                TAG_DELETE => ops.push(Op::Delete(key)),
                _ => return Err(Status::FormatError("unknown batch op tag")),
            }
        }
        Ok(ops)
    }
}

/// The persistent backing store for one page.
pub struct PageDb {
    log: PageLog,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    page_online: std::sync::atomic::AtomicBool,
    /// Monotonic counter of committed batches, exposed for tests and diagnostics.
    generation: AtomicU64,
}

impl PageDb {
    /// Opens (creating if absent) the backing store over `io`, replaying
    /// the log to rebuild the in-memory index, then running the
    /// initialization pre-actions from spec §4.6: ensure a head row
    /// exists for the first-commit id, and cache the `page_online` flag.
    ///
    /// Journals are pure in-memory staging areas (spec §4.4: an
    /// uncommitted journal's entries "will be lost" on an unexpected
    /// shutdown) so, unlike the original implementation, there is
    /// nothing to discard or finish replaying here on their behalf.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let log = PageLog::open(io)?;
        let mut index = BTreeMap::new();
        log.replay(|payload| {
            if let Ok(ops) = Batch::decode(payload) {
                for op in ops {
                    match op {
                        Op::Put(k, v) => {
                            index.insert(k, v);
                        }
                        Op::Delete(k) => {
                            index.remove(&k);
                        }
                    }
                }
            }
        })?;

        let page_online = index.contains_key(keys::PAGE_ONLINE_KEY);
        let db = Self {
            log,
            index: RwLock::new(index),
            page_online: std::sync::atomic::AtomicBool::new(page_online),
            generation: AtomicU64::new(0),
        };

        let first_head = keys::head_key(&CommitId::FIRST);
        if !db.index.read().contains_key(&first_head) {
            let mut batch = Batch::new();
            batch.put(first_head, 0u64.to_be_bytes().to_vec());
            db.commit_batch(batch)?;
        }
        debug!(generation = db.generation.load(Ordering::Relaxed), "pagedb.open");
        Ok(db)
    }

    /// Reads a single key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.index.read().get(key).cloned())
    }

    /// True if `key` is present.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.read().contains_key(key)
    }

    /// Returns every `(key, value)` pair whose key starts with `prefix`,
    /// in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let index = self.index.read();
        let mut upper = prefix.to_vec();
        // Smallest key that is strictly greater than every key with this
        // prefix: increment the last byte, carrying as needed.
        let end_bound = loop {
            match upper.last_mut() {
                Some(byte) if *byte == 0xff => {
                    upper.pop();
                }
                Some(byte) => {
                    *byte += 1;
                    break Bound::Excluded(upper.clone());
                }
                None => break Bound::Unbounded,
            }
        };
        index
            .range((Bound::Included(prefix.to_vec()), end_bound))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns an empty batch ready to accumulate mutations.
    pub fn batch(&self) -> Batch {
        Batch::new()
    }

    /// Applies `batch` atomically: the whole batch is durable (one
    /// fsynced log frame) and visible in the in-memory index, or
    /// neither, before this call returns.
    pub fn commit_batch(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let payload = batch.encode();
        self.log.append(&payload)?;
        {
            let mut index = self.index.write();
            for op in batch.ops {
                match op {
                    Op::Put(k, v) => {
                        if k == keys::PAGE_ONLINE_KEY {
                            self.page_online.store(true, Ordering::SeqCst);
                        }
                        index.insert(k, v);
                    }
                    Op::Delete(k) => {
                        index.remove(&k);
                    }
                }
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// The cached sticky `page_online` flag.
    pub fn is_page_online(&self) -> bool {
        self.page_online.load(Ordering::SeqCst)
    }

    /// Number of batches committed so far; monotonic, used by tests to
    /// assert atomicity without racing the index directly.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerdb_io::MemFileIo;

    fn open_db() -> PageDb {
        let io = Arc::new(MemFileIo::new());
        PageDb::open(io as Arc<dyn FileIo>).unwrap()
    }

    #[test]
    fn open_seeds_first_commit_head() {
        let db = open_db();
        assert!(db.contains(&keys::head_key(&CommitId::FIRST)));
    }

    #[test]
    fn batch_put_and_get() {
        let db = open_db();
        let mut batch = db.batch();
        batch.put(b"commits/a".to_vec(), b"bytes-a".to_vec());
        db.commit_batch(batch).unwrap();
        assert_eq!(db.get(b"commits/a").unwrap(), Some(b"bytes-a".to_vec()));
    }

    #[test]
    fn batch_delete_removes_key() {
        let db = open_db();
        let mut batch = db.batch();
        batch.put(b"k".to_vec(), b"v".to_vec());
        db.commit_batch(batch).unwrap();
        let mut batch = db.batch();
        batch.delete(b"k".to_vec());
        db.commit_batch(batch).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn scan_prefix_is_isolated_and_ordered() {
        let db = open_db();
        let mut batch = db.batch();
        batch.put(b"objects/2".to_vec(), b"two".to_vec());
        batch.put(b"objects/1".to_vec(), b"one".to_vec());
        batch.put(b"commits/1".to_vec(), b"other".to_vec());
        db.commit_batch(batch).unwrap();
        let scanned = db.scan_prefix(b"objects/");
        assert_eq!(
            scanned,
            vec![
                (b"objects/1".to_vec(), b"one".to_vec()),
                (b"objects/2".to_vec(), b"two".to_vec()),
            ]
        );
    }

    #[test]
    fn scan_prefix_handles_0xff_tail() {
        let db = open_db();
        let mut batch = db.batch();
        batch.put(vec![0xffu8], b"a".to_vec());
        batch.put(vec![0xffu8, 0x00], b"b".to_vec());
        db.commit_batch(batch).unwrap();
        let scanned = db.scan_prefix(&[0xffu8]);
        assert_eq!(scanned.len(), 2);
    }

    #[test]
    fn reopen_replays_committed_batches() {
        let io = Arc::new(MemFileIo::new());
        {
            let db = PageDb::open(Arc::clone(&io) as Arc<dyn FileIo>).unwrap();
            let mut batch = db.batch();
            batch.put(b"heads/x".to_vec(), b"1".to_vec());
            db.commit_batch(batch).unwrap();
        }
        let reopened = PageDb::open(io as Arc<dyn FileIo>).unwrap();
        assert_eq!(reopened.get(b"heads/x").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let db = open_db();
        let gen_before = db.generation();
        db.commit_batch(Batch::new()).unwrap();
        assert_eq!(db.generation(), gen_before);
    }
}
