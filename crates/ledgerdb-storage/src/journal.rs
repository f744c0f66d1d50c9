//! In-memory journals (spec §4.4 "Journal"), grounded on the original
//! implementation's `JournalImpl`: a `base` commit, an optional `other`
//! parent for merges, a `cleared` flag, and a sorted map of pending
//! per-key changes that collapses multiple `Put`/`Delete` calls on the
//! same key into the last one.
//!
//! Like the original, a journal lives only in memory: if it is dropped
//! without being committed its entries are simply lost, which is why
//! `ledgerdb-pagedb` has nothing to recover for journals on reopen.

use std::collections::BTreeMap;

use ledgerdb_btree::EntryChange;
use ledgerdb_objects::ObjectIdentifier;
use ledgerdb_types::{CommitId, KeyPriority, Result, Status, MAX_KEY_SIZE};

/// Whether a journal was opened as a page's single mutation ("simple",
/// one parent) or to record the result of a merge (two parents).
#[derive(Clone, Debug)]
pub enum JournalKind {
    Simple { base: CommitId },
    Merge { base: CommitId, other: CommitId },
}

/// A mutable staging area for one set of page changes (spec §4.4).
pub struct Journal {
    kind: JournalKind,
    cleared: bool,
    entries: BTreeMap<Vec<u8>, EntryChange>,
    committed: bool,
}

impl Journal {
    pub fn simple(base: CommitId) -> Self {
        Self {
            kind: JournalKind::Simple { base },
            cleared: false,
            entries: BTreeMap::new(),
            committed: false,
        }
    }

    pub fn merge(base: CommitId, other: CommitId) -> Self {
        Self {
            kind: JournalKind::Merge { base, other },
            cleared: false,
            entries: BTreeMap::new(),
            committed: false,
        }
    }

    pub fn kind(&self) -> &JournalKind {
        &self.kind
    }

    /// Records (or overwrites) a `Put` for `key`.
    pub fn put(
        &mut self,
        key: impl Into<Vec<u8>>,
        object_identifier: ObjectIdentifier,
        priority: KeyPriority,
    ) -> Result<()> {
        if self.committed {
            return Err(Status::IllegalState("journal already committed"));
        }
        let key = key.into();
        if key.len() > MAX_KEY_SIZE {
            return Err(Status::InvalidArgument("key exceeds MAX_KEY_SIZE"));
        }
        self.entries.insert(
            key.clone(),
            EntryChange {
                entry: ledgerdb_btree::Entry {
                    key,
                    object_identifier,
                    priority,
                },
                deleted: false,
            },
        );
        Ok(())
    }

    /// Records (or overwrites) a `Delete` for `key`.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        if self.committed {
            return Err(Status::IllegalState("journal already committed"));
        }
        let key = key.into();
        if key.len() > MAX_KEY_SIZE {
            return Err(Status::InvalidArgument("key exceeds MAX_KEY_SIZE"));
        }
        self.entries.insert(
            key.clone(),
            EntryChange {
                entry: ledgerdb_btree::Entry {
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
                    priority: KeyPriority::Eager,
                },
                deleted: true,
            },
        );
        Ok(())
    }

    /// Marks this journal to wipe all prior page content before its
    /// other recorded changes apply.
    pub fn clear(&mut self) -> Result<()> {
        if self.committed {
            return Err(Status::IllegalState("journal already committed"));
        }
        self.cleared = true;
        self.entries.clear();
        Ok(())
    }

    /// True if `Clear` was called and no further entries were recorded
    /// since (an empty journal after a clear still represents "delete
    /// everything").
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// True if committing this journal would be a no-op: no `Clear`
    /// and no recorded changes.
    pub fn is_empty(&self) -> bool {
        !self.cleared && self.entries.is_empty()
    }

    /// Consumes the journal, returning its changes in key order. Marks
    /// it committed so no further mutation is possible.
    pub fn take_changes(&mut self) -> Result<Vec<EntryChange>> {
        if self.committed {
            return Err(Status::IllegalState("journal already committed"));
        }
        self.committed = true;
        Ok(std::mem::take(&mut self.entries).into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerdb_objects::{ObjectDigest, ObjectType, PieceKind};

    fn some_id() -> ObjectIdentifier {
        ObjectIdentifier::new(0, 0, ObjectDigest::compute(b"v", ObjectType::Blob, PieceKind::Inline))
    }

    #[test]
    fn later_put_overwrites_earlier_one_for_same_key() {
        let mut journal = Journal::simple(CommitId::FIRST);
        journal.put(b"k".to_vec(), some_id(), KeyPriority::Eager).unwrap();
        journal.put(b"k".to_vec(), some_id(), KeyPriority::Lazy).unwrap();
        let changes = journal.take_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entry.priority, KeyPriority::Lazy);
    }

    #[test]
    fn clear_discards_prior_entries() {
        let mut journal = Journal::simple(CommitId::FIRST);
        journal.put(b"k".to_vec(), some_id(), KeyPriority::Eager).unwrap();
        journal.clear().unwrap();
        assert!(journal.is_cleared());
        assert!(journal.is_empty());
    }

    #[test]
    fn mutating_after_commit_is_an_error() {
        let mut journal = Journal::simple(CommitId::FIRST);
        journal.take_changes().unwrap();
        assert!(journal.put(b"k".to_vec(), some_id(), KeyPriority::Eager).is_err());
    }

    #[test]
    fn oversize_key_is_rejected() {
        let mut journal = Journal::simple(CommitId::FIRST);
        let key = vec![0u8; ledgerdb_types::MAX_KEY_SIZE + 1];
        let err = journal.put(key, some_id(), KeyPriority::Eager).unwrap_err();
        assert!(matches!(err, Status::InvalidArgument(_)));
        assert!(journal.is_empty());
    }
}
