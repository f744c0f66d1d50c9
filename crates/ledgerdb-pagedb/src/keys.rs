//! `PageDb` row-key builders, one per logical table in spec §4.6.
//!
//! Grounded directly on the original implementation's
//! `db_serialization.h` (`HeadRow`, `MergeRow`, `CommitRow`,
//! `ObjectRow`, `UnsyncedCommitRow`, `ObjectStatusRow`,
//! `SyncMetadataRow`, `PageIsOnlineRow`): each row class there becomes
//! a free function here returning the row's key bytes, plus a
//! `*_prefix` constant used for prefix scans.

use ledgerdb_types::CommitId;

/// `heads/<id>` — current heads; value is a big-endian u64 timestamp.
pub const HEADS_PREFIX: &[u8] = b"heads/";
/// `commits/<id>` — commit storage bytes.
pub const COMMITS_PREFIX: &[u8] = b"commits/";
/// `merges/<a>/<b>/<c>` — records that merge-commit `c` has parents `a`,`b`.
pub const MERGES_PREFIX: &[u8] = b"merges/";
/// `objects/<digest>` — piece bytes.
pub const OBJECTS_PREFIX: &[u8] = b"objects/";
/// `refs/<target>/<source>` — persisted outbound reference, value is priority byte.
pub const REFS_PREFIX: &[u8] = b"refs/";
/// `object_status/<status>/<id>` — TRANSIENT/LOCAL/SYNCED membership.
pub const OBJECT_STATUS_PREFIX: &[u8] = b"object_status/";
/// `unsynced/commits/<id>` — commits not yet uploaded; value is generation.
pub const UNSYNCED_COMMITS_PREFIX: &[u8] = b"unsynced/commits/";
/// `sync_metadata/<k>` — opaque sync-delegate cursor.
pub const SYNC_METADATA_PREFIX: &[u8] = b"sync_metadata/";
/// `clock/<device>` — per-device logical clock entries.
pub const CLOCK_PREFIX: &[u8] = b"clock/";
/// Sticky flag: present iff the page has ever been marked online.
pub const PAGE_ONLINE_KEY: &[u8] = b"page_online";

/// Key for a head row.
pub fn head_key(id: &CommitId) -> Vec<u8> {
    concat_prefix(HEADS_PREFIX, id.as_bytes())
}

/// Key for a commit row.
pub fn commit_key(id: &CommitId) -> Vec<u8> {
    concat_prefix(COMMITS_PREFIX, id.as_bytes())
}

/// Key for a merge-parentage row.
pub fn merge_key(parent_a: &CommitId, parent_b: &CommitId, merge: &CommitId) -> Vec<u8> {
    let mut key = Vec::with_capacity(MERGES_PREFIX.len() + 3 * 33);
    key.extend_from_slice(MERGES_PREFIX);
    key.extend_from_slice(parent_a.as_bytes());
    key.push(b'/');
    key.extend_from_slice(parent_b.as_bytes());
    key.push(b'/');
    key.extend_from_slice(merge.as_bytes());
    key
}

/// Key for an object (piece) row, keyed by its raw digest bytes.
pub fn object_key(digest: &[u8]) -> Vec<u8> {
    concat_prefix(OBJECTS_PREFIX, digest)
}

/// Key for a persisted outbound reference from `source` piece to `target` piece.
pub fn ref_key(target: &[u8], source: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(REFS_PREFIX.len() + target.len() + source.len() + 1);
    key.extend_from_slice(REFS_PREFIX);
    key.extend_from_slice(target);
    key.push(b'/');
    key.extend_from_slice(source);
    key
}

/// The `refs/<target>/` scan prefix, used to check whether any persisted
/// reference to `target` still exists before honoring `DeleteObject`.
pub fn ref_scan_prefix(target: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(REFS_PREFIX.len() + target.len() + 1);
    key.extend_from_slice(REFS_PREFIX);
    key.extend_from_slice(target);
    key.push(b'/');
    key
}

/// The three piece-lifecycle statuses a digest can occupy, in
/// `object_status/<status>/<id>` rows.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ObjectStatus {
    /// Just written by `AddObjectFromLocal`, not yet referenced by a committed root.
    Transient,
    /// Referenced by a committed root, not yet acknowledged by sync.
    Local,
    /// Acknowledged by the sync layer; never demoted (spec §3 invariant).
    Synced,
}

impl ObjectStatus {
    fn segment(self) -> &'static [u8] {
        match self {
            ObjectStatus::Transient => b"transient/",
            ObjectStatus::Local => b"local/",
            ObjectStatus::Synced => b"synced/",
        }
    }
}

/// Key for an object-status row.
pub fn object_status_key(status: ObjectStatus, digest: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(OBJECT_STATUS_PREFIX.len() + 16 + digest.len());
    key.extend_from_slice(OBJECT_STATUS_PREFIX);
    key.extend_from_slice(status.segment());
    key.extend_from_slice(digest);
    key
}

/// Scan prefix for all digests currently in `status`.
pub fn object_status_scan_prefix(status: ObjectStatus) -> Vec<u8> {
    let mut key = Vec::with_capacity(OBJECT_STATUS_PREFIX.len() + 16);
    key.extend_from_slice(OBJECT_STATUS_PREFIX);
    key.extend_from_slice(status.segment());
    key
}

/// Key for an unsynced-commit row.
pub fn unsynced_commit_key(id: &CommitId) -> Vec<u8> {
    concat_prefix(UNSYNCED_COMMITS_PREFIX, id.as_bytes())
}

/// Key for a sync-metadata cursor row.
pub fn sync_metadata_key(k: &[u8]) -> Vec<u8> {
    concat_prefix(SYNC_METADATA_PREFIX, k)
}

/// Key for a per-device clock entry row.
pub fn clock_key(device: &[u8]) -> Vec<u8> {
    concat_prefix(CLOCK_PREFIX, device)
}

fn concat_prefix(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_key_is_prefixed() {
        let id = CommitId::new([7u8; 32]);
        let key = head_key(&id);
        assert!(key.starts_with(HEADS_PREFIX));
        assert_eq!(&key[HEADS_PREFIX.len()..], id.as_bytes());
    }

    #[test]
    fn object_status_keys_distinguish_statuses() {
        let digest = b"abc";
        let transient = object_status_key(ObjectStatus::Transient, digest);
        let synced = object_status_key(ObjectStatus::Synced, digest);
        assert_ne!(transient, synced);
        assert!(transient.starts_with(&object_status_scan_prefix(ObjectStatus::Transient)));
    }

    #[test]
    fn ref_key_round_trips_through_scan_prefix() {
        let key = ref_key(b"target", b"source");
        assert!(key.starts_with(&ref_scan_prefix(b"target")));
    }
}
