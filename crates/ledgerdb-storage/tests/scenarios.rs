//! End-to-end scenarios over `PageStorage`, covering the parts of the
//! testable-properties walkthroughs that this layer alone can exercise
//! (no Repository/Ledger binding, no eviction, no references — those
//! live in `ledgerdb-catalog`/`ledgerdb-admin`).

use std::sync::Arc;

use ledgerdb_io::MemFileIo;
use ledgerdb_objects::ObjectType;
use ledgerdb_storage::{merge_three_way, DefaultToLeftResolver, PageStorage, PageStorageOptions};
use ledgerdb_types::{CommitId, KeyPriority, Status, MAX_KEY_SIZE};

fn open() -> PageStorage {
    PageStorage::open(Arc::new(MemFileIo::new()), PageStorageOptions::default()).unwrap()
}

/// S1: Put/Get through a snapshot.
#[test]
fn s1_put_get() {
    let storage = open();
    let value_id = storage.add_object_from_local(b"v", ObjectType::Blob).unwrap();
    let mut journal = storage.start_commit(CommitId::FIRST);
    journal.put(b"k".to_vec(), value_id, KeyPriority::Eager).unwrap();
    let commit = storage.commit_journal(journal).unwrap();

    let entry = storage.get_entry_from_commit(&commit, b"k").unwrap().unwrap();
    let value = storage.get_object(&entry.object_identifier).unwrap();
    assert_eq!(value, b"v");
}

/// S4: two concurrent writers from the same base, merged automatically.
#[test]
fn s4_two_concurrent_writer_merge() {
    let storage = open();

    let a1 = storage.add_object_from_local(b"1", ObjectType::Blob).unwrap();
    let mut base_journal = storage.start_commit(CommitId::FIRST);
    base_journal.put(b"a".to_vec(), a1, KeyPriority::Eager).unwrap();
    let base = storage.commit_journal(base_journal).unwrap();

    let b2 = storage.add_object_from_local(b"2", ObjectType::Blob).unwrap();
    let mut left_journal = storage.start_commit(base.id);
    left_journal.put(b"b".to_vec(), b2, KeyPriority::Eager).unwrap();
    let left = storage.commit_journal(left_journal).unwrap();

    let c3 = storage.add_object_from_local(b"3", ObjectType::Blob).unwrap();
    let mut right_journal = storage.start_commit(base.id);
    right_journal.put(b"c".to_vec(), c3, KeyPriority::Eager).unwrap();
    let right = storage.commit_journal(right_journal).unwrap();

    let changes = merge_three_way(
        storage.node_store(),
        base.root_node.as_ref(),
        left.root_node.as_ref(),
        right.root_node.as_ref(),
        &DefaultToLeftResolver,
    )
    .unwrap();

    let mut merge_journal = storage.start_merge_commit(left.id, right.id);
    for change in changes {
        if change.deleted {
            merge_journal.delete(change.entry.key).unwrap();
        } else {
            merge_journal
                .put(change.entry.key, change.entry.object_identifier, change.entry.priority)
                .unwrap();
        }
    }
    let merged = storage.commit_journal(merge_journal).unwrap();

    let contents = storage.get_commit_contents(&merged).unwrap();
    let mut keys: Vec<&[u8]> = contents.iter().map(|e| e.key.as_slice()).collect();
    keys.sort();
    assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
}

/// S5: a large value round-trips through content-defined chunking, and
/// a partial read returns exactly the requested byte range.
#[test]
fn s5_large_value_round_trip_and_partial_fetch() {
    let storage = open();
    let mut content = vec![0u8; 1024 * 1024];
    for (i, byte) in content.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
    let id = storage.add_object_from_local(&content, ObjectType::Blob).unwrap();

    let whole = storage.get_object(&id).unwrap();
    assert_eq!(whole, content);

    let part = storage.get_object_part(&id, 2, 5).unwrap();
    assert_eq!(part, content[2..7]);
}

/// S6: an oversize key is rejected before any journal entry or piece exists.
#[test]
fn s6_oversize_key_rejected() {
    let storage = open();
    let value_id = storage.add_object_from_local(b"v", ObjectType::Blob).unwrap();
    let mut journal = storage.start_commit(CommitId::FIRST);
    let oversize_key = vec![0u8; MAX_KEY_SIZE + 1];
    let err = journal.put(oversize_key, value_id, KeyPriority::Eager).unwrap_err();
    assert!(matches!(err, Status::InvalidArgument(_)));
    assert!(journal.is_empty());
}
