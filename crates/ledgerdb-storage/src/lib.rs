#![forbid(unsafe_code)]
//! The commit graph, journals, merge resolution and page storage
//! contract (spec §4.3/§4.4) built on top of `ledgerdb-pagedb` and
//! `ledgerdb-objects`/`ledgerdb-btree`.

mod commit;
mod journal;
mod merge;
mod page_storage;

pub use commit::{Commit, CommitFactory};
pub use journal::{Journal, JournalKind};
pub use merge::{
    find_merge_base, merge_three_way, CommitLookup, ConflictResolution, ConflictResolver, DefaultToLeftResolver,
    MergeBase, RetryPolicy,
};
pub use page_storage::{ContinuationToken, InlinedEntry, PageSnapshot, PageStorage, PageStorageOptions};
