#![forbid(unsafe_code)]
//! Shared identifiers, limits and the public error taxonomy.
//!
//! Every other crate in the workspace depends on this one and nothing
//! else below it: it carries no I/O, no locking, no persistence.

use std::fmt;

/// Maximum size, in bytes, of a user-supplied key (spec §6).
pub const MAX_KEY_SIZE: usize = 256;
/// Size, in bytes, of a page id (spec §6).
pub const PAGE_ID_SIZE: usize = 16;
/// Size, in bytes, of a commit id (spec §6).
pub const COMMIT_ID_SIZE: usize = 32;
/// Upper bound on content a digest may inline instead of storing a piece.
pub const MAX_INLINE_DIGEST_CONTENT: usize = 64;
/// Inline-data cap for a single pagination response (spec §6).
pub const MAX_INLINE_DATA_SIZE: usize = 60 * 1024;
/// Handle-count cap for a single pagination response (spec §6).
pub const MAX_INLINE_HANDLES: usize = 60;
/// Default backlog-download timeout before delayed bindings are served locally (spec §5).
pub const DEFAULT_SYNC_BACKLOG_TIMEOUT_MS: u64 = 5_000;

/// A 16-byte page identifier.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageId(pub [u8; PAGE_ID_SIZE]);

impl PageId {
    /// Builds a page id from raw bytes.
    pub fn new(bytes: [u8; PAGE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; PAGE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", hex_encode(&self.0))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

/// A 32-byte commit identifier, derived deterministically from commit storage bytes.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CommitId(pub [u8; COMMIT_ID_SIZE]);

impl CommitId {
    /// The distinguished "first commit" id: the empty page, never persisted.
    pub const FIRST: CommitId = CommitId([0u8; COMMIT_ID_SIZE]);

    /// Builds a commit id from raw bytes.
    pub fn new(bytes: [u8; COMMIT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// True for the distinguished first-commit id.
    pub fn is_first(&self) -> bool {
        *self == Self::FIRST
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; COMMIT_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", hex_encode(&self.0))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

/// The opaque name of a ledger, as supplied by the client.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LedgerName(pub Vec<u8>);

impl LedgerName {
    /// Wraps a byte string as a ledger name.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Borrows the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Whether a value must be prefetched on sync (`Eager`) or fetched on demand (`Lazy`).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum KeyPriority {
    /// Prefetch during sync.
    Eager,
    /// Fetch lazily, on first access.
    Lazy,
}

/// The origin of a batch of commits passed to `AddCommitsFromSync`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum ChangeSource {
    /// Produced locally by this device.
    Local,
    /// Received from a peer over P2P sync.
    P2p,
    /// Received from the cloud sync delegate.
    Cloud,
}

/// The two supported eviction pruning modes (spec §9, open question (a)).
///
/// The original implementation configures this choice but never invents a
/// third mode; we preserve exactly these two and decide between them via
/// `RepositoryOptions` rather than guessing at additional policies.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub enum PruningPolicy {
    /// Prune a synced commit's ancestors as soon as policy permits.
    #[default]
    LocalImmediate,
    /// Never prune; retain the full commit history locally.
    Never,
}

/// The public status taxonomy (spec §7). No type names beyond this enum:
/// every public operation in the crate returns `Result<T>` using it.
#[derive(thiserror::Error, Debug)]
pub enum Status {
    /// A supplied argument was invalid (e.g. empty ledger name).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A key exceeded `MAX_KEY_SIZE`.
    #[error("value too large")]
    ValueTooLarge,
    /// The requested key does not exist in the snapshot.
    #[error("key not found")]
    KeyNotFound,
    /// The requested page does not exist.
    #[error("page not found")]
    PageNotFound,
    /// A `PutReference` named an identifier unknown to this page.
    #[error("reference not found")]
    ReferenceNotFound,
    /// The repository is closing, or a second concurrent cleanup was attempted.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// A second explicit journal was started while one was already open.
    #[error("transaction already in progress")]
    TransactionAlreadyInProgress,
    /// `Commit`/`Rollback` was called with no open explicit journal.
    #[error("no transaction in progress")]
    NoTransactionInProgress,
    /// A persisted record failed to parse.
    #[error("format error: {0}")]
    FormatError(&'static str),
    /// A persisted record parsed but violated an invariant.
    #[error("data integrity error: {0}")]
    DataIntegrityError(&'static str),
    /// A piece's content did not hash to its claimed digest.
    #[error("object digest mismatch")]
    ObjectDigestMismatch,
    /// A client-visible I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// An I/O failure for state the caller expected to be locally present.
    #[error("internal I/O error: {0}")]
    InternalIoError(String),
    /// An object the caller expected to find locally was absent.
    #[error("internal not found")]
    InternalNotFound,
    /// The sync delegate could not be reached.
    #[error("network error")]
    NetworkError,
    /// No sync delegate is currently connected.
    #[error("not connected")]
    NotConnectedError,
    /// A LAZY entry's value is not cached locally and must be fetched.
    #[error("needs fetch")]
    NeedsFetch,
    /// The operation was cancelled cooperatively.
    #[error("interrupted")]
    Interrupted,
    /// A list operation returned fewer results than requested, with a continuation token.
    #[error("partial result")]
    PartialResult,
}

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Status>;

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
