//! Content-defined chunking, grounded on the original implementation's
//! `SplitDataSource`/`ForEachPiece`/`CollectPieces` (`storage/impl/split.h`):
//! a rolling hash over the byte stream picks chunk boundaries so that
//! inserting or deleting bytes in the middle of a large value only
//! changes the chunks near the edit, not the whole object.
//!
//! Simplified relative to the original: large objects get one flat
//! `Index` piece over all their chunks rather than a multi-level
//! index tree. Still content-defined and still stable under small
//! edits; only pathologically large single values would benefit from
//! a second index level.

use std::sync::OnceLock;

use ledgerdb_types::MAX_INLINE_DIGEST_CONTENT;

use crate::{ObjectDigest, ObjectIdentifier, ObjectType, Piece, PieceKind};

const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 64 * 1024;
/// Boundary probability is tuned so the expected chunk size is ~16 KiB.
const BOUNDARY_MASK: u64 = (1 << 14) - 1;

/// Whether a piece produced by [`split_data_source`] is the final
/// (root) piece of the split, or one more chunk/index on the way there.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum IterationStatus {
    InProgress,
    Done,
}

/// One piece produced while splitting content, paired with the
/// identifier it was assigned.
#[derive(Clone, Debug)]
pub struct SplitPiece {
    pub identifier: ObjectIdentifier,
    pub piece: Piece,
    pub status: IterationStatus,
}

/// The result of splitting one value: every piece that needs to be
/// stored, in the order they should be written (so an `Index` piece is
/// always written after the children it references), and the
/// identifier of the root.
#[derive(Clone, Debug)]
pub struct SplitResult {
    pub pieces: Vec<SplitPiece>,
    pub root: ObjectIdentifier,
}

/// Splits `content` (representing an object of `object_type`) into
/// content-addressed pieces. `make_identifier` is called once per
/// distinct digest produced, mirroring the original's
/// `make_object_identifier` callback (used by callers to assign
/// key-space/deletion-scope coordinates and to pin the digest live).
pub fn split_data_source(
    content: &[u8],
    object_type: ObjectType,
    mut make_identifier: impl FnMut(ObjectDigest) -> ObjectIdentifier,
) -> SplitResult {
    if content.len() <= MAX_INLINE_DIGEST_CONTENT {
        let digest = ObjectDigest::compute(content, object_type, PieceKind::Inline);
        let root = make_identifier(digest);
        return SplitResult {
            pieces: Vec::new(),
            root,
        };
    }

    let boundaries = chunk_boundaries(content);
    let mut pieces = Vec::with_capacity(boundaries.len());
    let mut children = Vec::with_capacity(boundaries.len());
    let mut start = 0usize;
    for &end in &boundaries {
        let chunk = &content[start..end];
        let digest = ObjectDigest::compute(chunk, object_type, PieceKind::Chunk);
        let identifier = make_identifier(digest);
        children.push(identifier.clone());
        pieces.push(SplitPiece {
            identifier,
            piece: Piece::Chunk(chunk.to_vec()),
            status: IterationStatus::InProgress,
        });
        start = end;
    }

    if children.len() == 1 {
        pieces[0].status = IterationStatus::Done;
        let root = pieces[0].identifier.clone();
        return SplitResult { pieces, root };
    }

    let index_piece = Piece::Index(children);
    let index_digest = ObjectDigest::compute(&index_piece.encode(), object_type, PieceKind::Index);
    let root = make_identifier(index_digest);
    pieces.push(SplitPiece {
        identifier: root.clone(),
        piece: index_piece,
        status: IterationStatus::Done,
    });
    SplitResult { pieces, root }
}

/// Walks the piece tree rooted at `root`, depth-first, calling `visit`
/// for every identifier encountered (including `root` itself).
/// `visit` returns whether to recurse into an `Index` piece's children;
/// returning `false` prunes that subtree. Mirrors the original's
/// `CollectPieces`.
pub fn collect_pieces(
    root: &ObjectIdentifier,
    get_piece: &mut dyn FnMut(&ObjectIdentifier) -> ledgerdb_types::Result<Piece>,
    visit: &mut dyn FnMut(&ObjectIdentifier) -> bool,
) -> ledgerdb_types::Result<()> {
    if !visit(root) {
        return Ok(());
    }
    if root.object_digest().inline_content().is_some() {
        return Ok(());
    }
    if let Piece::Index(children) = get_piece(root)? {
        for child in &children {
            collect_pieces(child, get_piece, visit)?;
        }
    }
    Ok(())
}

fn gear_table() -> &'static [u64; 256] {
    static TABLE: OnceLock<[u64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u64; 256];
        let mut seed: u64 = 0x9E3779B97F4A7C15;
        for slot in table.iter_mut() {
            seed = splitmix64(seed);
            *slot = seed;
        }
        table
    })
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn chunk_boundaries(content: &[u8]) -> Vec<usize> {
    let table = gear_table();
    let mut boundaries = Vec::new();
    let mut hash: u64 = 0;
    let mut chunk_start = 0usize;
    for (i, &byte) in content.iter().enumerate() {
        hash = (hash << 1).wrapping_add(table[byte as usize]);
        let pos = i + 1;
        let window = pos - chunk_start;
        if window >= MIN_CHUNK_SIZE && (hash & BOUNDARY_MASK == 0 || window >= MAX_CHUNK_SIZE) {
            boundaries.push(pos);
            chunk_start = pos;
            hash = 0;
        }
    }
    if chunk_start < content.len() {
        boundaries.push(content.len());
    }
    boundaries
}
