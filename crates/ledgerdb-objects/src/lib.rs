#![forbid(unsafe_code)]
//! Content-addressed object storage primitives (spec §4.3's data model,
//! §3's "ObjectIdentifier"/"ObjectDigest" definitions).
//!
//! Grounded on the teacher's `sombra-vstore` overflow-chain value store
//! for the "large values live outside the index, read back through a
//! chain of pieces" shape, and on the original implementation's
//! `storage/impl/split.h` for the content-defined chunking contract.
//! The hashing itself follows the pack's own content-addressed-storage
//! example (`blake3` for digests), since the teacher never hashes
//! values — it checksums pages instead.

pub mod split;

use std::collections::HashMap;

use ledgerdb_bytes::{write_length_prefixed, Cursor};
use ledgerdb_concurrency::{CounterToken, TokenCounter};
use ledgerdb_types::{Result, Status, MAX_INLINE_DIGEST_CONTENT};
use parking_lot::Mutex;

const HASH_LEN: usize = 32;

/// What a piece's content ultimately represents, per spec §3.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ObjectType {
    /// A serialized `BTreeNode`.
    TreeNode,
    /// An opaque user value.
    Blob,
}

/// How a piece's bytes are stored and addressed.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PieceKind {
    /// Content short enough to live inside the digest itself; no
    /// separate stored row exists for it.
    Inline,
    /// A leaf chunk of content, stored as-is.
    Chunk,
    /// An ordered list of child `ObjectIdentifier`s, stored encoded.
    Index,
}

/// A self-describing, self-verifying content hash: the kind of piece
/// and the object type it belongs to are encoded in a leading tag byte,
/// so a digest can be validated (and its payload interpreted) without
/// any side-channel metadata.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObjectDigest {
    bytes: Vec<u8>,
}

impl ObjectDigest {
    /// Hashes (or, for small content, inlines) `content` into a digest
    /// tagged with `object_type`/`piece_kind`.
    pub fn compute(content: &[u8], object_type: ObjectType, piece_kind: PieceKind) -> Self {
        let tag = encode_tag(object_type, piece_kind);
        let mut bytes = Vec::with_capacity(1 + HASH_LEN);
        bytes.push(tag);
        match piece_kind {
            PieceKind::Inline => bytes.extend_from_slice(content),
            PieceKind::Chunk | PieceKind::Index => {
                bytes.extend_from_slice(blake3::hash(content).as_bytes())
            }
        }
        Self { bytes }
    }

    /// Reconstructs a digest from its serialized form, validating the
    /// tag byte and payload length.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let tag = *bytes
            .first()
            .ok_or(Status::FormatError("empty object digest"))?;
        let (_, piece_kind) = decode_tag(tag)?;
        match piece_kind {
            PieceKind::Inline => {
                if bytes.len() - 1 > MAX_INLINE_DIGEST_CONTENT {
                    return Err(Status::FormatError("inline digest content too large"));
                }
            }
            PieceKind::Chunk | PieceKind::Index => {
                if bytes.len() - 1 != HASH_LEN {
                    return Err(Status::FormatError("hashed digest has wrong length"));
                }
            }
        }
        Ok(Self { bytes })
    }

    /// The serialized digest, as stored in a `PageDb` object key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The object type this digest was tagged with.
    pub fn object_type(&self) -> ObjectType {
        decode_tag(self.bytes[0]).expect("validated at construction").0
    }

    /// The piece kind this digest was tagged with.
    pub fn piece_kind(&self) -> PieceKind {
        decode_tag(self.bytes[0]).expect("validated at construction").1
    }

    /// The inlined content, if this digest carries it directly.
    pub fn inline_content(&self) -> Option<&[u8]> {
        match self.piece_kind() {
            PieceKind::Inline => Some(&self.bytes[1..]),
            _ => None,
        }
    }

    /// True if `content` hashes (or matches, for inline digests) to this digest.
    pub fn verify(&self, content: &[u8]) -> bool {
        match self.piece_kind() {
            PieceKind::Inline => self.bytes[1..] == *content,
            PieceKind::Chunk | PieceKind::Index => {
                self.bytes[1..] == *blake3::hash(content).as_bytes()
            }
        }
    }
}

fn encode_tag(object_type: ObjectType, piece_kind: PieceKind) -> u8 {
    let type_bit = match object_type {
        ObjectType::Blob => 0u8,
        ObjectType::TreeNode => 1u8,
    };
    let kind_bits = match piece_kind {
        PieceKind::Inline => 0u8,
        PieceKind::Chunk => 1u8,
        PieceKind::Index => 2u8,
    };
    type_bit | (kind_bits << 1)
}

fn decode_tag(tag: u8) -> Result<(ObjectType, PieceKind)> {
    let object_type = if tag & 1 == 0 {
        ObjectType::Blob
    } else {
        ObjectType::TreeNode
    };
    let piece_kind = match tag >> 1 {
        0 => PieceKind::Inline,
        1 => PieceKind::Chunk,
        2 => PieceKind::Index,
        _ => return Err(Status::FormatError("unknown object digest tag")),
    };
    Ok((object_type, piece_kind))
}

/// The identifier of an object: its digest, plus the key-space and
/// deletion-scope coordinates spec §3 attaches for name-hiding and
/// scoped-deletion bookkeeping. Opaque to this crate — `ledgerdb-btree`
/// and `ledgerdb-storage` are the only callers that interpret
/// `key_index`/`deletion_scope_id`.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObjectIdentifier {
    key_index: u32,
    deletion_scope_id: u32,
    object_digest: ObjectDigest,
}

impl ObjectIdentifier {
    /// Builds an identifier from its three components.
    pub fn new(key_index: u32, deletion_scope_id: u32, object_digest: ObjectDigest) -> Self {
        Self {
            key_index,
            deletion_scope_id,
            object_digest,
        }
    }

    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn deletion_scope_id(&self) -> u32 {
        self.deletion_scope_id
    }

    pub fn object_digest(&self) -> &ObjectDigest {
        &self.object_digest
    }

    /// Serializes this identifier for storage inside a B-tree entry or
    /// an `Index` piece.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.key_index.to_be_bytes());
        out.extend_from_slice(&self.deletion_scope_id.to_be_bytes());
        write_length_prefixed(out, self.object_digest.as_bytes());
    }

    /// Reads one identifier from `cursor`, as written by [`Self::encode`].
    pub fn decode(cursor: &mut Cursor<'_>) -> Result<Self> {
        let key_index = u32::from_be_bytes(
            cursor
                .take(4)
                .map_err(|_| Status::FormatError("truncated object identifier key_index"))?
                .try_into()
                .unwrap(),
        );
        let deletion_scope_id = u32::from_be_bytes(
            cursor
                .take(4)
                .map_err(|_| Status::FormatError("truncated object identifier scope"))?
                .try_into()
                .unwrap(),
        );
        let digest_bytes = cursor
            .read_length_prefixed()
            .map_err(|_| Status::FormatError("truncated object identifier digest"))?
            .to_vec();
        Ok(Self::new(
            key_index,
            deletion_scope_id,
            ObjectDigest::from_bytes(digest_bytes)?,
        ))
    }
}

/// Issues [`ObjectIdentifier`]s and tracks how many live references to
/// each digest currently exist in process memory, so `DeleteObject`
/// (in `ledgerdb-storage`) never collects a piece that some in-flight
/// `AddObjectFromLocal`/`GetObject` call is still about to reference.
///
/// Grounded on the original implementation's `ExpiringToken` /
/// `IsDiscardable` pattern, built from [`ledgerdb_concurrency::TokenCounter`].
#[derive(Default)]
pub struct ObjectIdentifierFactory {
    live: Mutex<HashMap<Vec<u8>, TokenCounter>>,
}

/// A live reference to a digest, obtained from [`ObjectIdentifierFactory::make`].
/// Dropping it releases the pin.
pub struct LiveToken {
    _inner: CounterToken,
}

impl ObjectIdentifierFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an identifier for `digest` and returns a token pinning it
    /// live until dropped.
    pub fn make(
        &self,
        key_index: u32,
        deletion_scope_id: u32,
        digest: ObjectDigest,
    ) -> (ObjectIdentifier, LiveToken) {
        let mut live = self.live.lock();
        let counter = live.entry(digest.as_bytes().to_vec()).or_default();
        let token = LiveToken {
            _inner: counter.issue(),
        };
        (
            ObjectIdentifier::new(key_index, deletion_scope_id, digest),
            token,
        )
    }

    /// True if no outstanding [`LiveToken`] references `digest`.
    pub fn is_discardable(&self, digest: &ObjectDigest) -> bool {
        self.live
            .lock()
            .get(digest.as_bytes())
            .map(TokenCounter::is_discardable)
            .unwrap_or(true)
    }
}

/// The decoded content of one stored piece (spec §3). Inline digests
/// never have a corresponding `Piece` — their content lives entirely in
/// the digest.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Piece {
    /// A leaf chunk of raw bytes.
    Chunk(Vec<u8>),
    /// An ordered list of child identifiers.
    Index(Vec<ObjectIdentifier>),
}

impl Piece {
    pub fn kind(&self) -> PieceKind {
        match self {
            Piece::Chunk(_) => PieceKind::Chunk,
            Piece::Index(_) => PieceKind::Index,
        }
    }

    /// Serializes this piece to its on-disk byte representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Piece::Chunk(bytes) => bytes.clone(),
            Piece::Index(children) => {
                let mut out = Vec::new();
                write_length_prefixed(&mut out, &(children.len() as u64).to_be_bytes());
                for child in children {
                    child.encode(&mut out);
                }
                out
            }
        }
    }

    /// Decodes a piece of the given `kind` from `bytes`.
    pub fn decode(kind: PieceKind, bytes: &[u8]) -> Result<Self> {
        match kind {
            PieceKind::Inline => Err(Status::InvalidArgument(
                "inline digests do not have a stored piece",
            )),
            PieceKind::Chunk => Ok(Piece::Chunk(bytes.to_vec())),
            PieceKind::Index => {
                let mut cursor = Cursor::new(bytes);
                let count_bytes = cursor
                    .read_length_prefixed()
                    .map_err(|_| Status::FormatError("truncated index piece count"))?;
                let count = u64::from_be_bytes(
                    count_bytes
                        .try_into()
                        .map_err(|_| Status::FormatError("malformed index piece count"))?,
                );
                let mut children = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    children.push(ObjectIdentifier::decode(&mut cursor)?);
                }
                Ok(Piece::Index(children))
            }
        }
    }
}

/// Reassembles whole or partial object content by walking the
/// piece tree rooted at an `ObjectIdentifier`, fetching non-inline
/// pieces through a caller-supplied accessor. Mirrors the original
/// implementation's `CollectPieces` traversal, specialized to full
/// reassembly and to a single contiguous byte range.
pub struct ObjectReader<'a> {
    get_piece: &'a dyn Fn(&ObjectIdentifier) -> Result<Piece>,
}

impl<'a> ObjectReader<'a> {
    pub fn new(get_piece: &'a dyn Fn(&ObjectIdentifier) -> Result<Piece>) -> Self {
        Self { get_piece }
    }

    /// Reassembles the full content addressed by `id`.
    pub fn read_whole(&self, id: &ObjectIdentifier) -> Result<Vec<u8>> {
        if let Some(inline) = id.object_digest().inline_content() {
            return Ok(inline.to_vec());
        }
        match (self.get_piece)(id)? {
            Piece::Chunk(bytes) => Ok(bytes),
            Piece::Index(children) => {
                let mut out = Vec::new();
                for child in &children {
                    out.extend_from_slice(&self.read_whole(child)?);
                }
                Ok(out)
            }
        }
    }

    /// Reassembles `len` bytes of content starting at `offset`, without
    /// fetching chunks entirely outside the requested range.
    pub fn read_part(&self, id: &ObjectIdentifier, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_part_into(id, offset, len, 0, &mut out)?;
        Ok(out)
    }

    fn read_part_into(
        &self,
        id: &ObjectIdentifier,
        offset: u64,
        len: u64,
        base: u64,
        out: &mut Vec<u8>,
    ) -> Result<u64> {
        if let Some(inline) = id.object_digest().inline_content() {
            return Ok(copy_overlap(inline, base, offset, len, out));
        }
        match (self.get_piece)(id)? {
            Piece::Chunk(bytes) => Ok(copy_overlap(&bytes, base, offset, len, out)),
            Piece::Index(children) => {
                let mut cursor = base;
                for child in &children {
                    let consumed = self.read_part_into(child, offset, len, cursor, out)?;
                    cursor += consumed;
                    if cursor >= offset + len {
                        break;
                    }
                }
                Ok(cursor - base)
            }
        }
    }
}

/// Copies the overlap between `[offset, offset+len)` and
/// `[base, base+bytes.len())` from `bytes` into `out`, returning
/// `bytes.len() as u64` (the caller advances its cursor by the full
/// child length regardless of overlap, since children are contiguous).
fn copy_overlap(bytes: &[u8], base: u64, offset: u64, len: u64, out: &mut Vec<u8>) -> u64 {
    let child_len = bytes.len() as u64;
    let want_start = offset.max(base);
    let want_end = (offset + len).min(base + child_len);
    if want_start < want_end {
        let start = (want_start - base) as usize;
        let end = (want_end - base) as usize;
        out.extend_from_slice(&bytes[start..end]);
    }
    child_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_digest_round_trips() {
        let digest = ObjectDigest::compute(b"short", ObjectType::Blob, PieceKind::Inline);
        assert_eq!(digest.inline_content(), Some(&b"short"[..]));
        assert!(digest.verify(b"short"));
        assert!(!digest.verify(b"other"));
    }

    #[test]
    fn chunk_digest_hashes_and_tags() {
        let digest = ObjectDigest::compute(b"some longer content", ObjectType::Blob, PieceKind::Chunk);
        assert_eq!(digest.piece_kind(), PieceKind::Chunk);
        assert_eq!(digest.object_type(), ObjectType::Blob);
        assert!(digest.verify(b"some longer content"));
        assert_eq!(digest.inline_content(), None);
    }

    #[test]
    fn digest_from_bytes_validates_length() {
        let mut bad = vec![encode_tag(ObjectType::Blob, PieceKind::Chunk)];
        bad.extend_from_slice(&[0u8; 10]);
        assert!(ObjectDigest::from_bytes(bad).is_err());
    }

    #[test]
    fn identifier_encode_decode_round_trips() {
        let digest = ObjectDigest::compute(b"payload", ObjectType::TreeNode, PieceKind::Chunk);
        let id = ObjectIdentifier::new(3, 7, digest);
        let mut buf = Vec::new();
        id.encode(&mut buf);
        let mut cursor = Cursor::new(&buf);
        let decoded = ObjectIdentifier::decode(&mut cursor).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn factory_tracks_discardability() {
        let factory = ObjectIdentifierFactory::new();
        let digest = ObjectDigest::compute(b"x", ObjectType::Blob, PieceKind::Chunk);
        assert!(factory.is_discardable(&digest));
        let (_, token) = factory.make(0, 0, digest.clone());
        assert!(!factory.is_discardable(&digest));
        drop(token);
        assert!(factory.is_discardable(&digest));
    }

    #[test]
    fn piece_index_round_trips() {
        let child_digest = ObjectDigest::compute(b"child", ObjectType::Blob, PieceKind::Chunk);
        let child = ObjectIdentifier::new(0, 0, child_digest);
        let piece = Piece::Index(vec![child.clone()]);
        let encoded = piece.encode();
        let decoded = Piece::decode(PieceKind::Index, &encoded).unwrap();
        assert_eq!(decoded, Piece::Index(vec![child]));
    }

    #[test]
    fn reader_reassembles_index_tree() {
        let a_digest = ObjectDigest::compute(b"aaaa", ObjectType::Blob, PieceKind::Chunk);
        let b_digest = ObjectDigest::compute(b"bbbb", ObjectType::Blob, PieceKind::Chunk);
        let a_id = ObjectIdentifier::new(0, 0, a_digest.clone());
        let b_id = ObjectIdentifier::new(0, 0, b_digest.clone());
        let root_children = vec![a_id.clone(), b_id.clone()];
        let root_piece = Piece::Index(root_children);
        let root_digest = ObjectDigest::compute(&root_piece.encode(), ObjectType::Blob, PieceKind::Index);
        let root_id = ObjectIdentifier::new(0, 0, root_digest);

        let get_piece = |id: &ObjectIdentifier| -> Result<Piece> {
            if id.object_digest() == &a_digest {
                Ok(Piece::Chunk(b"aaaa".to_vec()))
            } else if id.object_digest() == &b_digest {
                Ok(Piece::Chunk(b"bbbb".to_vec()))
            } else {
                Ok(root_piece.clone())
            }
        };
        let reader = ObjectReader::new(&get_piece);
        assert_eq!(reader.read_whole(&root_id).unwrap(), b"aaaabbbb".to_vec());
        assert_eq!(reader.read_part(&root_id, 2, 4).unwrap(), b"aabb".to_vec());
    }
}
