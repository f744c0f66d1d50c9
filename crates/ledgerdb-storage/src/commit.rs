//! `Commit` storage bytes and the factory that derives a commit's id
//! and generation from its parents (spec §4.3 "Commit").

use std::time::{SystemTime, UNIX_EPOCH};

use ledgerdb_bytes::{write_length_prefixed, Cursor};
use ledgerdb_objects::ObjectIdentifier;
use ledgerdb_types::{CommitId, Result, Status};

/// An immutable commit: parent ids, the root of its B-tree, and the
/// bookkeeping the head-set and generation ordering need.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Commit {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub timestamp_ns: u64,
    /// `1 + max(parent.generation)`, or `0` for the distinguished first commit.
    pub generation: u64,
    /// `None` only for the empty first commit.
    pub root_node: Option<ObjectIdentifier>,
}

impl Commit {
    /// Serializes the fields that feed the commit id (everything but the id itself).
    pub fn storage_bytes(
        parents: &[CommitId],
        timestamp_ns: u64,
        generation: u64,
        root_node: Option<&ObjectIdentifier>,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        write_length_prefixed(&mut out, &(parents.len() as u64).to_be_bytes());
        for parent in parents {
            out.extend_from_slice(parent.as_bytes());
        }
        out.extend_from_slice(&timestamp_ns.to_be_bytes());
        out.extend_from_slice(&generation.to_be_bytes());
        match root_node {
            Some(root) => {
                out.push(1);
                root.encode(&mut out);
            }
            None => out.push(0),
        }
        out
    }

    /// Encodes the full commit (id included) for the `commits/<id>` row.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.id.as_bytes().to_vec();
        out.extend_from_slice(&Self::storage_bytes(
            &self.parents,
            self.timestamp_ns,
            self.generation,
            self.root_node.as_ref(),
        ));
        out
    }

    /// Decodes a commit previously written by [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 32 {
            return Err(Status::FormatError("truncated commit id"));
        }
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&bytes[..32]);
        let id = CommitId::new(id_bytes);

        let mut cursor = Cursor::new(&bytes[32..]);
        let count_bytes = cursor
            .read_length_prefixed()
            .map_err(|_| Status::FormatError("truncated commit parent count"))?;
        let count = u64::from_be_bytes(
            count_bytes
                .try_into()
                .map_err(|_| Status::FormatError("malformed commit parent count"))?,
        );
        let mut parents = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = cursor
                .take(32)
                .map_err(|_| Status::FormatError("truncated commit parent"))?;
            let mut arr = [0u8; 32];
            arr.copy_from_slice(raw);
            parents.push(CommitId::new(arr));
        }
        let timestamp_ns = u64::from_be_bytes(
            cursor
                .take(8)
                .map_err(|_| Status::FormatError("truncated commit timestamp"))?
                .try_into()
                .unwrap(),
        );
        let generation = u64::from_be_bytes(
            cursor
                .take(8)
                .map_err(|_| Status::FormatError("truncated commit generation"))?
                .try_into()
                .unwrap(),
        );
        let has_root = *cursor
            .take(1)
            .map_err(|_| Status::FormatError("truncated commit root flag"))?
            .first()
            .unwrap();
        let root_node = match has_root {
            0 => None,
            1 => Some(ObjectIdentifier::decode(&mut cursor)?),
            _ => return Err(Status::FormatError("unknown commit root flag")),
        };
        Ok(Self {
            id,
            parents,
            timestamp_ns,
            generation,
            root_node,
        })
    }
}

/// Builds commits with correctly derived ids and generations.
pub struct CommitFactory;

impl CommitFactory {
    /// The distinguished empty commit every page starts from.
    pub fn first_commit() -> Commit {
        Commit {
            id: CommitId::FIRST,
            parents: Vec::new(),
            timestamp_ns: 0,
            generation: 0,
            root_node: None,
        }
    }

    /// Builds a new commit from its parents and new root, deriving its
    /// id from its content and its generation from `1 + max(parent
    /// generations)`.
    pub fn from_parents(parents: &[Commit], root_node: Option<ObjectIdentifier>) -> Commit {
        let generation = parents.iter().map(|p| p.generation).max().unwrap_or(0) + 1;
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let parent_ids: Vec<CommitId> = parents.iter().map(|p| p.id).collect();
        let bytes = Commit::storage_bytes(&parent_ids, timestamp_ns, generation, root_node.as_ref());
        let id = CommitId::new(*blake3::hash(&bytes).as_bytes());
        Commit {
            id,
            parents: parent_ids,
            timestamp_ns,
            generation,
            root_node,
        }
    }
}
