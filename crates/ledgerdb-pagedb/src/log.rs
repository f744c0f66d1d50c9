//! The durable append log backing `PageDb`. Each `Batch::commit` writes
//! one checksummed, variable-length frame; recovery replays the log
//! from the start to rebuild the in-memory index.
//!
//! Format mirrors `sombra_wal`'s magic+version file header and
//! checksummed frame header, generalized from that crate's
//! fixed-page-size frames to the variable-length batches `PageDb`
//! needs.

use std::sync::Arc;

use ledgerdb_checksum::compute_crc32;
use ledgerdb_io::FileIo;
use ledgerdb_types::{Result, Status};

const FILE_MAGIC: [u8; 4] = *b"LDPD";
const FILE_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 8;
const FRAME_HEADER_LEN: usize = 8; // 4-byte length + 4-byte crc32

/// A single durable log, append-only, replayable from the start.
pub struct PageLog {
    io: Arc<dyn FileIo>,
    append_offset: parking_lot::Mutex<u64>,
}

impl PageLog {
    /// Opens (creating if absent) a page log backed by `io`.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len().map_err(Status::IoError)?;
        let append_offset = if len < FILE_HEADER_LEN as u64 {
            let mut header = [0u8; FILE_HEADER_LEN];
            header[0..4].copy_from_slice(&FILE_MAGIC);
            header[4..6].copy_from_slice(&FILE_FORMAT_VERSION.to_be_bytes());
            header[6..8].fill(0);
            io.write_at(0, &header).map_err(Status::IoError)?;
            io.truncate(FILE_HEADER_LEN as u64)
                .map_err(Status::IoError)?;
            FILE_HEADER_LEN as u64
        } else {
            let mut header = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut header).map_err(Status::IoError)?;
            if header[0..4] != FILE_MAGIC {
                return Err(Status::FormatError("page log magic mismatch"));
            }
            let version = u16::from_be_bytes(header[4..6].try_into().unwrap());
            if version != FILE_FORMAT_VERSION {
                return Err(Status::FormatError("page log format version mismatch"));
            }
            len
        };
        Ok(Self {
            io,
            append_offset: parking_lot::Mutex::new(append_offset),
        })
    }

    /// Appends one frame containing `payload`, fsyncing before returning.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        let crc = compute_crc32(&[payload]);
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        header[4..8].copy_from_slice(&crc.to_be_bytes());

        let mut offset = self.append_offset.lock();
        self.io.write_at(*offset, &header).map_err(Status::IoError)?;
        self.io
            .write_at(*offset + FRAME_HEADER_LEN as u64, payload)
            .map_err(Status::IoError)?;
        *offset += FRAME_HEADER_LEN as u64 + payload.len() as u64;
        drop(offset);
        self.io.sync_all().map_err(Status::IoError)
    }

    /// Replays every frame from the start of the log, stopping at the
    /// first truncated or corrupt frame (a crash can leave a partially
    /// written final frame; everything before it is still valid).
    pub fn replay(&self, mut visit: impl FnMut(&[u8])) -> Result<()> {
        let len = self.io.len().map_err(Status::IoError)?;
        let mut offset = FILE_HEADER_LEN as u64;
        while offset + FRAME_HEADER_LEN as u64 <= len {
            let mut header = [0u8; FRAME_HEADER_LEN];
            if self.io.read_at(offset, &mut header).is_err() {
                break;
            }
            let payload_len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as u64;
            let expected_crc = u32::from_be_bytes(header[4..8].try_into().unwrap());
            if offset + FRAME_HEADER_LEN as u64 + payload_len > len {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            if self
                .io
                .read_at(offset + FRAME_HEADER_LEN as u64, &mut payload)
                .is_err()
            {
                break;
            }
            if compute_crc32(&[&payload]) != expected_crc {
                break;
            }
            visit(&payload);
            offset += FRAME_HEADER_LEN as u64 + payload_len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerdb_io::MemFileIo;

    #[test]
    fn append_and_replay_round_trips() {
        let io = Arc::new(MemFileIo::new());
        let log = PageLog::open(Arc::clone(&io) as Arc<dyn FileIo>).unwrap();
        log.append(b"first").unwrap();
        log.append(b"second").unwrap();

        let reopened = PageLog::open(io as Arc<dyn FileIo>).unwrap();
        let mut seen = Vec::new();
        reopened.replay(|payload| seen.push(payload.to_vec())).unwrap();
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn replay_stops_at_truncated_tail() {
        let io = Arc::new(MemFileIo::new());
        let log = PageLog::open(Arc::clone(&io) as Arc<dyn FileIo>).unwrap();
        log.append(b"whole").unwrap();
        // Simulate a crash mid-append: truncate off part of the second frame's header.
        let len = io.len().unwrap();
        io.truncate(len + 3).unwrap();

        let mut seen = Vec::new();
        log.replay(|payload| seen.push(payload.to_vec())).unwrap();
        assert_eq!(seen, vec![b"whole".to_vec()]);
    }
}
