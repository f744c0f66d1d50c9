#![forbid(unsafe_code)]
//! Checksum primitives shared by the commit log and the content-addressed
//! object store.

/// A running checksum accumulator.
pub trait Checksum: Default {
    /// Feeds more bytes into the running checksum.
    fn update(&mut self, data: &[u8]);
    /// Finalizes the checksum, consuming the accumulated state.
    fn finalize(self) -> u32;
}

/// CRC32 (Castagnoli) accumulator, the workspace's only checksum kind.
#[derive(Default)]
pub struct Crc32Fast(crc32fast::Hasher);

impl Checksum for Crc32Fast {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

/// Computes the CRC32 of the concatenation of `chunks`, without allocating.
pub fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}
