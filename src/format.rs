//! On-disk layout: super-header, TOC slots, manifests.
//!
//! The fixed-width binary header here is grounded on `libsql-wal/src/log.rs`'s
//! zerocopy `LogHeader` and the magic/crc framing in `sombra`'s `wal/mod.rs`.
//! All integers little-endian.

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{RetrievalError, Result};

pub const SUPER_HEADER_MAGIC: u32 = 0x5332_5657; // "WV2S"
pub const VECTOR_BLOB_MAGIC: u32 = 0x5632_5657; // "WV2V"
pub const SUPER_HEADER_LEN: usize = 4096;
pub const TOC_SLOT_LEN: usize = 256;

/// One manifest entry: `(offset, length, checksum, aux)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct Manifest {
    pub offset: U64,
    pub length: U64,
    pub checksum: U64,
    /// `logical_stamp`-adjacent auxiliary field (e.g. doc count, vector count).
    pub aux: U64,
}

impl Manifest {
    pub const LEN: usize = 32;

    pub fn empty() -> Self {
        Self { offset: U64::ZERO, length: U64::ZERO, checksum: U64::ZERO, aux: U64::ZERO }
    }

    pub fn new(offset: u64, length: u64, checksum: u64, aux: u64) -> Self {
        Self {
            offset: U64::new(offset),
            length: U64::new(length),
            checksum: U64::new(checksum),
            aux: U64::new(aux),
        }
    }
}

/// A TOC slot: `logical_stamp | frame_log_manifest | lex_manifest | vec_manifest | wal_region | checksum`.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct TocSlot {
    pub logical_stamp: U64,
    pub frame_log_manifest: Manifest,
    pub lex_manifest: Manifest,
    pub vec_manifest: Manifest,
    pub wal_region_offset: U64,
    pub wal_region_size: U64,
    pub checksum: U64,
}

impl TocSlot {
    /// Checksum is computed over every field except the checksum itself.
    pub fn compute_checksum(&self) -> u64 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.logical_stamp.as_bytes());
        hasher.update(self.frame_log_manifest.as_bytes());
        hasher.update(self.lex_manifest.as_bytes());
        hasher.update(self.vec_manifest.as_bytes());
        hasher.update(self.wal_region_offset.as_bytes());
        hasher.update(self.wal_region_size.as_bytes());
        hasher.finalize() as u64
    }

    pub fn finalize_checksum(&mut self) {
        self.checksum = U64::new(self.compute_checksum());
    }

    pub fn verify(&self) -> Result<()> {
        if self.checksum.get() != self.compute_checksum() {
            return Err(RetrievalError::invalid_toc("toc slot checksum mismatch"));
        }
        Ok(())
    }

    pub fn empty() -> Self {
        Self {
            logical_stamp: U64::ZERO,
            frame_log_manifest: Manifest::empty(),
            lex_manifest: Manifest::empty(),
            vec_manifest: Manifest::empty(),
            wal_region_offset: U64::ZERO,
            wal_region_size: U64::ZERO,
            checksum: U64::ZERO,
        }
    }
}

/// Fixed-size 4 KiB region at file offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct SuperHeader {
    pub magic: U32,
    pub major_version: U16,
    pub minor_version: U16,
    pub created_ms: U64,
    pub dimension_hint: U32,
    pub live_toc: u8,
    pub reserved: [u8; 7],
    pub toc_slot_a: TocSlot,
    pub toc_slot_b: TocSlot,
}

const _: () = assert!(std::mem::size_of::<SuperHeader>() <= SUPER_HEADER_LEN);

impl SuperHeader {
    pub fn new(created_ms: u64, dimension_hint: u32) -> Self {
        let mut toc_slot_a = TocSlot::empty();
        toc_slot_a.finalize_checksum();
        let mut toc_slot_b = TocSlot::empty();
        toc_slot_b.finalize_checksum();
        Self {
            magic: U32::new(SUPER_HEADER_MAGIC),
            major_version: U16::new(2),
            minor_version: U16::new(0),
            created_ms: U64::new(created_ms),
            dimension_hint: U32::new(dimension_hint),
            live_toc: 0,
            reserved: [0; 7],
            toc_slot_a,
            toc_slot_b,
        }
    }

    pub fn live_slot(&self) -> &TocSlot {
        if self.live_toc == 0 { &self.toc_slot_a } else { &self.toc_slot_b }
    }

    pub fn inactive_slot_mut(&mut self) -> &mut TocSlot {
        if self.live_toc == 0 { &mut self.toc_slot_b } else { &mut self.toc_slot_a }
    }

    /// Flip the "live TOC" pointer — a single-byte write in the real on-disk
    /// header.
    pub fn flip_live(&mut self) {
        self.live_toc = if self.live_toc == 0 { 1 } else { 0 };
    }

    pub fn to_padded_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SUPER_HEADER_LEN];
        let header_bytes = self.as_bytes();
        buf[..header_bytes.len()].copy_from_slice(header_bytes);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < std::mem::size_of::<SuperHeader>() {
            return Err(RetrievalError::invalid_toc("super-header truncated"));
        }
        let header = Self::read_from_prefix(bytes)
            .ok_or_else(|| RetrievalError::invalid_toc("super-header layout mismatch"))?;
        if header.magic.get() != SUPER_HEADER_MAGIC {
            return Err(RetrievalError::invalid_toc("super-header magic mismatch"));
        }
        Ok(header)
    }

    /// Open protocol: choose the TOC whose checksum matches and whose
    /// `logical_stamp` is greater; fall back to the other slot on checksum
    /// failure.
    pub fn select_valid_toc(&self) -> Result<&TocSlot> {
        let a_ok = self.toc_slot_a.verify().is_ok();
        let b_ok = self.toc_slot_b.verify().is_ok();
        match (a_ok, b_ok) {
            (true, true) => {
                if self.toc_slot_a.logical_stamp.get() >= self.toc_slot_b.logical_stamp.get() {
                    Ok(&self.toc_slot_a)
                } else {
                    Ok(&self.toc_slot_b)
                }
            }
            (true, false) => Ok(&self.toc_slot_a),
            (false, true) => Ok(&self.toc_slot_b),
            (false, false) => Err(RetrievalError::invalid_toc("both toc slots failed checksum")),
        }
    }
}

/// Vector blob header. Followed by `vector_count * dimensions * 4` bytes of
/// row-major f32, then `vector_count * 8` bytes of frame ids.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct VectorBlobHeader {
    pub magic: U32,
    pub version: U16,
    pub encoding: u8,
    pub similarity: u8,
    pub dimensions: U32,
    pub vector_count: U64,
    pub vector_bytes_len: U64,
    pub reserved: U64,
}

impl VectorBlobHeader {
    pub const LEN: usize = 36;

    pub fn new(dimensions: u32, vector_count: u64, similarity: u8) -> Self {
        Self {
            magic: U32::new(VECTOR_BLOB_MAGIC),
            version: U16::new(1),
            encoding: 2, // metal-compatible row-major f32
            similarity,
            dimensions: U32::new(dimensions),
            vector_count: U64::new(vector_count),
            vector_bytes_len: U64::new(vector_count * dimensions as u64 * 4),
            reserved: U64::ZERO,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = Self::read_from_prefix(bytes)
            .ok_or_else(|| RetrievalError::encoding("vector blob header truncated"))?;
        if header.magic.get() != VECTOR_BLOB_MAGIC {
            return Err(RetrievalError::encoding("vector blob magic mismatch"));
        }
        if header.version.get() != 1 {
            return Err(RetrievalError::encoding("unsupported vector blob version"));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toc_slot_checksum_round_trips() {
        let mut slot = TocSlot::empty();
        slot.logical_stamp = U64::new(7);
        slot.finalize_checksum();
        assert!(slot.verify().is_ok());
    }

    #[test]
    fn toc_slot_detects_corruption() {
        let mut slot = TocSlot::empty();
        slot.logical_stamp = U64::new(7);
        slot.finalize_checksum();
        slot.logical_stamp = U64::new(8);
        assert!(slot.verify().is_err());
    }

    #[test]
    fn select_valid_toc_prefers_higher_stamp() {
        let mut header = SuperHeader::new(0, 256);
        header.toc_slot_a.logical_stamp = U64::new(1);
        header.toc_slot_a.finalize_checksum();
        header.toc_slot_b.logical_stamp = U64::new(2);
        header.toc_slot_b.finalize_checksum();
        let chosen = header.select_valid_toc().unwrap();
        assert_eq!(chosen.logical_stamp.get(), 2);
    }

    #[test]
    fn select_valid_toc_falls_back_on_corruption() {
        let mut header = SuperHeader::new(0, 256);
        header.toc_slot_a.logical_stamp = U64::new(5);
        header.toc_slot_a.finalize_checksum();
        header.toc_slot_b.logical_stamp = U64::new(9);
        header.toc_slot_b.finalize_checksum();
        header.toc_slot_b.logical_stamp = U64::new(10); // corrupt b after the fact
        let chosen = header.select_valid_toc().unwrap();
        assert_eq!(chosen.logical_stamp.get(), 5);
    }

    #[test]
    fn super_header_round_trips_bytes() {
        let header = SuperHeader::new(1234, 256);
        let bytes = header.to_padded_bytes();
        let parsed = SuperHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.created_ms.get(), 1234);
        assert_eq!(parsed.dimension_hint.get(), 256);
    }
}
