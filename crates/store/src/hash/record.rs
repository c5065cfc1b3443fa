//! Record and free block encoding.
//!
//! ```text
//! record block:  0xC8 check[1] pad[4] next[4|8] key_size[4] value_size[4] key value padding
//! free block:    0xB0 0x00 size[4]
//! ```
//!
//! `next` holds the following block of the bucket chain as an offset shifted
//! right by the alignment power; it is 4 bytes wide in normal mode and 8 in
//! large mode.

use crate::{
    config::Compression,
    encoding::{align_up, get_u32, get_u64, put_u32, put_u64},
    error::{Error, Result},
};

use super::header::HEADER_SIZE;

/// First byte of a live record block.
pub const RECORD_MAGIC: u8 = 0xC8;
/// First byte of a free block.
pub const FREE_MAGIC: u8 = 0xB0;

/// Size of the free block header.
pub const FREE_HEADER_SIZE: usize = 6;

/// Largest file a normal-mode table may grow to.
pub const NORMAL_MODE_LIMIT: u64 = 1 << 31;

/// Byte offset of the `next` field inside a record block.
const NEXT_OFFSET: u64 = 6;

/// Geometry of a table file, fixed at creation (or rebuild).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub(crate) bucket_count: u64,
    pub(crate) alignment_power: u8,
    pub(crate) free_pool_power: u8,
    pub(crate) large: bool,
    pub(crate) compression: Compression,
}

impl Layout {
    pub(crate) fn alignment(&self) -> u64 {
        1u64 << self.alignment_power
    }

    /// Offset of the free-block pool region.
    pub(crate) fn pool_offset(&self) -> u64 {
        HEADER_SIZE as u64
    }

    /// Bytes reserved for the free-block pool.
    pub(crate) fn pool_size(&self) -> u64 {
        8 + 16 * self.pool_capacity() as u64
    }

    pub(crate) fn pool_capacity(&self) -> usize {
        1usize << self.free_pool_power
    }

    pub(crate) fn bucket_width(&self) -> u64 {
        if self.large { 8 } else { 4 }
    }

    pub(crate) fn bucket_offset(&self) -> u64 {
        self.pool_offset() + self.pool_size()
    }

    pub(crate) fn bucket_entry_offset(&self, bucket: u64) -> u64 {
        self.bucket_offset() + bucket * self.bucket_width()
    }

    /// Offset of the first record block.
    pub(crate) fn records_offset(&self) -> u64 {
        align_up(self.bucket_offset() + self.bucket_count * self.bucket_width(), self.alignment())
    }

    /// Size of the record block header.
    pub(crate) fn record_header_size(&self) -> usize {
        if self.large { 22 } else { 18 }
    }

    /// Smallest block worth keeping on its own.
    pub(crate) fn min_block(&self) -> u64 {
        align_up(self.record_header_size() as u64, self.alignment())
    }

    /// Encodes an offset for a bucket slot or `next` field.
    pub(crate) fn encode_offset(&self, offset: u64) -> u64 {
        offset >> self.alignment_power
    }

    pub(crate) fn decode_offset(&self, raw: u64) -> u64 {
        raw << self.alignment_power
    }

    pub(crate) fn read_slot(&self, buf: &[u8], pos: usize) -> u64 {
        let raw = if self.large { get_u64(buf, pos) } else { u64::from(get_u32(buf, pos)) };
        self.decode_offset(raw)
    }

    pub(crate) fn write_slot(&self, offset: u64) -> Vec<u8> {
        let raw = self.encode_offset(offset);
        if self.large { raw.to_le_bytes().to_vec() } else { (raw as u32).to_le_bytes().to_vec() }
    }

    /// File offset of the `next` field of the block at `block`.
    pub(crate) fn next_field(&self, block: u64) -> u64 {
        block + NEXT_OFFSET
    }

    /// Checks that a file of `size` bytes is addressable in this mode.
    pub(crate) fn check_file_size(&self, size: u64) -> Result<()> {
        if !self.large && size > NORMAL_MODE_LIMIT {
            return Err(Error::invalid("file size exceeds the 2 GiB limit of normal mode"));
        }
        Ok(())
    }
}

/// Decoded record block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub(crate) offset: u64,
    pub(crate) check: u8,
    pub(crate) padding: u32,
    pub(crate) next: u64,
    pub(crate) key_size: u32,
    pub(crate) value_size: u32,
    pub(crate) header_size: usize,
}

impl RecordHeader {
    /// Parses a record header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordHeader`] if the magic byte is wrong.
    pub(crate) fn parse(layout: &Layout, offset: u64, buf: &[u8]) -> Result<Self> {
        let header_size = layout.record_header_size();
        if buf.len() < header_size || buf[0] != RECORD_MAGIC {
            return Err(Error::RecordHeader { offset });
        }
        let size_pos = header_size - 8;
        Ok(Self {
            offset,
            check: buf[1],
            padding: get_u32(buf, 2),
            next: layout.read_slot(buf, NEXT_OFFSET as usize),
            key_size: get_u32(buf, size_pos),
            value_size: get_u32(buf, size_pos + 4),
            header_size,
        })
    }

    /// Total bytes occupied by the block.
    pub(crate) fn block_size(&self) -> u64 {
        self.header_size as u64
            + u64::from(self.key_size)
            + u64::from(self.value_size)
            + u64::from(self.padding)
    }

    pub(crate) fn key_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    pub(crate) fn value_offset(&self) -> u64 {
        self.key_offset() + u64::from(self.key_size)
    }
}

/// Bytes a record needs before alignment.
pub(crate) fn record_body_size(layout: &Layout, key: &[u8], value: &[u8]) -> u64 {
    layout.record_header_size() as u64 + key.len() as u64 + value.len() as u64
}

/// Encodes a whole record block of `block_size` bytes.
pub(crate) fn encode_record(
    layout: &Layout,
    check: u8,
    next: u64,
    key: &[u8],
    value: &[u8],
    block_size: u64,
) -> Vec<u8> {
    let header_size = layout.record_header_size();
    let body = record_body_size(layout, key, value);
    let padding = block_size - body;
    let mut buf = vec![0u8; header_size];
    buf[0] = RECORD_MAGIC;
    buf[1] = check;
    put_u32(&mut buf, 2, padding as u32);
    let slot = layout.write_slot(next);
    buf[NEXT_OFFSET as usize..NEXT_OFFSET as usize + slot.len()].copy_from_slice(&slot);
    let size_pos = header_size - 8;
    put_u32(&mut buf, size_pos, key.len() as u32);
    put_u32(&mut buf, size_pos + 4, value.len() as u32);

    buf.reserve(block_size as usize - header_size);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf.resize(block_size as usize, 0);
    buf
}

/// Encodes the header of a free block.
pub(crate) fn encode_free(size: u64) -> [u8; FREE_HEADER_SIZE] {
    let mut buf = [0u8; FREE_HEADER_SIZE];
    buf[0] = FREE_MAGIC;
    put_u32(&mut buf, 2, size as u32);
    buf
}

/// Serializes the free-block pool region.
pub(crate) fn encode_pool(blocks: &[(u64, u64)], region: u64) -> Vec<u8> {
    let mut buf = vec![0u8; region as usize];
    put_u64(&mut buf, 0, blocks.len() as u64);
    for (i, (offset, size)) in blocks.iter().enumerate() {
        let pos = 8 + i * 16;
        put_u64(&mut buf, pos, *offset);
        put_u64(&mut buf, pos + 8, *size);
    }
    buf
}

/// Parses the free-block pool region.
///
/// # Errors
///
/// Returns [`Error::Metadata`] if the entry count overruns the region.
pub(crate) fn decode_pool(buf: &[u8]) -> Result<Vec<(u64, u64)>> {
    let count = get_u64(buf, 0) as usize;
    if 8 + count.saturating_mul(16) > buf.len() {
        return Err(Error::metadata(format!("free-block pool claims {count} entries")));
    }
    Ok((0..count).map(|i| (get_u64(buf, 8 + i * 16), get_u64(buf, 16 + i * 16))).collect())
}
