//! The fixed 1024-byte header at the start of every table file.
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----
//! 0       8      Magic "TABULADB"
//! 8       4      Format version
//! 12      1      Flags (bit 0 large mode, bit 1 open for writing)
//! 13      1      Compression codec id
//! 14      1      Alignment power
//! 15      1      Free-block pool power
//! 16      8      Bucket count
//! 24      8      Record count
//! 32      8      Logical file size
//! 40      8      Offset of the first record block
//! 48      8      Unique-id counter
//! 56      2      Index catalog entry count
//! 64      ...    Catalog entries: name_len u16, name, kind u8
//! 1016    8      XXH3-64 of bytes 0..1016
//! ```

use xxhash_rust::xxh3::xxh3_64;

use crate::{
    config::Compression,
    encoding::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64},
    error::{Error, Result},
    index::IndexKind,
};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 1024;

/// Magic bytes identifying a table file.
pub const MAGIC: &[u8; 8] = b"TABULADB";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

const FLAG_LARGE: u8 = 1 << 0;
const FLAG_OPENED: u8 = 1 << 1;

const CATALOG_OFFSET: usize = 64;
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 8;

/// One secondary index recorded in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Indexed column.
    pub column: String,
    /// Key derivation.
    pub kind: IndexKind,
}

/// Decoded table file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub(crate) large: bool,
    pub(crate) opened: bool,
    pub(crate) compression: Compression,
    pub(crate) alignment_power: u8,
    pub(crate) free_pool_power: u8,
    pub(crate) bucket_count: u64,
    pub(crate) record_count: u64,
    pub(crate) file_size: u64,
    pub(crate) first_record: u64,
    pub(crate) unique_id: u64,
    pub(crate) catalog: Vec<CatalogEntry>,
}

impl Header {
    /// Serializes the header, failing if the catalog does not fit.
    pub(crate) fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        put_u32(&mut buf, 8, FORMAT_VERSION);
        let mut flags = 0;
        if self.large {
            flags |= FLAG_LARGE;
        }
        if self.opened {
            flags |= FLAG_OPENED;
        }
        buf[12] = flags;
        buf[13] = self.compression.id();
        buf[14] = self.alignment_power;
        buf[15] = self.free_pool_power;
        put_u64(&mut buf, 16, self.bucket_count);
        put_u64(&mut buf, 24, self.record_count);
        put_u64(&mut buf, 32, self.file_size);
        put_u64(&mut buf, 40, self.first_record);
        put_u64(&mut buf, 48, self.unique_id);
        put_u16(&mut buf, 56, self.catalog.len() as u16);

        let mut pos = CATALOG_OFFSET;
        for entry in &self.catalog {
            let name = entry.column.as_bytes();
            let end = pos + 2 + name.len() + 1;
            if end > CHECKSUM_OFFSET {
                return Err(Error::invalid("index catalog does not fit in the table header"));
            }
            put_u16(&mut buf, pos, name.len() as u16);
            buf[pos + 2..pos + 2 + name.len()].copy_from_slice(name);
            buf[end - 1] = entry.kind.id();
            pos = end;
        }

        let checksum = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        put_u64(&mut buf, CHECKSUM_OFFSET, checksum);
        Ok(buf)
    }

    /// Parses and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metadata`] on a bad magic, version, checksum or field.
    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::metadata("table header is truncated"));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::metadata("not a table file (bad magic)"));
        }
        let version = get_u32(buf, 8);
        if version != FORMAT_VERSION {
            return Err(Error::metadata(format!("unsupported format version {version}")));
        }
        if xxh3_64(&buf[..CHECKSUM_OFFSET]) != get_u64(buf, CHECKSUM_OFFSET) {
            return Err(Error::metadata("table header checksum mismatch"));
        }

        let flags = buf[12];
        let compression = Compression::from_id(buf[13])
            .ok_or_else(|| Error::metadata(format!("unknown compression id {}", buf[13])))?;
        let bucket_count = get_u64(buf, 16);
        if bucket_count == 0 {
            return Err(Error::metadata("bucket count is zero"));
        }

        let count = get_u16(buf, 56) as usize;
        let mut catalog = Vec::with_capacity(count);
        let mut pos = CATALOG_OFFSET;
        for _ in 0..count {
            if pos + 2 > CHECKSUM_OFFSET {
                return Err(Error::metadata("index catalog overruns the header"));
            }
            let len = get_u16(buf, pos) as usize;
            let end = pos + 2 + len + 1;
            if end > CHECKSUM_OFFSET {
                return Err(Error::metadata("index catalog overruns the header"));
            }
            let column = std::str::from_utf8(&buf[pos + 2..pos + 2 + len])
                .map_err(|_| Error::metadata("index catalog column is not UTF-8"))?
                .to_string();
            let kind = IndexKind::from_id(buf[end - 1])
                .ok_or_else(|| Error::metadata(format!("unknown index kind {}", buf[end - 1])))?;
            catalog.push(CatalogEntry { column, kind });
            pos = end;
        }

        Ok(Self {
            large: flags & FLAG_LARGE != 0,
            opened: flags & FLAG_OPENED != 0,
            compression,
            alignment_power: buf[14],
            free_pool_power: buf[15],
            bucket_count,
            record_count: get_u64(buf, 24),
            file_size: get_u64(buf, 32),
            first_record: get_u64(buf, 40),
            unique_id: get_u64(buf, 48),
            catalog,
        })
    }
}
