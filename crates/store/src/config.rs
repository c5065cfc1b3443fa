//! Table configuration: tuning, cache sizing and open modes.
//!
//! Tuning fields (`bucket_count`, `alignment_power`, `free_pool_power`,
//! `compression`, `large`) are only consulted when a file is created or
//! rebuilt by `optimize`; an existing file keeps the layout recorded in its
//! header. Cache fields apply on every open.

use std::{fmt, ops};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::error::Error;

/// Default number of hash buckets.
pub const DEFAULT_BUCKET_COUNT: u64 = 131_071;
/// Default record alignment power (16-byte blocks).
pub const DEFAULT_ALIGNMENT_POWER: u8 = 4;
/// Default free-block pool power (1024 entries).
pub const DEFAULT_FREE_POOL_POWER: u8 = 10;
/// Default leaf page cache capacity.
pub const DEFAULT_LEAF_CACHE: usize = 1024;
/// Default non-leaf page cache capacity.
pub const DEFAULT_NONLEAF_CACHE: usize = 512;
/// Default size of the memory-mapped window.
pub const DEFAULT_MAPPED_MEMORY: u64 = 67_108_864;

/// Largest accepted alignment power.
pub const MAX_ALIGNMENT_POWER: u8 = 16;
/// Largest accepted free-block pool power.
pub const MAX_FREE_POOL_POWER: u8 = 20;

/// Configuration validation errors.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A value is outside its accepted range.
    #[snafu(display("Invalid configuration: {message}"))]
    Validation {
        /// Which value and why.
        message: String,
    },
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::InvalidOperation { message: err.to_string() }
    }
}

/// Whole-record compression codec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Records are stored as encoded.
    #[default]
    None,
    /// Deflate (zlib-family).
    Deflate,
    /// Bzip2.
    Bzip2,
    /// The native LZ4 block codec.
    Lz4,
}

impl Compression {
    pub(crate) fn id(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
            Compression::Bzip2 => 2,
            Compression::Lz4 => 3,
        }
    }

    pub(crate) fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Compression::None),
            1 => Some(Compression::Deflate),
            2 => Some(Compression::Bzip2),
            3 => Some(Compression::Lz4),
            _ => None,
        }
    }
}

/// Table configuration.
///
/// # Validation Rules
///
/// - `bucket_count` must be >= 1
/// - `alignment_power` must be <= 16
/// - `free_pool_power` must be <= 20
/// - `leaf_cache` and `nonleaf_cache` must be >= 1
///
/// # Example
///
/// ```no_run
/// # use tabula_store::{Compression, TableConfig};
/// let config = TableConfig::builder()
///     .bucket_count(1021)
///     .compression(Compression::Deflate)
///     .record_cache(4096)
///     .build()
///     .expect("valid table config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TableConfig {
    /// Number of hash buckets in the primary record store.
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u64,
    /// Record blocks are rounded up to `2^alignment_power` bytes.
    #[serde(default = "default_alignment_power")]
    pub alignment_power: u8,
    /// The free-block pool holds at most `2^free_pool_power` entries.
    #[serde(default = "default_free_pool_power")]
    pub free_pool_power: u8,
    /// Whole-record compression codec.
    #[serde(default)]
    pub compression: Compression,
    /// Use 64-bit bucket offsets, lifting the 2 GiB file size ceiling.
    #[serde(default)]
    pub large: bool,
    /// Capacity of the decoded record cache; 0 disables it.
    #[serde(default)]
    pub record_cache: usize,
    /// Capacity of each index's leaf page cache.
    #[serde(default = "default_leaf_cache")]
    pub leaf_cache: usize,
    /// Capacity of each index's non-leaf page cache.
    #[serde(default = "default_nonleaf_cache")]
    pub nonleaf_cache: usize,
    /// Size of the memory-mapped read window; 0 disables mapping.
    #[serde(default = "default_mapped_memory")]
    pub mapped_memory: u64,
    /// Free-block releases between automatic defragmentation passes; 0 disables it.
    #[serde(default)]
    pub defrag_unit: u32,
}

#[bon::bon]
impl TableConfig {
    /// Creates a new table configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_BUCKET_COUNT)] bucket_count: u64,
        #[builder(default = DEFAULT_ALIGNMENT_POWER)] alignment_power: u8,
        #[builder(default = DEFAULT_FREE_POOL_POWER)] free_pool_power: u8,
        #[builder(default)] compression: Compression,
        #[builder(default)] large: bool,
        #[builder(default)] record_cache: usize,
        #[builder(default = DEFAULT_LEAF_CACHE)] leaf_cache: usize,
        #[builder(default = DEFAULT_NONLEAF_CACHE)] nonleaf_cache: usize,
        #[builder(default = DEFAULT_MAPPED_MEMORY)] mapped_memory: u64,
        #[builder(default)] defrag_unit: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            bucket_count,
            alignment_power,
            free_pool_power,
            compression,
            large,
            record_cache,
            leaf_cache,
            nonleaf_cache,
            mapped_memory,
            defrag_unit,
        };
        config.validate()?;
        Ok(config)
    }
}

impl TableConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_count == 0 {
            return Err(ConfigError::Validation {
                message: "bucket_count must be >= 1".to_string(),
            });
        }
        if self.alignment_power > MAX_ALIGNMENT_POWER {
            return Err(ConfigError::Validation {
                message: format!(
                    "alignment_power must be <= {}, got {}",
                    MAX_ALIGNMENT_POWER, self.alignment_power
                ),
            });
        }
        if self.free_pool_power > MAX_FREE_POOL_POWER {
            return Err(ConfigError::Validation {
                message: format!(
                    "free_pool_power must be <= {}, got {}",
                    MAX_FREE_POOL_POWER, self.free_pool_power
                ),
            });
        }
        if self.leaf_cache == 0 || self.nonleaf_cache == 0 {
            return Err(ConfigError::Validation {
                message: "leaf_cache and nonleaf_cache must be >= 1".to_string(),
            });
        }
        if !self.large && self.bucket_count > (1u64 << 31) / 8 {
            return Err(ConfigError::Validation {
                message: format!(
                    "bucket_count {} does not fit a normal-mode file; enable large mode",
                    self.bucket_count
                ),
            });
        }
        Ok(())
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            alignment_power: DEFAULT_ALIGNMENT_POWER,
            free_pool_power: DEFAULT_FREE_POOL_POWER,
            compression: Compression::None,
            large: false,
            record_cache: 0,
            leaf_cache: DEFAULT_LEAF_CACHE,
            nonleaf_cache: DEFAULT_NONLEAF_CACHE,
            mapped_memory: DEFAULT_MAPPED_MEMORY,
            defrag_unit: 0,
        }
    }
}

fn default_bucket_count() -> u64 {
    DEFAULT_BUCKET_COUNT
}

fn default_alignment_power() -> u8 {
    DEFAULT_ALIGNMENT_POWER
}

fn default_free_pool_power() -> u8 {
    DEFAULT_FREE_POOL_POWER
}

fn default_leaf_cache() -> usize {
    DEFAULT_LEAF_CACHE
}

fn default_nonleaf_cache() -> usize {
    DEFAULT_NONLEAF_CACHE
}

fn default_mapped_memory() -> u64 {
    DEFAULT_MAPPED_MEMORY
}

/// Parameters for rebuilding a table with `optimize`.
///
/// Absent fields keep the table's current setting, except `bucket_count`
/// which defaults to `max(2 * records + 1, 1021)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
pub struct OptimizeOptions {
    /// New bucket count.
    pub bucket_count: Option<u64>,
    /// New alignment power.
    pub alignment_power: Option<u8>,
    /// New free-block pool power.
    pub free_pool_power: Option<u8>,
    /// New compression codec.
    pub compression: Option<Compression>,
    /// Switch large mode on or off.
    pub large: Option<bool>,
}

/// How a table file is opened.
///
/// Combine flags with `|`:
///
/// ```
/// # use tabula_store::OpenMode;
/// let mode = OpenMode::WRITER | OpenMode::CREATE | OpenMode::SYNC;
/// assert!(mode.contains(OpenMode::CREATE));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenMode(u32);

impl OpenMode {
    /// Open for reading.
    pub const READER: Self = Self(1 << 0);
    /// Open for reading and writing.
    pub const WRITER: Self = Self(1 << 1);
    /// Create the file if it does not exist (writer only).
    pub const CREATE: Self = Self(1 << 2);
    /// Truncate the file on open (writer only).
    pub const TRUNCATE: Self = Self(1 << 3);
    /// Do not take the advisory file lock.
    pub const NO_LOCK: Self = Self(1 << 4);
    /// Fail immediately instead of waiting for the file lock.
    pub const LOCK_NONBLOCKING: Self = Self(1 << 5);
    /// Sync data files to stable storage on every commit (writer only).
    pub const SYNC: Self = Self(1 << 6);

    const ALL: u32 = (1 << 7) - 1;

    /// Returns the raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds a mode from raw bits, rejecting unknown flags.
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL == 0 { Some(Self(bits)) } else { None }
    }

    /// Returns true if every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true for writer handles.
    pub const fn is_writer(self) -> bool {
        self.contains(Self::WRITER)
    }

    /// Checks that the combination of flags is meaningful.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] unless exactly one of `READER` and
    /// `WRITER` is set, or if a writer-only flag accompanies `READER`.
    pub fn validate(self) -> Result<(), Error> {
        let reader = self.contains(Self::READER);
        let writer = self.contains(Self::WRITER);
        if reader == writer {
            return Err(Error::invalid("open mode needs exactly one of READER or WRITER"));
        }
        let writer_only = Self::CREATE.0 | Self::TRUNCATE.0 | Self::SYNC.0;
        if reader && self.0 & writer_only != 0 {
            return Err(Error::invalid("CREATE, TRUNCATE and SYNC require WRITER"));
        }
        Ok(())
    }
}

impl ops::BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OpenMode, &str); 7] = [
            (OpenMode::READER, "READER"),
            (OpenMode::WRITER, "WRITER"),
            (OpenMode::CREATE, "CREATE"),
            (OpenMode::TRUNCATE, "TRUNCATE"),
            (OpenMode::NO_LOCK, "NO_LOCK"),
            (OpenMode::LOCK_NONBLOCKING, "LOCK_NONBLOCKING"),
            (OpenMode::SYNC, "SYNC"),
        ];
        let names: Vec<&str> =
            NAMES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| *name).collect();
        write!(f, "OpenMode({})", names.join(" | "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_documented_values() {
        let config = TableConfig::builder().build().unwrap();
        assert_eq!(config, TableConfig::default());
        assert_eq!(config.bucket_count, 131_071);
        assert_eq!(config.alignment_power, 4);
        assert_eq!(config.free_pool_power, 10);
        assert_eq!(config.record_cache, 0);
        assert_eq!(config.leaf_cache, 1024);
        assert_eq!(config.nonleaf_cache, 512);
        assert_eq!(config.mapped_memory, 67_108_864);
        assert_eq!(config.defrag_unit, 0);
    }

    #[test]
    fn builder_rejects_out_of_range_values() {
        assert!(TableConfig::builder().bucket_count(0).build().is_err());
        assert!(TableConfig::builder().alignment_power(17).build().is_err());
        assert!(TableConfig::builder().free_pool_power(21).build().is_err());
        assert!(TableConfig::builder().leaf_cache(0).build().is_err());
    }

    #[test]
    fn deserialized_config_fills_defaults() {
        let config: TableConfig =
            serde_json::from_str(r#"{"compression": "bzip2", "record_cache": 10}"#).unwrap();
        assert_eq!(config.compression, Compression::Bzip2);
        assert_eq!(config.record_cache, 10);
        assert_eq!(config.bucket_count, DEFAULT_BUCKET_COUNT);
        config.validate().unwrap();
    }

    #[test]
    fn compression_ids_round_trip() {
        for codec in [Compression::None, Compression::Deflate, Compression::Bzip2, Compression::Lz4]
        {
            assert_eq!(Compression::from_id(codec.id()), Some(codec));
        }
        assert_eq!(Compression::from_id(9), None);
    }

    #[test]
    fn open_mode_validation() {
        assert!(OpenMode::READER.validate().is_ok());
        assert!((OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRUNCATE).validate().is_ok());
        assert!((OpenMode::READER | OpenMode::NO_LOCK).validate().is_ok());
        assert!(OpenMode::default().validate().is_err());
        assert!((OpenMode::READER | OpenMode::WRITER).validate().is_err());
        assert!((OpenMode::READER | OpenMode::CREATE).validate().is_err());
    }

    #[test]
    fn open_mode_bits() {
        assert_eq!(OpenMode::from_bits(0b11), Some(OpenMode::READER | OpenMode::WRITER));
        assert_eq!(OpenMode::from_bits(1 << 9), None);
        let mode = OpenMode::WRITER | OpenMode::SYNC;
        assert_eq!(format!("{mode:?}"), "OpenMode(WRITER | SYNC)");
    }

    #[test]
    fn optimize_options_builder() {
        let options = OptimizeOptions::builder().bucket_count(4093).large(true).build();
        assert_eq!(options.bucket_count, Some(4093));
        assert_eq!(options.alignment_power, None);
        assert_eq!(options.large, Some(true));
    }
}
