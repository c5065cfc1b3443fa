//! Column maps and their on-disk encoding.
//!
//! A record value is the concatenation, in column-name order, of
//! `varint(name_len) name varint(value_len) value`. With compression enabled
//! the encoded bytes are stored as `varint(raw_len)` followed by the codec
//! output, so the uncompressed size is known without decompressing.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use crate::{
    config::Compression,
    encoding::{read_varint, write_varint},
    error::{Error, Result},
};

/// The columns of one record, ordered by name.
///
/// Iteration order is always ascending by column name, so a record read back
/// from the table iterates exactly like the map that was stored.
pub type Columns = BTreeMap<String, Vec<u8>>;

/// Reserved column used by the numeric accumulators.
pub const NUMERIC_COLUMN: &str = "_num";

/// Serializes columns into the record value format.
pub fn encode_columns(columns: &Columns) -> Vec<u8> {
    let size: usize = columns.iter().map(|(name, value)| name.len() + value.len() + 4).sum();
    let mut out = Vec::with_capacity(size);
    for (name, value) in columns {
        write_varint(&mut out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
        write_varint(&mut out, value.len() as u64);
        out.extend_from_slice(value);
    }
    out
}

/// Parses a record value back into columns.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the bytes are truncated or a name is not UTF-8.
pub fn decode_columns(bytes: &[u8]) -> Result<Columns> {
    let mut columns = Columns::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let name = take(bytes, &mut pos)?;
        let name = std::str::from_utf8(name)
            .map_err(|e| Error::Codec { reason: format!("column name is not UTF-8: {e}") })?
            .to_string();
        let value = take(bytes, &mut pos)?.to_vec();
        columns.insert(name, value);
    }
    Ok(columns)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_varint(bytes, pos)? as usize;
    let end = pos.checked_add(len).filter(|end| *end <= bytes.len()).ok_or_else(|| {
        Error::Codec { reason: format!("field of {len} bytes overruns record at {pos}") }
    })?;
    let field = &bytes[*pos..end];
    *pos = end;
    Ok(field)
}

/// Looks up one column in an encoded record without building the map.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the bytes are malformed.
pub fn find_column<'a>(bytes: &'a [u8], column: &str) -> Result<Option<&'a [u8]>> {
    let mut pos = 0;
    while pos < bytes.len() {
        let name = take(bytes, &mut pos)?;
        let value = take(bytes, &mut pos)?;
        if name == column.as_bytes() {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Compresses an encoded record with `codec`, framing it with its raw size.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the codec fails.
pub fn compress(codec: Compression, raw: &[u8]) -> Result<Vec<u8>> {
    if codec == Compression::None {
        return Ok(raw.to_vec());
    }
    let mut out = Vec::with_capacity(raw.len() / 2 + 16);
    write_varint(&mut out, raw.len() as u64);
    match codec {
        Compression::None => {},
        Compression::Deflate => {
            let level = flate2::Compression::default();
            let mut encoder = flate2::write::DeflateEncoder::new(out, level);
            encoder.write_all(raw).map_err(codec_error)?;
            out = encoder.finish().map_err(codec_error)?;
        },
        Compression::Bzip2 => {
            let mut encoder = bzip2::write::BzEncoder::new(out, bzip2::Compression::default());
            encoder.write_all(raw).map_err(codec_error)?;
            out = encoder.finish().map_err(codec_error)?;
        },
        Compression::Lz4 => out.extend_from_slice(&lz4_flex::block::compress(raw)),
    }
    Ok(out)
}

/// Reverses [`compress`].
///
/// # Errors
///
/// Returns [`Error::Codec`] if the frame is malformed or the codec fails.
pub fn decompress(codec: Compression, stored: &[u8]) -> Result<Vec<u8>> {
    if codec == Compression::None {
        return Ok(stored.to_vec());
    }
    let mut pos = 0;
    let raw_len = read_varint(stored, &mut pos)? as usize;
    let body = &stored[pos..];
    let raw = match codec {
        Compression::None => body.to_vec(),
        Compression::Deflate => {
            let mut raw = Vec::with_capacity(raw_len);
            flate2::read::DeflateDecoder::new(body).read_to_end(&mut raw).map_err(codec_error)?;
            raw
        },
        Compression::Bzip2 => {
            let mut raw = Vec::with_capacity(raw_len);
            bzip2::read::BzDecoder::new(body).read_to_end(&mut raw).map_err(codec_error)?;
            raw
        },
        Compression::Lz4 => lz4_flex::block::decompress(body, raw_len)
            .map_err(|e| Error::Codec { reason: e.to_string() })?,
    };
    if raw.len() != raw_len {
        return Err(Error::Codec {
            reason: format!("decompressed {} bytes, frame says {raw_len}", raw.len()),
        });
    }
    Ok(raw)
}

/// Returns the uncompressed size of a stored record value.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the frame prefix is malformed.
pub fn raw_size(codec: Compression, stored: &[u8]) -> Result<usize> {
    if codec == Compression::None {
        return Ok(stored.len());
    }
    let mut pos = 0;
    Ok(read_varint(stored, &mut pos)? as usize)
}

fn codec_error(e: std::io::Error) -> Error {
    Error::Codec { reason: e.to_string() }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn sample() -> Columns {
        Columns::from([
            ("zeta".to_string(), b"last".to_vec()),
            ("alpha".to_string(), b"first".to_vec()),
            ("empty".to_string(), Vec::new()),
            ("bin".to_string(), vec![0, 255, 0, 1]),
        ])
    }

    #[test]
    fn test_encode_decode_preserves_name_order() {
        let columns = sample();
        let decoded = decode_columns(&encode_columns(&columns)).unwrap();
        assert_eq!(decoded, columns);
        let names: Vec<_> = decoded.keys().map(String::as_str).collect();
        assert_eq!(names, ["alpha", "bin", "empty", "zeta"]);
        assert_eq!(decoded["empty"], Vec::<u8>::new());
    }

    #[test]
    fn test_empty_map_encodes_to_nothing() {
        assert!(encode_columns(&Columns::new()).is_empty());
        assert!(decode_columns(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_find_column() {
        let encoded = encode_columns(&sample());
        assert_eq!(find_column(&encoded, "zeta").unwrap(), Some(b"last".as_slice()));
        assert_eq!(find_column(&encoded, "empty").unwrap(), Some(b"".as_slice()));
        assert_eq!(find_column(&encoded, "missing").unwrap(), None);
    }

    #[test]
    fn test_truncated_record_is_codec_error() {
        let encoded = encode_columns(&sample());
        let err = decode_columns(&encoded[..encoded.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Codec { .. }));
    }

    #[test]
    fn test_every_codec_round_trips() {
        let raw = encode_columns(&Columns::from([(
            "text".to_string(),
            b"the quick brown fox jumps over the lazy dog ".repeat(50),
        )]));
        let codecs = [Compression::None, Compression::Deflate, Compression::Bzip2, Compression::Lz4];
        for codec in codecs {
            let stored = compress(codec, &raw).unwrap();
            assert_eq!(raw_size(codec, &stored).unwrap(), raw.len());
            assert_eq!(decompress(codec, &stored).unwrap(), raw, "{codec:?}");
            if codec != Compression::None {
                assert!(stored.len() < raw.len(), "{codec:?} did not shrink repetitive input");
            }
        }
    }

    #[test]
    fn test_corrupt_frame_is_rejected() {
        let mut stored = compress(Compression::Lz4, b"some bytes to squeeze").unwrap();
        stored[0] = stored[0].wrapping_add(3);
        assert!(decompress(Compression::Lz4, &stored).is_err());
    }
}
