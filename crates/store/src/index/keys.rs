//! Derived index keys.
//!
//! Every index entry is a B+ tree key `derived ++ primary_key` with an empty
//! value. Lexical, token and q-gram derivations escape their bytes
//! (`0x00 -> 0x00 0xFF`) and end with the terminator `0x00 0x01`, which keeps
//! byte order and makes the derived part prefix-free. Decimal keys are a fixed
//! 8-byte order-preserving encoding of the parsed number.

use std::collections::BTreeSet;

use super::IndexKind;
use crate::error::{Error, Result};

/// Longest value (or token) stored verbatim in a derived key.
pub const MAX_INDEXED_VALUE: usize = 512;

/// Longest primary key accepted by a table with indexes.
pub const MAX_INDEXED_PRIMARY_KEY: usize = 1024;

const ESCAPE: u8 = 0xFF;
const TERMINATOR: [u8; 2] = [0x00, 0x01];

/// Escapes `raw` without the terminator. Escaped strings compare like the
/// raw ones, so this is also the prefix of every key derived from a value
/// that starts with `raw`.
pub fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 2);
    for &byte in raw {
        out.push(byte);
        if byte == 0 {
            out.push(ESCAPE);
        }
    }
    out
}

/// Escaped and terminated form of `raw`.
pub fn terminated(raw: &[u8]) -> Vec<u8> {
    let mut out = escape(raw);
    out.extend_from_slice(&TERMINATOR);
    out
}

/// Cuts `raw` to the indexed length.
pub fn truncate(raw: &[u8]) -> &[u8] {
    &raw[..raw.len().min(MAX_INDEXED_VALUE)]
}

/// Lexical derived key, and whether the value had to be truncated.
pub fn lexical_key(value: &[u8]) -> (Vec<u8>, bool) {
    (terminated(truncate(value)), value.len() > MAX_INDEXED_VALUE)
}

/// Parses decimal text the forgiving way: leading whitespace, an optional
/// sign, digits, an optional fraction and exponent. Text that does not start
/// with a number counts as 0.
pub fn parse_decimal(value: &[u8]) -> f64 {
    let start = value.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(value.len());
    let bytes = &value[start..];
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let digits_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut mantissa_digits = end - digits_start;
    if bytes.get(end) == Some(&b'.') {
        let mut frac = end + 1;
        while bytes.get(frac).is_some_and(u8::is_ascii_digit) {
            frac += 1;
        }
        mantissa_digits += frac - end - 1;
        end = frac;
    }
    if mantissa_digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = exp;
        while bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            exp += 1;
        }
        if exp > exp_digits {
            end = exp;
        }
    }
    std::str::from_utf8(&bytes[..end])
        .ok()
        .and_then(|text| text.parse::<f64>().ok())
        .filter(|n| !n.is_nan())
        .unwrap_or(0.0)
}

/// Order-preserving big-endian encoding of a number.
pub fn decimal_key(number: f64) -> [u8; 8] {
    let number = if number.is_nan() || number == 0.0 { 0.0 } else { number };
    let bits = number.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    ordered.to_be_bytes()
}

/// Splits text into its distinct tokens (separated by whitespace or commas).
pub fn tokens(value: &[u8]) -> BTreeSet<Vec<u8>> {
    value
        .split(|b| b.is_ascii_whitespace() || *b == b',')
        .filter(|token| !token.is_empty())
        .map(<[u8]>::to_vec)
        .collect()
}

/// Tokens of a query operand, in the order given.
pub fn operand_tokens(operand: &[u8]) -> Vec<Vec<u8>> {
    let mut seen = BTreeSet::new();
    operand
        .split(|b| b.is_ascii_whitespace() || *b == b',')
        .filter(|token| !token.is_empty() && seen.insert(token.to_vec()))
        .map(<[u8]>::to_vec)
        .collect()
}

/// Distinct 2-character shingles of `value`; the final character also forms
/// a 1-character shingle.
pub fn qgrams(value: &[u8]) -> BTreeSet<Vec<u8>> {
    let text = String::from_utf8_lossy(value);
    let chars: Vec<char> = text.chars().collect();
    (0..chars.len())
        .map(|i| chars[i..(i + 2).min(chars.len())].iter().collect::<String>().into_bytes())
        .collect()
}

/// The 2-character shingles a value must contain for `needle` to be a
/// substring of it. `needle` must have at least two characters.
pub fn needle_bigrams(needle: &str) -> BTreeSet<Vec<u8>> {
    let chars: Vec<char> = needle.chars().collect();
    chars.windows(2).map(|pair| pair.iter().collect::<String>().into_bytes()).collect()
}

/// Every derived key of `value` for an index of `kind`, and whether any part
/// was truncated.
pub fn derived_keys(kind: IndexKind, value: &[u8]) -> (BTreeSet<Vec<u8>>, bool) {
    match kind {
        IndexKind::Lexical => {
            let (key, truncated) = lexical_key(value);
            (BTreeSet::from([key]), truncated)
        },
        IndexKind::Decimal => {
            (BTreeSet::from([decimal_key(parse_decimal(value)).to_vec()]), false)
        },
        IndexKind::Token => {
            (tokens(value).iter().map(|token| terminated(truncate(token))).collect(), false)
        },
        IndexKind::QGram => {
            (qgrams(value).iter().map(Vec::as_slice).map(terminated).collect(), false)
        },
    }
}

/// Builds an index entry key.
pub fn entry_key(derived: &[u8], primary_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(derived.len() + primary_key.len());
    key.extend_from_slice(derived);
    key.extend_from_slice(primary_key);
    key
}

/// Splits an entry key into its derived part and the primary key.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the derived part is malformed.
pub fn split_entry(kind: IndexKind, entry: &[u8]) -> Result<(&[u8], &[u8])> {
    let derived_len = match kind {
        IndexKind::Decimal => {
            if entry.len() < 8 {
                return Err(Error::corrupted("decimal index entry shorter than 8 bytes"));
            }
            8
        },
        IndexKind::Lexical | IndexKind::Token | IndexKind::QGram => {
            let mut i = 0;
            loop {
                match (entry.get(i).copied(), entry.get(i + 1).copied()) {
                    (Some(0), Some(1)) => break i + 2,
                    (Some(0), Some(ESCAPE)) => i += 2,
                    (Some(0), _) | (None, _) => {
                        return Err(Error::corrupted("index entry without terminator"));
                    },
                    (Some(_), _) => i += 1,
                }
            }
        },
    };
    Ok(entry.split_at(derived_len))
}
