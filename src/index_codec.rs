//! Index codec (§4.4, §6) — encode/decode fixed-shape `(key, offset, length)`
//! index entries in the line-oriented format that lives inside the
//! compressed index stream.
//!
//! ```text
//! <key>\t<offset>\t<length>\n
//! ```
//!
//! This module is deliberately ignorant of sorting, compression, and
//! seeking by byte offset to entry boundaries — [`index_builder`] owns
//! sorting, [`codec`] owns compression, and [`retrieve`]'s buffered binary
//! search owns "seek to an arbitrary byte offset and find the next
//! complete line". This module only knows how to turn one entry into bytes
//! and back.

use std::io::{BufRead, Write};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexCodecError {
    #[error("index line has {found} tab-separated fields, expected 3")]
    WrongFieldCount { found: usize },
    #[error("index line has a non-decimal offset field")]
    InvalidOffset,
    #[error("index line has a non-decimal length field")]
    InvalidLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub offset: u64,
    pub length: u64,
}

impl IndexEntry {
    pub fn new(key: Vec<u8>, offset: u64, length: u64) -> Self {
        Self { key, offset, length }
    }

    /// Serialize as one newline-terminated index line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key.len() + 24);
        out.extend_from_slice(&self.key);
        out.push(b'\t');
        out.extend_from_slice(self.offset.to_string().as_bytes());
        out.push(b'\t');
        out.extend_from_slice(self.length.to_string().as_bytes());
        out.push(b'\n');
        out
    }

    pub fn write<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        w.write_all(&self.encode())
    }

    /// Parse one index line. `line` must NOT include the trailing newline.
    pub fn decode(line: &[u8]) -> Result<Self, IndexCodecError> {
        let fields: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
        if fields.len() != 3 {
            return Err(IndexCodecError::WrongFieldCount { found: fields.len() });
        }
        let key = fields[0].to_vec();
        let offset = parse_u64(fields[1]).ok_or(IndexCodecError::InvalidOffset)?;
        let length = parse_u64(fields[2]).ok_or(IndexCodecError::InvalidLength)?;
        Ok(IndexEntry { key, offset, length })
    }
}

fn parse_u64(field: &[u8]) -> Option<u64> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}

/// Iterate decoded entries out of a line-oriented reader (the decompressed
/// index stream, or the raw-index spill file — both use this same format).
pub fn read_entries<R: BufRead>(mut reader: R) -> impl Iterator<Item = Result<IndexEntry, IndexCodecError>> {
    std::iter::from_fn(move || {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                Some(IndexEntry::decode(&line))
            }
            Err(_) => None,
        }
    })
}
