//! Retriever (§4.5) — buffered binary search over a decompressed index, plus
//! single-key and bulk record lookup against the archive.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Write};

use thiserror::Error;

use crate::codec::{self, CodecError, CodecKind, ReadSeek};
use crate::index_codec::{IndexCodecError, IndexEntry};
use crate::key::{self, KeyFormat};

/// Once a search range shrinks to this many bytes or fewer, switch to a
/// buffered linear scan rather than continuing to bisect (§4.5.1 "small
/// scope"). Below this size the seek-and-parse overhead of another probe
/// outweighs just reading the range.
pub const DEFAULT_LINEAR_SCAN_THRESHOLD: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("malformed index entry: {0}")]
    IndexCodec(#[from] IndexCodecError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveStats {
    pub keys_found: u64,
    pub keys_missing: u64,
    /// Members that failed to decompress during bulk retrieval. These do
    /// not abort the run (§8 "corrupted member"): retrieval continues with
    /// whatever other members are intact.
    pub codec_errors: u64,
}

/// A fully decompressed, in-memory index, ready for repeated lookups.
///
/// The index is always decompressed as a whole before any lookup — it is
/// one compressed member regardless of how the index builder produced it,
/// and binary search needs random access, which a compressed stream cannot
/// give directly (§4.5 "byte-addressable only after decompression").
pub struct Index {
    buf: Vec<u8>,
}

impl Index {
    pub fn load<R: ReadSeek + ?Sized>(reader: &mut R, codec: CodecKind) -> Result<Self, RetrieveError> {
        let buf = codec::decode_one_member(codec, reader)?;
        Ok(Self { buf })
    }

    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Look up `key`, returning its `(offset, length)` entry if present.
    pub fn search(&self, key: &[u8]) -> Result<Option<IndexEntry>, RetrieveError> {
        self.search_with_threshold(key, DEFAULT_LINEAR_SCAN_THRESHOLD)
    }

    /// Same as [`Index::search`] with an explicit linear-scan threshold —
    /// exposed for benchmarking and property tests.
    pub fn search_with_threshold(&self, key: &[u8], linear_threshold: u64) -> Result<Option<IndexEntry>, RetrieveError> {
        let mut lo: u64 = 0;
        let mut hi: u64 = self.buf.len() as u64;

        loop {
            if hi.saturating_sub(lo) <= linear_threshold {
                return self.linear_scan(lo, hi, key);
            }

            let mid = lo + (hi - lo) / 2;
            let line_start = next_line_start(&self.buf, mid);
            if line_start >= hi {
                // No further entries in range: the key is absent.
                return Ok(None);
            }

            let line = read_line(&self.buf, line_start);
            let entry = IndexEntry::decode(line)?;

            match entry.key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Less => {
                    // Termination rule 1: advancing past this entry leaves
                    // no room in [lo, hi) — the key is absent.
                    let new_lo = line_start + line.len() as u64 + 1;
                    if new_lo >= hi {
                        return Ok(None);
                    }
                    lo = new_lo;
                }
                std::cmp::Ordering::Greater => {
                    // Termination rule 2: the probe landed on the same line
                    // that starts the current range, so bisecting further
                    // would repeat this exact probe forever. Fall back to a
                    // linear scan of the remaining range instead.
                    if line_start == lo {
                        return self.linear_scan(lo, hi, key);
                    }
                    hi = line_start;
                }
            }
        }
    }

    fn linear_scan(&self, lo: u64, hi: u64, key: &[u8]) -> Result<Option<IndexEntry>, RetrieveError> {
        let mut pos = lo;
        while pos < hi {
            let line = read_line(&self.buf, pos);
            if line.is_empty() && pos as usize >= self.buf.len() {
                break;
            }
            let entry = IndexEntry::decode(line)?;
            match entry.key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => {}
            }
            pos += line.len() as u64 + 1;
        }
        Ok(None)
    }
}

/// Given an arbitrary byte position, return the offset of the start of the
/// next complete line at or after it (§4.5.1's "seek to mid, skip to next
/// newline" discipline). Returns `buf.len()` if no further newline exists.
fn next_line_start(buf: &[u8], pos: u64) -> u64 {
    let mut p = pos as usize;
    if p == 0 {
        return 0;
    }
    if p <= buf.len() && buf.get(p - 1) == Some(&b'\n') {
        return p as u64;
    }
    while p < buf.len() && buf[p] != b'\n' {
        p += 1;
    }
    if p < buf.len() {
        p += 1;
    }
    p as u64
}

/// The line (without its trailing newline) starting at `pos`.
fn read_line(buf: &[u8], pos: u64) -> &[u8] {
    let start = pos as usize;
    if start >= buf.len() {
        return &[];
    }
    match buf[start..].iter().position(|&b| b == b'\n') {
        Some(rel) => &buf[start..start + rel],
        None => &buf[start..],
    }
}

/// Fetch the single record named by `key`, or `Ok(None)` if it is absent
/// from the index (§4.5 "KeyNotFound is not an error").
pub fn retrieve_one<R: ReadSeek + ?Sized>(
    index: &Index,
    archive_source: &mut R,
    codec: CodecKind,
    key_format: &KeyFormat,
    key: &[u8],
) -> Result<Option<Vec<u8>>, RetrieveError> {
    let entry = match index.search(key)? {
        Some(e) => e,
        None => return Ok(None),
    };
    let payload = codec::decompress_range(codec, archive_source, entry.offset, entry.length)?;
    for line in payload.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if let Ok(found) = key::extract_key(line, key_format) {
            if found == key {
                return Ok(Some(line.to_vec()));
            }
        }
    }
    Ok(None)
}

/// Fetch many records in one pass (§4.5.2 "bulk retrieval"): queries are
/// grouped by the member that holds them, members are visited in ascending
/// offset order, and each member is decompressed exactly once regardless of
/// how many requested keys it contains.
pub fn retrieve_bulk<R: ReadSeek + ?Sized, W: Write>(
    index: &Index,
    archive_source: &mut R,
    codec: CodecKind,
    key_format: &KeyFormat,
    keys: &[Vec<u8>],
    mut output: W,
) -> Result<RetrieveStats, RetrieveError> {
    let mut stats = RetrieveStats::default();

    let mut dedup_keys: Vec<Vec<u8>> = keys.to_vec();
    dedup_keys.sort();
    dedup_keys.dedup();

    let mut by_member: BTreeMap<(u64, u64), HashSet<Vec<u8>>> = BTreeMap::new();
    for key in &dedup_keys {
        match index.search(key)? {
            Some(entry) => {
                by_member.entry((entry.offset, entry.length)).or_default().insert(key.clone());
                stats.keys_found += 1;
            }
            None => stats.keys_missing += 1,
        }
    }

    // `BTreeMap` iterates in ascending key order, i.e. ascending offset.
    for ((offset, length), wanted) in by_member {
        match codec::decompress_range(codec, archive_source, offset, length) {
            Ok(payload) => {
                for line in payload.split(|&b| b == b'\n') {
                    if line.is_empty() {
                        continue;
                    }
                    if let Ok(found) = key::extract_key(line, key_format) {
                        if wanted.contains(&found) {
                            output.write_all(line)?;
                            output.write_all(b"\n")?;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("member at offset {offset} (length {length}) failed to decompress: {e}");
                stats.codec_errors += 1;
            }
        }
    }

    output.flush()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_index(keys: &[&str]) -> Index {
        let mut buf = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            IndexEntry::new(k.as_bytes().to_vec(), (i * 100) as u64, 50).write(&mut buf).unwrap();
        }
        Index::from_bytes(buf)
    }

    #[test]
    fn finds_present_key_at_every_position() {
        let keys = ["a", "c", "e", "g", "i", "k"];
        let index = build_index(&keys);
        for (i, k) in keys.iter().enumerate() {
            let entry = index.search_with_threshold(k.as_bytes(), 0).unwrap().unwrap();
            assert_eq!(entry.offset, (i * 100) as u64);
        }
    }

    #[test]
    fn returns_none_for_absent_key_below_all() {
        let index = build_index(&["b", "d", "f"]);
        assert!(index.search_with_threshold(b"a", 0).unwrap().is_none());
    }

    #[test]
    fn returns_none_for_absent_key_above_all() {
        let index = build_index(&["b", "d", "f"]);
        assert!(index.search_with_threshold(b"z", 0).unwrap().is_none());
    }

    #[test]
    fn returns_none_for_absent_key_between_entries() {
        let index = build_index(&["b", "d", "f", "h", "j", "l"]);
        for probe in ["a", "c", "e", "g", "i", "k", "m"] {
            assert!(
                index.search_with_threshold(probe.as_bytes(), 0).unwrap().is_none(),
                "expected {probe} absent"
            );
        }
    }

    #[test]
    fn empty_index_always_misses() {
        let index = Index::from_bytes(Vec::new());
        assert!(index.search(b"anything").unwrap().is_none());
    }

    #[test]
    fn single_entry_index_hits_and_misses() {
        let index = build_index(&["m"]);
        assert!(index.search_with_threshold(b"m", 0).unwrap().is_some());
        assert!(index.search_with_threshold(b"a", 0).unwrap().is_none());
        assert!(index.search_with_threshold(b"z", 0).unwrap().is_none());
    }

    #[test]
    fn large_scope_threshold_falls_back_to_linear_scan_immediately() {
        let keys = ["a", "b", "c", "d", "e"];
        let index = build_index(&keys);
        // threshold >= buf len forces the very first iteration into linear scan.
        let entry = index.search_with_threshold(b"d", 1 << 20).unwrap().unwrap();
        assert_eq!(entry.key, b"d");
    }

    #[test]
    fn retrieve_one_resolves_from_archive() {
        let mut archive = Vec::new();
        let m0 = codec::compress_member(CodecKind::Gzip, b"{\"id\":\"a\",\"v\":1}\n{\"id\":\"b\",\"v\":2}\n", 6).unwrap();
        let off = 0u64;
        let len = m0.len() as u64;
        archive.extend_from_slice(&m0);

        let mut index_buf = Vec::new();
        IndexEntry::new(b"a".to_vec(), off, len).write(&mut index_buf).unwrap();
        IndexEntry::new(b"b".to_vec(), off, len).write(&mut index_buf).unwrap();
        let index = Index::from_bytes(index_buf);

        let mut source = Cursor::new(archive);
        let found = retrieve_one(&index, &mut source, CodecKind::Gzip, &KeyFormat::json("id"), b"b").unwrap();
        assert_eq!(found.unwrap(), b"{\"id\":\"b\",\"v\":2}".to_vec());

        let missing = retrieve_one(&index, &mut source, CodecKind::Gzip, &KeyFormat::json("id"), b"z").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn retrieve_bulk_spans_multiple_members_in_ascending_order() {
        let m0 = codec::compress_member(CodecKind::Gzip, b"{\"id\":\"a\"}\n", 6).unwrap();
        let m1 = codec::compress_member(CodecKind::Gzip, b"{\"id\":\"b\"}\n{\"id\":\"c\"}\n", 6).unwrap();
        let off0 = 0u64;
        let len0 = m0.len() as u64;
        let off1 = len0;
        let len1 = m1.len() as u64;
        let mut archive = Vec::new();
        archive.extend_from_slice(&m0);
        archive.extend_from_slice(&m1);

        let mut index_buf = Vec::new();
        IndexEntry::new(b"a".to_vec(), off0, len0).write(&mut index_buf).unwrap();
        IndexEntry::new(b"b".to_vec(), off1, len1).write(&mut index_buf).unwrap();
        IndexEntry::new(b"c".to_vec(), off1, len1).write(&mut index_buf).unwrap();
        let index = Index::from_bytes(index_buf);

        let mut source = Cursor::new(archive);
        let mut out = Vec::new();
        let stats = retrieve_bulk(
            &index,
            &mut source,
            CodecKind::Gzip,
            &KeyFormat::json("id"),
            &[b"a".to_vec(), b"c".to_vec(), b"missing".to_vec()],
            &mut out,
        )
        .unwrap();

        assert_eq!(stats.keys_found, 2);
        assert_eq!(stats.keys_missing, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"a\""));
        assert!(text.contains("\"c\""));
        assert!(!text.contains("\"b\""));
    }

    #[test]
    fn corrupted_member_does_not_abort_retrieval_of_others() {
        let m0 = codec::compress_member(CodecKind::Gzip, b"{\"id\":\"a\"}\n", 6).unwrap();
        let mut m1 = codec::compress_member(CodecKind::Gzip, b"{\"id\":\"b\"}\n", 6).unwrap();
        // flip a byte in the middle of m1's compressed stream
        let mid = m1.len() / 2;
        m1[mid] ^= 0xFF;

        let off0 = 0u64;
        let len0 = m0.len() as u64;
        let off1 = len0;
        let len1 = m1.len() as u64;
        let mut archive = Vec::new();
        archive.extend_from_slice(&m0);
        archive.extend_from_slice(&m1);

        let mut index_buf = Vec::new();
        IndexEntry::new(b"a".to_vec(), off0, len0).write(&mut index_buf).unwrap();
        IndexEntry::new(b"b".to_vec(), off1, len1).write(&mut index_buf).unwrap();
        let index = Index::from_bytes(index_buf);

        let mut source = Cursor::new(archive);
        let mut out = Vec::new();
        let stats = retrieve_bulk(
            &index,
            &mut source,
            CodecKind::Gzip,
            &KeyFormat::json("id"),
            &[b"a".to_vec(), b"b".to_vec()],
            &mut out,
        )
        .unwrap();

        assert_eq!(stats.codec_errors, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"a\""));
    }
}
