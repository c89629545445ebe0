//! Index builder (§4.4) — turns the repacker's raw, per-member index stream
//! into one globally sorted, deduplicated, compressed index.
//!
//! Small raw-index streams are sorted entirely in memory. Once the stream
//! exceeds [`EXTERNAL_SORT_RUN_SIZE`] entries, this spills sorted runs to
//! temporary files and performs a k-way merge, never holding more than one
//! run's worth of raw entries at a time — the external sort spec.md §4.4
//! calls for.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, BufRead, BufReader, Write};

use thiserror::Error;

use crate::codec::{self, CodecError, CodecKind};
use crate::index_codec::{self, IndexCodecError, IndexEntry};

/// Above this many buffered entries, the builder spills a sorted run to
/// disk instead of growing the in-memory buffer further.
pub const EXTERNAL_SORT_RUN_SIZE: usize = 500_000;

#[derive(Error, Debug)]
pub enum IndexBuilderError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    IndexCodec(#[from] IndexCodecError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Fatal (§4.4 step 2, exit code 3): the same key names two different
    /// `(offset, length)` pairs. An index where this holds cannot answer
    /// lookups unambiguously, so building stops rather than picking one.
    #[error("key {key:?} maps to both {first:?} and {second:?}", key = String::from_utf8_lossy(key))]
    Integrity {
        key: Vec<u8>,
        first: (u64, u64),
        second: (u64, u64),
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexBuilderStats {
    pub entries_read: u64,
    pub distinct_keys: u64,
    pub duplicates_collapsed: u64,
}

/// Build the final compressed index from a raw, line-oriented, unsorted
/// `(key, offset, length)` stream.
pub fn build_index<R: BufRead, WI: Write>(
    raw_index: R,
    mut final_index_sink: WI,
    codec: CodecKind,
    level: i32,
) -> Result<IndexBuilderStats, IndexBuilderError> {
    let mut buffer: Vec<IndexEntry> = Vec::new();
    let mut run_files: Vec<tempfile::NamedTempFile> = Vec::new();

    for entry in index_codec::read_entries(raw_index) {
        buffer.push(entry?);
        if buffer.len() >= EXTERNAL_SORT_RUN_SIZE {
            log::debug!("spilling sorted run of {} entries", buffer.len());
            run_files.push(spill_sorted_run(&mut buffer)?);
        }
    }

    let mut sorted_bytes = Vec::new();
    let stats = if run_files.is_empty() {
        let entries_read = buffer.len() as u64;
        let deduped = sort_and_dedupe_in_memory(buffer)?;
        for e in &deduped {
            e.write(&mut sorted_bytes)?;
        }
        IndexBuilderStats {
            entries_read,
            distinct_keys: deduped.len() as u64,
            duplicates_collapsed: entries_read - deduped.len() as u64,
        }
    } else {
        if !buffer.is_empty() {
            run_files.push(spill_sorted_run(&mut buffer)?);
        }
        log::debug!("merging {} sorted runs", run_files.len());
        let mut runs: Vec<Box<dyn Iterator<Item = Result<IndexEntry, IndexCodecError>>>> =
            Vec::with_capacity(run_files.len());
        for f in &run_files {
            let file = f.reopen()?;
            runs.push(Box::new(index_codec::read_entries(BufReader::new(file))));
        }
        k_way_merge_into(runs, &mut sorted_bytes)?
    };

    let compressed = codec::compress_member(codec, &sorted_bytes, level)?;
    final_index_sink.write_all(&compressed)?;
    final_index_sink.flush()?;
    Ok(stats)
}

fn sort_and_dedupe_in_memory(mut entries: Vec<IndexEntry>) -> Result<Vec<IndexEntry>, IndexBuilderError> {
    entries.sort_by(|a, b| a.key.cmp(&b.key).then(a.offset.cmp(&b.offset)).then(a.length.cmp(&b.length)));
    let mut out: Vec<IndexEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match out.last() {
            Some(last) if last.key == entry.key => {
                if last.offset == entry.offset && last.length == entry.length {
                    continue;
                }
                return Err(IndexBuilderError::Integrity {
                    key: entry.key,
                    first: (last.offset, last.length),
                    second: (entry.offset, entry.length),
                });
            }
            _ => out.push(entry),
        }
    }
    Ok(out)
}

fn spill_sorted_run(buffer: &mut Vec<IndexEntry>) -> io::Result<tempfile::NamedTempFile> {
    buffer.sort_by(|a, b| a.key.cmp(&b.key).then(a.offset.cmp(&b.offset)).then(a.length.cmp(&b.length)));
    let mut file = tempfile::NamedTempFile::new()?;
    {
        let mut w = io::BufWriter::new(file.as_file_mut());
        for entry in buffer.iter() {
            entry.write(&mut w)?;
        }
        w.flush()?;
    }
    buffer.clear();
    Ok(file)
}

/// Merge already key-sorted runs, collapsing exact duplicates and failing on
/// same-key/different-value collisions, writing the merged line-oriented
/// entries to `sink`.
fn k_way_merge_into<WI: Write>(
    mut runs: Vec<Box<dyn Iterator<Item = Result<IndexEntry, IndexCodecError>>>>,
    sink: &mut WI,
) -> Result<IndexBuilderStats, IndexBuilderError> {
    let mut heap: BinaryHeap<Reverse<(Vec<u8>, u64, u64, usize)>> = BinaryHeap::new();
    for (i, run) in runs.iter_mut().enumerate() {
        if let Some(entry) = run.next() {
            let e = entry?;
            heap.push(Reverse((e.key, e.offset, e.length, i)));
        }
    }

    let mut stats = IndexBuilderStats::default();
    let mut pending: Option<(Vec<u8>, u64, u64)> = None;

    while let Some(Reverse((key, offset, length, run_idx))) = heap.pop() {
        stats.entries_read += 1;
        if let Some(next) = runs[run_idx].next() {
            let e = next?;
            heap.push(Reverse((e.key, e.offset, e.length, run_idx)));
        }

        match pending {
            Some((ref pkey, poffset, plength)) if *pkey == key => {
                if poffset == offset && plength == length {
                    stats.duplicates_collapsed += 1;
                } else {
                    return Err(IndexBuilderError::Integrity {
                        key,
                        first: (poffset, plength),
                        second: (offset, length),
                    });
                }
            }
            _ => {
                if let Some((pkey, poffset, plength)) = pending.take() {
                    IndexEntry::new(pkey, poffset, plength).write(&mut *sink)?;
                    stats.distinct_keys += 1;
                }
                pending = Some((key, offset, length));
            }
        }
    }
    if let Some((pkey, poffset, plength)) = pending {
        IndexEntry::new(pkey, poffset, plength).write(&mut *sink)?;
        stats.distinct_keys += 1;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn raw(entries: &[(&[u8], u64, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, o, l) in entries {
            IndexEntry::new(k.to_vec(), *o, *l).write(&mut out).unwrap();
        }
        out
    }

    fn decompress_index(compressed: &[u8], codec: CodecKind) -> Vec<IndexEntry> {
        let mut cursor = Cursor::new(compressed.to_vec());
        let bytes = codec::decode_one_member(codec, &mut cursor).unwrap();
        index_codec::read_entries(Cursor::new(bytes)).collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn sorts_and_compresses_small_input() {
        let input = raw(&[(b"c", 20, 5), (b"a", 0, 10), (b"b", 10, 10)]);
        let mut out = Vec::new();
        let stats = build_index(Cursor::new(input), &mut out, CodecKind::Gzip, 6).unwrap();
        assert_eq!(stats.distinct_keys, 3);
        let entries = decompress_index(&out, CodecKind::Gzip);
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    }

    #[test]
    fn collapses_exact_duplicates() {
        let input = raw(&[(b"a", 0, 10), (b"a", 0, 10), (b"b", 10, 5)]);
        let mut out = Vec::new();
        let stats = build_index(Cursor::new(input), &mut out, CodecKind::Gzip, 6).unwrap();
        assert_eq!(stats.distinct_keys, 2);
        assert_eq!(stats.duplicates_collapsed, 1);
    }

    #[test]
    fn rejects_conflicting_offsets_for_same_key() {
        let input = raw(&[(b"a", 0, 10), (b"a", 50, 10)]);
        let mut out = Vec::new();
        let err = build_index(Cursor::new(input), &mut out, CodecKind::Gzip, 6).unwrap_err();
        assert!(matches!(err, IndexBuilderError::Integrity { .. }));
    }

    #[test]
    fn empty_input_produces_well_formed_empty_index() {
        let mut out = Vec::new();
        let stats = build_index(Cursor::new(Vec::new()), &mut out, CodecKind::Gzip, 6).unwrap();
        assert_eq!(stats.distinct_keys, 0);
        let entries = decompress_index(&out, CodecKind::Gzip);
        assert!(entries.is_empty());
    }

    #[test]
    fn external_merge_matches_in_memory_result_for_large_input() {
        let mut entries: Vec<(u64, u64)> = Vec::new();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for i in 0..(EXTERNAL_SORT_RUN_SIZE * 2 + 3) {
            keys.push(format!("k{i:08}").into_bytes());
            entries.push((i as u64, 1));
        }
        // shuffle deterministically by reversing
        let mut pairs: Vec<(Vec<u8>, u64, u64)> =
            keys.iter().cloned().zip(entries.iter().copied()).map(|(k, (o, l))| (k, o, l)).collect();
        pairs.reverse();

        let mut input = Vec::new();
        for (k, o, l) in &pairs {
            IndexEntry::new(k.clone(), *o, *l).write(&mut input).unwrap();
        }

        let mut out = Vec::new();
        let stats = build_index(Cursor::new(input), &mut out, CodecKind::Gzip, 1).unwrap();
        assert_eq!(stats.distinct_keys, pairs.len() as u64);

        let decoded = decompress_index(&out, CodecKind::Gzip);
        assert_eq!(decoded.len(), pairs.len());
        for w in decoded.windows(2) {
            assert!(w[0].key < w[1].key);
        }
    }
}
