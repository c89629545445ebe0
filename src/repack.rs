//! Repacker (§4.3) — streams input records, groups them into bounded-size
//! members, emits a compressed archive and a raw (unsorted, unmerged)
//! index stream of per-member entries.

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::codec::{self, CodecError, CodecKind};
use crate::index_codec::IndexEntry;
use crate::key::{self, FormatError, KeyFormat};

/// Default member size, per spec.md §4.3: 2^14 records.
pub const DEFAULT_MEMBER_RECORD_COUNT: usize = 1 << 14;

#[derive(Debug, Clone)]
pub struct RepackOptions {
    pub member_record_count: usize,
    pub key_format: KeyFormat,
    pub codec: CodecKind,
    pub level: i32,
    /// When true, a record whose key cannot be extracted aborts the run
    /// (§4.3 "Failure semantics"). Default is false: count and skip.
    pub strict: bool,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            member_record_count: DEFAULT_MEMBER_RECORD_COUNT,
            key_format: KeyFormat::Raw,
            codec: CodecKind::Gzip,
            level: CodecKind::Gzip.default_level(),
            strict: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepackStats {
    pub records_written: u64,
    pub records_skipped: u64,
    pub members_written: u64,
}

#[derive(Error, Debug)]
pub enum RepackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("line {line}: {source}")]
    Strict { line: u64, source: FormatError },
}

/// A byte-counting `Write` wrapper — the repacker needs to know the
/// archive's current write position to record each member's `offset`, but
/// `archive_sink` is only required to be `Write` (an object-store writer is
/// typically append-only, not seekable; §6 opener interface).
struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct BufferedRecord {
    key: Vec<u8>,
    line: Vec<u8>,
}

/// How many members are batched together for one call to
/// [`codec::compress_members_parallel`]. Bounds the extra memory a batch
/// holds (at most this many members' worth of uncompressed payload) while
/// still giving the `parallel` feature useful concurrent work.
const COMPRESSION_BATCH_SIZE: usize = 8;

/// Stream `input` through the key extractor, grouping records into members
/// of at most `opts.member_record_count` records each, writing the
/// compressed archive to `archive_sink` and the raw, per-member index
/// entries to `raw_index_sink` (§4.3).
///
/// `raw_index_sink` is unsorted across members by design — [`crate::index_builder`]
/// performs the global sort.
pub fn repack<R: BufRead, WA: Write, WI: Write>(
    mut input: R,
    archive_sink: WA,
    mut raw_index_sink: WI,
    opts: &RepackOptions,
) -> Result<RepackStats, RepackError> {
    let mut archive = CountingWriter::new(archive_sink);
    let mut stats = RepackStats::default();
    let mut buffer: Vec<BufferedRecord> = Vec::with_capacity(opts.member_record_count);
    let mut pending_members: Vec<Vec<BufferedRecord>> = Vec::with_capacity(COMPRESSION_BATCH_SIZE);
    let mut line_no: u64 = 0;
    let mut raw_line = Vec::new();

    loop {
        raw_line.clear();
        let n = input.read_until(b'\n', &mut raw_line)?;
        if n == 0 {
            break;
        }
        line_no += 1;
        let had_newline = raw_line.last() == Some(&b'\n');
        if had_newline {
            raw_line.pop();
        }

        match key::extract_key(&raw_line, &opts.key_format) {
            Ok(key) => {
                buffer.push(BufferedRecord { key, line: raw_line.clone() });
            }
            Err(e) => {
                if opts.strict {
                    return Err(RepackError::Strict { line: line_no, source: e });
                }
                log::warn!("line {line_no}: skipping record, key extraction failed: {e}");
                stats.records_skipped += 1;
                continue;
            }
        }

        if buffer.len() >= opts.member_record_count {
            pending_members.push(std::mem::take(&mut buffer));
            if pending_members.len() >= COMPRESSION_BATCH_SIZE {
                flush_batch(&mut pending_members, &mut archive, &mut raw_index_sink, opts, &mut stats)?;
            }
        }
    }

    if !buffer.is_empty() {
        pending_members.push(buffer);
    }
    if !pending_members.is_empty() {
        flush_batch(&mut pending_members, &mut archive, &mut raw_index_sink, opts, &mut stats)?;
    }

    archive.flush()?;
    raw_index_sink.flush()?;
    Ok(stats)
}

/// Sort, compress, and write a batch of up to [`COMPRESSION_BATCH_SIZE`]
/// members. Compression across the batch runs concurrently when the
/// `parallel` feature is enabled (§E "Supplemented features"); writing and
/// index emission stay strictly in input order regardless.
fn flush_batch<W: Write, WI: Write>(
    pending_members: &mut Vec<Vec<BufferedRecord>>,
    archive: &mut CountingWriter<W>,
    raw_index_sink: &mut WI,
    opts: &RepackOptions,
    stats: &mut RepackStats,
) -> Result<(), RepackError> {
    for member in pending_members.iter_mut() {
        // Stable sort by key (§4.3 step 2a) — records inside a member are
        // sorted on emission, which is what guarantees no cross-member key
        // overlap within a single repack run (§3 invariants).
        member.sort_by(|a, b| a.key.cmp(&b.key));
    }

    let payloads: Vec<Vec<u8>> = pending_members
        .iter()
        .map(|member| {
            let mut payload = Vec::new();
            for record in member {
                payload.extend_from_slice(&record.line);
                payload.push(b'\n');
            }
            payload
        })
        .collect();

    let compressed = codec::compress_members_parallel(opts.codec, &payloads, opts.level)?;

    for (member, compressed) in pending_members.iter().zip(compressed.into_iter()) {
        let offset = archive.count;
        archive.write_all(&compressed)?;
        let length = compressed.len() as u64;

        // Emit one raw-index entry per distinct key (§4.3 step 2d): the
        // member is already key-sorted, so distinct keys are runs of equal
        // keys.
        let mut i = 0;
        while i < member.len() {
            let key = &member[i].key;
            let mut j = i + 1;
            while j < member.len() && &member[j].key == key {
                j += 1;
            }
            IndexEntry::new(key.clone(), offset, length).write(&mut *raw_index_sink)?;
            i = j;
        }

        stats.records_written += member.len() as u64;
        stats.members_written += 1;
        log::debug!("flushed member {} at offset {offset}, {length} bytes, {} records", stats.members_written, member.len());
    }

    pending_members.clear();
    Ok(())
}

/// Index-an-already-chunked-archive mode (§4.3 "Index-only mode").
///
/// Unlike [`repack`], this does not re-sort or re-emit the archive: members
/// are taken as-is, discovered via [`codec::scan_frames`]. Each member is
/// decompressed just long enough to enumerate its keys.
///
/// This deliberately does not special-case a key appearing in more than one
/// member (an open question in spec.md §9): it emits one raw entry per
/// distinct key per member, and lets [`crate::index_builder`] apply its
/// existing same-key/different-member collision check (§4.4 step 2). An
/// externally-chunked archive that violates the no-overlap invariant
/// surfaces as the same `IntegrityError` a corrupted repacker run would.
pub fn index_only<R: codec::ReadSeek + ?Sized, WI: Write>(
    archive_source: &mut R,
    mut raw_index_sink: WI,
    codec_kind: CodecKind,
    key_format: &KeyFormat,
    strict: bool,
) -> Result<RepackStats, RepackError> {
    let mut stats = RepackStats::default();
    let frames = codec::scan_frames(codec_kind, archive_source)?;

    for (offset, length) in frames {
        let payload = codec::decompress_range(codec_kind, archive_source, offset, length)?;
        let mut keys: Vec<Vec<u8>> = Vec::new();

        for (line_no, line) in payload.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            match key::extract_key(line, key_format) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    if strict {
                        return Err(RepackError::Strict { line: line_no as u64, source: e });
                    }
                    log::warn!("member at offset {offset}: skipping record, key extraction failed: {e}");
                    stats.records_skipped += 1;
                }
            }
        }

        keys.sort();
        keys.dedup();
        for key in &keys {
            IndexEntry::new(key.clone(), offset, length).write(&mut raw_index_sink)?;
        }
        stats.records_written += keys.len() as u64;
        stats.members_written += 1;
    }

    raw_index_sink.flush()?;
    Ok(stats)
}
