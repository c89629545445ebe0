//! Frame-boundary-aware compressor/decompressor for gzip and zstd.
//!
//! # Member == frame
//! A "member" in this crate's archive is always exactly one standalone codec
//! frame: one RFC 1952 gzip member, or one zstd (RFC 8878) frame. Tying
//! member boundaries to codec frame boundaries is what makes
//! [`decompress_range`] correct without any archive-wide state — every
//! member is independently decodable, and a plain `gunzip`/`zstd -d` over
//! the whole archive file produces the full, uninterrupted record stream
//! (concatenated gzip members and concatenated zstd frames are both valid
//! inputs to their respective standard decompressors).
//!
//! # On-disk format
//! There is no custom wrapper around frames — archive bytes are exactly
//! what `flate2`/`zstd` emit. This is deliberate: byte-for-byte
//! compatibility with standard tools is a hard requirement (§6).

use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};

use thiserror::Error;

/// Trait alias for "a source we can both read and seek" — every codec
/// operation that needs exact frame-boundary accounting needs `Seek`,
/// because the underlying codec crates buffer their input internally and
/// only `Seek::seek(SeekFrom::Current(0))` reports the true logical
/// position once buffered-but-unconsumed bytes are accounted for.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek + ?Sized> ReadSeek for T {}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("gzip frame error: {0}")]
    Gzip(String),
    #[error("zstd frame error: {0}")]
    Zstd(String),
    #[error("empty input: no frame to decode")]
    NoFrame,
}

/// The two codecs this crate supports, per spec.md §1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Gzip,
    Zstd,
}

impl CodecKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::Gzip => "gzip",
            CodecKind::Zstd => "zstd",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Some(CodecKind::Gzip),
            "zstd" | "zst" => Some(CodecKind::Zstd),
            _ => None,
        }
    }

    /// Infer a codec from a file extension, as the CLI façade does when
    /// `--codec` is omitted (§6).
    pub fn from_extension(path: &std::path::Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") | Some("gzip") => Some(CodecKind::Gzip),
            Some("zst") | Some("zstd") => Some(CodecKind::Zstd),
            _ => None,
        }
    }

    /// A sane default compression level for this codec.
    pub fn default_level(self) -> i32 {
        match self {
            CodecKind::Gzip => 6,
            CodecKind::Zstd => 3,
        }
    }
}

/// Compress `data` as a single standalone member (one complete frame).
///
/// This is the whole-member-at-once analogue of spec.md's
/// `open_member_writer` / `finish_member` pair: the repacker buffers a
/// member's records in memory before this is called (§4.3 step 2), so there
/// is no benefit to incremental streaming here — one frame in, one frame
/// out, matching what `decode_one_member` expects to read back.
pub fn compress_member(codec: CodecKind, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    match codec {
        CodecKind::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(
                Vec::new(),
                flate2::Compression::new(level.clamp(0, 9) as u32),
            );
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        CodecKind::Zstd => {
            zstd::encode_all(data, level).map_err(|e| CodecError::Zstd(e.to_string()))
        }
    }
}

/// Decode exactly one member (one standalone frame) starting at `reader`'s
/// current position, leaving `reader` positioned at the first byte after
/// the frame.
///
/// Returns [`CodecError::NoFrame`] if `reader` is already at EOF — callers
/// (`scan_frames`) use this to detect the end of the archive.
pub fn decode_one_member<R: ReadSeek + ?Sized>(
    codec: CodecKind,
    reader: &mut R,
) -> Result<Vec<u8>, CodecError> {
    let start = reader.stream_position()?;
    let mut out = Vec::new();

    // `BufReader::fill_buf` does one greedy read of up to its capacity, which
    // routinely pulls bytes from the *next* frame into its internal buffer.
    // Those extra bytes are never consumed by the decoder, but the
    // underlying `reader`'s position has already moved past all of them. We
    // have to seek `reader` back by whatever is left in the `BufReader`'s
    // buffer once decoding stops, so `reader`'s position lands exactly at
    // the end of this frame rather than wherever the last greedy read
    // happened to reach.
    let decode_result = match codec {
        CodecKind::Gzip => {
            let mut buffered = BufReader::new(&mut *reader);
            let result = flate2::bufread::GzDecoder::new(&mut buffered)
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Gzip(e.to_string()));
            let unread = buffered.buffer().len() as i64;
            drop(buffered);
            reader.seek(SeekFrom::Current(-unread))?;
            result
        }
        CodecKind::Zstd => {
            let mut buffered = BufReader::new(&mut *reader);
            let result = (|| {
                zstd::stream::read::Decoder::new(&mut buffered)
                    .map_err(|e| CodecError::Zstd(e.to_string()))?
                    .single_frame()
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::Zstd(e.to_string()))
            })();
            let unread = buffered.buffer().len() as i64;
            drop(buffered);
            reader.seek(SeekFrom::Current(-unread))?;
            result
        }
    };

    let end = reader.stream_position()?;
    if end == start {
        return Err(CodecError::NoFrame);
    }
    decode_result.map(|_| out)
}

/// Parse frame boundaries from a seekable compressed source without fully
/// decompressing payloads where avoidable (§4.1 `scan_frames`).
///
/// Used only in the "index an already-chunked archive" path (§4.3
/// index-only mode): each returned `(offset, length)` pair is one member.
pub fn scan_frames<R: ReadSeek + ?Sized>(
    codec: CodecKind,
    reader: &mut R,
) -> Result<Vec<(u64, u64)>, CodecError> {
    let mut frames = Vec::new();
    loop {
        let start = reader.stream_position()?;
        match decode_one_member(codec, reader) {
            Ok(_) => {
                let end = reader.stream_position()?;
                frames.push((start, end - start));
            }
            Err(CodecError::NoFrame) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(frames)
}

/// Compress several independent member payloads, one per call to
/// [`compress_member`]. With the `parallel` feature enabled this runs across
/// a Rayon thread pool; otherwise it is equivalent to a sequential `map`.
/// Output order always matches input order.
pub fn compress_members_parallel(
    codec: CodecKind,
    payloads: &[Vec<u8>],
    level: i32,
) -> Result<Vec<Vec<u8>>, CodecError> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        payloads.par_iter().map(|p| compress_member(codec, p, level)).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        payloads.iter().map(|p| compress_member(codec, p, level)).collect()
    }
}

/// Read exactly `length` bytes starting at `offset` in `source` and
/// decompress them as one or more standalone frames into the concatenated
/// record stream they decode to (§4.1 `decompress_range`).
///
/// A member is always exactly one frame, but this loops in case the range
/// was produced by an index-only scan over a pre-chunked archive whose
/// "members" happen to coincide with more than one underlying frame.
pub fn decompress_range<R: Read + Seek + ?Sized>(
    codec: CodecKind,
    source: &mut R,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, CodecError> {
    source.seek(SeekFrom::Start(offset))?;
    let mut raw = vec![0u8; length as usize];
    source.read_exact(&mut raw)?;

    let mut cursor = Cursor::new(raw);
    let mut out = Vec::new();
    loop {
        match decode_one_member(codec, &mut cursor) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(CodecError::NoFrame) => break,
            Err(e) => return Err(e),
        }
        if cursor.position() >= cursor.get_ref().len() as u64 {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_roundtrip_single_member() {
        let data = b"hello\nworld\n";
        let compressed = compress_member(CodecKind::Gzip, data, 6).unwrap();
        let mut cursor = Cursor::new(compressed);
        let decoded = decode_one_member(CodecKind::Gzip, &mut cursor).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn zstd_roundtrip_single_member() {
        let data = b"hello\nworld\n";
        let compressed = compress_member(CodecKind::Zstd, data, 3).unwrap();
        let mut cursor = Cursor::new(compressed);
        let decoded = decode_one_member(CodecKind::Zstd, &mut cursor).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn scan_frames_finds_each_member_gzip() {
        let mut archive = Vec::new();
        let mut expected_lens = Vec::new();
        for chunk in [&b"a\nb\n"[..], &b"c\n"[..], &b"d\ne\nf\n"[..]] {
            let compressed = compress_member(CodecKind::Gzip, chunk, 6).unwrap();
            expected_lens.push(compressed.len() as u64);
            archive.extend_from_slice(&compressed);
        }
        let mut cursor = Cursor::new(archive);
        let frames = scan_frames(CodecKind::Gzip, &mut cursor).unwrap();
        assert_eq!(frames.len(), 3);
        let mut expected_offset = 0u64;
        for (i, (offset, length)) in frames.iter().enumerate() {
            assert_eq!(*offset, expected_offset);
            assert_eq!(*length, expected_lens[i]);
            expected_offset += expected_lens[i];
        }
    }

    #[test]
    fn decompress_range_recovers_one_member_zstd() {
        let mut archive = Vec::new();
        let m0 = compress_member(CodecKind::Zstd, b"one\ntwo\n", 3).unwrap();
        let m1 = compress_member(CodecKind::Zstd, b"three\n", 3).unwrap();
        let off1 = m0.len() as u64;
        let len1 = m1.len() as u64;
        archive.extend_from_slice(&m0);
        archive.extend_from_slice(&m1);

        let mut cursor = Cursor::new(archive);
        let decoded = decompress_range(CodecKind::Zstd, &mut cursor, off1, len1).unwrap();
        assert_eq!(decoded, b"three\n");
    }

    #[test]
    fn empty_input_has_no_frames() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(scan_frames(CodecKind::Gzip, &mut cursor).unwrap().is_empty());
    }

    #[test]
    fn scan_frames_finds_each_member_zstd() {
        // Same over-read hazard as the gzip case, exercised against the
        // other codec backend.
        let mut archive = Vec::new();
        let mut expected_lens = Vec::new();
        for chunk in [&b"a\nb\n"[..], &b"c\n"[..], &b"d\ne\nf\n"[..]] {
            let compressed = compress_member(CodecKind::Zstd, chunk, 3).unwrap();
            expected_lens.push(compressed.len() as u64);
            archive.extend_from_slice(&compressed);
        }
        let mut cursor = Cursor::new(archive);
        let frames = scan_frames(CodecKind::Zstd, &mut cursor).unwrap();
        assert_eq!(frames.len(), 3);
        let mut expected_offset = 0u64;
        for (i, (offset, length)) in frames.iter().enumerate() {
            assert_eq!(*offset, expected_offset);
            assert_eq!(*length, expected_lens[i]);
            expected_offset += expected_lens[i];
        }
    }

    #[test]
    fn decompress_range_recovers_multiple_frames_in_one_range() {
        // A declared range spanning more than one underlying frame must
        // decode all of them, not just the first (this is the scenario the
        // multi-frame loop in `decompress_range` exists for).
        let m0 = compress_member(CodecKind::Gzip, b"one\ntwo\n", 6).unwrap();
        let m1 = compress_member(CodecKind::Gzip, b"three\n", 6).unwrap();
        let m2 = compress_member(CodecKind::Gzip, b"four\n", 6).unwrap();
        let range_len = (m1.len() + m2.len()) as u64;
        let offset = m0.len() as u64;

        let mut archive = Vec::new();
        archive.extend_from_slice(&m0);
        archive.extend_from_slice(&m1);
        archive.extend_from_slice(&m2);

        let mut cursor = Cursor::new(archive);
        let decoded = decompress_range(CodecKind::Gzip, &mut cursor, offset, range_len).unwrap();
        assert_eq!(decoded, b"three\nfour\n");
    }
}
