//! # gzipi — random-like access to line-oriented records in block-compressed archives
//!
//! Format guarantees:
//! - An archive is a concatenation of standalone gzip members or zstd
//!   frames; any standard `gunzip`/`zstd -d` decodes the whole archive with
//!   no custom framing involved
//! - The companion index is itself one compressed member: a sorted,
//!   line-oriented `key\toffset\tlength\n` stream
//! - A key names at most one `(offset, length)` pair once the index is
//!   built; the index builder treats a key naming two different pairs as a
//!   fatal integrity error rather than picking one arbitrarily
//! - Lookups never require decompressing the whole archive: only the
//!   member(s) holding the requested key(s) are decompressed

pub mod cli;
pub mod codec;
pub mod error;
pub mod index_builder;
pub mod index_codec;
pub mod key;
pub mod opener;
pub mod repack;
pub mod retrieve;

pub use codec::{CodecError, CodecKind};
pub use error::Error;
pub use index_builder::{build_index, IndexBuilderError, IndexBuilderStats};
pub use index_codec::{IndexCodecError, IndexEntry};
pub use key::{FormatError, KeyFormat};
pub use opener::{LocalOpener, Opener, TempOutput};
pub use repack::{repack, RepackError, RepackOptions, RepackStats};
pub use retrieve::{retrieve_bulk, retrieve_one, Index, RetrieveError, RetrieveStats};

pub type Result<T> = std::result::Result<T, Error>;
