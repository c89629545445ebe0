//! Crate-level error type and the exit-code mapping the CLI façade uses.
//!
//! Each module that owns a failure domain defines its own `thiserror` enum
//! (`codec::CodecError`, `key::FormatError`, `index_codec::IndexCodecError`,
//! `repack::RepackError`, `index_builder::IndexBuilderError`,
//! `retrieve::RetrieveError`); this type unifies them for library callers
//! and for `cli::run`'s exit-code mapping.

use thiserror::Error;

use crate::codec::CodecError;
use crate::index_builder::IndexBuilderError;
use crate::index_codec::IndexCodecError;
use crate::key::FormatError;
use crate::repack::RepackError;
use crate::retrieve::RetrieveError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    IndexCodec(#[from] IndexCodecError),

    #[error(transparent)]
    Repack(#[from] RepackError),

    #[error(transparent)]
    IndexBuilder(#[from] IndexBuilderError),

    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error("usage error: {0}")]
    Usage(String),
}

/// Exit codes from §6/§7 of the spec: 0 success, 1 I/O or format error,
/// 2 usage error, 3 integrity error.
impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 2,
            Error::IndexBuilder(IndexBuilderError::Integrity { .. }) => 3,
            _ => 1,
        }
    }
}
