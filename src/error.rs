//! Error types for CDF operations.

use thiserror::Error;

/// All errors that can occur when working with CDF files.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic number, version, or record-header inconsistency.
    #[error("malformed CDF: {0}")]
    Malformed(String),

    /// Invalid magic number in the file header.
    #[error("invalid magic number, expected cdf30001, found {found:02x?}")]
    InvalidMagicNumber { found: Vec<u8> },

    /// Encoding, data type, or record kind not implemented.
    #[error("unsupported CDF feature: {0}")]
    Unsupported(String),

    /// The MD5 trailer does not match the file contents.
    ///
    /// Surfaced on the first data read after open, never silently.
    #[error("MD5 checksum mismatch, expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    /// Gzip inflate/deflate failure, attached to the offending record.
    #[error("compression failure at record offset {offset}: {source}")]
    Compression {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// Variable or attribute lookup by name or number failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// A component or record index is outside its valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Unexpected end of the file image while parsing a record.
    #[error("unexpected end of file image")]
    UnexpectedEof,

    /// A prior write failed; only `close` is legal on this writer.
    #[error("writer is poisoned by an earlier error")]
    Poisoned,

    /// The writer has already been closed.
    #[error("writer is closed")]
    Closed,

    /// Other unspecified error.
    #[error("{0}")]
    Other(String),
}
