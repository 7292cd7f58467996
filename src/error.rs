use std::fmt::{self, Display};

/// Errors produced by the storage engine.
///
/// `NotFound` is intentionally absent: a missing key is represented as
/// `Option::None` from `get`/`delete`, never as an error (see [`crate::Result`]).
#[derive(Debug)]
pub enum Error {
    /// An OS-level I/O failure (open, read, write, fsync, unlink, ...).
    Io(std::io::Error),
    /// A record's bytes could not be decoded by its codec.
    Decode(String),
    /// A data file's first byte did not match a known codec identifier.
    UnknownFormat(u8),
    /// Compaction failed between allocating the new file and swapping the index.
    CompactionFailed(String),
    /// A caller-supplied parameter (e.g. a scheduler interval) was out of range.
    InvalidParameter(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::Decode(msg) => write!(f, "failed to decode record: {msg}"),
            Error::UnknownFormat(id) => write!(f, "unknown format identifier: 0x{id:02x}"),
            Error::CompactionFailed(msg) => write!(f, "compaction failed: {msg}"),
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
