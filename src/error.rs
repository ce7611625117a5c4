use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// LoomDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid or damaged on-disk or in-PM data: bad checksums, malformed
    /// internal keys or tags, truncated footers.
    Corruption(String),
    /// Invalid caller input, typically an out-of-bounds run range.
    InvalidArgument(String),
    /// An IO error from the file or PM layer.
    IO(String),
    /// A write was attempted on a read-only structure (immutable memtable,
    /// finished minirun).
    ReadOnly,
    /// A PM arena has no room left for an allocation. Fatal for the leaf
    /// index, which must always fit its backing arena.
    OutOfMemory,
    /// The operation is not supported by this iterator or store.
    Unsupported(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::OutOfMemory => write!(f, "persistent memory arena exhausted"),
            Error::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinvalid {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)).into() };
}

/// A LoomDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
