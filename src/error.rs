//! Error kinds shared across the allocator, node codec, and engine.

use std::io;

use thiserror::Error;

/// All the ways an operation on a tree can fail.
///
/// Mirrors the C-flavored error codes from the file-format contract
/// (`EXISTS`, `NOT_FOUND`, `CORRUPT`, ...) as proper variants instead of
/// sentinel return values.
#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    Exists,

    #[error("node at offset {offset} is corrupt: start_mark {start_mark} != end_mark {end_mark}")]
    Corrupt {
        offset: u64,
        start_mark: u32,
        end_mark: u32,
    },

    #[error("file header is not a redbtree file")]
    BadMagic,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("allocation metadata could not be grown")]
    OutOfMemory,

    #[error("device error: {0}")]
    Device(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
