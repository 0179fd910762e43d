//! An object-store-backed virtual filesystem adapter exposing a
//! POSIX-like file abstraction over Amazon S3 (or any S3-compatible
//! endpoint): `s3://bucket/key` paths, random-access reads, buffered
//! writes with multipart upload, append-by-replay, directory-marker
//! listing, and prefix rename via server-side copy — all wrapped in a
//! retry envelope with exponential backoff and delete-idempotence.
//!
//! The entry point most hosts want is [`open`], which returns a
//! [`RetryingFilesystem`] backed by a lazily-constructed, memoized S3
//! client (see [`client::ClientProvider`]).

pub mod client;
pub mod error;
mod multipart_copy;
pub mod path;
pub mod reader;
pub mod region;
pub mod retry;
mod transfer;
pub mod writer;

pub mod filesystem;

pub use error::{Error, ErrorKind, Result};
pub use filesystem::{ListDir, S3Filesystem, Stat};
pub use reader::{RandomAccessReader, ReadStatus};
pub use region::ReadOnlyMemoryRegion;
pub use retry::{RetryingFilesystem, RetryingReader, RetryingWriter};
pub use writer::WritableFile;

/// Build the filesystem a host framework should actually use: an
/// [`S3Filesystem`] wrapped in the retry envelope. The underlying S3
/// client, transfer executor, and transfer manager are constructed lazily
/// on first use and memoized for the process lifetime.
pub fn open() -> RetryingFilesystem {
    RetryingFilesystem::new(S3Filesystem::new())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_returns_a_usable_handle_without_touching_the_network() {
        // Constructing the façade and its retry wrapper must not itself
        // reach out to S3 — only the first real operation should trigger
        // client construction.
        let _fs = open();
    }
}
