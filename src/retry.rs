//! The retry envelope: exponential backoff with jitter, retriable-error
//! classification, and delete-idempotence absorption, wrapped around every
//! façade operation and every file-handle operation it returns.
//!
//! There's exactly one façade implementation in this crate, so unlike
//! `sourcefrog-conserve`'s `Box<dyn Transport>` (which exists to support
//! several transports behind one interface), this decorator wraps the
//! concrete [`S3Filesystem`] and its concrete handle types directly rather
//! than through a trait object — a trait here would only ever have one
//! implementor.

use std::thread;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::filesystem::{ListDir, S3Filesystem, Stat};
use crate::reader::{RandomAccessReader, ReadStatus};
use crate::region::ReadOnlyMemoryRegion;
use crate::writer::WritableFile;

/// Maximum number of retry attempts after the first call.
pub const MAX_RETRIES: u32 = 10;

/// Backoff ceiling before jitter.
pub const MAX_BACKOFF_MICROS: u64 = 32_000_000;

/// Default initial delay for the façade-level decorator.
pub const DEFAULT_INITIAL_DELAY_MICROS: u64 = 1_000_000;

/// Initial delay used by the decorator wrapping already-open file handles —
/// handle operations are expected to be smaller and more frequent than the
/// façade calls that open them, so they back off faster.
pub const HANDLE_INITIAL_DELAY_MICROS: u64 = 100_000;

/// Run `f` under the backoff loop: retry while the error kind is retriable,
/// sleeping `min(initial << attempt, MAX_BACKOFF) + jitter` between
/// attempts, up to `MAX_RETRIES` additional tries beyond the first.
fn call_with_retries<T>(initial_delay_micros: u64, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempts = 0u32;
    let mut last_err;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retriable() {
                    return Err(err);
                }
                last_err = err;
            }
        }
        if attempts >= MAX_RETRIES {
            return Err(Error::aborted(last_err));
        }
        tracing::debug!(attempt = attempts, kind = ?last_err.kind, "retrying after retriable error");
        if initial_delay_micros > 0 {
            let jitter = rand::random::<u64>() % 1_000_000;
            let base = initial_delay_micros
                .checked_shl(attempts)
                .unwrap_or(u64::MAX);
            let delay = base.min(MAX_BACKOFF_MICROS) + jitter;
            thread::sleep(Duration::from_micros(delay));
        }
        attempts += 1;
    }
}

/// Identical to [`call_with_retries`] except a `NotFound` on any attempt
/// after the first is treated as success — `DeleteObject` is idempotent
/// under the store's eventual-consistency model, so a delete that the
/// store had already applied before a transient failure should not be
/// reported as an error.
fn delete_with_retries(initial_delay_micros: u64, mut f: impl FnMut() -> Result<()>) -> Result<()> {
    let mut attempts = 0u32;
    let mut last_err;
    loop {
        match f() {
            Ok(()) => return Ok(()),
            Err(err) if attempts > 0 && err.is_not_found() => return Ok(()),
            Err(err) => {
                if !err.is_retriable() {
                    return Err(err);
                }
                last_err = err;
            }
        }
        if attempts >= MAX_RETRIES {
            return Err(Error::aborted(last_err));
        }
        tracing::debug!(attempt = attempts, kind = ?last_err.kind, "retrying delete after retriable error");
        if initial_delay_micros > 0 {
            let jitter = rand::random::<u64>() % 1_000_000;
            let base = initial_delay_micros
                .checked_shl(attempts)
                .unwrap_or(u64::MAX);
            let delay = base.min(MAX_BACKOFF_MICROS) + jitter;
            thread::sleep(Duration::from_micros(delay));
        }
        attempts += 1;
    }
}

/// A filesystem façade wrapped in the retry envelope. This is the type a
/// host framework actually holds: every method call here is retried as a
/// unit, and `open_read` / `open_write` / `open_append` hand back handles
/// that are themselves wrapped.
#[derive(Clone)]
pub struct RetryingFilesystem {
    inner: S3Filesystem,
}

impl RetryingFilesystem {
    pub fn new(inner: S3Filesystem) -> Self {
        RetryingFilesystem { inner }
    }

    pub fn open_read(&self, uri: &str) -> Result<RetryingReader> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.open_read(uri))
            .map(RetryingReader::new)
    }

    pub fn open_write(&self, uri: &str) -> Result<RetryingWriter> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.open_write(uri))
            .map(RetryingWriter::new)
    }

    pub fn open_append(&self, uri: &str) -> Result<RetryingWriter> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.open_append(uri))
            .map(RetryingWriter::new)
    }

    pub fn read_region(&self, uri: &str) -> Result<ReadOnlyMemoryRegion> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.read_region(uri))
    }

    pub fn exists(&self, uri: &str) -> Result<bool> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.exists(uri))
    }

    pub fn stat(&self, uri: &str) -> Result<Stat> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.stat(uri))
    }

    pub fn list(&self, uri: &str) -> Result<ListDir> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.list(uri))
    }

    pub fn delete_file(&self, uri: &str) -> Result<()> {
        delete_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.delete_file(uri))
    }

    pub fn create_dir(&self, uri: &str) -> Result<()> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.create_dir(uri))
    }

    pub fn delete_dir(&self, uri: &str) -> Result<()> {
        delete_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.delete_dir(uri))
    }

    pub fn file_size(&self, uri: &str) -> Result<u64> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.file_size(uri))
    }

    pub fn rename(&self, src: &str, tgt: &str) -> Result<()> {
        call_with_retries(DEFAULT_INITIAL_DELAY_MICROS, || self.inner.rename(src, tgt))
    }
}

/// A [`RandomAccessReader`] whose every read is retried.
pub struct RetryingReader {
    inner: RandomAccessReader,
}

impl RetryingReader {
    fn new(inner: RandomAccessReader) -> Self {
        RetryingReader { inner }
    }

    pub fn read(&self, offset: u64, n: u64, out: &mut Vec<u8>) -> Result<(u64, ReadStatus)> {
        call_with_retries(HANDLE_INITIAL_DELAY_MICROS, || {
            let mut buf = Vec::new();
            let result = self.inner.read(offset, n, &mut buf);
            if result.is_ok() {
                *out = buf;
            }
            result
        })
    }
}

/// A [`WritableFile`] whose every `append` / `sync` / `flush` / `close` is
/// retried, and whose destructor invokes `close` (ignoring the result) so a
/// dropped handle never silently loses buffered data.
pub struct RetryingWriter {
    inner: WritableFile,
}

impl RetryingWriter {
    fn new(inner: WritableFile) -> Self {
        RetryingWriter { inner }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        call_with_retries(HANDLE_INITIAL_DELAY_MICROS, || self.inner.append(bytes))
    }

    pub fn sync(&mut self) -> Result<()> {
        call_with_retries(HANDLE_INITIAL_DELAY_MICROS, || self.inner.sync())
    }

    pub fn flush(&mut self) -> Result<()> {
        call_with_retries(HANDLE_INITIAL_DELAY_MICROS, || self.inner.flush())
    }

    pub fn close(&mut self) -> Result<()> {
        call_with_retries(HANDLE_INITIAL_DELAY_MICROS, || self.inner.close())
    }
}

impl Drop for RetryingWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use assert_matches::assert_matches;
    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn call_with_retries_returns_first_non_retriable_outcome() {
        let attempts = Cell::new(0);
        let result: Result<&str> = call_with_retries(0, || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(Error::new(ErrorKind::Unavailable, "x"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn call_with_retries_does_not_retry_non_retriable_errors() {
        let attempts = Cell::new(0);
        let result: Result<()> = call_with_retries(0, || {
            attempts.set(attempts.get() + 1);
            Err(Error::new(ErrorKind::InvalidArgument, "x"))
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn call_with_retries_aborts_after_max_retries() {
        let attempts = Cell::new(0);
        let result: Result<()> = call_with_retries(0, || {
            attempts.set(attempts.get() + 1);
            Err(Error::new(ErrorKind::Unavailable, "x"))
        });
        let err = result.unwrap_err();
        assert_matches!(err.kind, ErrorKind::Aborted);
        assert_eq!(attempts.get(), MAX_RETRIES + 1);
    }

    #[test]
    #[traced_test]
    fn call_with_retries_logs_each_retry() {
        let attempts = Cell::new(0);
        let result: Result<()> = call_with_retries(0, || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 2 {
                Err(Error::new(ErrorKind::Unavailable, "x"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert!(logs_contain("retrying after retriable error"));
    }

    #[test]
    fn delete_with_retries_absorbs_not_found_after_first_attempt() {
        let attempts = Cell::new(0);
        let result = delete_with_retries(0, || {
            attempts.set(attempts.get() + 1);
            match attempts.get() {
                1 => Err(Error::new(ErrorKind::Unavailable, "x")),
                2 => Err(Error::new(ErrorKind::Unavailable, "x")),
                _ => Err(Error::new(ErrorKind::NotFound, "x")),
            }
        });
        assert!(result.is_ok());
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn delete_with_retries_does_not_absorb_not_found_on_first_attempt() {
        let attempts = Cell::new(0);
        let result = delete_with_retries(0, || {
            attempts.set(attempts.get() + 1);
            Err(Error::new(ErrorKind::NotFound, "x"))
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }
}
