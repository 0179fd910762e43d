//! The writable-file state machine: buffered local appends, flushed to S3
//! as a multipart upload on `sync`.
//!
//! Grounded on `sourcefrog-conserve/src/transport/local.rs::write_file`'s
//! use of `tempfile::Builder` for a disambiguated local spill file, and on
//! `sourcefrog-conserve/src/transport/s3.rs`'s pattern of blocking the
//! calling thread on `self.env.runtime.block_on(...)` to bridge into the
//! async SDK.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::client::S3Environment;
use crate::error::{Error, ErrorKind, Result};

/// Prefix for spill files: `/tmp/s3_filesystem_XXXXXX<n>_*`.
const SPILL_PREFIX: &str = "s3_filesystem_";

static SPILL_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Produce the next disambiguator for a spill file name: a process-wide
/// counter mod 1000. Combined with the OS's own unique-file mechanism
/// (`tempfile`'s random suffix) this is unique enough without needing a
/// global lock beyond the atomic increment itself.
fn next_disambiguator() -> u32 {
    SPILL_COUNTER.fetch_add(1, Ordering::Relaxed) % 1000
}

enum State {
    Open,
    Closed,
}

/// A local-spill-file-backed writable handle for one `(bucket, key)`.
///
/// State machine: `Open -> (Append*) -> Syncing -> Open | Closed`.
/// `sync_needed` is set by any `append` and cleared by a successful `sync`;
/// `close` performs a final `sync` and is idempotent.
pub struct WritableFile {
    env: Arc<S3Environment>,
    bucket: String,
    key: String,
    spill_file: File,
    spill_path: PathBuf,
    sync_needed: bool,
    state: State,
}

impl WritableFile {
    /// Create a fresh writable file with an empty, truncated spill file.
    pub(crate) fn create(env: Arc<S3Environment>, bucket: String, key: String) -> Result<Self> {
        let (spill_file, spill_path) = new_spill_file(&key)?;
        Ok(WritableFile {
            env,
            bucket,
            key,
            spill_file,
            spill_path,
            sync_needed: false,
            state: State::Open,
        })
    }

    /// Create a writable file whose spill file is pre-seeded with the
    /// bytes already written to it (used by `open-append`, which streams
    /// the existing object in before returning the handle to the caller).
    pub(crate) fn from_seeded_spill(
        env: Arc<S3Environment>,
        bucket: String,
        key: String,
        spill_file: File,
        spill_path: PathBuf,
    ) -> Self {
        WritableFile {
            env,
            bucket,
            key,
            spill_file,
            spill_path,
            sync_needed: false,
            state: State::Open,
        }
    }

    /// Append bytes to the spill file. Marks the handle as needing a sync.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if matches!(self.state, State::Closed) {
            return Err(Error::new(ErrorKind::FailedPrecondition, &self.key));
        }
        self.spill_file
            .write_all(bytes)
            .map_err(|err| Error::with_source(ErrorKind::Internal, &self.key, err))?;
        self.sync_needed = true;
        Ok(())
    }

    /// Upload the whole spill file, retrying failed parts, then seek back
    /// to the pre-upload write cursor so later appends resume correctly.
    pub fn sync(&mut self) -> Result<()> {
        if !self.sync_needed {
            return Ok(());
        }
        let _span =
            tracing::trace_span!("WritableFile::sync", bucket = %self.bucket, key = %self.key)
                .entered();

        self.spill_file
            .flush()
            .map_err(|err| Error::with_source(ErrorKind::Internal, &self.key, err))?;
        let cursor = self
            .spill_file
            .stream_position()
            .map_err(|err| Error::with_source(ErrorKind::Internal, &self.key, err))?;

        let outcome = self.env.runtime.block_on(self.env.transfer.upload_file(
            &self.bucket,
            &self.key,
            &self.spill_path,
        ))?;

        if !outcome.completed {
            return Err(Error {
                kind: ErrorKind::Unknown,
                path: Some(self.key.clone()),
                source: Some(Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "multipart upload failed for {} parts: {}",
                        outcome.failed_parts_count,
                        outcome.last_error.unwrap_or_default()
                    ),
                ))),
            });
        }

        self.spill_file
            .seek(SeekFrom::Start(cursor))
            .map_err(|err| Error::with_source(ErrorKind::Internal, &self.key, err))?;
        self.sync_needed = false;
        Ok(())
    }

    /// Equivalent to `sync`.
    pub fn flush(&mut self) -> Result<()> {
        self.sync()
    }

    /// Final sync, then release the spill file. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if matches!(self.state, State::Closed) {
            return Ok(());
        }
        self.sync()?;
        self.state = State::Closed;
        Ok(())
    }
}

impl Drop for WritableFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.spill_path);
    }
}

fn new_spill_file(key: &str) -> Result<(File, PathBuf)> {
    let disambiguator = next_disambiguator();
    let prefix = format!("{SPILL_PREFIX}{disambiguator:03}_");
    let named = tempfile::Builder::new()
        .prefix(&prefix)
        .tempfile()
        .map_err(|err| Error::with_source(ErrorKind::Internal, key, err))?;
    let (file, path) = named.keep().map_err(|err| {
        Error::with_source(ErrorKind::Internal, key, err.error)
    })?;
    Ok((file, path))
}

/// Open a new spill file seeded with the bytes read from `path` on `reader`,
/// in `chunk_size`-sized reads, stopping at `OutOfRange`. Used by
/// open-append, which streams the existing object in before handing the
/// write handle back to the caller.
pub(crate) fn seed_spill_file_from_reader(
    key: &str,
    reader: &crate::reader::RandomAccessReader,
    chunk_size: u64,
) -> Result<(File, PathBuf)> {
    let (mut file, path) = new_spill_file(key)?;
    let mut offset = 0u64;
    let mut buf = Vec::new();
    loop {
        let (bytes_read, status) = reader.read(offset, chunk_size, &mut buf)?;
        if status == crate::reader::ReadStatus::OutOfRange {
            break;
        }
        file.write_all(&buf)
            .map_err(|err| Error::with_source(ErrorKind::Internal, key, err))?;
        offset += bytes_read;
        if bytes_read == 0 {
            // A zero-length, non-`OutOfRange` read would otherwise loop
            // forever; treat it the same as end-of-file.
            break;
        }
    }
    file.flush()
        .map_err(|err| Error::with_source(ErrorKind::Internal, key, err))?;
    Ok((file, path))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disambiguator_wraps_mod_1000() {
        let a = next_disambiguator();
        for _ in 0..999 {
            next_disambiguator();
        }
        let b = next_disambiguator();
        assert_eq!(a, b);
    }
}
