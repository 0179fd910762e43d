//! The filesystem façade: `open-read` / `open-write` / `open-append` /
//! `read-region` / `stat` / `list` / `delete-file` / `create-dir` /
//! `delete-dir` / `rename` / `exists` / `file-size`, everything a host
//! framework's pluggable-filesystem layer needs to treat an S3 bucket as a
//! POSIX-like namespace.
//!
//! Grounded on `sourcefrog-conserve/src/transport/s3.rs`'s `Transport`
//! implementation for the shape of each operation (one SDK call per
//! `Transport` method, with `trace_span!` around it and a paginated
//! `list_objects_v2().into_paginator()` for `list_dir`); generalized here to
//! a richer operation set — stat with directory-marker override, rename via
//! multipart copy, append-by-replay.

use std::fmt;
use std::sync::Arc;

use crate::client::{ClientProvider, S3Environment};
use crate::error::{from_sdk_error, Error, ErrorKind, Result};
use crate::multipart_copy;
use crate::path;
use crate::reader::{RandomAccessReader, ReadStatus};
use crate::region::ReadOnlyMemoryRegion;
use crate::writer::{self, WritableFile};

/// Chunk size `open-append` reads the existing object in while seeding the
/// new writer's spill file.
pub const READ_APPEND_CHUNK: u64 = 1024 * 1024;

/// Page size for `ListObjectsV2`.
const LIST_PAGE_SIZE: i32 = 100;

/// File statistics: `(length, is_directory, mtime_nanos)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stat {
    pub length: u64,
    pub is_directory: bool,
    pub mtime_nanos: i64,
}

/// Result of listing a directory-like prefix.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListDir {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// The S3-backed filesystem façade. Cheaply `Clone`: it only holds a
/// [`ClientProvider`] handle, which memoizes the real client on first use.
#[derive(Clone, Default)]
pub struct S3Filesystem {
    provider: ClientProvider,
}

impl fmt::Debug for S3Filesystem {
    #[mutants::skip] // unimportant to test
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Filesystem").finish_non_exhaustive()
    }
}

impl S3Filesystem {
    pub fn new() -> Self {
        S3Filesystem::default()
    }

    fn env(&self) -> Result<Arc<S3Environment>> {
        self.provider.get()
    }

    pub fn open_read(&self, uri: &str) -> Result<RandomAccessReader> {
        let (bucket, key) = path::parse(uri, false)?;
        Ok(RandomAccessReader::new(self.env()?, bucket, key))
    }

    pub fn open_write(&self, uri: &str) -> Result<WritableFile> {
        let (bucket, key) = path::parse(uri, false)?;
        WritableFile::create(self.env()?, bucket, key)
    }

    pub fn open_append(&self, uri: &str) -> Result<WritableFile> {
        let (bucket, key) = path::parse(uri, false)?;
        let env = self.env()?;
        let reader = RandomAccessReader::new(env.clone(), bucket.clone(), key.clone());
        let (spill_file, spill_path) =
            writer::seed_spill_file_from_reader(&key, &reader, READ_APPEND_CHUNK)?;
        Ok(WritableFile::from_seeded_spill(
            env, bucket, key, spill_file, spill_path,
        ))
    }

    pub fn read_region(&self, uri: &str) -> Result<ReadOnlyMemoryRegion> {
        let stat = self.stat(uri)?;
        let reader = self.open_read(uri)?;
        let mut buf = Vec::with_capacity(stat.length as usize);
        let (_read, status) = reader.read(0, stat.length.max(1), &mut buf)?;
        if status == ReadStatus::OutOfRange {
            buf.clear();
        }
        Ok(ReadOnlyMemoryRegion::new(bytes::Bytes::from(buf)))
    }

    pub fn exists(&self, uri: &str) -> Result<bool> {
        match self.stat(uri) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// `HeadObject` (or `HeadBucket` for an empty key), then a one-item
    /// `ListObjects` on `key + "/"` whose presence overrides the result
    /// with a directory stat — the marker wins over a same-named file.
    pub fn stat(&self, uri: &str) -> Result<Stat> {
        let (bucket, key) = path::parse(uri, true)?;
        let env = self.env()?;
        let _span = tracing::trace_span!("S3Filesystem::stat", %bucket, %key).entered();

        if key.is_empty() {
            return env
                .runtime
                .block_on(env.client.head_bucket().bucket(&bucket).send())
                .map(|_| Stat {
                    length: 0,
                    is_directory: true,
                    mtime_nanos: 0,
                })
                .map_err(|err| from_sdk_error(bucket.clone(), err));
        }

        let file_stat = env
            .runtime
            .block_on(env.client.head_object().bucket(&bucket).key(&key).send())
            .map(|output| Stat {
                length: output.content_length.unwrap_or(0).max(0) as u64,
                is_directory: false,
                mtime_nanos: output.last_modified.map(datetime_to_nanos).unwrap_or(0),
            })
            .map_err(|err| from_sdk_error(key.clone(), err));

        let dir_marker_prefix = path::ensure_trailing_slash(&key);
        let dir_stat = env.runtime.block_on(
            env.client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(&dir_marker_prefix)
                .max_keys(1)
                .send(),
        );
        if let Ok(output) = dir_stat {
            if let Some(first) = output.contents.and_then(|c| c.into_iter().next()) {
                return Ok(Stat {
                    length: 0,
                    is_directory: true,
                    mtime_nanos: first.last_modified.map(datetime_to_nanos).unwrap_or(0),
                });
            }
        }

        file_stat
    }

    /// Paginated `ListObjectsV2` with delimiter `/`, stripping the listed
    /// prefix from both common prefixes and content keys.
    pub fn list(&self, uri: &str) -> Result<ListDir> {
        let (bucket, key) = path::parse(uri, true)?;
        let env = self.env()?;
        let prefix = path::ensure_trailing_slash(&key);
        let _span = tracing::trace_span!("S3Filesystem::list", %bucket, %prefix).entered();

        let mut result = ListDir::default();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = env
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(&prefix)
                .delimiter("/")
                .max_keys(LIST_PAGE_SIZE);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = env
                .runtime
                .block_on(request.send())
                .map_err(|err| from_sdk_error(prefix.clone(), err))?;

            for common_prefix in output.common_prefixes.unwrap_or_default() {
                if let Some(name) = common_prefix.prefix {
                    if let Some(stripped) = name.strip_prefix(&prefix).and_then(|n| n.strip_suffix('/')) {
                        if !stripped.is_empty() {
                            result.dirs.push(stripped.to_owned());
                        }
                    }
                }
            }
            for object in output.contents.unwrap_or_default() {
                if let Some(name) = object.key {
                    if let Some(stripped) = name.strip_prefix(&prefix) {
                        if !stripped.is_empty() {
                            result.files.push(stripped.to_owned());
                        }
                    }
                }
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(result)
    }

    pub fn delete_file(&self, uri: &str) -> Result<()> {
        let (bucket, key) = path::parse(uri, false)?;
        let env = self.env()?;
        env.runtime
            .block_on(env.client.delete_object().bucket(&bucket).key(&key).send())
            .map_err(|err| from_sdk_error(key.clone(), err))?;
        Ok(())
    }

    /// For an empty key, just verify the bucket exists. Otherwise write an
    /// empty marker object if one doesn't already exist.
    pub fn create_dir(&self, uri: &str) -> Result<()> {
        let (bucket, key) = path::parse(uri, true)?;
        let env = self.env()?;
        if key.is_empty() {
            return env
                .runtime
                .block_on(env.client.head_bucket().bucket(&bucket).send())
                .map(|_| ())
                .map_err(|err| from_sdk_error(bucket.clone(), err));
        }
        let dir_uri = format!("s3://{bucket}/{}", path::ensure_trailing_slash(&key));
        if !self.exists(&dir_uri)? {
            let mut writer = self.open_write(&dir_uri)?;
            writer.close()?;
        }
        Ok(())
    }

    /// A directory is only deletable while its listing contains nothing but
    /// (at most) its own marker object. A genuine not-yet-converged listing
    /// and a genuinely non-empty directory look identical from here, so
    /// both return a retriable `Internal` error, and the retry envelope is
    /// relied on to ride out the former.
    pub fn delete_dir(&self, uri: &str) -> Result<()> {
        let (bucket, key) = path::parse(uri, true)?;
        let env = self.env()?;
        let prefix = path::ensure_trailing_slash(&key);
        let output = env
            .runtime
            .block_on(
                env.client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&prefix)
                    .max_keys(2)
                    .send(),
            )
            .map_err(|err| from_sdk_error(prefix.clone(), err))?;
        let contents = output.contents.unwrap_or_default();
        if contents.iter().any(|o| o.key.as_deref() != Some(prefix.as_str())) {
            return Err(Error::new(ErrorKind::Internal, &prefix));
        }
        if contents.iter().any(|o| o.key.as_deref() == Some(prefix.as_str())) {
            let marker_uri = format!("s3://{bucket}/{prefix}");
            self.delete_file(&marker_uri)?;
        }
        Ok(())
    }

    pub fn file_size(&self, uri: &str) -> Result<u64> {
        Ok(self.stat(uri)?.length)
    }

    /// List the source prefix, multipart-server-side-copy each object to
    /// its target key, then delete the source object. No rollback of
    /// already-copied keys on partial failure.
    pub fn rename(&self, src_uri: &str, tgt_uri: &str) -> Result<()> {
        let (src_bucket, src_key_raw) = path::parse(src_uri, false)?;
        let (tgt_bucket, tgt_key_raw) = path::parse(tgt_uri, false)?;
        let env = self.env()?;

        // Normalize so src and tgt agree in directory-ness.
        let (src_key, tgt_key) = if src_key_raw.ends_with('/') || tgt_key_raw.ends_with('/') {
            (
                path::ensure_trailing_slash(&src_key_raw),
                path::ensure_trailing_slash(&tgt_key_raw),
            )
        } else {
            (src_key_raw, tgt_key_raw)
        };

        let _span =
            tracing::trace_span!("S3Filesystem::rename", src = %src_key, tgt = %tgt_key).entered();

        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = env
                .client
                .list_objects_v2()
                .bucket(&src_bucket)
                .prefix(&src_key)
                .max_keys(LIST_PAGE_SIZE);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = env
                .runtime
                .block_on(request.send())
                .map_err(|err| from_sdk_error(src_key.clone(), err))?;

            for object in output.contents.unwrap_or_default() {
                let object_key = object
                    .key
                    .ok_or_else(|| Error::new(ErrorKind::Internal, &src_key))?;
                let object_tgt_key = match object_key.strip_prefix(&src_key) {
                    Some(suffix) => format!("{tgt_key}{suffix}"),
                    None => return Err(Error::new(ErrorKind::Internal, &object_key)),
                };
                let len = object.size.unwrap_or(0).max(0) as u64;

                env.runtime.block_on(multipart_copy::copy(
                    &env.client,
                    &src_bucket,
                    &object_key,
                    len,
                    &tgt_bucket,
                    &object_tgt_key,
                ))?;

                env.runtime
                    .block_on(
                        env.client
                            .delete_object()
                            .bucket(&src_bucket)
                            .key(&object_key)
                            .send(),
                    )
                    .map_err(|err| from_sdk_error(object_key.clone(), err))?;
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(())
    }
}

fn datetime_to_nanos(dt: aws_sdk_s3::primitives::DateTime) -> i64 {
    dt.secs().saturating_mul(1_000_000_000) + i64::from(dt.subsec_nanos())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn list_dir_default_is_empty() {
        let listing = ListDir::default();
        assert!(listing.dirs.is_empty());
        assert!(listing.files.is_empty());
    }
}
