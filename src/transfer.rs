//! Multipart upload with bounded per-attempt retry, used by [`crate::writer`]
//! to flush a spill file to S3, running on the fixed-size transfer executor
//! thread pool.
//!
//! There's no off-the-shelf "transfer manager" type in `aws-sdk-s3` the way
//! there is in the Java/C++ AWS SDKs, so this module builds the narrow piece
//! actually needed: submit a whole file as parts, await completion, and on
//! partial failure re-send only the parts that failed, up to 5 additional
//! times. The concurrent
//! part-upload shape is grounded on
//! `quickwit-storage/src/object_storage/s3_compatible_storage.rs`'s
//! `put_multi_part`, which `stream::iter(...).buffered(max_concurrency)`s a
//! set of `UploadPart` futures and aborts the multipart upload on fatal
//! failure. Every `PutObject`/`UploadPart` request disables payload signing,
//! since the spill file body is already fully buffered on local disk and
//! gains nothing from a signed streaming checksum.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use futures::stream::{self, StreamExt};

use crate::error::{Error, ErrorKind, Result};

/// Part size used both for upload and for multipart server-side copy.
pub const PART_SIZE: u64 = 5 * 1024 * 1024;

/// Additional attempts `sync` makes (beyond the first) when the upload comes
/// back with failed parts.
pub const MAX_UPLOAD_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct TransferManager {
    client: aws_sdk_s3::Client,
    max_concurrency: usize,
}

/// Outcome of a (possibly multi-attempt) upload.
pub struct UploadOutcome {
    pub completed: bool,
    pub failed_parts_count: usize,
    pub last_error: Option<String>,
}

struct PendingPart {
    part_number: i32,
    range: std::ops::Range<u64>,
}

impl TransferManager {
    pub fn new(client: aws_sdk_s3::Client, max_concurrency: usize) -> Self {
        TransferManager {
            client,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Upload the entire contents of `spill_path` to `(bucket, key)`,
    /// content-type `application/octet-stream`, retrying failed parts up to
    /// `MAX_UPLOAD_RETRIES` additional times.
    pub async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        spill_path: &Path,
    ) -> Result<UploadOutcome> {
        let len = std::fs::metadata(spill_path)
            .map_err(|err| Error::with_source(ErrorKind::Internal, key, err))?
            .len();

        if len == 0 {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type("application/octet-stream")
                .body(Vec::new().into())
                .customize()
                .disable_payload_signing()
                .send()
                .await
                .map_err(|err| Error::with_source(ErrorKind::Unknown, key, err))?;
            return Ok(UploadOutcome {
                completed: true,
                failed_parts_count: 0,
                last_error: None,
            });
        }

        let parts = part_plan(len);

        let create = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|err| Error::with_source(ErrorKind::Unknown, key, err))?;
        let upload_id = create
            .upload_id
            .ok_or_else(|| Error::new(ErrorKind::Unknown, key))?;

        let mut completed: Vec<Option<CompletedPart>> = vec![None; parts.len()];
        let mut pending = parts;
        let mut last_error = None;

        for attempt in 0..=MAX_UPLOAD_RETRIES {
            if pending.is_empty() {
                break;
            }
            let results = self
                .upload_parts(bucket, key, &upload_id, spill_path, &pending)
                .await;
            let mut still_pending = Vec::new();
            for (part, result) in pending.into_iter().zip(results.into_iter()) {
                match result {
                    Ok(completed_part) => {
                        completed[(part.part_number - 1) as usize] = Some(completed_part);
                    }
                    Err(err) => {
                        last_error = Some(err.to_string());
                        still_pending.push(part);
                    }
                }
            }
            pending = still_pending;
            if !pending.is_empty() && attempt < MAX_UPLOAD_RETRIES {
                tracing::debug!(
                    remaining = pending.len(),
                    attempt,
                    "retrying failed multipart upload parts"
                );
            }
        }

        if !pending.is_empty() {
            let _ = self.abort(bucket, key, &upload_id).await;
            return Ok(UploadOutcome {
                completed: false,
                failed_parts_count: pending.len(),
                last_error,
            });
        }

        let completed_parts: Vec<CompletedPart> = completed.into_iter().flatten().collect();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| Error::with_source(ErrorKind::Unknown, key, err))?;

        Ok(UploadOutcome {
            completed: true,
            failed_parts_count: 0,
            last_error: None,
        })
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        spill_path: &Path,
        parts: &[PendingPart],
    ) -> Vec<std::result::Result<CompletedPart, Error>> {
        stream::iter(parts.iter().map(|part| {
            let client = self.client.clone();
            let bucket = bucket.to_owned();
            let key = key.to_owned();
            let upload_id = upload_id.to_owned();
            let spill_path = spill_path.to_owned();
            let part_number = part.part_number;
            let range = part.range.clone();
            async move {
                let body = read_range(&spill_path, range)
                    .map_err(|err| Error::with_source(ErrorKind::Internal, &key, err))?;
                let output = client
                    .upload_part()
                    .bucket(bucket)
                    .key(&key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(body.into())
                    .customize()
                    .disable_payload_signing()
                    .send()
                    .await
                    .map_err(|err| Error::with_source(ErrorKind::Unknown, &key, err))?;
                Ok(CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag)
                    .build())
            }
        }))
        .buffered(self.max_concurrency)
        .collect()
        .await
    }

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| Error::with_source(ErrorKind::Unknown, key, err))?;
        Ok(())
    }
}

fn read_range(path: &Path, range: std::ops::Range<u64>) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Split a file of length `len` into 1-indexed, `PART_SIZE`-bounded parts,
/// the last one truncated to whatever remains.
fn part_plan(len: u64) -> Vec<PendingPart> {
    let part_count = len.div_ceil(PART_SIZE).max(1);
    (0..part_count)
        .map(|i| {
            let start = i * PART_SIZE;
            let end = ((i + 1) * PART_SIZE).min(len);
            PendingPart {
                part_number: (i + 1) as i32,
                range: start..end,
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::exact_multiple(10 * 1024 * 1024, 2)]
    #[case::tiny_file(1, 1)]
    #[case::truncated_tail(11 * 1024 * 1024, 3)]
    fn part_plan_splits_into_expected_count(#[case] len: u64, #[case] expected_parts: usize) {
        assert_eq!(part_plan(len).len(), expected_parts);
    }

    #[test]
    fn part_plan_splits_on_boundaries() {
        let parts = part_plan(11 * 1024 * 1024);
        let ranges: Vec<_> = parts.iter().map(|p| (p.part_number, p.range.clone())).collect();
        assert_eq!(
            ranges,
            vec![
                (1, 0..5 * 1024 * 1024),
                (2, 5 * 1024 * 1024..10 * 1024 * 1024),
                (3, 10 * 1024 * 1024..11 * 1024 * 1024),
            ]
        );
    }

    #[test]
    fn part_plan_tiny_file_is_one_part() {
        let parts = part_plan(1);
        assert_eq!(parts[0].range, 0..1);
    }
}
