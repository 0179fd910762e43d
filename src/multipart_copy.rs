//! Multipart server-side copy, the core of `rename`.
//!
//! An earlier reference implementation this behavior was distilled from
//! computed its part count with `floor` division and indexed `PartNumber`
//! from 0 — both defects that silently dropped the tail of a source object
//! larger than one part. This module uses **ceiling** division and
//! 1-indexed part numbers instead. Concurrency shape (bounded attempts per part, abort on fatal failure) is
//! grounded on `quickwit-storage/src/object_storage/s3_compatible_storage.rs`'s
//! `put_multi_part`/`abort_multipart_upload` pairing — the closest available
//! example of a multipart operation that aborts cleanly on partial failure.

use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};

use crate::error::{Error, ErrorKind, Result};
use crate::transfer::PART_SIZE;

/// Attempts per part copy before giving up on that part. No backoff between
/// these attempts — they escalate straight to failure,
/// leaving retry-with-backoff to the outer retry envelope around `rename`
/// itself.
const MAX_PART_COPY_ATTEMPTS: u32 = 3;

/// Server-side copy `src_key` (length `src_len`) in `src_bucket` to
/// `(dst_bucket, dst_key)` using a multipart upload whose parts are
/// `UploadPartCopy` requests against byte ranges of the source.
pub(crate) async fn copy(
    client: &aws_sdk_s3::Client,
    src_bucket: &str,
    src_key: &str,
    src_len: u64,
    dst_bucket: &str,
    dst_key: &str,
) -> Result<()> {
    let _span = tracing::trace_span!(
        "multipart_copy::copy",
        src = %format!("{src_bucket}/{src_key}"),
        dst = %format!("{dst_bucket}/{dst_key}"),
        src_len
    )
    .entered();

    let create = client
        .create_multipart_upload()
        .bucket(dst_bucket)
        .key(dst_key)
        .send()
        .await
        .map_err(|err| Error::with_source(ErrorKind::Unknown, dst_key, err))?;
    let upload_id = create
        .upload_id
        .ok_or_else(|| Error::new(ErrorKind::Unknown, dst_key))?;

    let copy_source = format!("{src_bucket}/{}", urlencoding::encode(src_key));
    let part_count = part_count(src_len);

    let mut completed_parts = Vec::with_capacity(part_count as usize);
    for part_number in 1..=part_count {
        let start = (part_number - 1) as u64 * PART_SIZE;
        let end = (start + PART_SIZE - 1).min(src_len.saturating_sub(1));
        match copy_part(
            client,
            dst_bucket,
            dst_key,
            &upload_id,
            &copy_source,
            part_number,
            start,
            end,
        )
        .await
        {
            Ok(part) => completed_parts.push(part),
            Err(err) => {
                let _ = client
                    .abort_multipart_upload()
                    .bucket(dst_bucket)
                    .key(dst_key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                return Err(err);
            }
        }
    }

    client
        .complete_multipart_upload()
        .bucket(dst_bucket)
        .key(dst_key)
        .upload_id(&upload_id)
        .multipart_upload(
            CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build(),
        )
        .send()
        .await
        .map_err(|err| Error::with_source(ErrorKind::Unknown, dst_key, err))?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn copy_part(
    client: &aws_sdk_s3::Client,
    dst_bucket: &str,
    dst_key: &str,
    upload_id: &str,
    copy_source: &str,
    part_number: u64,
    start: u64,
    end: u64,
) -> Result<CompletedPart> {
    let range = format!("bytes={start}-{end}");
    let mut last_err = None;
    for _attempt in 0..MAX_PART_COPY_ATTEMPTS {
        let result = client
            .upload_part_copy()
            .bucket(dst_bucket)
            .key(dst_key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .copy_source(copy_source)
            .copy_source_range(&range)
            .send()
            .await;
        match result {
            Ok(output) => {
                let e_tag = output
                    .copy_part_result
                    .and_then(|result| result.e_tag)
                    .unwrap_or_default();
                return Ok(CompletedPart::builder()
                    .part_number(part_number as i32)
                    .e_tag(e_tag)
                    .build());
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(Error::with_source(
        ErrorKind::Unknown,
        dst_key,
        last_err.expect("loop runs at least once"),
    ))
}

/// Number of `PART_SIZE` parts needed to cover `len` bytes, rounding up.
fn part_count(len: u64) -> u64 {
    len.div_ceil(PART_SIZE).max(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eleven_mib_source_makes_three_parts() {
        assert_eq!(part_count(11 * 1024 * 1024), 3);
    }

    #[test]
    fn exact_multiple_has_no_extra_part() {
        assert_eq!(part_count(10 * 1024 * 1024), 2);
    }

    #[test]
    fn zero_length_source_still_gets_one_part() {
        assert_eq!(part_count(0), 1);
    }

    proptest::proptest! {
        #[test]
        fn part_count_never_truncates_the_tail(len in 1u64..100_000_000) {
            let parts = part_count(len);
            let covered = parts * PART_SIZE;
            proptest::prop_assert!(covered >= len);
            proptest::prop_assert!((parts - 1) * PART_SIZE < len);
        }
    }
}
