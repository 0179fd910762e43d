#![cfg(feature = "s3-integration-test")]

//! Exercises this crate's own façade against a real temporary bucket.
//! Only built and run with `--features=s3-integration-test`, since it needs
//! AWS credentials in the environment and writes to a real bucket.
//!
//! Adapted from `sourcefrog-conserve/tests/s3_integration.rs`'s
//! `TempBucket` helper, which creates a bucket with a short-lived lifecycle
//! rule as a backstop against leaked buckets if the test is killed before
//! its own cleanup runs.

use std::str::FromStr;
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use aws_config::BehaviorVersion;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, BucketLocationConstraint, CreateBucketConfiguration,
    ExpirationStatus, LifecycleExpiration, LifecycleRule, LifecycleRuleFilter,
};
use pretty_assertions::assert_eq;
use tokio::runtime::Runtime;

static TRACING_INIT: Once = Once::new();

/// These tests talk to a real bucket; route `tracing` output to stderr so a
/// failure's request/response trail is visible, same as a host binary would
/// set up logging before making any calls.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

struct TempBucket {
    runtime: Runtime,
    bucket_name: String,
    client: aws_sdk_s3::Client,
}

impl TempBucket {
    fn url(&self) -> String {
        format!("s3://{}", self.bucket_name)
    }

    fn new() -> TempBucket {
        init_tracing();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("create runtime");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock")
            .as_secs();
        let bucket_name = format!("s3vfs-integration-{now}-{:x}", rand::random::<u32>());
        let config = runtime.block_on(aws_config::defaults(BehaviorVersion::latest()).load());
        let client = aws_sdk_s3::Client::new(&config);
        runtime.block_on(TempBucket::setup_bucket(&bucket_name, &client));
        TempBucket {
            runtime,
            bucket_name,
            client,
        }
    }

    async fn setup_bucket(bucket_name: &str, client: &aws_sdk_s3::Client) {
        let region = client
            .config()
            .region()
            .expect("AWS config from environment specifies a region")
            .as_ref();
        client
            .create_bucket()
            .bucket(bucket_name)
            .create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from_str(region).unwrap())
                    .build(),
            )
            .send()
            .await
            .expect("create bucket");

        client
            .put_bucket_lifecycle_configuration()
            .bucket(bucket_name)
            .lifecycle_configuration(
                BucketLifecycleConfiguration::builder()
                    .rules(
                        LifecycleRule::builder()
                            .id("delete-after-1d")
                            .filter(LifecycleRuleFilter::ObjectSizeGreaterThan(0))
                            .status(ExpirationStatus::Enabled)
                            .expiration(LifecycleExpiration::builder().days(1).build())
                            .build()
                            .expect("build lifecycle rule"),
                    )
                    .build()
                    .expect("build lifecycle configuration"),
            )
            .send()
            .await
            .expect("set bucket lifecycle");
    }

    async fn delete(&self) {
        let mut paginator = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket_name)
            .into_paginator()
            .send();
        while let Some(page) = paginator.next().await {
            for object in page.expect("list objects page").contents.unwrap_or_default() {
                self.client
                    .delete_object()
                    .bucket(&self.bucket_name)
                    .key(object.key.unwrap())
                    .send()
                    .await
                    .expect("delete object");
            }
        }
        self.client
            .delete_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .expect("delete bucket");
    }
}

impl Drop for TempBucket {
    fn drop(&mut self) {
        self.runtime.block_on(self.delete());
    }
}

#[test]
fn write_read_delete_round_trip() {
    let bucket = TempBucket::new();
    let fs = s3vfs::open();
    let uri = format!("{}/greeting.txt", bucket.url());

    let mut writer = fs.open_write(&uri).expect("open-write");
    writer.append(b"hello, ").expect("append");
    writer.append(b"world").expect("append");
    writer.close().expect("close");

    let region = fs.read_region(&uri).expect("read-region");
    assert_eq!(region.as_slice(), b"hello, world");

    let stat = fs.stat(&uri).expect("stat");
    assert_eq!(stat.length, 12);
    assert!(!stat.is_directory);

    fs.delete_file(&uri).expect("delete-file");
    assert!(!fs.exists(&uri).expect("exists"));
}

#[test]
fn append_resumes_from_existing_content() {
    let bucket = TempBucket::new();
    let fs = s3vfs::open();
    let uri = format!("{}/log.txt", bucket.url());

    let mut writer = fs.open_write(&uri).expect("open-write");
    writer.append(b"first").expect("append");
    writer.close().expect("close");

    let mut appended = fs.open_append(&uri).expect("open-append");
    appended.append(b"second").expect("append");
    appended.close().expect("close");

    let region = fs.read_region(&uri).expect("read-region");
    assert_eq!(region.as_slice(), b"firstsecond");
}

#[test]
fn directories_list_and_delete() {
    let bucket = TempBucket::new();
    let fs = s3vfs::open();
    let dir_uri = format!("{}/subdir/", bucket.url());
    let file_uri = format!("{}/subdir/file.txt", bucket.url());

    fs.create_dir(&dir_uri).expect("create-dir");
    assert!(fs.stat(&dir_uri).expect("stat dir").is_directory);

    let mut writer = fs.open_write(&file_uri).expect("open-write");
    writer.append(b"x").expect("append");
    writer.close().expect("close");

    let listing = fs.list(&dir_uri).expect("list");
    assert_eq!(listing.files, vec!["file.txt".to_owned()]);

    fs.delete_file(&file_uri).expect("delete-file");
    fs.delete_dir(&dir_uri).expect("delete-dir");
}

#[test]
fn rename_moves_every_object_under_a_prefix() {
    let bucket = TempBucket::new();
    let fs = s3vfs::open();
    let src = format!("{}/src/a.txt", bucket.url());
    let tgt = format!("{}/tgt/a.txt", bucket.url());

    let mut writer = fs.open_write(&src).expect("open-write");
    writer.append(b"payload").expect("append");
    writer.close().expect("close");

    fs.rename(&format!("{}/src/", bucket.url()), &format!("{}/tgt/", bucket.url()))
        .expect("rename");

    assert!(!fs.exists(&src).expect("exists src"));
    let region = fs.read_region(&tgt).expect("read-region tgt");
    assert_eq!(region.as_slice(), b"payload");
}
