//! Lazily construct and memoize the S3 client, transfer executor, and
//! transfer manager from environment configuration.
//!
//! Grounded on `sourcefrog-conserve/src/transport/s3.rs::load_aws_config`
//! (which builds an `aws_config` loader from a region override and bridges
//! into the async SDK with a dedicated Tokio runtime, since the rest of the
//! host is synchronous) and generalized to a fuller environment-variable
//! surface (endpoint override, legacy region fallback, config-file region,
//! HTTP vs. HTTPS, TLS verification).

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use aws_types::SdkConfig;
use tokio::runtime::Runtime;

use crate::error::{Error, ErrorKind, Result};
use crate::transfer::TransferManager;

/// Number of worker threads backing the transfer executor.
pub const TRANSFER_EXECUTOR_THREADS: usize = 5;

/// Everything a façade or file handle needs to talk to S3: the client
/// itself, the blocking-bridge runtime, and the transfer manager used by
/// writable files and multipart copy.
pub struct S3Environment {
    pub(crate) client: aws_sdk_s3::Client,
    pub(crate) runtime: Runtime,
    pub(crate) transfer: TransferManager,
}

/// One-time, mutex-guarded holder for the process-wide [`S3Environment`].
///
/// The host framework sees only an opaque, cheaply-cloned handle;
/// construction happens exactly once regardless of how many filesystem
/// instances are opened concurrently.
#[derive(Clone, Default)]
pub struct ClientProvider {
    inner: Arc<OnceLock<Arc<S3Environment>>>,
    // Guards the one-time construction path; `OnceLock` alone would let two
    // racing callers both start building before either finishes.
    building: Arc<Mutex<()>>,
}

impl ClientProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized environment, constructing it on first use.
    pub fn get(&self) -> Result<Arc<S3Environment>> {
        if let Some(env) = self.inner.get() {
            return Ok(env.clone());
        }
        let _guard = self.building.lock().expect("client provider mutex poisoned");
        if let Some(env) = self.inner.get() {
            return Ok(env.clone());
        }
        let env = Arc::new(build_environment()?);
        // `OnceLock::set` can only fail if another thread beat us to it,
        // which the `building` mutex above already rules out.
        let _ = self.inner.set(env.clone());
        Ok(env)
    }
}

fn build_environment() -> Result<S3Environment> {
    // The transfer executor is a fixed pool of worker threads that
    // multipart-upload parts run on. Unlike
    // `sourcefrog-conserve/src/transport/s3.rs`, which only ever has one
    // request in flight and so bridges with a `new_current_thread` runtime,
    // this adapter fans multiple part uploads out concurrently, so the
    // bridge runtime itself is the executor.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TRANSFER_EXECUTOR_THREADS)
        .enable_all()
        .build()
        .map_err(|err| Error::with_source(ErrorKind::Internal, "runtime", err))?;

    let config = runtime.block_on(load_sdk_config());

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&config)
        // Bucket names containing `.` break TLS hostname validation under
        // virtual-hosted addressing, so this adapter always uses
        // path-style addressing.
        .force_path_style(true);

    // Payload signing for GET/PUT/UploadPart is disabled per request (see
    // `reader.rs` and `transfer.rs`) rather than here: the SDK's signing
    // customization is only exposed on the individual fluent builders, not
    // on the shared client config.

    if env_bool("S3_VERIFY_SSL", true) {
        // TLS verification stays on the SDK's default HTTPS connector;
        // nothing to override. S3_CA_FILE / S3_CA_PATH would plug in here
        // via a custom connector if a host ever needs non-system trust
        // anchors; the default system trust store covers the common case.
    }

    if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
        let scheme = if env_bool("S3_USE_HTTPS", true) {
            "https"
        } else {
            "http"
        };
        let endpoint = if endpoint.contains("://") {
            endpoint
        } else {
            format!("{scheme}://{endpoint}")
        };
        s3_config_builder = s3_config_builder.endpoint_url(endpoint);
    }

    let client = aws_sdk_s3::Client::from_conf(s3_config_builder.build());

    let transfer = TransferManager::new(client.clone(), TRANSFER_EXECUTOR_THREADS);

    Ok(S3Environment {
        client,
        runtime,
        transfer,
    })
}

async fn load_sdk_config() -> SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

    if let Some(region) = resolve_region() {
        loader = loader.region(Region::new(region));
    }

    if let (Ok(key), Ok(secret)) = (
        std::env::var("AWS_ACCESS_KEY_ID"),
        std::env::var("AWS_SECRET_ACCESS_KEY"),
    ) {
        let token = std::env::var("AWS_SESSION_TOKEN").ok();
        loader = loader.credentials_provider(Credentials::new(
            key,
            secret,
            token,
            None,
            "s3vfs-environment",
        ));
    }

    loader.load().await
}

/// `AWS_REGION` takes precedence over the deprecated `S3_REGION`; if neither
/// is set and `AWS_SDK_LOAD_CONFIG` asks for it, fall back to `[default]`
/// in the AWS config file.
fn resolve_region() -> Option<String> {
    if let Ok(region) = std::env::var("AWS_REGION") {
        return Some(region);
    }
    if let Ok(region) = std::env::var("S3_REGION") {
        return Some(region);
    }
    if env_bool("AWS_SDK_LOAD_CONFIG", false) {
        return region_from_config_file();
    }
    None
}

fn region_from_config_file() -> Option<String> {
    let path = std::env::var("AWS_CONFIG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_home().join(".aws").join("config"));
    let contents = std::fs::read_to_string(path).ok()?;
    let mut in_default_profile = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_default_profile = line == "[default]";
            continue;
        }
        if in_default_profile {
            if let Some(value) = line.strip_prefix("region") {
                if let Some(value) = value.trim_start().strip_prefix('=') {
                    return Some(value.trim().to_owned());
                }
            }
        }
    }
    None
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_default()
}

fn env_bool(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(value) => value != "0",
        Err(_) => default,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_bool_defaults_and_zero() {
        std::env::remove_var("S3VFS_TEST_FLAG");
        assert!(env_bool("S3VFS_TEST_FLAG", true));
        std::env::set_var("S3VFS_TEST_FLAG", "0");
        assert!(!env_bool("S3VFS_TEST_FLAG", true));
        std::env::set_var("S3VFS_TEST_FLAG", "1");
        assert!(env_bool("S3VFS_TEST_FLAG", false));
        std::env::remove_var("S3VFS_TEST_FLAG");
    }

    #[test]
    fn region_from_config_file_reads_default_profile() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config");
        std::fs::write(
            &config_path,
            "[profile other]\nregion = eu-west-1\n[default]\nregion = us-west-2\n",
        )
        .unwrap();
        std::env::set_var("AWS_CONFIG_FILE", &config_path);
        assert_eq!(region_from_config_file(), Some("us-west-2".to_owned()));
        std::env::remove_var("AWS_CONFIG_FILE");
    }
}
