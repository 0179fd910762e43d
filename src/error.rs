//! Error type shared by every operation this crate exposes.
//!
//! Modeled on `sourcefrog-conserve`'s `transport::error::Error`, generalized
//! from that transport's two-variant enum to the flat `kind` + `path` +
//! `source` shape the retry decorator needs: it must be able to match on
//! the failure class alone, regardless of which operation produced it.
//! The `from_sdk_error` + per-operation `From<&XxxError> for ErrorKind`
//! pattern below is lifted directly from
//! `sourcefrog-conserve/src/transport/s3.rs`'s `s3_error` helper.

use std::fmt;

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::delete_object::DeleteObjectError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;

/// Classification of a failure, shared across every façade and file-handle
/// operation. These are the only kinds the retry decorator ever sees.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A path or argument failed validation before any I/O was attempted.
    InvalidArgument,
    /// The object, bucket, or directory marker does not exist.
    NotFound,
    /// A ranged read started at or past the end of the object.
    OutOfRange,
    /// The operation cannot proceed in the handle's current state.
    FailedPrecondition,
    /// A local or logical failure not attributable to the object store.
    Internal,
    /// The object store (or network) is transiently unavailable.
    Unavailable,
    /// A request exceeded its deadline.
    DeadlineExceeded,
    /// An SDK error that doesn't fit a more specific kind.
    Unknown,
    /// The retry envelope exhausted `MAX_RETRIES`.
    Aborted,
}

impl ErrorKind {
    /// Whether the default retry envelope should retry an error of this kind.
    ///
    /// Retriable: `{Unavailable, DeadlineExceeded, Unknown, FailedPrecondition,
    /// Internal}`. `FailedPrecondition` is included even though in this
    /// crate its only producer is "writer already closed" — see
    /// `DESIGN.md` for why that's still correct.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Unavailable
                | ErrorKind::DeadlineExceeded
                | ErrorKind::Unknown
                | ErrorKind::FailedPrecondition
                | ErrorKind::Internal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Internal => "internal",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Error returned by every operation in this crate.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    /// The bucket-relative key (or, for bucket-level operations, the
    /// bucket name) the failing operation was acting on, when known.
    pub path: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(path) = &self.path {
            write!(f, ": {path}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl Error {
    pub fn new(kind: ErrorKind, path: impl Into<String>) -> Self {
        Error {
            kind,
            path: Some(path.into()),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            path: Some(path.into()),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error {
            kind: ErrorKind::InvalidArgument,
            path: Some(message.into()),
            source: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    /// An `Aborted` error embedding the final attempt's status, as produced
    /// by the retry envelope after `MAX_RETRIES` attempts.
    pub fn aborted(last: Error) -> Self {
        Error {
            kind: ErrorKind::Aborted,
            path: last.path.clone(),
            source: Some(Box::new(
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "all 10 retry attempts failed: {}",
                        last.source
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| last.kind.to_string())
                    ),
                ),
            )),
        }
    }
}

/// Classify an SDK error by its typed service-error variant where one of the
/// `From` impls below covers it; a transport-level failure below the
/// service-error layer (timeout, dispatch, or malformed response) is
/// classified directly from the `SdkError` variant instead, since there's no
/// service-specific error to match on.
pub(crate) fn from_sdk_error<K, E, R>(key: K, source: SdkError<E, R>) -> Error
where
    K: Into<String>,
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
    ErrorKind: for<'a> From<&'a E>,
{
    let kind = match &source {
        SdkError::ServiceError(service_err) => ErrorKind::from(service_err.err()),
        SdkError::TimeoutError(_) => ErrorKind::DeadlineExceeded,
        SdkError::DispatchFailure(_) => ErrorKind::Unavailable,
        SdkError::ResponseError(_) => ErrorKind::Unavailable,
        SdkError::ConstructionFailure(_) => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    };
    Error {
        kind,
        path: Some(key.into()),
        source: Some(Box::new(source)),
    }
}

impl From<&GetObjectError> for ErrorKind {
    fn from(source: &GetObjectError) -> Self {
        match source {
            GetObjectError::NoSuchKey(_) => ErrorKind::NotFound,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<&HeadObjectError> for ErrorKind {
    fn from(source: &HeadObjectError) -> Self {
        match source {
            HeadObjectError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<&HeadBucketError> for ErrorKind {
    fn from(source: &HeadBucketError) -> Self {
        match source {
            HeadBucketError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<&ListObjectsV2Error> for ErrorKind {
    fn from(source: &ListObjectsV2Error) -> Self {
        match source {
            ListObjectsV2Error::NoSuchBucket(_) => ErrorKind::NotFound,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<&DeleteObjectError> for ErrorKind {
    fn from(_source: &DeleteObjectError) -> Self {
        // `DeleteObject` is unconditionally idempotent in S3 itself; this
        // crate's own delete-idempotence (absorbing a `NotFound` from a
        // *previous* attempt) lives in the retry decorator, not here.
        ErrorKind::Unknown
    }
}

pub type Result<T> = std::result::Result<T, Error>;
