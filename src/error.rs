//! Error types for S3 file operations
//!
//! Every failure surfaced by this crate is an [`S3Error`]. Callers that need
//! to branch on the failure should use [`S3Error::kind`], which maps the many
//! transport and service conditions onto the closed [`ErrorKind`] taxonomy.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for S3 file operations
pub type S3Result<T> = Result<T, S3Error>;

/// Structured classification of an [`S3Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No such bucket, key or version, or a directory marker
    NotExist,

    /// Access denied by the object store
    NotAllowed,

    /// Object changed underneath a read (ETag mismatch)
    Precondition,

    /// Transient failure that a retry may fix
    Temporary,

    /// Service unavailable, throttled, or credentials expired
    Unavailable,

    /// Malformed request that retrying cannot fix
    Fatal,

    /// The caller canceled the operation
    Canceled,

    /// Invalid argument supplied by the caller
    Invalid,

    /// Operation not supported for this handle
    NotSupported,

    /// Anything else
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotExist => "resource does not exist",
            ErrorKind::NotAllowed => "access denied",
            ErrorKind::Precondition => "precondition failed",
            ErrorKind::Temporary => "temporary error",
            ErrorKind::Unavailable => "resource unavailable",
            ErrorKind::Fatal => "fatal error",
            ErrorKind::Canceled => "operation was canceled",
            ErrorKind::Invalid => "invalid argument",
            ErrorKind::NotSupported => "operation not supported",
            ErrorKind::Other => "unknown error",
        };
        f.write_str(name)
    }
}

/// Tracing identifiers returned by S3 with every response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIds {
    /// `x-amz-request-id`
    pub request_id: Option<String>,

    /// `x-amz-id-2`
    pub extended_id: Option<String>,
}

impl RequestIds {
    pub fn new(request_id: Option<&str>, extended_id: Option<&str>) -> Self {
        Self {
            request_id: request_id.map(str::to_string),
            extended_id: extended_id.map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.request_id.is_none() && self.extended_id.is_none()
    }
}

impl fmt::Display for RequestIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x-amz-request-id: {}, x-amz-id-2: {}",
            self.request_id.as_deref().unwrap_or("-"),
            self.extended_id.as_deref().unwrap_or("-")
        )
    }
}

/// Errors that can occur during S3 file operations
#[derive(Error, Debug, Clone)]
pub enum S3Error {
    /// AWS SDK error that carries no service code (request construction, etc.)
    #[error("AWS SDK error: {0}")]
    Sdk(String),

    /// S3 service error with specific error code
    #[error("S3 service error ({code}): {message}")]
    Service {
        code: String,
        message: String,
        status: Option<u16>,
        ids: RequestIds,
    },

    /// Object or bucket not found, detected locally rather than by error code
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object changed during a read
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Network error (connection reset, DNS failure, response parsing)
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Error while streaming an object body
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid argument or configuration
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Operation not supported on this handle
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Operation was canceled by the caller
    #[error("Canceled: {0}")]
    Canceled(String),

    /// The handle was closed or discarded, or its actor is gone
    #[error("File closed: {0}")]
    Closed(String),

    /// A read that delivered `n` bytes before failing
    #[error("{source} (after reading {n} bytes)")]
    PartialRead { n: usize, source: Box<S3Error> },

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<S3Error>,
    },

    /// Final error of a retried operation
    #[error("{context}: {source} [{ids}] [retries={retries}, elapsed={elapsed:?}]")]
    Annotated {
        context: String,
        source: Box<S3Error>,
        ids: RequestIds,
        retries: u32,
        elapsed: Duration,
    },
}

impl S3Error {
    /// Add context to an error
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        S3Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build a service error from a code and message
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        S3Error::Service {
            code: code.into(),
            message: message.into(),
            status: None,
            ids: RequestIds::default(),
        }
    }

    /// The innermost S3 error code, if this error came from the service
    pub fn code(&self) -> Option<&str> {
        match self {
            S3Error::Service { code, .. } => Some(code.as_str()),
            S3Error::WithContext { source, .. }
            | S3Error::Annotated { source, .. }
            | S3Error::PartialRead { source, .. } => source.code(),
            _ => None,
        }
    }

    /// Request ids of the failed call, if the service returned any
    pub fn request_ids(&self) -> Option<&RequestIds> {
        match self {
            S3Error::Service { ids, .. } if !ids.is_empty() => Some(ids),
            S3Error::Annotated { ids, source, .. } => {
                if ids.is_empty() {
                    source.request_ids()
                } else {
                    Some(ids)
                }
            }
            S3Error::WithContext { source, .. } | S3Error::PartialRead { source, .. } => {
                source.request_ids()
            }
            _ => None,
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            S3Error::Service { code, status, .. } => kind_for_code(code, *status),
            S3Error::NotFound(_) => ErrorKind::NotExist,
            S3Error::Precondition(_) => ErrorKind::Precondition,
            S3Error::Network(_) | S3Error::Timeout(_) | S3Error::Io(_) => ErrorKind::Temporary,
            S3Error::Invalid(_) | S3Error::Closed(_) => ErrorKind::Invalid,
            S3Error::NotSupported(_) => ErrorKind::NotSupported,
            S3Error::Canceled(_) => ErrorKind::Canceled,
            S3Error::Sdk(_) => ErrorKind::Other,
            S3Error::WithContext { source, .. }
            | S3Error::Annotated { source, .. }
            | S3Error::PartialRead { source, .. } => source.kind(),
        }
    }

    pub fn is_not_exist(&self) -> bool {
        self.kind() == ErrorKind::NotExist
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }

    /// Check if a retry with the same client may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            S3Error::Network(msg) => !is_permanent_transport_message(msg),
            S3Error::Timeout(_) | S3Error::Io(_) => true,
            S3Error::Service {
                code,
                message,
                status,
                ..
            } => {
                is_retryable_code(code)
                    || is_throttle_code(code)
                    || matches!(status, Some(s) if *s >= 500 && *s != 501)
                    || is_transient_message(message)
            }
            S3Error::Sdk(msg) => is_transient_message(msg),
            S3Error::WithContext { source, .. }
            | S3Error::Annotated { source, .. }
            | S3Error::PartialRead { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Bytes a failed read delivered into the caller's buffer before failing
    pub fn bytes_read(&self) -> usize {
        match self {
            S3Error::PartialRead { n, .. } => *n,
            _ => 0,
        }
    }

    /// Check if the service asked us to slow down
    pub fn is_throttle(&self) -> bool {
        self.code().is_some_and(is_throttle_code)
    }
}

fn kind_for_code(code: &str, status: Option<u16>) -> ErrorKind {
    match code {
        "NoSuchBucket" | "NoSuchKey" | "NoSuchVersion" | "NotFound" => ErrorKind::NotExist,
        "AccessDenied" => ErrorKind::NotAllowed,
        "InvalidRequest" | "InvalidArgument" | "EntityTooSmall" | "EntityTooLarge"
        | "KeyTooLong" | "MethodNotAllowed" => ErrorKind::Fatal,
        "ExpiredToken" | "AccountProblem" | "ServiceUnavailable" | "TokenRefreshRequired"
        | "OperationAborted" => ErrorKind::Unavailable,
        "PreconditionFailed" => ErrorKind::Precondition,
        c if is_throttle_code(c) => ErrorKind::Unavailable,
        c if is_retryable_code(c) => ErrorKind::Temporary,
        _ => match status {
            Some(s) if s >= 500 && s != 501 => ErrorKind::Temporary,
            _ => ErrorKind::Other,
        },
    }
}

/// Check if an AWS error code is retryable
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "RequestError"
            | "RequestTimeout"
            | "ResponseTimeout"
            | "RequestTimeoutException"
            | "SerializationError"
            | "ReadError"
            | "InternalError"
            | "InternalServerError"
            | "XAmzContentSHA256Mismatch"
    )
}

/// Check if an AWS error code signals throttling
pub(crate) fn is_throttle_code(code: &str) -> bool {
    matches!(
        code,
        "SlowDown"
            | "Throttling"
            | "ThrottlingException"
            | "ThrottledException"
            | "RequestThrottled"
            | "RequestThrottledException"
            | "TooManyRequestsException"
            | "RequestLimitExceeded"
            | "BandwidthLimitExceeded"
            | "ProvisionedThroughputExceededException"
            | "PriorRequestNotComplete"
    )
}

fn is_transient_message(msg: &str) -> bool {
    msg.trim_end().ends_with("amazonaws.com: no such host")
        || msg.contains("resource unavailable")
        || msg.contains("Service Unavailable")
}

// DNS failures for non-AWS hosts usually mean a typo in the endpoint.
fn is_permanent_transport_message(msg: &str) -> bool {
    let msg = msg.trim_end();
    msg.ends_with("no such host") && !msg.ends_with("amazonaws.com: no such host")
}

impl From<io::Error> for S3Error {
    fn from(err: io::Error) -> Self {
        S3Error::Io(err.to_string())
    }
}

/// Convert AWS SDK errors to S3Error
impl<E> From<aws_sdk_s3::error::SdkError<E>> for S3Error
where
    E: aws_sdk_s3::error::ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    fn from(error: aws_sdk_s3::error::SdkError<E>) -> Self {
        use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
        use aws_sdk_s3::operation::{RequestId, RequestIdExt};

        match &error {
            SdkError::TimeoutError(_) => S3Error::Timeout(DisplayErrorContext(&error).to_string()),
            SdkError::DispatchFailure(_) => {
                S3Error::Network(format!("dispatch failure: {}", DisplayErrorContext(&error)))
            }
            SdkError::ResponseError(_) => {
                S3Error::Network(format!("response error: {}", DisplayErrorContext(&error)))
            }
            SdkError::ServiceError(context) => {
                let meta = context.err().meta();
                S3Error::Service {
                    code: meta.code().unwrap_or("Unknown").to_string(),
                    message: meta.message().unwrap_or_default().to_string(),
                    status: Some(context.raw().status().as_u16()),
                    ids: RequestIds::new(meta.request_id(), meta.extended_request_id()),
                }
            }
            _ => S3Error::Sdk(DisplayErrorContext(&error).to_string()),
        }
    }
}
