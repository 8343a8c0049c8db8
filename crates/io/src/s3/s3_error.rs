use aws_sdk_s3::{
    error::{ProvideErrorMetadata, SdkError},
    operation::{
        get_object::GetObjectError, head_object::HeadObjectError,
    },
};

use crate::error::{ErrorKind, IOError};

/// Classify an SDK error into an [`ErrorKind`], looking at the service
/// error code first and the HTTP status second. Timeouts and dispatch
/// failures never carried a response.
fn classify<E, R>(err: &SdkError<E, R>, code: Option<&str>, status: Option<u16>) -> ErrorKind {
    match err {
        SdkError::TimeoutError(_) => return ErrorKind::TimedOut,
        SdkError::DispatchFailure(_) => return ErrorKind::Unavailable,
        SdkError::ConstructionFailure(_) => return ErrorKind::Unsupported,
        _ => {}
    }

    if let Some(code) = code {
        match code {
            "NoSuchKey" | "NoSuchBucket" | "NotFound" => return ErrorKind::NotFound,
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" => {
                return ErrorKind::AccessDenied
            }
            "SlowDown" | "TooManyRequests" | "Throttling" | "ThrottlingException"
            | "RequestLimitExceeded" => return ErrorKind::Throttled,
            "RequestTimeout" => return ErrorKind::TimedOut,
            "ServiceUnavailable" | "InternalError" => return ErrorKind::Unavailable,
            "PreconditionFailed" => return ErrorKind::PreconditionFailed,
            _ => {}
        }
    }

    match status {
        Some(404) => ErrorKind::NotFound,
        Some(403) => ErrorKind::AccessDenied,
        Some(408) => ErrorKind::TimedOut,
        Some(429) => ErrorKind::Throttled,
        Some(500 | 502 | 503 | 504) => ErrorKind::Unavailable,
        _ => ErrorKind::Other,
    }
}

/// Turn any S3 SDK error into an [`IOError`] attributed to `location`.
pub(crate) fn parse_sdk_error<E>(
    err: SdkError<E, aws_smithy_runtime_api::http::Response>,
    operation: &str,
    location: &str,
) -> IOError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let (code, status) = match &err {
        SdkError::ServiceError(service_err) => (
            service_err.err().code().map(ToString::to_string),
            Some(service_err.raw().status().as_u16()),
        ),
        _ => (None, None),
    };
    let kind = classify(&err, code.as_deref(), status);
    let message = err
        .as_service_error()
        .and_then(ProvideErrorMetadata::message)
        .map_or_else(|| err.to_string(), ToString::to_string);

    IOError::new(kind, format!("S3 {operation} failed: {message}"))
        .at(location)
        .caused_by(err)
}

/// `HeadObject` reports a missing key with an empty 404 body, so the typed
/// variant check comes before the generic classification.
pub(crate) fn parse_head_object_error(
    err: SdkError<HeadObjectError, aws_smithy_runtime_api::http::Response>,
    location: &str,
) -> IOError {
    if matches!(err.as_service_error(), Some(e) if e.is_not_found()) {
        return IOError::new(ErrorKind::NotFound, "object does not exist").at(location);
    }
    parse_sdk_error(err, "HeadObject", location)
}

pub(crate) fn parse_get_object_error(
    err: SdkError<GetObjectError, aws_smithy_runtime_api::http::Response>,
    location: &str,
) -> IOError {
    if matches!(err.as_service_error(), Some(e) if e.is_no_such_key()) {
        return IOError::new(ErrorKind::NotFound, "object does not exist").at(location);
    }
    parse_sdk_error(err, "GetObject", location)
}
