#[derive(Debug, thiserror::Error)]
#[error("`{location}` is not a usable location: {reason}")]
pub struct InvalidLocationError {
    pub reason: String,
    pub location: String,
}

impl InvalidLocationError {
    pub fn new(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            location: location.into(),
        }
    }
}

/// Broad classification of a storage failure. Backends map their native
/// error codes onto this set; everything above the backends branches on it
/// (retry loops on the transient kinds, the precondition evaluator on
/// [`ErrorKind::NotFound`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// The object or bucket does not exist.
    NotFound,
    /// Credentials were rejected or lack permission.
    AccessDenied,
    /// The service asked us to back off.
    Throttled,
    /// The request or connection timed out.
    TimedOut,
    /// The backend is temporarily unable to serve requests.
    Unavailable,
    /// A precondition on the request did not hold.
    PreconditionFailed,
    /// The backend does not support this operation.
    Unsupported,
    /// Nothing more specific could be determined.
    Other,
}

impl ErrorKind {
    /// Whether retrying the same request may succeed. Unclassified
    /// failures count as transient so that flaky connections get their
    /// retries.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled | ErrorKind::TimedOut | ErrorKind::Unavailable | ErrorKind::Other
        )
    }
}

/// A classified storage failure: what went wrong, where, and the backend
/// error that caused it.
#[derive(thiserror::Error, Debug)]
#[error("{reason} ({kind}){}{}", location.as_ref().map_or_else(String::new, |l| format!(" at `{l}`")), source.as_ref().map_or_else(String::new, |s| format!("; caused by: {s:#}")))]
pub struct IOError {
    kind: ErrorKind,
    reason: String,
    location: Option<String>,
    source: Option<anyhow::Error>,
}

impl IOError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            location: None,
            source: None,
        }
    }

    /// Attribute the failure to a location.
    #[must_use]
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Attach the underlying backend error.
    #[must_use]
    pub fn caused_by(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StatError {
    #[error("cannot stat {0}")]
    InvalidLocation(#[from] InvalidLocationError),
    #[error("stat failed: {0}")]
    IOError(#[from] IOError),
}

impl StatError {
    /// True iff the stat failed because the object does not exist. The
    /// precondition evaluator treats this case as "proceed", every other
    /// stat failure as fatal.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StatError::IOError(e) if e.kind() == ErrorKind::NotFound)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("cannot read {0}")]
    InvalidLocation(#[from] InvalidLocationError),
    #[error("read failed: {0}")]
    IOError(#[from] IOError),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("cannot write {0}")]
    InvalidLocation(#[from] InvalidLocationError),
    #[error("write failed: {0}")]
    IOError(#[from] IOError),
}

#[derive(thiserror::Error, Debug)]
pub enum DeleteError {
    #[error("cannot delete {0}")]
    InvalidLocation(#[from] InvalidLocationError),
    #[error("delete failed: {0}")]
    IOError(#[from] IOError),
}

#[derive(thiserror::Error, Debug)]
pub enum DeleteBatchFatalError {
    #[error("cannot batch-delete {0}")]
    InvalidLocation(#[from] InvalidLocationError),
    #[error("batch delete failed: {0}")]
    IOError(#[from] IOError),
}

/// Per-key failure inside an otherwise-delivered batch delete response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDeleteError {
    /// The location that failed to delete, if the service echoed the key back
    pub location: Option<String>,
    /// Service error code, when one was returned for this key
    pub error_code: Option<String>,
    /// What the service said went wrong
    pub error_message: String,
}

impl BatchDeleteError {
    #[must_use]
    pub fn new(
        location: Option<String>,
        error_code: Option<String>,
        error_message: String,
    ) -> Self {
        Self {
            location,
            error_code,
            error_message,
        }
    }
}

impl std::fmt::Display for BatchDeleteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "Failed to delete `{location}`: ")?,
            None => write!(f, "Failed to delete object: ")?,
        }

        match (&self.error_code, &self.error_message) {
            (Some(code), message) => write!(f, "{code} - {message}"),
            (None, message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for BatchDeleteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Throttled.is_transient());
        assert!(ErrorKind::TimedOut.is_transient());
        assert!(ErrorKind::Other.is_transient());
        assert!(!ErrorKind::NotFound.is_transient());
        assert!(!ErrorKind::AccessDenied.is_transient());
        assert!(!ErrorKind::Unsupported.is_transient());
    }

    #[test]
    fn test_io_error_display() {
        let plain = IOError::new(ErrorKind::NotFound, "object does not exist");
        assert_eq!(plain.to_string(), "object does not exist (not-found)");

        let located = IOError::new(ErrorKind::AccessDenied, "rejected").at("s3://b/k");
        assert_eq!(located.to_string(), "rejected (access-denied) at `s3://b/k`");
    }

    #[test]
    fn test_stat_not_found_probe() {
        let missing: StatError = IOError::new(ErrorKind::NotFound, "gone").into();
        assert!(missing.is_not_found());

        let denied: StatError = IOError::new(ErrorKind::AccessDenied, "no").into();
        assert!(!denied.is_not_found());
    }
}
