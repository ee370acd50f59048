use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[non_exhaustive]
#[derive(Debug, ThisError)]
pub(crate) enum PageBlobError {
    #[error("object store error")]
    ObjectStoreError(#[from] Arc<object_store::Error>),

    #[error("object changed since it was last observed. key=`{key}`")]
    PreconditionFailed {
        key: String,
        #[source]
        source: Arc<object_store::Error>,
    },

    #[error("object not found. key=`{key}`")]
    ObjectNotFound {
        key: String,
        #[source]
        source: Arc<object_store::Error>,
    },

    #[error("write is not page aligned. offset=`{offset}`, len=`{len}`, page_size=`{page_size}`")]
    UnalignedWrite { offset: u64, len: u64, page_size: u64 },

    #[error("range out of bounds. start=`{start}`, end=`{end}`, size=`{size}`")]
    RangeOutOfBounds { start: u64, end: u64, size: u64 },

    #[error("size does not fit in whole pages. needed=`{needed}`, page_size=`{page_size}`")]
    SizeOverflow { needed: u64, page_size: u64 },

    #[error("invalid blob key. key=`{key}`, reason=`{reason}`")]
    InvalidKey { key: String, reason: String },

    #[error("invalid page size, it must be greater than 0. page_size=`{0}`")]
    InvalidPageSize(u64),

    #[error("invalid initial page count, it must be greater than 0. initial_page_count=`{0}`")]
    InvalidInitialPageCount(u32),

    #[error("invalid growth factor, it must be at least 1.0. growth_factor=`{0}`")]
    InvalidGrowthFactor(f64),

    #[error("invalid retry delays, min_delay must not exceed max_delay. min_delay=`{min_delay:?}`, max_delay=`{max_delay:?}`")]
    InvalidRetryDelays {
        min_delay: Duration,
        max_delay: Duration,
    },

    #[error("invalid retry delay, min_delay must be greater than 0")]
    InvalidMinDelay,

    #[error("invalid retry attempts, it must be greater than 0 when set")]
    InvalidMaxAttempts,

    #[error("conflict retries exhausted. attempts=`{attempts}`")]
    RetryExhausted { attempts: u32 },

    #[error("invalid record frame. key=`{key}`, reason=`{reason}`")]
    InvalidFrame { key: String, reason: String },

    // used to pass through errors from callbacks like codecs and mutators
    #[error("callback error")]
    CallbackError(BoxError),

    #[error("unknown configuration file format. path=`{0}`")]
    UnknownConfigurationFormat(PathBuf),

    #[error("invalid configuration format")]
    InvalidConfigurationFormat(#[from] Box<figment::Error>),
}

impl From<object_store::Error> for PageBlobError {
    fn from(value: object_store::Error) -> Self {
        Self::ObjectStoreError(Arc::new(value))
    }
}

/// Represents the kind of public errors that can be returned to the user.
///
/// Only [ErrorKind::Conflict] is retryable by re-reading the object and redoing the
/// mutation. Every other kind is surfaced to the caller unchanged.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object's revision tag changed since it was last observed. The caller must
    /// re-read the object and retry the mutation. Never indicates data corruption.
    Conflict,

    /// User attempted an invalid request. This might be:
    ///
    /// - A write whose offset or length is not page aligned
    /// - A read or write past the allocated size of the object
    /// - An invalid configuration
    /// - A user-supplied callback such as a codec or mutation failed
    ///
    /// The user must correct the code, configuration, or argument. Never retried.
    Invalid,

    /// The referenced object does not exist. The caller decides whether to create it.
    NotFound,

    /// A storage or network service is unavailable, or rejected the request for a reason
    /// other than a concurrency conflict. The original cause is attached as the source.
    Unavailable,

    /// The optimistic-concurrency loop ran out of attempts while still seeing conflicts.
    RetryExhausted,

    /// Persisted bytes are in an unexpected state and could not be decoded.
    Data,

    /// An unexpected internal error occurred.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Conflict => write!(f, "Conflict error"),
            ErrorKind::Invalid => write!(f, "Invalid error"),
            ErrorKind::NotFound => write!(f, "NotFound error"),
            ErrorKind::Unavailable => write!(f, "Unavailable error"),
            ErrorKind::RetryExhausted => write!(f, "RetryExhausted error"),
            ErrorKind::Data => write!(f, "Data error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Represents a public error that can be returned to the user.
#[non_exhaustive]
#[derive(Debug)]
pub struct Error {
    msg: String,
    kind: ErrorKind,
    source: Option<BoxError>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl Error {
    /// Creates a new conflict error.
    pub fn conflict(msg: String) -> Self {
        Self::new(msg, ErrorKind::Conflict)
    }

    /// Creates a new invalid argument error.
    pub fn invalid(msg: String) -> Self {
        Self::new(msg, ErrorKind::Invalid)
    }

    /// Creates a new not found error.
    pub fn not_found(msg: String) -> Self {
        Self::new(msg, ErrorKind::NotFound)
    }

    /// Creates a new unavailable error.
    pub fn unavailable(msg: String) -> Self {
        Self::new(msg, ErrorKind::Unavailable)
    }

    /// Creates a new retry exhausted error.
    pub fn retry_exhausted(msg: String) -> Self {
        Self::new(msg, ErrorKind::RetryExhausted)
    }

    /// Creates a new data error.
    pub fn data(msg: String) -> Self {
        Self::new(msg, ErrorKind::Data)
    }

    /// Creates a new internal error.
    pub fn internal(msg: String) -> Self {
        Self::new(msg, ErrorKind::Internal)
    }

    fn new(msg: String, kind: ErrorKind) -> Self {
        Self {
            msg,
            kind,
            source: None,
        }
    }

    /// Adds a source to the error.
    pub fn with_source(mut self, source: BoxError) -> Self {
        self.source = Some(source);
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the error is a concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }
}

impl From<PageBlobError> for Error {
    fn from(err: PageBlobError) -> Self {
        let msg = err.to_string();
        match err {
            // Conflict errors
            PageBlobError::PreconditionFailed { source, .. } => {
                Error::conflict(msg).with_source(Box::new(source))
            }

            // NotFound errors
            PageBlobError::ObjectNotFound { source, .. } => {
                Error::not_found(msg).with_source(Box::new(source))
            }

            // Unavailable errors
            PageBlobError::ObjectStoreError(err) => {
                Error::unavailable(msg).with_source(Box::new(err))
            }

            // Invalid errors
            PageBlobError::UnalignedWrite { .. } => Error::invalid(msg),
            PageBlobError::RangeOutOfBounds { .. } => Error::invalid(msg),
            PageBlobError::SizeOverflow { .. } => Error::invalid(msg),
            PageBlobError::InvalidKey { .. } => Error::invalid(msg),
            PageBlobError::InvalidPageSize(_) => Error::invalid(msg),
            PageBlobError::InvalidInitialPageCount(_) => Error::invalid(msg),
            PageBlobError::InvalidGrowthFactor(_) => Error::invalid(msg),
            PageBlobError::InvalidRetryDelays { .. } => Error::invalid(msg),
            PageBlobError::InvalidMinDelay => Error::invalid(msg),
            PageBlobError::InvalidMaxAttempts => Error::invalid(msg),
            PageBlobError::CallbackError(err) => Error::invalid(msg).with_source(err),
            PageBlobError::UnknownConfigurationFormat(_) => Error::invalid(msg),
            PageBlobError::InvalidConfigurationFormat(err) => {
                Error::invalid(msg).with_source(err)
            }

            // Retry errors
            PageBlobError::RetryExhausted { .. } => Error::retry_exhausted(msg),

            // Data errors
            PageBlobError::InvalidFrame { .. } => Error::data(msg),
        }
    }
}
