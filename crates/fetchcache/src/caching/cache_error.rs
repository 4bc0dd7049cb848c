use thiserror::Error;
use tokio::task::JoinError;

/// An error that happens while resolving a cache lookup.
///
/// A single failed fetch is shared between all callers that were coalesced onto it, which is why
/// this type is [`Clone`] and carries the rendered error message rather than the original error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The fetch function failed on every allowed attempt.
    ///
    /// The message contains the full context chain of the last failure.
    #[error("fetch failed after {attempts} attempt(s): {message}")]
    FetchFailed { attempts: u32, message: String },
    /// Nothing is cached for the key, and there is no known way to fetch it.
    #[error("not found")]
    NotFound,
    /// The cache was closed and does not accept new lookups.
    #[error("cache is closed")]
    Closed,
    /// An unexpected error in the cache itself, like a panicking fetch task.
    #[error("internal error")]
    InternalError,
}

impl From<JoinError> for CacheError {
    #[track_caller]
    fn from(err: JoinError) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    pub(crate) fn fetch_failed(attempts: u32, err: &anyhow::Error) -> Self {
        Self::FetchFailed {
            attempts,
            message: format!("{err:#}"),
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short tag identifying the kind of error, for use in metrics.
    pub fn as_tag(&self) -> &'static str {
        match self {
            CacheError::FetchFailed { .. } => "fetch-failed",
            CacheError::NotFound => "not-found",
            CacheError::Closed => "closed",
            CacheError::InternalError => "internal",
        }
    }
}

/// The outcome of resolving a single key.
pub type FetchResult<T> = Result<T, CacheError>;
