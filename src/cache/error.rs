use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Boxed fetcher failure, as produced by caller-supplied fetch functions.
pub type FetchError = Box<dyn StdError + Send + Sync>;

/// Failure surfaced by query operations.
///
/// Cancellation is deliberately absent: an aborted fetch is absorbed by the
/// engine and never reaches a caller as an error.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The fetcher failed. Stored verbatim on the entry and shared by every
    /// caller awaiting the same fetch.
    #[error("query fetch failed: {0}")]
    Fetch(Arc<dyn StdError + Send + Sync>),
    /// The entry holds a value of a different type than requested.
    #[error("cached value for `{key}` is not a `{expected}`")]
    TypeMismatch { key: String, expected: &'static str },
    /// The fetch task panicked or was torn down with its runtime.
    #[error("fetch task failed: {0}")]
    TaskFailed(String),
}

impl QueryError {
    pub fn fetch(error: impl Into<FetchError>) -> Self {
        Self::Fetch(Arc::from(error.into()))
    }

    pub fn type_mismatch<T>(key: impl Into<String>) -> Self {
        Self::TypeMismatch {
            key: key.into(),
            expected: std::any::type_name::<T>(),
        }
    }

    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::TaskFailed(message.into())
    }

    /// The fetcher's own error, when this is a fetch failure.
    pub fn fetch_source(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Fetch(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}
