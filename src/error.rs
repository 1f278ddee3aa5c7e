use std::sync::Arc;

/// Represents a result type for fallible operations in this crate.
///
/// Flag evaluation itself never fails: problems with flag data are reported through
/// [`Reason::Error`](crate::eval::Reason::Error). `Result` is used by stores, store wrappers and
/// context builders.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by persistent stores and big segment stores.
///
/// Store implementations live outside of this crate, so their errors are carried as opaque trait
/// objects.
pub type StoreError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Enum representing possible errors.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Underlying persistent store or big segment store failed.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Context could not be built because of invalid key or kind.
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Indicates that the background refresh thread panicked. This should normally never happen.
    #[error("refresh thread panicked")]
    RefreshThreadPanicked,
}

impl Error {
    /// Wrap any error coming from an external store.
    pub fn store<E>(err: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Store(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}
