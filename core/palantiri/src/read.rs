use std::fmt::{self, Display};

/// Error which can occur during [`Counter::next_value`](crate::resolver::Counter::next_value).
///
/// A read error is never fatal to the engine: the counter is simply omitted from the
/// snapshot of the current tick, and will be read again on the next tick.
#[derive(Debug)]
pub enum ReadError {
    /// The error is temporary, reading again may work.
    ///
    /// You should use this kind of error when the counter reads an external entity
    /// that you know can fail from time to time.
    CanRetry(anyhow::Error),
    /// The measured instance no longer exists.
    ///
    /// Use this when the object that you measure disappears in an expected way.
    /// For instance, a process can exit, which removes its associated files in the procfs.
    /// The recreation loop of the engine will ask the resolver for a fresh resource later,
    /// which may find a new instance (for example a restarted process).
    Gone,
}

impl Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::CanRetry(e) => write!(f, "reading failed (but could work later): {e}"),
            ReadError::Gone => write!(f, "the measured instance is gone"),
        }
    }
}

// Allow to convert from anyhow::Error to read errors
// NOTE: this prevents ReadError from implementing Error...
impl<T: Into<anyhow::Error>> From<T> for ReadError {
    fn from(value: T) -> Self {
        Self::CanRetry(value.into())
    }
}

/// Adds the convenient method `error.gone_read()`.
pub trait ReadGone<T> {
    fn gone_read(self) -> Result<T, ReadError>;
}

impl<T, E> ReadGone<T> for Result<T, E> {
    /// Turns this error into [`ReadError::Gone`], discarding the error value.
    fn gone_read(self) -> Result<T, ReadError> {
        self.map_err(|_| ReadError::Gone)
    }
}
