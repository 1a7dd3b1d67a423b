//! Interface between the engine and the platform that provides the counters.

use thiserror::Error;

use crate::counter::CounterId;
use crate::read::ReadError;

/// A live, readable counter resource, produced by a [`Resolver`].
///
/// The engine reads a counter from a blocking thread, and never reads the same counter
/// twice at the same time. Reading may block on I/O.
pub trait Counter: Send {
    /// Reads the next raw value of the counter.
    fn next_value(&mut self) -> Result<f64, ReadError>;

    /// Returns `true` if the recreation loop should replace this resource with a fresh one.
    ///
    /// A counter that computes a rate between two reads keeps its previous reading in its state.
    /// It should return `false` as long as the object it measures still exists, so that the
    /// recreation loop keeps it (and its state). The default is `true`.
    fn is_stale(&self) -> bool {
        true
    }
}

/// Turns a counter identity into a live [`Counter`], and refreshes it later.
///
/// A resolver is shared by the sampling loop, the recreation loop and the threads that
/// add counters, therefore it must be `Send + Sync`.
pub trait Resolver: Send + Sync {
    /// Produces a new resource for the counter identified by `id`.
    fn resolve(&self, id: &CounterId) -> Result<Box<dyn Counter>, ResolveError>;

    /// Produces a fresh resource for a counter that has already been resolved once.
    ///
    /// This is called periodically by the recreation loop for the counters whose current
    /// resource is stale (see [`Counter::is_stale`]), in order to recover from resources that
    /// have been invalidated externally (for instance, a process that disappeared and
    /// reappeared with a new pid). The default implementation resolves the counter again.
    fn refresh(&self, id: &CounterId) -> Result<Box<dyn Counter>, ResolveError> {
        self.resolve(id)
    }

    /// Lists the counters that this resolver knows how to resolve, if it can enumerate them.
    fn list_available(&self) -> Result<Vec<CounterId>, ResolveError> {
        Ok(Vec::new())
    }
}

/// Error which can occur in [`Resolver::resolve`] or [`Resolver::refresh`].
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The counter (or its instance) does not exist at the moment.
    #[error("counter {0} not found")]
    NotFound(CounterId),
    /// The resolver does not support this kind of counter.
    #[error("unsupported counter {0}: {1}")]
    Unsupported(CounterId, String),
    /// An I/O error occurred while looking for the counter.
    #[error("I/O error while resolving {0}")]
    Io(CounterId, #[source] std::io::Error),
    #[error("could not resolve {0}")]
    Other(CounterId, #[source] anyhow::Error),
}

impl ResolveError {
    /// Returns the identity of the counter that could not be resolved.
    pub fn counter(&self) -> &CounterId {
        match self {
            ResolveError::NotFound(id)
            | ResolveError::Unsupported(id, _)
            | ResolveError::Io(id, _)
            | ResolveError::Other(id, _) => id,
        }
    }

    /// Returns `true` if the counter may become resolvable later, i.e. if it is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::NotFound(_) | ResolveError::Io(_, _))
    }
}
