//! Sinks that receive the snapshots, and the registry that fans the snapshots out to them.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::snapshot::Snapshot;

/// Receives every snapshot produced by the engine.
///
/// Observers are called sequentially, on a thread that is allowed to block (for instance on
/// network I/O), and never while an internal lock of the engine is held. A slow observer slows
/// down the whole sampling cycle.
pub trait Observer: Send {
    fn notify(&mut self, snapshot: &Snapshot) -> Result<(), NotifyError>;
}

/// Error which can occur during [`Observer::notify`].
#[derive(Debug)]
pub enum NotifyError {
    /// The snapshot could not be delivered, and the observer cannot be used anymore.
    ///
    /// The observer is removed from the registry.
    Fatal(anyhow::Error),
    /// The error is temporary, delivering the next snapshot may work.
    CanRetry(anyhow::Error),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Fatal(e) => write!(f, "fatal error in Observer::notify: {e}"),
            NotifyError::CanRetry(e) => write!(f, "notification failed (but could work later): {e}"),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for NotifyError {
    fn from(value: T) -> Self {
        Self::Fatal(value.into())
    }
}

/// Adds the convenient method `error.retry_notify()`.
pub trait NotifyRetry<T> {
    fn retry_notify(self) -> Result<T, NotifyError>;
}

impl<T, E: Into<anyhow::Error>> NotifyRetry<T> for Result<T, E> {
    /// Turns this error into [`NotifyError::CanRetry`].
    fn retry_notify(self) -> Result<T, NotifyError> {
        self.map_err(|e| NotifyError::CanRetry(e.into()))
    }
}

/// Identifies an observer in an [`ObserverRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

type GuardedObserver = Arc<Mutex<Box<dyn Observer>>>;

/// An ordered collection of observers.
///
/// The collection is replaced as a whole on every change, so that a notification that is in
/// progress keeps working with the observers that were registered when it began.
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<Arc<[(ObserverId, GuardedObserver)]>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            observers: Mutex::new(Arc::new([])),
        }
    }

    /// Registers an observer and returns its id.
    pub fn add_observer(&self, observer: Box<dyn Observer>) -> ObserverId {
        self.add_observers([observer])[0]
    }

    /// Registers several observers, in order, and returns their ids.
    pub fn add_observers(&self, observers: impl IntoIterator<Item = Box<dyn Observer>>) -> Vec<ObserverId> {
        let new: Vec<(ObserverId, GuardedObserver)> = observers
            .into_iter()
            .map(|o| {
                let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
                (id, Arc::new(Mutex::new(o)))
            })
            .collect();
        let ids: Vec<ObserverId> = new.iter().map(|(id, _)| *id).collect();

        let mut observers = self.lock();
        let updated: Arc<[_]> = observers.iter().cloned().chain(new).collect();
        *observers = updated;
        log::debug!("Observers added: {ids:?}");
        ids
    }

    /// Unregisters an observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.remove_all(&[id]) == 1
    }

    /// Returns the number of registered observers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers the snapshot to every observer, in registration order.
    ///
    /// A failing observer does not prevent the delivery to the others: the error is logged,
    /// and the observer is unregistered if the error is fatal (or if the observer panicked).
    ///
    /// Returns the number of observers that received the snapshot without error.
    pub fn notify(&self, snapshot: &Snapshot) -> usize {
        let observers = self.lock().clone();
        let mut delivered = 0;
        let mut broken = Vec::new();
        for (id, observer) in observers.iter() {
            let res = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.lock().unwrap_or_else(PoisonError::into_inner).notify(snapshot)
            }));
            match res {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(NotifyError::CanRetry(e))) => {
                    log::error!("Non-fatal error when notifying {id} (will retry): {e:#}");
                }
                Ok(Err(NotifyError::Fatal(e))) => {
                    log::error!("Fatal error when notifying {id} (it will be removed): {e:?}");
                    broken.push(*id);
                }
                Err(panic) => {
                    log::error!("{id} panicked during its notification (it will be removed): {panic:?}");
                    broken.push(*id);
                }
            }
        }
        if !broken.is_empty() {
            self.remove_all(&broken);
        }
        log::trace!("snapshot delivered to {delivered}/{} observers", observers.len());
        delivered
    }

    fn remove_all(&self, ids: &[ObserverId]) -> usize {
        let mut observers = self.lock();
        let before = observers.len();
        let updated: Arc<[_]> = observers.iter().filter(|(id, _)| !ids.contains(id)).cloned().collect();
        let removed = before - updated.len();
        *observers = updated;
        if removed > 0 {
            log::debug!("Observers removed: {ids:?}");
        }
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Arc<[(ObserverId, GuardedObserver)]>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::ObserverRegistry;
    use crate::snapshot::{Snapshot, Timestamp};
    use crate::test::{FailingObserver, RecordingObserver};

    fn snapshot() -> Snapshot {
        Snapshot::from_values(Timestamp::now(), [("cpu", 42.0)])
    }

    #[test]
    fn every_observer_is_notified() {
        let registry = ObserverRegistry::new();
        let a = RecordingObserver::new();
        let b = RecordingObserver::new();
        registry.add_observers([a.boxed(), b.boxed()]);

        assert_eq!(registry.notify(&snapshot()), 2);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a.snapshots()[0].get("cpu").map(|v| v.value), Some(42.0));
    }

    #[test]
    fn remove_by_id() {
        let registry = ObserverRegistry::new();
        let a = RecordingObserver::new();
        let b = RecordingObserver::new();
        let id_a = registry.add_observer(a.boxed());
        registry.add_observer(b.boxed());

        assert!(registry.remove_observer(id_a));
        assert!(!registry.remove_observer(id_a));
        registry.notify(&snapshot());
        assert_eq!(a.len(), 0);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn failures_are_isolated() {
        let registry = ObserverRegistry::new();
        let retry = FailingObserver::retry();
        let fatal = FailingObserver::fatal();
        let panicking = FailingObserver::panicking();
        let ok = RecordingObserver::new();
        registry.add_observers([retry.boxed(), fatal.boxed(), panicking.boxed(), ok.boxed()]);

        assert_eq!(registry.notify(&snapshot()), 1);
        assert_eq!(ok.len(), 1);
        // the fatal and panicking observers are removed, the retryable one stays
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.notify(&snapshot()), 1);
        assert_eq!(ok.len(), 2);
        assert_eq!(retry.calls(), 2);
        assert_eq!(fatal.calls(), 1);
        assert_eq!(panicking.calls(), 1);
    }
}
