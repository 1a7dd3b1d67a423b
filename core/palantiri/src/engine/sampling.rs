//! The sampling loop: read every counter, build a snapshot, notify the observers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::read::ReadError;
use crate::snapshot::{Snapshot, Timestamp};

use super::Shared;
use super::sleep::{Wakeup, sleep_or_cancel};

pub(super) async fn run(shared: Arc<Shared>, token: CancellationToken) {
    log::debug!("Sampling loop started, period: {:?}", shared.sample_period);
    while !token.is_cancelled() {
        tick(&shared).await;
        if sleep_or_cancel(shared.sample_period, &token).await == Wakeup::Cancelled {
            break;
        }
    }
    log::debug!("Sampling loop stopped");
}

/// Runs one complete cycle: collection, then notification.
pub(super) async fn tick(shared: &Arc<Shared>) -> Snapshot {
    let snapshot = collect(shared).await;
    notify(shared, snapshot).await
}

/// Reads the counters of the current set, with a bounded parallelism.
///
/// The timestamp of the snapshot is captured once, before the first read.
async fn collect(shared: &Shared) -> Snapshot {
    let counters = shared.counters();
    let timestamp = Timestamp::now();
    let divisor = shared.normalization_divisor;

    let mut reads = JoinSet::new();
    for (index, handle) in counters.iter().enumerate() {
        let Ok(permit) = shared.read_permits.clone().acquire_owned().await else {
            break;
        };
        let handle = handle.clone();
        reads.spawn_blocking(move || {
            let _permit = permit;
            let res = std::panic::catch_unwind(AssertUnwindSafe(|| handle.read(divisor)));
            (index, handle, res)
        });
    }

    let mut values = Vec::with_capacity(counters.len());
    while let Some(joined) = reads.join_next().await {
        let (index, handle, res) = match joined {
            Ok(read) => read,
            Err(e) => {
                log::error!("counter read task failed: {e}");
                continue;
            }
        };
        let alias = handle.alias();
        match res {
            Ok(Some(Ok(value))) => {
                log::trace!("{alias} = {value}");
                values.push((index, alias.to_owned(), value));
            }
            Ok(Some(Err(ReadError::Gone))) => {
                log::warn!("Counter {alias} is gone, it will be skipped until it is recreated");
            }
            Ok(Some(Err(ReadError::CanRetry(e)))) => {
                log::error!("Could not read counter {alias}: {e:#}");
            }
            Ok(None) => {
                log::trace!("counter {alias} has no resource yet, skipped");
            }
            Err(panic) => {
                log::error!("Counter {alias} panicked while being read: {panic:?}");
            }
        }
    }
    values.sort_unstable_by_key(|(index, _, _)| *index);

    log::debug!("Collected {}/{} counters", values.len(), counters.len());
    Snapshot::from_values(timestamp, values.into_iter().map(|(_, alias, value)| (alias, value)))
}

/// Delivers the snapshot to the observers, on a thread that is allowed to block.
async fn notify(shared: &Arc<Shared>, snapshot: Snapshot) -> Snapshot {
    let notified = shared.clone();
    let delivery = tokio::task::spawn_blocking(move || {
        notified.observers.notify(&snapshot);
        snapshot
    });
    match delivery.await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            // ObserverRegistry::notify catches the panics of the observers, this only happens on shutdown
            log::error!("snapshot notification failed: {e}");
            Snapshot::from_values(Timestamp::now(), std::iter::empty::<(String, f64)>())
        }
    }
}
