//! The recreation loop: periodically refresh the resource of every counter.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Shared;
use super::sleep::{Wakeup, sleep_or_cancel};

pub(super) async fn run(shared: Arc<Shared>, token: CancellationToken) {
    log::debug!("Recreation loop started, period: {:?}", shared.recreation_period);
    while sleep_or_cancel(shared.recreation_period, &token).await == Wakeup::Elapsed {
        recreate_all(&shared).await;
    }
    log::debug!("Recreation loop stopped");
}

enum Outcome {
    Recreated,
    Kept,
    Failed,
}

/// Asks the resolver for a new resource for each counter of the current set.
///
/// Counters that have never been resolved are resolved, the counters with a stale resource are
/// refreshed, the others keep their resource. When it fails, the previous resource stays in place.
pub(super) async fn recreate_all(shared: &Shared) {
    let counters = shared.counters();
    log::info!("Counters recreation started");

    let mut tasks = JoinSet::new();
    for handle in counters.iter().cloned() {
        let Ok(permit) = shared.refresh_permits.clone().acquire_owned().await else {
            break;
        };
        let resolver = shared.resolver.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let res = if !handle.is_resolved() {
                resolver.resolve(handle.id())
            } else if handle.needs_recreation() {
                resolver.refresh(handle.id())
            } else {
                log::trace!("counter {} is up to date, kept", handle.alias());
                return Outcome::Kept;
            };
            match res {
                Ok(resource) => {
                    handle.replace_resource(resource);
                    Outcome::Recreated
                }
                Err(e) => {
                    log::warn!("Could not recreate counter {}: {e}", handle.alias());
                    Outcome::Failed
                }
            }
        });
    }

    let mut recreated = 0;
    let mut kept = 0;
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Outcome::Recreated) => recreated += 1,
            Ok(Outcome::Kept) => kept += 1,
            Ok(Outcome::Failed) => (),
            Err(e) => log::error!("counter recreation task failed: {e}"),
        }
    }
    log::info!(
        "Counters recreation finished: {recreated}/{} recreated, {kept} up to date",
        counters.len()
    );
}
