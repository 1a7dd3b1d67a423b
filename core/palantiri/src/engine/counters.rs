//! Copy-on-write updates of the counter set.

use std::sync::Arc;

use crate::config::DuplicateAliasPolicy;
use crate::counter::CounterHandle;

use super::EngineError;

/// The active counters of an engine.
///
/// The set is never modified in place: every change builds a new set, so that a tick that
/// has fetched the previous one keeps a consistent view of it.
pub(crate) type CounterSet = Arc<[Arc<CounterHandle>]>;

/// Builds the set that results from adding `new` to `current`.
pub(super) fn with_added(
    current: &[Arc<CounterHandle>],
    new: Vec<CounterHandle>,
    policy: DuplicateAliasPolicy,
) -> Result<CounterSet, EngineError> {
    let mut set = current.to_vec();
    for handle in new {
        match set.iter().position(|c| c.alias() == handle.alias()) {
            Some(_) if policy == DuplicateAliasPolicy::Reject => {
                return Err(EngineError::DuplicateAlias(handle.alias().to_owned()));
            }
            Some(pos) => {
                log::warn!("Counter '{}' replaced by {}", handle.alias(), handle.id());
                set[pos] = Arc::new(handle);
            }
            None => set.push(Arc::new(handle)),
        }
    }
    Ok(set.into())
}

/// Builds the set that results from removing the counters named by `aliases` from `current`.
///
/// Returns the new set and the removed handles, in the order of the set.
pub(super) fn without(current: &[Arc<CounterHandle>], aliases: &[String]) -> (CounterSet, Vec<Arc<CounterHandle>>) {
    let (removed, kept): (Vec<_>, Vec<_>) = current
        .iter()
        .cloned()
        .partition(|c| aliases.iter().any(|a| a == c.alias()));
    (kept.into(), removed)
}

/// Returns the first of `aliases` that is already used in `current`, or that appears twice.
pub(super) fn find_duplicate<'a>(
    current: &[Arc<CounterHandle>],
    mut aliases: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let mut seen: Vec<&str> = current.iter().map(|c| c.alias()).collect();
    aliases.find_map(|alias| {
        if seen.contains(&alias) {
            Some(alias.to_owned())
        } else {
            seen.push(alias);
            None
        }
    })
}
