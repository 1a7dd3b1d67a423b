//! The sampling engine and its lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{self, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{DuplicateAliasPolicy, EngineConfig};
use crate::counter::{CounterHandle, CounterSpec};
use crate::observer::{Observer, ObserverId, ObserverRegistry};
use crate::resolver::{ResolveError, Resolver};
use crate::snapshot::Snapshot;

mod counters;
mod recreation;
mod sampling;
mod sleep;

use counters::CounterSet;

/// Error which can occur when building or controlling a [`SamplingEngine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
    #[error("a counter with alias '{0}' already exists")]
    DuplicateAlias(String),
    #[error("could not add counter '{alias}'")]
    Resolve {
        alias: String,
        #[source]
        source: ResolveError,
    },
    #[error("could not start the async runtime of the engine")]
    Runtime(#[source] std::io::Error),
    #[error("the sampling loops did not stop within {0:?}")]
    StopTimeout(Duration),
}

/// State of a [`SamplingEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
}

/// Polls a set of counters on a fixed cadence and delivers the snapshots to observers.
///
/// The engine runs two loops on an async runtime:
/// - the sampling loop reads every counter, builds a [`Snapshot`] and notifies the observers,
///   then waits for `sample_period`;
/// - the recreation loop waits for `recreation_period`, then refreshes the resource of every counter.
///
/// All the methods take `&self`: the engine can be shared between threads (for instance with an `Arc`).
/// The methods that wait (`add_counters`, `wait_stopped`, `sample_now`, `recreate_now`) must
/// not be called from an async task.
///
/// Dropping the engine stops it.
pub struct SamplingEngine {
    shared: Arc<Shared>,
    rt: Handle,
    /// Runtime created by the engine, if it has not been given one.
    owned_rt: Option<Runtime>,
}

/// State shared by the engine and its loops.
pub(crate) struct Shared {
    control: Mutex<Control>,
    observers: ObserverRegistry,
    resolver: Arc<dyn Resolver>,
    /// Bounds the number of counters that are read at the same time.
    read_permits: Arc<Semaphore>,
    /// Bounds the number of counters that are refreshed at the same time.
    /// Separate from `read_permits`: a slow recreation pass never delays a sampling tick.
    refresh_permits: Arc<Semaphore>,
    normalization_divisor: f64,
    duplicate_aliases: DuplicateAliasPolicy,
    sample_period: Duration,
    recreation_period: Duration,
}

/// Everything that is protected by the mutation lock.
struct Control {
    running: Option<CancellationToken>,
    counters: CounterSet,
    /// Loop tasks that may not have finished yet.
    tasks: Vec<JoinHandle<()>>,
}

impl Shared {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current counter set (cheap: the set is reference-counted).
    fn counters(&self) -> CounterSet {
        self.lock_control().counters.clone()
    }
}

impl SamplingEngine {
    /// Creates an idle engine without any counter, with its own multi-threaded runtime.
    pub fn new(config: EngineConfig, resolver: Arc<dyn Resolver>) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let mut builder = runtime::Builder::new_multi_thread();
        builder.enable_time().thread_name("palantiri-engine");
        if let Some(n) = config.worker_threads {
            builder.worker_threads(n);
        }
        let rt = builder.build().map_err(EngineError::Runtime)?;
        let mut engine = Self::with_runtime(config, resolver, rt.handle().clone())?;
        engine.owned_rt = Some(rt);
        Ok(engine)
    }

    /// Creates an idle engine without any counter, which runs its loops on an existing runtime.
    ///
    /// The runtime must have the time driver enabled.
    pub fn with_runtime(config: EngineConfig, resolver: Arc<dyn Resolver>, rt: Handle) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let shared = Shared {
            control: Mutex::new(Control {
                running: None,
                counters: Arc::new([]),
                tasks: Vec::new(),
            }),
            observers: ObserverRegistry::new(),
            resolver,
            read_permits: Arc::new(Semaphore::new(config.effective_parallel_reads())),
            refresh_permits: Arc::new(Semaphore::new(config.effective_parallel_reads())),
            normalization_divisor: config.effective_normalization_divisor(),
            duplicate_aliases: config.duplicate_aliases,
            sample_period: config.sample_period,
            recreation_period: config.recreation_period,
        };
        Ok(Self {
            shared: Arc::new(shared),
            rt,
            owned_rt: None,
        })
    }

    /// Starts the sampling and recreation loops.
    ///
    /// Does nothing if the engine is already running.
    pub fn start(&self) {
        let mut control = self.shared.lock_control();
        if control.running.is_some() {
            log::debug!("The sampling engine is already running");
            return;
        }
        let token = CancellationToken::new();
        let sampling = self.rt.spawn(sampling::run(self.shared.clone(), token.clone()));
        let recreation = self.rt.spawn(recreation::run(self.shared.clone(), token.clone()));
        control.tasks.retain(|t| !t.is_finished());
        control.tasks.extend([sampling, recreation]);
        control.running = Some(token);
        log::info!(
            "Sampling engine started with {} counters (sample period: {:?}, recreation period: {:?})",
            control.counters.len(),
            self.shared.sample_period,
            self.shared.recreation_period,
        );
    }

    /// Stops the sampling and recreation loops.
    ///
    /// Does nothing if the engine is not running. When this method returns, no new tick begins,
    /// but the tick in progress (if any) completes. Use [`wait_stopped`](Self::wait_stopped)
    /// to wait for it.
    pub fn stop(&self) {
        let mut control = self.shared.lock_control();
        if let Some(token) = control.running.take() {
            token.cancel();
            log::info!("Sampling engine stopped");
        }
    }

    pub fn state(&self) -> EngineState {
        match self.shared.lock_control().running {
            Some(_) => EngineState::Running,
            None => EngineState::Idle,
        }
    }

    /// Waits for the loops of the previous runs to finish.
    pub fn wait_stopped(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut tasks = std::mem::take(&mut self.shared.lock_control().tasks);
        let res = self.rt.block_on(async {
            tokio::time::timeout(timeout, async {
                while let Some(task) = tasks.last_mut() {
                    if let Err(e) = task.await {
                        log::error!("An engine loop failed: {e}");
                    }
                    tasks.pop();
                }
            })
            .await
        });
        if res.is_err() {
            // keep the unfinished tasks for the next call
            self.shared.lock_control().tasks.append(&mut tasks);
            return Err(EngineError::StopTimeout(timeout));
        }
        Ok(())
    }

    /// Resolves the counters and adds them to the active set.
    ///
    /// Either all the counters are added, or none of them. Returns the aliases of the added counters.
    pub fn add_counters(&self, specs: impl IntoIterator<Item = CounterSpec>) -> Result<Vec<String>, EngineError> {
        let specs: Vec<CounterSpec> = specs.into_iter().collect();
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        if self.shared.duplicate_aliases == DuplicateAliasPolicy::Reject {
            // fail before resolving anything
            let aliases: Vec<String> = specs.iter().map(|s| s.alias()).collect();
            let current = self.shared.counters();
            if let Some(alias) = counters::find_duplicate(&current, aliases.iter().map(String::as_str)) {
                return Err(EngineError::DuplicateAlias(alias));
            }
        }

        // Resolution may be slow, don't hold the lock.
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let alias = spec.alias();
            let handle = CounterHandle::resolve(spec, self.shared.resolver.as_ref())
                .map_err(|source| EngineError::Resolve { alias, source })?;
            handles.push(handle);
        }
        let added: Vec<String> = handles.iter().map(|h| h.alias().to_owned()).collect();

        let mut control = self.shared.lock_control();
        control.counters = counters::with_added(&control.counters, handles, self.shared.duplicate_aliases)?;
        drop(control);

        log::info!("Counters added: {}", added.join(", "));
        Ok(added)
    }

    /// Resolves a counter and adds it to the active set. Returns its alias.
    pub fn add_counter(&self, spec: CounterSpec) -> Result<String, EngineError> {
        let alias = spec.alias();
        self.add_counters([spec])?;
        Ok(alias)
    }

    /// Removes the counters with the given aliases from the active set.
    ///
    /// `on_removed` is called once for each removed counter, after the set has been replaced.
    /// Aliases that do not match any counter are ignored. Returns the number of removed counters.
    pub fn remove_counters<S: Into<String>>(
        &self,
        aliases: impl IntoIterator<Item = S>,
        mut on_removed: impl FnMut(&str),
    ) -> usize {
        let aliases: Vec<String> = aliases.into_iter().map(Into::into).collect();
        let mut control = self.shared.lock_control();
        let (remaining, removed) = counters::without(&control.counters, &aliases);
        if removed.is_empty() {
            return 0;
        }
        control.counters = remaining;
        drop(control);

        let removed_aliases: Vec<&str> = removed.iter().map(|h| h.alias()).collect();
        log::info!("Counters removed: {}", removed_aliases.join(", "));
        for alias in removed_aliases {
            on_removed(alias);
        }
        removed.len()
    }

    /// Returns the aliases of the active counters, in order.
    pub fn counters(&self) -> Vec<String> {
        self.shared.counters().iter().map(|c| c.alias().to_owned()).collect()
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.shared.observers
    }

    pub fn add_observer(&self, observer: Box<dyn Observer>) -> ObserverId {
        self.shared.observers.add_observer(observer)
    }

    pub fn add_observers(&self, observers: impl IntoIterator<Item = Box<dyn Observer>>) -> Vec<ObserverId> {
        self.shared.observers.add_observers(observers)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.remove_observer(id)
    }

    /// Runs one sampling tick immediately, whether the engine is running or not.
    ///
    /// The observers are notified, and the snapshot is returned.
    pub fn sample_now(&self) -> Snapshot {
        self.rt.block_on(sampling::tick(&self.shared))
    }

    /// Recreates the resource of every counter immediately, whether the engine is running or not.
    pub fn recreate_now(&self) {
        self.rt.block_on(recreation::recreate_all(&self.shared))
    }
}

impl Drop for SamplingEngine {
    fn drop(&mut self) {
        self.stop();
        if let Some(rt) = self.owned_rt.take() {
            rt.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

/// Builds a [`SamplingEngine`] with an initial set of counters and observers.
pub struct EngineBuilder {
    config: EngineConfig,
    counters: Vec<CounterSpec>,
    observers: Vec<Box<dyn Observer>>,
    rt: Option<Handle>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            counters: Vec::new(),
            observers: Vec::new(),
            rt: None,
        }
    }

    pub fn counter(mut self, spec: CounterSpec) -> Self {
        self.counters.push(spec);
        self
    }

    pub fn counters(mut self, specs: impl IntoIterator<Item = CounterSpec>) -> Self {
        self.counters.extend(specs);
        self
    }

    pub fn observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn observers(mut self, observers: impl IntoIterator<Item = Box<dyn Observer>>) -> Self {
        self.observers.extend(observers);
        self
    }

    /// Runs the engine on an existing runtime instead of creating a new one.
    pub fn runtime(mut self, rt: Handle) -> Self {
        self.rt = Some(rt);
        self
    }

    /// Creates the engine and resolves the initial counters.
    ///
    /// The engine is not started.
    pub fn build(self, resolver: Arc<dyn Resolver>) -> Result<SamplingEngine, EngineError> {
        let engine = match self.rt {
            Some(rt) => SamplingEngine::with_runtime(self.config, resolver, rt)?,
            None => SamplingEngine::new(self.config, resolver)?,
        };
        engine.add_counters(self.counters)?;
        engine.add_observers(self.observers);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::{EngineBuilder, EngineError, EngineState, SamplingEngine};
    use crate::config::{DuplicateAliasPolicy, EngineConfig};
    use crate::counter::CounterSpec;
    use crate::resolver::ResolveError;
    use crate::test::{FailingObserver, FakeBehavior, FakeResolver, Gate, RecordingObserver};

    fn init_logger() {
        let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
    }

    fn config(sample_ms: u64, recreation_ms: u64) -> EngineConfig {
        EngineConfig {
            sample_period: Duration::from_millis(sample_ms),
            recreation_period: Duration::from_millis(recreation_ms),
            normalization_divisor: Some(2.0),
            ..Default::default()
        }
    }

    fn spec(category: &str, name: &str, alias: &str) -> CounterSpec {
        CounterSpec::new(category, name, None::<String>).with_alias(alias)
    }

    #[test]
    fn periodic_sampling() {
        init_logger();
        let resolver = Arc::new(FakeResolver::new().with_constant("cpu/usage", 42.0));
        let recorder = RecordingObserver::new();
        let engine = EngineBuilder::new(config(100, 1000))
            .counter(spec("cpu", "usage", "cpu"))
            .observer(recorder.boxed())
            .build(resolver)
            .unwrap();

        engine.start();
        assert_eq!(engine.state(), EngineState::Running);
        sleep(Duration::from_millis(250));

        let snapshots = recorder.snapshots();
        assert!(snapshots.len() >= 2, "not enough snapshots: {}", snapshots.len());
        for s in &snapshots {
            assert_eq!(s.aliases().collect::<Vec<_>>(), vec!["cpu"]);
            assert_eq!(s.get("cpu").unwrap().value, 42.0);
        }
        for pair in snapshots.windows(2) {
            assert!(pair[0].timestamp() < pair[1].timestamp());
        }

        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.wait_stopped(Duration::from_secs(2)).unwrap();
        let n = recorder.len();
        sleep(Duration::from_millis(300));
        assert_eq!(recorder.len(), n);
    }

    #[test]
    fn failure_isolation_and_shared_timestamp() {
        init_logger();
        let resolver = Arc::new(
            FakeResolver::new()
                .with_constant("a/x", 1.0)
                .with_failing("b/x")
                .with_gone("c/x")
                .with_constant("d/x", 4.0),
        );
        let engine = EngineBuilder::new(config(1000, 60_000))
            .counters([spec("a", "x", "a"), spec("b", "x", "b"), spec("c", "x", "c"), spec("d", "x", "d")])
            .build(resolver)
            .unwrap();

        let snapshot = engine.sample_now();
        assert_eq!(snapshot.aliases().collect::<Vec<_>>(), vec!["a", "d"]);
        for (_, value) in snapshot.iter() {
            assert_eq!(value.timestamp, snapshot.timestamp());
        }
    }

    #[test]
    fn normalization() {
        let resolver = Arc::new(FakeResolver::new().with_constant("a/x", 10.0).with_constant("b/x", 10.0));
        let engine = EngineBuilder::new(config(1000, 60_000))
            .counter(spec("a", "x", "a"))
            .counter(spec("b", "x", "b").normalized())
            .build(resolver)
            .unwrap();

        let snapshot = engine.sample_now();
        assert_eq!(snapshot.get("a").unwrap().value, 10.0);
        assert_eq!(snapshot.get("b").unwrap().value, 5.0);
    }

    #[test]
    fn start_is_idempotent() {
        let resolver = Arc::new(FakeResolver::new().with_constant("cpu/usage", 1.0));
        let recorder = RecordingObserver::new();
        let engine = EngineBuilder::new(config(100, 1000))
            .counter(spec("cpu", "usage", "cpu"))
            .observer(recorder.boxed())
            .build(resolver)
            .unwrap();

        engine.start();
        engine.start();
        assert_eq!(engine.shared.lock_control().tasks.len(), 2);
        sleep(Duration::from_millis(250));
        engine.stop();
        engine.wait_stopped(Duration::from_secs(2)).unwrap();
        // one loop gives 3 snapshots (at 0, 100 and 200ms), two loops would give about 6
        assert!(recorder.len() <= 4, "too many snapshots: {}", recorder.len());
    }

    #[test]
    fn stop_before_start() {
        let engine = SamplingEngine::new(config(100, 1000), Arc::new(FakeResolver::new())).unwrap();
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.wait_stopped(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn restart() {
        let resolver = Arc::new(FakeResolver::new().with_constant("cpu/usage", 1.0));
        let recorder = RecordingObserver::new();
        let engine = EngineBuilder::new(config(50, 1000))
            .counter(spec("cpu", "usage", "cpu"))
            .observer(recorder.boxed())
            .build(resolver)
            .unwrap();

        engine.start();
        engine.stop();
        engine.wait_stopped(Duration::from_secs(2)).unwrap();
        let n = recorder.len();

        engine.start();
        sleep(Duration::from_millis(120));
        engine.stop();
        engine.wait_stopped(Duration::from_secs(2)).unwrap();
        assert!(recorder.len() > n);
    }

    #[test]
    fn add_and_remove() {
        let resolver = Arc::new(FakeResolver::new().with_constant("a/x", 1.0).with_constant("b/x", 2.0));
        let engine = SamplingEngine::new(config(1000, 60_000), resolver).unwrap();
        assert!(engine.sample_now().is_empty());

        let added = engine.add_counters([spec("a", "x", "a"), spec("b", "x", "b")]).unwrap();
        assert_eq!(added, vec!["a", "b"]);
        assert_eq!(engine.counters(), vec!["a", "b"]);
        assert_eq!(engine.sample_now().aliases().collect::<Vec<_>>(), vec!["a", "b"]);

        let mut removed = Vec::new();
        let n = engine.remove_counters(["a", "missing"], |alias| removed.push(alias.to_owned()));
        assert_eq!(n, 1);
        assert_eq!(removed, vec!["a"]);
        assert_eq!(engine.sample_now().aliases().collect::<Vec<_>>(), vec!["b"]);

        removed.clear();
        assert_eq!(engine.remove_counters(["a"], |alias| removed.push(alias.to_owned())), 0);
        assert!(removed.is_empty());
    }

    #[test]
    fn add_is_atomic() {
        let resolver = Arc::new(FakeResolver::new().with_constant("a/x", 1.0));
        let engine = SamplingEngine::new(config(1000, 60_000), resolver).unwrap();

        let res = engine.add_counters([spec("a", "x", "a"), spec("nope", "x", "b")]);
        match res {
            Err(EngineError::Resolve { alias, source }) => {
                assert_eq!(alias, "b");
                assert!(matches!(source, ResolveError::NotFound(_)));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(engine.counters().is_empty());
    }

    #[test]
    fn duplicate_aliases() {
        let resolver = Arc::new(FakeResolver::new().with_constant("a/x", 1.0).with_constant("b/x", 2.0));
        let engine = SamplingEngine::new(config(1000, 60_000), resolver.clone()).unwrap();
        engine.add_counter(spec("a", "x", "same")).unwrap();
        let res = engine.add_counter(spec("b", "x", "same"));
        assert!(matches!(res, Err(EngineError::DuplicateAlias(alias)) if alias == "same"));
        assert_eq!(engine.sample_now().get("same").unwrap().value, 1.0);

        let replacing = SamplingEngine::new(
            EngineConfig {
                duplicate_aliases: DuplicateAliasPolicy::Replace,
                ..config(1000, 60_000)
            },
            resolver,
        )
        .unwrap();
        replacing.add_counter(spec("a", "x", "same")).unwrap();
        replacing.add_counter(spec("b", "x", "same")).unwrap();
        assert_eq!(replacing.counters(), vec!["same"]);
        assert_eq!(replacing.sample_now().get("same").unwrap().value, 2.0);
    }

    #[test]
    fn recreation_replaces_resources() {
        init_logger();
        let resolver = Arc::new(FakeResolver::new().with_constant("cpu/usage", 1.0));
        let engine = EngineBuilder::new(config(1000, 60_000))
            .counter(spec("cpu", "usage", "cpu"))
            .build(resolver.clone())
            .unwrap();
        assert_eq!(engine.sample_now().get("cpu").unwrap().value, 1.0);

        // the resource is kept until the next recreation
        resolver.set("cpu/usage", FakeBehavior::Constant(2.0));
        assert_eq!(engine.sample_now().get("cpu").unwrap().value, 1.0);
        engine.recreate_now();
        assert_eq!(engine.sample_now().get("cpu").unwrap().value, 2.0);

        // a failed refresh keeps the previous resource
        resolver.fail_refresh(true);
        resolver.set("cpu/usage", FakeBehavior::Constant(3.0));
        engine.recreate_now();
        assert_eq!(engine.sample_now().get("cpu").unwrap().value, 2.0);
        assert_eq!(resolver.refreshes(), 2);
    }

    #[test]
    fn slow_recreation_does_not_delay_sampling() {
        init_logger();
        let resolver = Arc::new(
            FakeResolver::new()
                .with_constant("a/x", 1.0)
                .with_constant("b/x", 2.0)
                .with_constant("c/x", 3.0),
        );
        let engine = EngineBuilder::new(EngineConfig {
            max_parallel_reads: Some(1),
            ..config(1000, 60_000)
        })
        .counters([spec("a", "x", "a"), spec("b", "x", "b"), spec("c", "x", "c")])
        .build(resolver.clone())
        .unwrap();
        resolver.slow_refresh(Duration::from_millis(300));

        std::thread::scope(|s| {
            s.spawn(|| engine.recreate_now());
            sleep(Duration::from_millis(50));
            let t0 = Instant::now();
            let snapshot = engine.sample_now();
            let elapsed = t0.elapsed();
            assert_eq!(snapshot.len(), 3);
            assert!(elapsed < Duration::from_millis(250), "sampling took {elapsed:?}");
        });
        assert_eq!(resolver.refreshes(), 3);
    }

    #[test]
    fn tick_in_progress_keeps_its_counter_set() {
        init_logger();
        let gate = Gate::new();
        let resolver = Arc::new(
            FakeResolver::new()
                .with_constant("a/x", 1.0)
                .with_constant("b/x", 2.0),
        );
        resolver.set("slow/x", FakeBehavior::Blocking(gate.clone(), 5.0));
        let engine = EngineBuilder::new(config(1000, 60_000))
            .counters([spec("slow", "x", "slow"), spec("a", "x", "a")])
            .build(resolver)
            .unwrap();

        std::thread::scope(|s| {
            let in_flight = s.spawn(|| engine.sample_now());
            // the tick has started reading "slow"
            gate.wait();
            let removed = engine.remove_counters(["a", "slow"], |_| ());
            let added = engine.add_counter(spec("b", "x", "b"));
            let current = engine.counters();
            gate.wait();
            assert_eq!(removed, 2);
            assert_eq!(added.unwrap(), "b");
            assert_eq!(current, vec!["b"]);

            let snapshot = in_flight.join().unwrap();
            assert_eq!(snapshot.aliases().collect::<Vec<_>>(), vec!["slow", "a"]);
            assert_eq!(snapshot.get("slow").unwrap().value, 5.0);
        });
        let next = engine.sample_now();
        assert_eq!(next.aliases().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(next.get("b").unwrap().value, 2.0);
    }

    #[test]
    fn refresh_during_read() {
        init_logger();
        let gate = Gate::new();
        let resolver = Arc::new(FakeResolver::new());
        resolver.set("slow/x", FakeBehavior::Blocking(gate.clone(), 1.0));
        let engine = EngineBuilder::new(config(1000, 60_000))
            .counter(spec("slow", "x", "slow"))
            .build(resolver.clone())
            .unwrap();

        std::thread::scope(|s| {
            let in_flight = s.spawn(|| engine.sample_now());
            gate.wait();
            resolver.set("slow/x", FakeBehavior::Constant(2.0));
            let recreation = s.spawn(|| engine.recreate_now());
            // the resource cannot be replaced while it is being read
            sleep(Duration::from_millis(100));
            let blocked = !recreation.is_finished();
            gate.wait();
            assert!(blocked);

            let snapshot = in_flight.join().unwrap();
            assert_eq!(snapshot.get("slow").unwrap().value, 1.0);
            recreation.join().unwrap();
        });
        assert_eq!(resolver.refreshes(), 1);
        assert_eq!(engine.sample_now().get("slow").unwrap().value, 2.0);
    }

    #[test]
    fn gone_counter_comes_back() {
        let resolver = Arc::new(FakeResolver::new().with_gone("process/cpu_usage[app]"));
        let engine = EngineBuilder::new(config(1000, 60_000))
            .counter(CounterSpec::new("process", "cpu_usage", Some("app")).with_alias("app"))
            .build(resolver.clone())
            .unwrap();
        assert!(engine.sample_now().get("app").is_none());

        resolver.set("process/cpu_usage[app]", FakeBehavior::Constant(12.5));
        engine.recreate_now();
        assert_eq!(engine.sample_now().get("app").unwrap().value, 12.5);
    }

    #[test]
    fn waiting_for_instance() {
        let resolver = Arc::new(FakeResolver::new());
        let engine = SamplingEngine::new(config(1000, 60_000), resolver.clone()).unwrap();
        let waiting = CounterSpec::new("process", "cpu_usage", Some("later"))
            .with_alias("later")
            .waiting_for_instance();
        engine.add_counter(waiting).unwrap();
        assert_eq!(engine.counters(), vec!["later"]);
        assert!(engine.sample_now().is_empty());

        resolver.set("process/cpu_usage[later]", FakeBehavior::Constant(3.0));
        engine.recreate_now();
        assert_eq!(engine.sample_now().get("later").unwrap().value, 3.0);
    }

    #[test]
    fn recreation_loop_runs_periodically() {
        let resolver = Arc::new(FakeResolver::new().with_constant("cpu/usage", 1.0));
        let engine = EngineBuilder::new(config(1000, 50))
            .counter(spec("cpu", "usage", "cpu"))
            .build(resolver.clone())
            .unwrap();
        engine.start();
        sleep(Duration::from_millis(300));
        engine.stop();
        engine.wait_stopped(Duration::from_secs(2)).unwrap();
        assert!(resolver.refreshes() >= 2, "refreshes: {}", resolver.refreshes());

        let n = resolver.refreshes();
        sleep(Duration::from_millis(150));
        assert_eq!(resolver.refreshes(), n);
    }

    #[test]
    fn observers() {
        let resolver = Arc::new(FakeResolver::new().with_constant("cpu/usage", 1.0));
        let engine = EngineBuilder::new(config(1000, 60_000))
            .counter(spec("cpu", "usage", "cpu"))
            .build(resolver)
            .unwrap();
        let a = RecordingObserver::new();
        let b = RecordingObserver::new();
        let fatal = FailingObserver::fatal();
        let id_a = engine.add_observer(a.boxed());
        engine.add_observers([fatal.boxed(), b.boxed()]);

        engine.sample_now();
        assert_eq!((a.len(), b.len()), (1, 1));
        assert_eq!(engine.observers().len(), 2);

        assert!(engine.remove_observer(id_a));
        engine.sample_now();
        assert_eq!((a.len(), b.len()), (1, 2));
        assert_eq!(fatal.calls(), 1);
    }

    #[test]
    fn independent_engines() {
        let resolver = Arc::new(FakeResolver::new().with_constant("a/x", 1.0).with_constant("b/x", 2.0));
        let rec_1 = RecordingObserver::new();
        let rec_2 = RecordingObserver::new();
        let engine_1 = EngineBuilder::new(config(50, 1000))
            .counter(spec("a", "x", "a"))
            .observer(rec_1.boxed())
            .build(resolver.clone())
            .unwrap();
        let engine_2 = EngineBuilder::new(config(50, 1000))
            .counter(spec("b", "x", "b"))
            .observer(rec_2.boxed())
            .build(resolver)
            .unwrap();

        engine_1.start();
        engine_2.start();
        sleep(Duration::from_millis(120));
        engine_1.stop();
        engine_2.stop();
        engine_1.wait_stopped(Duration::from_secs(2)).unwrap();
        engine_2.wait_stopped(Duration::from_secs(2)).unwrap();

        assert!(rec_1.snapshots().iter().all(|s| s.aliases().eq(["a"])));
        assert!(rec_2.snapshots().iter().all(|s| s.aliases().eq(["b"])));
        assert!(!rec_1.is_empty() && !rec_2.is_empty());
    }

    #[test]
    fn external_runtime() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let resolver = Arc::new(FakeResolver::new().with_constant("cpu/usage", 7.0));
        let recorder = RecordingObserver::new();
        let engine = EngineBuilder::new(config(50, 1000))
            .counter(spec("cpu", "usage", "cpu"))
            .observer(recorder.boxed())
            .runtime(rt.handle().clone())
            .build(resolver)
            .unwrap();
        engine.start();
        sleep(Duration::from_millis(80));
        drop(engine);
        assert!(!recorder.is_empty());
    }

    #[test]
    fn invalid_config() {
        let res = SamplingEngine::new(config(0, 1000), Arc::new(FakeResolver::new()));
        assert!(matches!(res, Err(EngineError::InvalidConfig(_))));
    }
}
