//! Sampling engine for named counters.
//!
//! Palantiri polls a configurable set of counters on a fixed cadence, stamps every
//! successfully-read value with the time of the tick, and fans the resulting [`Snapshot`]
//! out to the registered [`Observer`]s.
//!
//! # Overview
//!
//! - A [`Counter`] is read through a resource obtained from a [`Resolver`].
//! - The [`SamplingEngine`] owns the active counter set and runs two independent loops:
//!   the sampling loop (every `sample_period`) and the recreation loop (every `recreation_period`),
//!   which asks the resolver to refresh the resource of every counter.
//! - The counter set can be changed while the engine runs, with [`SamplingEngine::add_counters`]
//!   and [`SamplingEngine::remove_counters`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use palantiri::{EngineBuilder, config::EngineConfig, counter::CounterSpec};
//! # fn example(resolver: std::sync::Arc<dyn palantiri::resolver::Resolver>, sink: Box<dyn palantiri::observer::Observer>) -> anyhow::Result<()> {
//!
//! let config = EngineConfig {
//!     sample_period: Duration::from_millis(500),
//!     ..Default::default()
//! };
//! let engine = EngineBuilder::new(config)
//!     .counter(CounterSpec::new("cpu", "usage", Some("total")).with_alias("cpu"))
//!     .observer(sink)
//!     .build(resolver)?;
//! engine.start();
//! std::thread::sleep(Duration::from_secs(5));
//! engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod counter;
pub mod engine;
pub mod observer;
pub mod read;
pub mod resolver;
pub mod snapshot;


pub use engine::{EngineBuilder, EngineError, EngineState, SamplingEngine};
pub use observer::Observer;
pub use resolver::{Counter, Resolver};
pub use snapshot::{CounterValue, Snapshot, Timestamp};
