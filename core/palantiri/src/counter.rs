//! Counter identities and handles.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::read::ReadError;
use crate::resolver::{Counter, ResolveError, Resolver};

/// Identity of a metric, used to (re-)resolve it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterId {
    /// Family of counters, for instance `cpu`, `memory` or `process`.
    pub category: String,
    /// Name of the counter inside its category.
    pub name: String,
    /// Instance of the measured object, if the category has several instances (cpus, processes...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl CounterId {
    pub fn new(category: impl Into<String>, name: impl Into<String>, instance: Option<impl Into<String>>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            instance: instance.map(Into::into),
        }
    }

    /// Returns a flat key `{category}_{name}_{instance}`, which is the default alias of the counter.
    pub fn key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.category,
            self.name,
            self.instance.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}/{}[{instance}]", self.category, self.name),
            None => write!(f, "{}/{}", self.category, self.name),
        }
    }
}

/// Describes a counter to add to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSpec {
    #[serde(flatten)]
    pub id: CounterId,

    /// Outward-facing name of the counter. Defaults to [`CounterId::key`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// If `true`, the raw values are divided by the normalization divisor of the engine
    /// (by default, the number of CPUs).
    #[serde(default)]
    pub normalize: bool,

    /// If `true`, a counter that cannot be resolved yet is added anyway, without a resource.
    /// It is skipped by the sampling loop until the recreation loop manages to resolve it.
    #[serde(default)]
    pub wait_for_instance: bool,
}

impl CounterSpec {
    pub fn new(category: impl Into<String>, name: impl Into<String>, instance: Option<impl Into<String>>) -> Self {
        Self {
            id: CounterId::new(category, name, instance),
            alias: None,
            normalize: false,
            wait_for_instance: false,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }

    pub fn waiting_for_instance(mut self) -> Self {
        self.wait_for_instance = true;
        self
    }

    /// The alias that the counter will have in the engine.
    pub fn alias(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.id.key())
    }
}

/// The engine's representation of one monitored counter.
///
/// The resource is protected by its own lock: replacing it (in the recreation loop)
/// never exposes a half-initialized resource to a concurrent read, it only waits
/// for the read to finish.
pub struct CounterHandle {
    alias: String,
    id: CounterId,
    normalize: bool,
    resource: Mutex<Option<Box<dyn Counter>>>,
}

impl CounterHandle {
    /// Resolves the counter described by `spec`.
    ///
    /// If the resolution fails and `spec.wait_for_instance` is set, an unresolved handle is returned instead.
    pub fn resolve(spec: CounterSpec, resolver: &dyn Resolver) -> Result<Self, ResolveError> {
        match resolver.resolve(&spec.id) {
            Ok(resource) => Ok(Self::new(spec, Some(resource))),
            Err(e) if spec.wait_for_instance => {
                log::info!("Counter {} is not available yet, waiting for it: {e}", spec.id);
                Ok(Self::new(spec, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Creates a handle with an existing resource, or without any resource.
    pub fn new(spec: CounterSpec, resource: Option<Box<dyn Counter>>) -> Self {
        Self {
            alias: spec.alias(),
            id: spec.id,
            normalize: spec.normalize,
            resource: Mutex::new(resource),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn id(&self) -> &CounterId {
        &self.id
    }

    pub fn normalize(&self) -> bool {
        self.normalize
    }

    /// Returns `true` if the handle currently has a resource.
    pub fn is_resolved(&self) -> bool {
        self.lock_resource().is_some()
    }

    /// Returns `true` if the handle has no resource, or if its resource is stale.
    pub fn needs_recreation(&self) -> bool {
        self.lock_resource().as_ref().is_none_or(|counter| counter.is_stale())
    }

    /// Reads the next value of the counter and applies the normalization if needed.
    ///
    /// Returns `None` if the counter has no resource.
    pub(crate) fn read(&self, divisor: f64) -> Option<Result<f64, ReadError>> {
        let mut resource = self.lock_resource();
        let counter = resource.as_mut()?;
        let value = counter.next_value().map(|raw| {
            if self.normalize { raw / divisor } else { raw }
        });
        Some(value)
    }

    /// Publishes a new resource, dropping the previous one.
    pub(crate) fn replace_resource(&self, resource: Box<dyn Counter>) {
        *self.lock_resource() = Some(resource);
    }

    fn lock_resource(&self) -> MutexGuard<'_, Option<Box<dyn Counter>>> {
        // A counter that panicked while being read leaves the mutex poisoned,
        // but the resource is still usable (or will be replaced by the recreation loop).
        self.resource.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CounterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterHandle")
            .field("alias", &self.alias)
            .field("id", &self.id)
            .field("normalize", &self.normalize)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
