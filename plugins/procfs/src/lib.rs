//! Counters read from the Linux procfs.
//!
//! The [`ProcfsResolver`] supports three categories:
//!
//! | category  | name                           | instance                      | unit    |
//! |-----------|--------------------------------|-------------------------------|---------|
//! | `cpu`     | `usage`                        | `total` (default), `cpuN`     | %       |
//! | `memory`  | any key of `/proc/meminfo`     | none                          | bytes   |
//! | `process` | `cpu_usage`, `memory_resident` | the name of the process       | %/bytes |

use std::path::PathBuf;

use anyhow::Context;
use palantiri::{
    Counter, Resolver,
    counter::CounterId,
    resolver::ResolveError,
};
use procfs::{ExplicitSystemInfo, LocalSystemInfo, ProcError, SystemInfoInterface};
use rlimit::{Resource, getrlimit, setrlimit};
use serde::{Deserialize, Serialize};

mod cpu;
mod memory;
mod process;

pub use cpu::{CpuSelector, CpuUsageCounter};
pub use memory::MeminfoCounter;
pub use process::{ProcessCounter, ProcessMetric};

pub const CATEGORY_CPU: &str = "cpu";
pub const CATEGORY_MEMORY: &str = "memory";
pub const CATEGORY_PROCESS: &str = "process";

/// Turns counter ids into readers of procfs files.
pub struct ProcfsResolver {
    config: Config,
    sysinfo: ExplicitSystemInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where the procfs is mounted.
    pub root: PathBuf,
    /// Raise the soft limit of open files to the hard limit, because every process counter keeps two files open.
    pub raise_fd_limit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            raise_fd_limit: true,
        }
    }
}

impl ProcfsResolver {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let sysinfo = gather_system_info().context("could not gather system info")?;
        if config.raise_fd_limit {
            increase_file_descriptors_soft_limit().context("Error while increasing file descriptors soft limit")?;
        }
        Ok(Self::with_system_info(config, sysinfo))
    }

    /// Creates a resolver that uses the given system information instead of querying the kernel.
    pub fn with_system_info(config: Config, sysinfo: ExplicitSystemInfo) -> Self {
        Self { config, sysinfo }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.config.root.join(file)
    }

    fn resolve_cpu(&self, id: &CounterId) -> Result<Box<dyn Counter>, ResolveError> {
        if id.name != "usage" {
            return Err(ResolveError::Unsupported(id.clone(), String::from("the only cpu counter is 'usage'")));
        }
        let selector = CpuSelector::parse(id.instance.as_deref()).ok_or_else(|| {
            ResolveError::Unsupported(id.clone(), String::from("the instance must be 'total' or 'cpuN'"))
        })?;
        let stat_path = self.path("stat");
        if let CpuSelector::Core(i) = selector {
            let n_cpus = cpu::list_cpus(&stat_path, &self.sysinfo).map_err(|e| ResolveError::Other(id.clone(), e))?;
            if i >= n_cpus {
                return Err(ResolveError::NotFound(id.clone()));
            }
        }
        let counter = CpuUsageCounter::new(&stat_path, copy_system_info(&self.sysinfo), selector)
            .map_err(|e| ResolveError::Other(id.clone(), e))?;
        Ok(Box::new(counter))
    }

    fn resolve_memory(&self, id: &CounterId) -> Result<Box<dyn Counter>, ResolveError> {
        if id.instance.is_some() {
            return Err(ResolveError::Unsupported(id.clone(), String::from("memory counters have no instance")));
        }
        match MeminfoCounter::new(&self.path("meminfo"), &id.name) {
            Ok(Some(counter)) => Ok(Box::new(counter)),
            Ok(None) => Err(ResolveError::NotFound(id.clone())),
            Err(e) => Err(ResolveError::Other(id.clone(), e)),
        }
    }

    fn resolve_process(&self, id: &CounterId) -> Result<Box<dyn Counter>, ResolveError> {
        let metric = ProcessMetric::parse(&id.name).ok_or_else(|| {
            ResolveError::Unsupported(id.clone(), String::from("the process counters are 'cpu_usage' and 'memory_resident'"))
        })?;
        let Some(name) = id.instance.as_deref() else {
            return Err(ResolveError::Unsupported(id.clone(), String::from("the instance must be a process name")));
        };
        let process = process::find_process(&self.config.root, name)
            .map_err(|e| ResolveError::Other(id.clone(), e))?
            .ok_or_else(|| ResolveError::NotFound(id.clone()))?;
        let counter = ProcessCounter::new(process, metric, self.sysinfo.ticks_per_second, self.sysinfo.page_size)
            .map_err(|e| match e {
                ProcError::NotFound(_) => ResolveError::NotFound(id.clone()),
                e => ResolveError::Other(id.clone(), e.into()),
            })?;
        log::debug!("{id} resolved to pid {}", counter.pid());
        Ok(Box::new(counter))
    }
}

impl Resolver for ProcfsResolver {
    fn resolve(&self, id: &CounterId) -> Result<Box<dyn Counter>, ResolveError> {
        match id.category.as_str() {
            CATEGORY_CPU => self.resolve_cpu(id),
            CATEGORY_MEMORY => self.resolve_memory(id),
            CATEGORY_PROCESS => self.resolve_process(id),
            other => Err(ResolveError::Unsupported(id.clone(), format!("unknown category '{other}'"))),
        }
    }

    fn list_available(&self) -> Result<Vec<CounterId>, ResolveError> {
        let mut counters = Vec::new();

        let cpu_error = |e| ResolveError::Other(CounterId::new(CATEGORY_CPU, "usage", None::<String>), e);
        let n_cpus = cpu::list_cpus(&self.path("stat"), &self.sysinfo).map_err(cpu_error)?;
        counters.push(CounterId::new(CATEGORY_CPU, "usage", Some("total")));
        counters.extend((0..n_cpus).map(|i| CounterId::new(CATEGORY_CPU, "usage", Some(format!("cpu{i}")))));

        let memory_error = |e| ResolveError::Other(CounterId::new(CATEGORY_MEMORY, "*", None::<String>), e);
        let keys = memory::list_keys(&self.path("meminfo")).map_err(memory_error)?;
        counters.extend(keys.into_iter().map(|k| CounterId::new(CATEGORY_MEMORY, k, None::<String>)));
        Ok(counters)
    }
}

fn gather_system_info() -> Result<ExplicitSystemInfo, ProcError> {
    let sysinfo = LocalSystemInfo;
    Ok(ExplicitSystemInfo {
        boot_time_secs: sysinfo.boot_time_secs()?,
        ticks_per_second: sysinfo.ticks_per_second(),
        page_size: sysinfo.page_size(),
        is_little_endian: sysinfo.is_little_endian(),
    })
}

fn increase_file_descriptors_soft_limit() -> Result<(), anyhow::Error> {
    let (fd_soft, fd_hard) = getrlimit(Resource::NOFILE).context("Error while getting file descriptors limits")?;
    setrlimit(Resource::NOFILE, fd_hard, fd_hard)
        .with_context(|| format!("Error while setting file descriptors soft limit from {fd_soft} to {fd_hard}"))?;
    log::debug!("Increased file descriptors soft limit ({fd_soft}) to reach hard limit value ({fd_hard})");
    Ok(())
}

fn copy_system_info(sysinfo: &ExplicitSystemInfo) -> ExplicitSystemInfo {
    ExplicitSystemInfo {
        boot_time_secs: sysinfo.boot_time_secs,
        ticks_per_second: sysinfo.ticks_per_second,
        page_size: sysinfo.page_size,
        is_little_endian: sysinfo.is_little_endian,
    }
}
