//! CPU usage, from /proc/stat.

use std::{
    fs::File,
    io::{BufReader, Seek},
    path::Path,
};

use anyhow::Context;
use palantiri::{Counter, read::ReadError};
use procfs::{CpuTime, ExplicitSystemInfo, FromBufReadSI, KernelStats};

/// Which line of /proc/stat to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSelector {
    /// All the CPUs (the `cpu` line).
    Total,
    /// One CPU (the `cpuN` line).
    Core(usize),
}

impl CpuSelector {
    /// Parses the instance of a `cpu/usage` counter: nothing or `total`, `cpuN` or `N`.
    pub fn parse(instance: Option<&str>) -> Option<Self> {
        match instance {
            None | Some("total") | Some("_Total") => Some(CpuSelector::Total),
            Some(s) => s.strip_prefix("cpu").unwrap_or(s).parse().ok().map(CpuSelector::Core),
        }
    }
}

/// Busy percentage of the CPU(s) since the previous read.
pub struct CpuUsageCounter {
    /// A reader opened to /proc/stat.
    reader: BufReader<File>,
    sysinfo: ExplicitSystemInfo,
    cpu: CpuSelector,
    /// The previously measured times, to compute the difference.
    /// On the first read, the difference is computed since boot.
    previous: Option<CpuTicks>,
}

/// The times of a CPU, in ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuTicks {
    busy: u64,
    total: u64,
}

impl From<&CpuTime> for CpuTicks {
    fn from(t: &CpuTime) -> Self {
        // guest times are already included in user and nice
        let busy = t.user
            + t.nice
            + t.system
            + t.irq.unwrap_or(0)
            + t.softirq.unwrap_or(0)
            + t.steal.unwrap_or(0);
        let total = busy + t.idle + t.iowait.unwrap_or(0);
        Self { busy, total }
    }
}

impl CpuUsageCounter {
    pub fn new(proc_stat_path: &Path, sysinfo: ExplicitSystemInfo, cpu: CpuSelector) -> anyhow::Result<Self> {
        let file = File::open(proc_stat_path).with_context(|| format!("could not open {}", proc_stat_path.display()))?;
        let mut counter = Self {
            reader: BufReader::new(file),
            sysinfo,
            cpu,
            previous: None,
        };
        // check that the cpu exists
        let n_cpus = counter.read_stats()?.cpu_time.len();
        if let CpuSelector::Core(i) = cpu {
            anyhow::ensure!(i < n_cpus, "cpu{i} does not exist, there are {n_cpus} cpus");
        }
        Ok(counter)
    }

    fn read_stats(&mut self) -> anyhow::Result<KernelStats> {
        self.reader.rewind()?;
        let stats = KernelStats::from_buf_read(&mut self.reader, &self.sysinfo).context("invalid /proc/stat")?;
        Ok(stats)
    }

    fn read_ticks(&mut self) -> anyhow::Result<CpuTicks> {
        let stats = self.read_stats()?;
        let time = match self.cpu {
            CpuSelector::Total => &stats.total,
            CpuSelector::Core(i) => stats
                .cpu_time
                .get(i)
                .with_context(|| format!("cpu{i} is missing from /proc/stat"))?,
        };
        Ok(CpuTicks::from(time))
    }
}

impl Counter for CpuUsageCounter {
    fn next_value(&mut self) -> Result<f64, ReadError> {
        let now = self.read_ticks()?;
        let prev = self.previous.replace(now).unwrap_or_default();
        let busy = now.busy.saturating_sub(prev.busy);
        let total = now.total.saturating_sub(prev.total);
        if total == 0 {
            return Ok(0.0);
        }
        Ok(busy as f64 * 100.0 / total as f64)
    }

    fn is_stale(&self) -> bool {
        // /proc/stat never goes away, and a new counter would lose the previous ticks
        false
    }
}

/// Lists the cpus that appear in /proc/stat.
pub fn list_cpus(proc_stat_path: &Path, sysinfo: &ExplicitSystemInfo) -> anyhow::Result<usize> {
    let file = File::open(proc_stat_path).with_context(|| format!("could not open {}", proc_stat_path.display()))?;
    let stats = KernelStats::from_buf_read(BufReader::new(file), sysinfo).context("invalid /proc/stat")?;
    Ok(stats.cpu_time.len())
}
