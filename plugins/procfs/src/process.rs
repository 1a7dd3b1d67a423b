//! Process-level metrics, from `/proc/<pid>`.

use std::{
    fs::File,
    io::{self, BufReader, Seek},
    path::Path,
    time::Instant,
};

use anyhow::Context;
use palantiri::{Counter, read::ReadError};
use procfs::{
    FromRead, ProcError,
    process::{Process, Stat, StatM},
};

/// The measured quantity of a process counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMetric {
    /// Percentage of one core used since the previous read.
    CpuUsage,
    /// Resident memory, in bytes.
    MemoryResident,
}

impl ProcessMetric {
    pub const ALL: [(&'static str, ProcessMetric); 2] = [
        ("cpu_usage", ProcessMetric::CpuUsage),
        ("memory_resident", ProcessMetric::MemoryResident),
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().find(|(n, _)| *n == name).map(|(_, m)| *m)
    }
}

/// Reads the stats of one process.
pub struct ProcessCounter {
    process: Process,
    metric: ProcessMetric,
    /// Set when a read found that the process does not exist anymore.
    gone: bool,

    /// A reader opened to `/proc/<pid>/stat`
    reader_stat: BufReader<File>,
    /// A reader opened to `/proc/<pid>/statm`
    reader_statm: BufReader<File>,

    ticks_per_second: u64,
    /// The memory page size, in bytes
    page_size: u64,

    /// The time of the previous read and the cpu time (in ticks) of the process at that time.
    /// The first one is taken when the counter is created.
    previous: (Instant, u64),
}

impl ProcessCounter {
    pub fn new(process: Process, metric: ProcessMetric, ticks_per_second: u64, page_size: u64) -> Result<Self, ProcError> {
        let mut reader_stat = BufReader::new(process.open_relative("stat")?);
        let reader_statm = BufReader::new(process.open_relative("statm")?);
        let stat = Stat::from_read(&mut reader_stat)?;
        Ok(Self {
            process,
            metric,
            gone: false,
            reader_stat,
            reader_statm,
            ticks_per_second,
            page_size,
            previous: (Instant::now(), stat.utime + stat.stime),
        })
    }

    pub fn pid(&self) -> i32 {
        self.process.pid
    }

    fn read_cpu_usage(&mut self) -> Result<f64, ReadError> {
        self.reader_stat.rewind().map_err(gone_if_io_not_found)?;
        let stat = Stat::from_read(&mut self.reader_stat).map_err(gone_if_proc_not_found)?;
        let now = (Instant::now(), stat.utime + stat.stime);
        let (t_prev, ticks_prev) = std::mem::replace(&mut self.previous, now);
        let elapsed = now.0.duration_since(t_prev).as_secs_f64();
        Ok(cpu_percent(now.1.saturating_sub(ticks_prev), self.ticks_per_second, elapsed))
    }

    fn read_memory_resident(&mut self) -> Result<f64, ReadError> {
        self.reader_statm.rewind().map_err(gone_if_io_not_found)?;
        let statm = StatM::from_read(&mut self.reader_statm).map_err(gone_if_proc_not_found)?;
        Ok((statm.resident * self.page_size) as f64)
    }
}

impl Counter for ProcessCounter {
    fn next_value(&mut self) -> Result<f64, ReadError> {
        log::trace!("reading process {} ({:?})", self.process.pid, self.metric);
        let res = match self.metric {
            ProcessMetric::CpuUsage => self.read_cpu_usage(),
            ProcessMetric::MemoryResident => self.read_memory_resident(),
        };
        if let Err(ReadError::Gone) = res {
            self.gone = true;
        }
        res
    }

    /// The counter is kept as long as its process runs, so that the cpu usage
    /// is always computed against the previous read.
    fn is_stale(&self) -> bool {
        self.gone || !self.process.is_alive()
    }
}

/// Converts a cpu time delta (in ticks) to a percentage of one core during `elapsed_secs`.
fn cpu_percent(delta_ticks: u64, ticks_per_second: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 || ticks_per_second == 0 {
        return 0.0;
    }
    let cpu_secs = delta_ticks as f64 / ticks_per_second as f64;
    cpu_secs / elapsed_secs * 100.0
}

fn gone_if_proc_not_found(err: ProcError) -> ReadError {
    match err {
        ProcError::NotFound(_) => ReadError::Gone,
        ProcError::Io(err, _) if err.raw_os_error() == Some(3) => {
            // "No such process" not caught by the procfs crate (it should ideally be mapped to ProcError::NotFound)
            ReadError::Gone
        }
        _ => ReadError::CanRetry(err.into()),
    }
}

fn gone_if_io_not_found(err: io::Error) -> ReadError {
    match err.kind() {
        io::ErrorKind::NotFound => ReadError::Gone,
        _ if err.raw_os_error() == Some(3) => ReadError::Gone,
        _ => ReadError::CanRetry(err.into()),
    }
}

/// Finds the first process (by pid order) whose name is `name`.
pub fn find_process(proc_root: &Path, name: &str) -> anyhow::Result<Option<Process>> {
    let processes = procfs::process::all_processes_with_root(proc_root)
        .with_context(|| format!("cannot read {}", proc_root.display()))?;
    for p in processes {
        // processes can exit while we iterate
        let Ok(p) = p else { continue };
        match p.stat() {
            Ok(stat) if stat.comm == name => return Ok(Some(p)),
            _ => (),
        }
    }
    Ok(None)
}
