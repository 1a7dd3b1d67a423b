//! System memory, from /proc/meminfo.

use std::{
    fs::File,
    io::{BufRead, BufReader, Seek},
    path::Path,
};

use anyhow::{Context, anyhow};
use palantiri::{Counter, read::ReadError};

/// Reads one entry of /proc/meminfo, in bytes.
pub struct MeminfoCounter {
    /// A reader opened to /proc/meminfo.
    reader: BufReader<File>,
    /// Name of the entry, for instance `MemAvailable`.
    key: String,
}

impl MeminfoCounter {
    /// Opens /proc/meminfo. Returns `Ok(None)` if the file has no entry named `key`.
    pub fn new(proc_meminfo_path: &Path, key: &str) -> anyhow::Result<Option<Self>> {
        let file =
            File::open(proc_meminfo_path).with_context(|| format!("could not open {}", proc_meminfo_path.display()))?;
        let mut counter = Self {
            reader: BufReader::new(file),
            key: key.to_owned(),
        };
        match counter.read()? {
            Some(_) => Ok(Some(counter)),
            None => Ok(None),
        }
    }

    fn read(&mut self) -> anyhow::Result<Option<u64>> {
        self.reader.rewind()?;
        for line in (&mut self.reader).lines() {
            let line = line.context("could not read line from /proc/meminfo")?;
            if line.is_empty() {
                continue;
            }
            let (key, value) =
                parse_meminfo_line(&line).with_context(|| format!("invalid line in /proc/meminfo: {line}"))?;
            if key == self.key {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

impl Counter for MeminfoCounter {
    fn next_value(&mut self) -> Result<f64, ReadError> {
        match self.read()? {
            Some(bytes) => Ok(bytes as f64),
            None => Err(ReadError::CanRetry(anyhow!("{} is missing from /proc/meminfo", self.key))),
        }
    }

    fn is_stale(&self) -> bool {
        false
    }
}

/// Lists the entries of /proc/meminfo.
pub fn list_keys(proc_meminfo_path: &Path) -> anyhow::Result<Vec<String>> {
    let file =
        File::open(proc_meminfo_path).with_context(|| format!("could not open {}", proc_meminfo_path.display()))?;
    let mut keys = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("could not read line from /proc/meminfo")?;
        if let Some((key, _)) = parse_meminfo_line(&line) {
            keys.push(key.to_owned());
        }
    }
    Ok(keys)
}

fn parse_meminfo_line(line: &str) -> Option<(&str, u64)> {
    let mut s = line.split_ascii_whitespace();
    let key = s.next()?.strip_suffix(':')?;
    let value: u64 = s.next()?.parse().ok()?;
    let value = match s.next() {
        Some(unit) => convert_meminfo_to_bytes(value, unit)?,
        None => value, // no unit means that the unit is Byte
    };
    Some((key, value))
}

fn convert_meminfo_to_bytes(value: u64, unit: &str) -> Option<u64> {
    // For meminfo, "kB" actually means "kiB". See the doc of procfs.
    match unit {
        "B" => Some(value),
        "kB" | "KiB" | "kiB" | "KB" => Some(value * 1024),
        "mB" | "MiB" | "miB" | "MB" => Some(value * 1024 * 1024),
        "gB" | "GiB" | "giB" | "GB" => Some(value * 1024 * 1024 * 1024),
        _ => None,
    }
}
