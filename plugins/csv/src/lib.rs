//! CSV sink for the snapshots of the sampling engine.

mod csv;
mod output;

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use output::CsvObserver;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Absolute or relative path to the output file
    pub path: PathBuf,
    /// Do we flush after each snapshot?
    pub force_flush: bool,
    /// Do we append to the file instead of replacing it?
    pub append: bool,
    /// The CSV delimiter, such as `;`
    pub delimiter: char,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("palantiri-output.csv"),
            force_flush: true,
            append: false,
            delimiter: ';',
        }
    }
}

impl Config {
    /// Opens the output file and creates the observer.
    pub fn build(&self) -> anyhow::Result<CsvObserver> {
        let observer = if self.append {
            CsvObserver::append(&self.path, self.force_flush, self.delimiter)
        } else {
            CsvObserver::new(&self.path, self.force_flush, self.delimiter)
        };
        observer.with_context(|| format!("could not open CSV file {}", self.path.display()))
    }
}
