//! Agent configuration file.
//!
//! The file is written in JSON by default. A file with the `.toml` extension is read as TOML.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use palantiri::{config::EngineConfig, counter::CounterSpec};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "palantiri-config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub engine: EngineConfig,
    pub counters: Vec<CounterSpec>,
    pub destinations: Vec<Destination>,
}

/// Where to send the snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    /// Print one line per snapshot on the standard output.
    Console,
    /// Write the values to a CSV file.
    Csv(palantiri_csv::Config),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Console => write!(f, "console"),
            Destination::Csv(csv) => write!(f, "csv ({})", csv.path.display()),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            counters: vec![
                CounterSpec::new("cpu", "usage", Some("total")).with_alias("cpu"),
                CounterSpec::new("memory", "MemAvailable", None::<String>).with_alias("memory_available"),
            ],
            destinations: vec![Destination::Console],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Format::Toml,
            _ => Format::Json,
        }
    }
}

impl AgentConfig {
    pub fn parse(content: &str, format: Format) -> anyhow::Result<Self> {
        let config = match format {
            Format::Json => serde_json::from_str(content)?,
            Format::Toml => toml::from_str(content)?,
        };
        Ok(config)
    }

    pub fn to_string(&self, format: Format) -> anyhow::Result<String> {
        let s = match format {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };
        Ok(s)
    }

    /// Loads the config from a file.
    ///
    /// If the file does not exist and `write_default` is true, the default config
    /// is written to the file and returned.
    pub fn load(path: &Path, write_default: bool) -> anyhow::Result<Self> {
        let format = Format::from_path(path);
        match std::fs::read_to_string(path) {
            Ok(content) => {
                Self::parse(&content, format).with_context(|| format!("invalid config file {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && write_default => {
                log::warn!("Config file not found, writing the default config to {}", path.display());
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
            Err(e) => Err(e).with_context(|| format!("could not read config file {}", path.display())),
        }
    }

    /// Writes the config to a file, in the format that matches its extension.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = self.to_string(Format::from_path(path))?;
        std::fs::write(path, content).with_context(|| format!("could not write config file {}", path.display()))
    }
}
