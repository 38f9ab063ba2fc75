//! Optional node configuration.
//!
//! `config.toml` under the home directory, every field defaulted so a
//! missing or empty file behaves identically to no file at all.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::constants::{CONTROL_UDP_PORT, DEFAULT_UDP_PORT, LOG_MAX_SIZE};

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Extra seed peers appended to the compiled-in supernode table.
    #[serde(default)]
    pub seeds: Vec<SeedConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log to stdout instead of node.log.
    #[serde(default)]
    pub stdout: bool,
    #[serde(default = "default_log_max_size")]
    pub max_size: u64,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            stdout: false,
            max_size: default_log_max_size(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// First port tried for the peer-to-peer UDP endpoint.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Loopback port for the local control channel. Also the
    /// single-instance guard; change it only to run isolated test nodes.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            control_port: default_control_port(),
        }
    }
}

/// One additional seed peer: a public identity string plus its fixed
/// endpoints.
#[derive(Debug, Deserialize)]
pub struct SeedConfig {
    pub identity: String,
    pub endpoints: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_UDP_PORT
}
fn default_control_port() -> u16 {
    CONTROL_UDP_PORT
}
fn default_log_max_size() -> u64 {
    LOG_MAX_SIZE
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        toml::from_str(&content).context("failed to parse config.toml")
    }

    /// Load `config.toml` from the home directory, or defaults when absent.
    /// A present-but-broken file is reported, not silently defaulted.
    pub fn load_from_home(home: &Path) -> Result<Self> {
        let path = home.join("config.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.log.level.to_ascii_lowercase().as_str() {
            "trace" => log::LevelFilter::Trace,
            "debug" => log::LevelFilter::Debug,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        }
    }
}
