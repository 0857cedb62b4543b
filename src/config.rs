//! Service configuration.
//!
//! Sources, lowest priority first: built-in defaults, an optional JSON file,
//! `SCRIPT_RUNNER_*` environment variables, then command-line flags (applied
//! by the binary).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::backend::PythonBackend;
use crate::pool;
use crate::transport::DEFAULT_MAX_FRAME_SIZE;

pub const ENV_ADDRESS: &str = "SCRIPT_RUNNER_ADDRESS";
pub const ENV_PORT: &str = "SCRIPT_RUNNER_PORT";
pub const ENV_KEY: &str = "SCRIPT_RUNNER_KEY";
pub const ENV_WORKERS: &str = "SCRIPT_RUNNER_WORKERS";
pub const ENV_PYTHON: &str = "SCRIPT_RUNNER_PYTHON";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Interface to listen on.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret clients present in the handshake.
    #[serde(default)]
    pub key: Option<String>,

    /// Worker pool size.
    #[serde(default = "pool::default_size")]
    pub workers: usize,

    /// Largest inbound frame accepted, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Python executable used for Python tasks.
    #[serde(default = "default_python")]
    pub python: String,

    /// How long a Python child may take to come up.
    #[serde(default = "default_python_ready_timeout")]
    pub python_ready_timeout_secs: u64,
}

fn default_address() -> String {
    "0.0.0.0".into()
}

const fn default_port() -> u16 {
    6000
}

const fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_python() -> String {
    "python3".into()
}

const fn default_python_ready_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            key: None,
            workers: pool::default_size(),
            max_frame_size: default_max_frame_size(),
            python: default_python(),
            python_ready_timeout_secs: default_python_ready_timeout(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by `path` if given, then by the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Override fields from environment variables found by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup(ENV_ADDRESS) {
            self.address = address;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a valid port: {port}"))?;
        }
        if let Some(key) = lookup(ENV_KEY) {
            self.key = Some(key);
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = workers
                .parse()
                .with_context(|| format!("{ENV_WORKERS} is not a valid count: {workers}"))?;
        }
        if let Some(python) = lookup(ENV_PYTHON) {
            self.python = python;
        }
        Ok(())
    }

    /// The handshake secret. The service refuses to start without one.
    pub fn require_key(&self) -> Result<&str> {
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => anyhow::bail!("No handshake key configured (set {ENV_KEY}, --key or \"key\" in the config file)"),
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn python_backend(&self) -> PythonBackend {
        PythonBackend::new(
            self.python.clone(),
            Duration::from_secs(self.python_ready_timeout_secs),
        )
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}
