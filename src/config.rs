// src/config.rs
use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_QUEUE_DEPTH: usize = 10_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 65_536;

/// Server configuration. Every field has a default so a config file only
/// needs to name what it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory that request targets are resolved against.
    pub doc_root: PathBuf,
    /// Worker thread count. 0 means one worker per CPU core.
    pub workers: usize,
    /// Maximum number of queued connection tasks before submit starts
    /// reporting overload.
    pub queue_depth: usize,
    /// Live-connection ceiling; accepts beyond it get the fixed busy
    /// response and an immediate close.
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("/var/www/html"),
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> ServerResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}
