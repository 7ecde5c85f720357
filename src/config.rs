//! Configuration file for jobscope
//!
//! Settings live in `<config_dir>/jobscope/config.toml`. Every field is
//! optional; a missing file yields the defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use jobscope_cluster::ResolverConfig;
use jobscope_logs::{
    DEFAULT_CAPACITY, DEFAULT_HISTORY_SIZE, DEFAULT_QUEUE_CAPACITY, StreamConfig,
};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lines kept per stream
    pub buffer_size: usize,
    /// Depth of each subscriber queue
    pub queue_capacity: usize,
    /// Delay before a stopped stream is removed
    pub stop_grace_ms: u64,
    /// Re-read interval for streams served by a remote transport
    pub remote_poll_ms: u64,
    /// Nodes whose files are readable from this machine (node-list syntax allowed)
    pub local_nodes: Vec<String>,
    pub spool_dir: PathBuf,
    pub stdout_pattern: String,
    pub stderr_pattern: String,
    /// Where filter presets are stored; defaults to the config directory
    pub presets_dir: Option<PathBuf>,
    pub search_history_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let resolver = ResolverConfig::default();
        let stream = StreamConfig::default();
        Self {
            buffer_size: DEFAULT_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stop_grace_ms: stream.stop_grace.as_millis() as u64,
            remote_poll_ms: stream.remote_poll_interval.as_millis() as u64,
            local_nodes: Vec::new(),
            spool_dir: resolver.spool_dir,
            stdout_pattern: resolver.stdout_pattern,
            stderr_pattern: resolver.stderr_pattern,
            presets_dir: None,
            search_history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

impl Config {
    /// Directory holding the config file and presets
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("jobscope"))
    }

    /// Load from the default location, falling back to defaults
    ///
    /// An invalid file is reported and ignored.
    pub fn load() -> Self {
        match Self::dir() {
            Some(dir) => Self::load_or_default(&dir.join(CONFIG_FILE)),
            None => Self::default(),
        }
    }

    fn load_or_default(path: &Path) -> Self {
        Self::load_from(path).unwrap_or_else(|e| {
            warn!("ignoring config file, using defaults: {e:#}");
            Self::default()
        })
    }

    /// Load from an explicit path; a missing file is the default config
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn presets_dir(&self) -> Option<PathBuf> {
        self.presets_dir.clone().or_else(Self::dir)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            buffer_size: self.buffer_size,
            queue_capacity: self.queue_capacity,
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            remote_poll_interval: Duration::from_millis(self.remote_poll_ms),
            ..StreamConfig::default()
        }
    }

    /// Resolver settings; this machine's hostname always counts as local
    pub fn resolver_config(&self, hostname: Option<&str>) -> ResolverConfig {
        let mut local_nodes = self.local_nodes.clone();
        if let Some(host) = hostname.map(str::trim).filter(|h| !h.is_empty()) {
            local_nodes.push(host.to_string());
            // Short name too, scheduler node names are rarely qualified
            if let Some((short, _)) = host.split_once('.') {
                local_nodes.push(short.to_string());
            }
        }

        ResolverConfig {
            local_nodes,
            spool_dir: self.spool_dir.clone(),
            stdout_pattern: self.stdout_pattern.clone(),
            stderr_pattern: self.stderr_pattern.clone(),
        }
    }
}
