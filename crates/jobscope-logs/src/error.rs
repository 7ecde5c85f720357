use std::path::PathBuf;

use thiserror::Error;

use jobscope_cluster::ClusterError;
use jobscope_types::StreamKey;

/// Errors returned by stream lifecycle operations
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream already active: {0}")]
    AlreadyActive(StreamKey),

    #[error("Stream not found: {0}")]
    NotFound(StreamKey),

    #[error("Failed to resolve output for {key}: {source}")]
    Resolve {
        key: StreamKey,
        #[source]
        source: ClusterError,
    },

    #[error("Remote tailing is not implemented (node {node}, file {})", path.display())]
    RemoteNotImplemented { node: String, path: PathBuf },

    #[error("Failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream manager is closed")]
    Closed,
}

/// Errors from building filters, chains and presets
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid filter: {0}")]
    Invalid(String),

    #[error("Filter not found: {0}")]
    UnknownFilter(String),

    #[error("Filter chain not found: {0}")]
    UnknownChain(String),

    #[error("Preset not found: {0}")]
    UnknownPreset(String),

    #[error("No active filter chain")]
    NoActiveChain,

    #[error("Failed to persist presets to {}: {message}", path.display())]
    Persist { path: PathBuf, message: String },
}

/// Errors from searching a stream's buffer
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search query is empty")]
    EmptyQuery,

    #[error("Invalid search pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("No search has been run")]
    NoActiveSearch,

    #[error("No more matches")]
    NoMoreMatches,

    #[error("No searcher for stream {0}")]
    UnknownStream(StreamKey),
}
