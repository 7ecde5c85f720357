use thiserror::Error;

/// Errors raised while looking up job metadata or resolving output paths
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Scheduler query failed: {0}")]
    Scheduler(String),

    #[error("Invalid output path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
