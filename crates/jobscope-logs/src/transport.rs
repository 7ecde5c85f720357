//! Byte sources for job output files
//!
//! A transport reads a file from a given offset up to its current end. The
//! stream manager only picks which transport serves a stream; watching and
//! line handling are the same for local and remote files.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::StreamError;

/// Largest single read; bigger backlogs are read in several chunks
pub const DEFAULT_MAX_READ_BYTES: usize = 4 * 1024 * 1024;

/// File a stream reads from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamTarget {
    pub path: PathBuf,
    pub node: Option<String>,
    pub is_remote: bool,
}

/// Result of one incremental read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub bytes: Vec<u8>,
    /// Offset to resume from on the next read
    pub next_offset: u64,
    /// The file shrank below the previous offset and was read from the start
    pub truncated: bool,
    /// More data was available than fit in this chunk
    pub more: bool,
}

impl ReadChunk {
    pub fn empty(offset: u64) -> Self {
        Self {
            next_offset: offset,
            ..Default::default()
        }
    }
}

/// "Open file F on node N and read what was appended since offset O"
pub trait OutputTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read from `offset` to the current end of the target file
    ///
    /// A file that does not exist yet is an empty read, not an error.
    fn read_from<'a>(
        &'a self,
        target: &'a StreamTarget,
        offset: u64,
    ) -> BoxFuture<'a, Result<ReadChunk, StreamError>>;
}

/// Reads files on this machine
pub struct LocalTransport {
    max_read_bytes: usize,
}

impl LocalTransport {
    pub fn new(max_read_bytes: usize) -> Self {
        Self {
            max_read_bytes: max_read_bytes.max(1),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_READ_BYTES)
    }
}

impl OutputTransport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn read_from<'a>(
        &'a self,
        target: &'a StreamTarget,
        offset: u64,
    ) -> BoxFuture<'a, Result<ReadChunk, StreamError>> {
        Box::pin(read_local(&target.path, offset, self.max_read_bytes))
    }
}

async fn read_local(path: &Path, offset: u64, max: usize) -> Result<ReadChunk, StreamError> {
    let io_err = |source: std::io::Error| StreamError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ReadChunk::empty(offset)),
        Err(e) => return Err(io_err(e)),
    };

    let len = file.metadata().await.map_err(io_err)?.len();
    let (start, truncated) = if len < offset {
        (0, true)
    } else {
        (offset, false)
    };
    if len == start {
        return Ok(ReadChunk {
            truncated,
            ..ReadChunk::empty(start)
        });
    }

    file.seek(SeekFrom::Start(start)).await.map_err(io_err)?;
    let want = (len - start).min(max as u64);
    let mut bytes = Vec::with_capacity(want as usize);
    file.take(want)
        .read_to_end(&mut bytes)
        .await
        .map_err(io_err)?;

    let more = start + (bytes.len() as u64) < len;
    if more {
        // Stop at a line boundary so the next chunk starts a fresh line
        if let Some(pos) = bytes.iter().rposition(|b| *b == b'\n') {
            bytes.truncate(pos + 1);
        }
    }

    Ok(ReadChunk {
        next_offset: start + bytes.len() as u64,
        bytes,
        truncated,
        more,
    })
}

/// Placeholder for tailing files on compute nodes
///
/// Always fails with [`StreamError::RemoteNotImplemented`]; plug a real
/// transport in with `StreamManager::with_remote_transport`.
#[derive(Default)]
pub struct RemoteTransport;

impl OutputTransport for RemoteTransport {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn read_from<'a>(
        &'a self,
        target: &'a StreamTarget,
        _offset: u64,
    ) -> BoxFuture<'a, Result<ReadChunk, StreamError>> {
        Box::pin(async move {
            Err(StreamError::RemoteNotImplemented {
                node: target.node.clone().unwrap_or_default(),
                path: target.path.clone(),
            })
        })
    }
}
