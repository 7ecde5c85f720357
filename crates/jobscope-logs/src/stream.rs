use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferStats, CircularBuffer, DEFAULT_CAPACITY, split_lines};
use crate::bus::{DEFAULT_QUEUE_CAPACITY, EventBus, Subscription, SubscriptionId};
use crate::error::StreamError;
use crate::transport::{
    DEFAULT_MAX_READ_BYTES, LocalTransport, OutputTransport, RemoteTransport, StreamTarget,
};
use jobscope_cluster::{ClusterError, PathResolver, validate_output_path};
use jobscope_types::{OutputKind, StreamEvent, StreamKey};

/// Stream manager settings
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Lines kept per stream
    pub buffer_size: usize,
    /// Depth of each subscriber queue
    pub queue_capacity: usize,
    /// Delay between stop and removal of a stream
    pub stop_grace: Duration,
    /// How often streams on remote transports are re-read
    pub remote_poll_interval: Duration,
    /// Largest single read from a transport
    pub max_read_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stop_grace: Duration::from_secs(5),
            remote_poll_interval: Duration::from_secs(2),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

/// Live state of one stream
struct StreamState {
    key: StreamKey,
    target: StreamTarget,
    buffer: CircularBuffer,
    transport: Arc<dyn OutputTransport>,
    offset: AtomicU64,
    active: AtomicBool,
    /// Serialises reads so the offset only moves forward
    read_lock: tokio::sync::Mutex<()>,
    /// Bytes after the last newline, held until the line is finished
    partial: Mutex<Vec<u8>>,
    started_at: DateTime<Utc>,
    last_update: Mutex<Option<DateTime<Utc>>>,
    /// Stops remote polling for this stream
    cancel: CancellationToken,
}

impl StreamState {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            key: self.key.clone(),
            path: self.target.path.clone(),
            is_remote: self.target.is_remote,
            node: self.target.node.clone(),
            transport: self.transport.name(),
            offset: self.offset.load(Ordering::Acquire),
            active: self.is_active(),
            started_at: self.started_at,
            last_update: *self.last_update.lock(),
            buffer: self.buffer.stats(),
        }
    }
}

/// Public snapshot of a stream
#[derive(Clone, Debug, Serialize)]
pub struct StreamInfo {
    pub key: StreamKey,
    pub path: PathBuf,
    pub is_remote: bool,
    pub node: Option<String>,
    pub transport: &'static str,
    pub offset: u64,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub buffer: BufferStats,
}

/// Snapshot of the whole manager
#[derive(Clone, Debug, Serialize)]
pub struct ManagerStats {
    pub active_streams: usize,
    pub total_streams: usize,
    pub subscriber_topics: usize,
    pub dropped_events: u64,
    pub buffered_lines: usize,
    pub memory_bytes: usize,
    pub streams: Vec<StreamInfo>,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<StreamKey, Arc<StreamState>>,
    /// Local file -> streams reading it (stdout and stderr may share a file)
    by_path: HashMap<PathBuf, Vec<StreamKey>>,
}

impl Registry {
    fn unlink_path(&mut self, path: &Path, key: &StreamKey) {
        if let Some(keys) = self.by_path.get_mut(path) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_path.remove(path);
            }
        }
    }
}

/// Directory watches shared by all local streams
struct Watches {
    watcher: RecommendedWatcher,
    dirs: HashMap<PathBuf, usize>,
}

/// State shared with background tasks
struct Inner {
    resolver: Arc<PathResolver>,
    bus: Arc<EventBus>,
    config: StreamConfig,
    registry: RwLock<Registry>,
    local: Arc<dyn OutputTransport>,
    remote: RwLock<Arc<dyn OutputTransport>>,
}

impl Inner {
    fn lookup(&self, key: &StreamKey) -> Option<Arc<StreamState>> {
        self.registry.read().streams.get(key).cloned()
    }

    /// Read everything appended since the last offset into the buffer
    ///
    /// Returns the number of new lines. Output events are only published
    /// when `publish` is set. A trailing unfinished line is held back until
    /// its newline arrives or the stream is flushed.
    async fn read_new(&self, state: &StreamState, publish: bool) -> Result<usize, StreamError> {
        let _guard = state.read_lock.lock().await;
        let mut appended = 0;

        loop {
            let offset = state.offset.load(Ordering::Acquire);
            let chunk = state.transport.read_from(&state.target, offset).await?;

            let complete = {
                let mut partial = state.partial.lock();
                if chunk.truncated {
                    warn!(key = %state.key, "output file shrank, reading from the start");
                    partial.clear();
                }
                state.offset.store(chunk.next_offset, Ordering::Release);
                take_complete_lines(&mut partial, &chunk.bytes, self.config.max_read_bytes)
            };
            appended += self.deliver(state, &complete, publish);

            if !chunk.more || !state.is_active() {
                break;
            }
        }

        Ok(appended)
    }

    /// Append the held unfinished line, if any, as a line of its own
    async fn flush_partial(&self, state: &StreamState, publish: bool) -> usize {
        let _guard = state.read_lock.lock().await;
        let rest = std::mem::take(&mut *state.partial.lock());
        self.deliver(state, &rest, publish)
    }

    fn deliver(&self, state: &StreamState, bytes: &[u8], publish: bool) -> usize {
        if bytes.is_empty() {
            return 0;
        }

        let raw = String::from_utf8_lossy(bytes).into_owned();
        let lines = split_lines(&raw);
        let appended = state.buffer.append_lines(lines.iter().cloned());
        *state.last_update.lock() = Some(Utc::now());

        if publish {
            self.bus.publish(Arc::new(StreamEvent::output(
                state.key.clone(),
                raw,
                lines,
            )));
        }
        appended
    }

    /// Read and turn failures into error events
    async fn refresh(&self, state: &StreamState) -> Result<usize, StreamError> {
        match self.read_new(state, true).await {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!(key = %state.key, error = %e, "read failed");
                self.bus
                    .publish(Arc::new(StreamEvent::error(state.key.clone(), e.to_string())));
                Err(e)
            }
        }
    }

    /// Handle a change notification for one local file
    async fn dispatch_path(&self, path: &Path) {
        let states: Vec<Arc<StreamState>> = {
            let registry = self.registry.read();
            let Some(keys) = registry.by_path.get(path) else {
                return;
            };
            keys.iter()
                .filter_map(|k| registry.streams.get(k).cloned())
                .collect()
        };

        for state in states {
            if state.is_active() {
                let _ = self.refresh(&state).await;
            }
        }
    }
}

/// Join `bytes` onto the held fragment and split off every finished line
///
/// A fragment that grows past `limit` without a newline is released whole.
fn take_complete_lines(partial: &mut Vec<u8>, bytes: &[u8], limit: usize) -> Vec<u8> {
    partial.extend_from_slice(bytes);
    match partial.iter().rposition(|b| *b == b'\n') {
        Some(pos) => {
            let rest = partial.split_off(pos + 1);
            std::mem::replace(partial, rest)
        }
        None if partial.len() > limit => std::mem::take(partial),
        None => Vec::new(),
    }
}

/// Owns per-job output streams and drives their incremental reads
pub struct StreamManager {
    inner: Arc<Inner>,
    watches: Mutex<Option<Watches>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StreamManager {
    /// Create a manager and start its notification loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        resolver: Arc<PathResolver>,
        bus: Arc<EventBus>,
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })
        .map_err(|source| StreamError::Watch {
            path: PathBuf::new(),
            source,
        })?;

        let inner = Arc::new(Inner {
            resolver,
            bus,
            local: Arc::new(LocalTransport::new(config.max_read_bytes)),
            remote: RwLock::new(Arc::new(RemoteTransport) as Arc<dyn OutputTransport>),
            config,
            registry: RwLock::new(Registry::default()),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::notification_loop(
            Arc::clone(&inner),
            rx,
            cancel.clone(),
        ));

        Ok(Self {
            inner,
            watches: Mutex::new(Some(Watches {
                watcher,
                dirs: HashMap::new(),
            })),
            cancel,
            tasks: Mutex::new(vec![task]),
        })
    }

    /// Serve remote streams through `transport` instead of the placeholder
    pub fn with_remote_transport(self, transport: Arc<dyn OutputTransport>) -> Self {
        *self.inner.remote.write() = transport;
        self
    }

    async fn notification_loop(
        inner: Arc<Inner>,
        mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(Ok(event)) => {
                            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                                for path in &event.paths {
                                    inner.dispatch_path(path).await;
                                }
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "file watch error"),
                        None => break,
                    }
                }
            }
        }
        debug!("notification loop stopped");
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Start streaming a job's output
    ///
    /// A file that does not exist yet is not an error: the buffer stays empty
    /// until the job writes to it.
    pub async fn start_stream(
        &self,
        job_id: &str,
        kind: OutputKind,
    ) -> Result<CircularBuffer, StreamError> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Closed);
        }

        let key = StreamKey::new(job_id, kind);
        if self.is_active(&key) {
            return Err(StreamError::AlreadyActive(key));
        }

        let resolve_err = |source: ClusterError| StreamError::Resolve {
            key: key.clone(),
            source,
        };
        let resolved = self
            .inner
            .resolver
            .resolve_output_path(job_id, kind)
            .await
            .map_err(resolve_err)?;
        validate_output_path(&resolved.path).map_err(resolve_err)?;

        let (path, transport) = if resolved.is_remote {
            (resolved.path, self.inner.remote.read().clone())
        } else {
            (normalize_local_path(&resolved.path), Arc::clone(&self.inner.local))
        };

        let state = Arc::new(StreamState {
            key: key.clone(),
            target: StreamTarget {
                path,
                node: resolved.node,
                is_remote: resolved.is_remote,
            },
            buffer: CircularBuffer::new(self.inner.config.buffer_size),
            transport,
            offset: AtomicU64::new(0),
            active: AtomicBool::new(true),
            read_lock: tokio::sync::Mutex::new(()),
            partial: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            last_update: Mutex::new(None),
            cancel: self.cancel.child_token(),
        });

        {
            let mut registry = self.inner.registry.write();
            if registry
                .streams
                .get(&key)
                .is_some_and(|existing| existing.is_active())
            {
                return Err(StreamError::AlreadyActive(key));
            }
            registry.streams.insert(key.clone(), Arc::clone(&state));
            if !state.target.is_remote {
                registry
                    .by_path
                    .entry(state.target.path.clone())
                    .or_default()
                    .push(key.clone());
            }
        }

        if !state.target.is_remote {
            if let Err(e) = self.watch_file(&state.target.path) {
                self.rollback(&state);
                return Err(e);
            }
        }

        match self.inner.read_new(&state, false).await {
            Ok(lines) => debug!(key = %key, lines, "initial read complete"),
            Err(e @ StreamError::RemoteNotImplemented { .. }) => {
                self.rollback(&state);
                return Err(e);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "initial read failed");
                self.inner
                    .bus
                    .publish(Arc::new(StreamEvent::error(key.clone(), e.to_string())));
            }
        }

        if state.target.is_remote {
            self.spawn_remote_poll(Arc::clone(&state));
        }

        info!(
            key = %key,
            path = %state.target.path.display(),
            transport = state.transport.name(),
            "stream started"
        );
        self.inner
            .bus
            .publish(Arc::new(StreamEvent::started(key)));

        Ok(state.buffer.clone())
    }

    /// Stop a stream; it is removed after the configured grace delay
    pub async fn stop_stream(&self, job_id: &str, kind: OutputKind) -> Result<(), StreamError> {
        let key = StreamKey::new(job_id, kind);

        let state = {
            let mut registry = self.inner.registry.write();
            let state = registry
                .streams
                .get(&key)
                .filter(|s| s.is_active())
                .cloned()
                .ok_or_else(|| StreamError::NotFound(key.clone()))?;
            state.active.store(false, Ordering::Release);
            if !state.target.is_remote {
                registry.unlink_path(&state.target.path, &key);
            }
            state
        };

        state.cancel.cancel();
        if !state.target.is_remote {
            self.unwatch_file(&state.target.path);
        }
        self.inner.flush_partial(&state, true).await;

        self.inner
            .bus
            .publish(Arc::new(StreamEvent::stopped(key.clone())));
        info!(key = %key, "stream stopped");

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let grace = self.inner.config.stop_grace;
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let removed = {
                        let mut registry = inner.registry.write();
                        // A new stream may have taken the key during the grace period
                        let same = registry
                            .streams
                            .get(&key)
                            .is_some_and(|s| Arc::ptr_eq(s, &state));
                        if same {
                            registry.streams.remove(&key);
                        }
                        same
                    };
                    if removed {
                        let dropped = inner.bus.unsubscribe_all(&key);
                        debug!(key = %key, subscribers = dropped, "stream removed");
                    }
                }
            }
        });
        self.track(task);

        Ok(())
    }

    /// Re-read a stream now instead of waiting for a notification
    pub async fn refresh(&self, job_id: &str, kind: OutputKind) -> Result<usize, StreamError> {
        let key = StreamKey::new(job_id, kind);
        let state = self
            .inner
            .lookup(&key)
            .filter(|s| s.is_active())
            .ok_or(StreamError::NotFound(key))?;
        self.inner.refresh(&state).await
    }

    /// Append a held unfinished last line to the buffer now
    ///
    /// For one-shot reads of output that may not end in a newline. Returns
    /// the number of lines appended.
    pub async fn flush_partial(
        &self,
        job_id: &str,
        kind: OutputKind,
    ) -> Result<usize, StreamError> {
        let key = StreamKey::new(job_id, kind);
        let state = self.inner.lookup(&key).ok_or(StreamError::NotFound(key))?;
        Ok(self.inner.flush_partial(&state, true).await)
    }

    pub fn subscribe(&self, job_id: &str, kind: OutputKind) -> Subscription {
        self.inner.bus.subscribe(
            &StreamKey::new(job_id, kind),
            self.inner.config.queue_capacity,
        )
    }

    pub fn unsubscribe(&self, job_id: &str, kind: OutputKind, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(&StreamKey::new(job_id, kind), id)
    }

    /// Buffer of a stream that is active or within its grace period
    pub fn get_buffer(&self, job_id: &str, kind: OutputKind) -> Option<CircularBuffer> {
        self.inner
            .lookup(&StreamKey::new(job_id, kind))
            .map(|s| s.buffer.clone())
    }

    pub fn is_active(&self, key: &StreamKey) -> bool {
        self.inner.lookup(key).is_some_and(|s| s.is_active())
    }

    pub fn active_streams(&self) -> Vec<StreamKey> {
        let mut keys: Vec<_> = self
            .inner
            .registry
            .read()
            .streams
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.key.clone())
            .collect();
        keys.sort_by(|a, b| (&a.job_id, a.kind.as_str()).cmp(&(&b.job_id, b.kind.as_str())));
        keys
    }

    pub fn stream_info(&self, job_id: &str, kind: OutputKind) -> Option<StreamInfo> {
        self.inner
            .lookup(&StreamKey::new(job_id, kind))
            .map(|s| s.info())
    }

    pub fn stats(&self) -> ManagerStats {
        let states: Vec<_> = self
            .inner
            .registry
            .read()
            .streams
            .values()
            .cloned()
            .collect();
        let streams: Vec<StreamInfo> = states.iter().map(|s| s.info()).collect();

        ManagerStats {
            active_streams: streams.iter().filter(|s| s.active).count(),
            total_streams: streams.len(),
            subscriber_topics: self.inner.bus.topic_count(),
            dropped_events: self.inner.bus.dropped_count(),
            buffered_lines: streams.iter().map(|s| s.buffer.size).sum(),
            memory_bytes: streams.iter().map(|s| s.buffer.memory_bytes).sum(),
            streams,
        }
    }

    /// Cancel background work, deactivate every stream and clear the bus
    pub fn close(&self) {
        self.cancel.cancel();

        let states: Vec<_> = {
            let mut registry = self.inner.registry.write();
            registry.by_path.clear();
            registry.streams.drain().map(|(_, s)| s).collect()
        };
        for state in &states {
            state.active.store(false, Ordering::Release);
        }

        // Dropping the watcher ends its event thread
        self.watches.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.bus.clear();

        if !states.is_empty() {
            info!(streams = states.len(), "stream manager closed");
        }
    }

    fn watch_file(&self, path: &Path) -> Result<(), StreamError> {
        let dir = watch_dir(path);
        let mut watches = self.watches.lock();
        let Some(watches) = watches.as_mut() else {
            return Err(StreamError::Closed);
        };

        let count = watches.dirs.entry(dir.clone()).or_insert(0);
        if *count == 0 {
            if let Err(source) = watches.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                watches.dirs.remove(&dir);
                return Err(StreamError::Watch { path: dir, source });
            }
            debug!(dir = %dir.display(), "watching directory");
        }
        *count += 1;
        Ok(())
    }

    fn unwatch_file(&self, path: &Path) {
        let dir = watch_dir(path);
        let mut watches = self.watches.lock();
        let Some(watches) = watches.as_mut() else {
            return;
        };

        if let Some(count) = watches.dirs.get_mut(&dir) {
            *count -= 1;
            if *count == 0 {
                watches.dirs.remove(&dir);
                if let Err(e) = watches.watcher.unwatch(&dir) {
                    debug!(dir = %dir.display(), error = %e, "unwatch failed");
                }
            }
        }
    }

    /// Undo a start that failed after registration
    fn rollback(&self, state: &Arc<StreamState>) {
        state.active.store(false, Ordering::Release);
        {
            let mut registry = self.inner.registry.write();
            if registry
                .streams
                .get(&state.key)
                .is_some_and(|s| Arc::ptr_eq(s, state))
            {
                registry.streams.remove(&state.key);
            }
            if !state.target.is_remote {
                registry.unlink_path(&state.target.path, &state.key);
            }
        }
        if !state.target.is_remote {
            self.unwatch_file(&state.target.path);
        }
    }

    fn spawn_remote_poll(&self, state: Arc<StreamState>) {
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.remote_poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = state.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if state.is_active() {
                            let _ = inner.refresh(&state).await;
                        }
                    }
                }
            }
        });
        self.track(task);
    }

    fn track(&self, task: tokio::task::JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Absolute path with the parent directory canonicalised, so it matches the
/// paths reported by the watcher
fn normalize_local_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or(absolute.clone()),
        _ => absolute,
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}
