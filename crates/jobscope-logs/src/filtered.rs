//! Filtered, highlighted view over the stream manager
//!
//! Raw events are run through the active filter chain and republished on a
//! separate bus, so raw and filtered consumers never interfere.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use ratatui::style::Style;
use ratatui::text::Line;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::CircularBuffer;
use crate::bus::{EventBus, SharedEvent, Subscription, SubscriptionId};
use crate::error::{SearchError, StreamError};
use crate::filter::{ChainMatch, FilterStats};
use crate::highlight::{Span, highlight_style, merge_spans, to_line};
use crate::presets::FilterManager;
use crate::search::{SearchHistory, SearchOptions, SearchResult, StreamSearcher};
use crate::stream::{ManagerStats, StreamManager};
use jobscope_types::{EventPayload, OutputKind, StreamEvent, StreamKey};

/// A buffered line that passed the active chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FilteredLine {
    /// 1-based position in the stream buffer
    pub line_number: usize,
    pub text: String,
    /// Filter and search highlights, merged
    pub spans: Vec<Span>,
}

impl FilteredLine {
    pub fn to_line(&self, base: Style) -> Line<'static> {
        to_line(&self.text, &self.spans, base, highlight_style())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FilteredStats {
    pub streams: ManagerStats,
    pub filtered_topics: usize,
    pub filtered_dropped: u64,
    pub searchers: usize,
    /// Streams with a running filtered pump
    pub forwarders: usize,
    pub active_chain: Option<String>,
    pub filters: Vec<FilterStats>,
}

/// Pumps one stream's raw events onto the filtered bus
struct Forwarder {
    cancel: CancellationToken,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

pub struct FilteredStreamManager {
    streams: Arc<StreamManager>,
    filters: Arc<FilterManager>,
    filtered_bus: Arc<EventBus>,
    searchers: RwLock<HashMap<StreamKey, Arc<StreamSearcher>>>,
    forwarders: Arc<Mutex<HashMap<StreamKey, Forwarder>>>,
    derived: Mutex<Vec<JoinHandle<()>>>,
    history: Mutex<SearchHistory>,
    cancel: CancellationToken,
}

impl FilteredStreamManager {
    pub fn new(
        streams: Arc<StreamManager>,
        filters: Arc<FilterManager>,
        history_size: usize,
    ) -> Self {
        Self {
            streams,
            filters,
            filtered_bus: Arc::new(EventBus::new()),
            searchers: RwLock::new(HashMap::new()),
            forwarders: Arc::new(Mutex::new(HashMap::new())),
            derived: Mutex::new(Vec::new()),
            history: Mutex::new(SearchHistory::new(history_size)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn filters(&self) -> &Arc<FilterManager> {
        &self.filters
    }

    pub fn filtered_bus(&self) -> &Arc<EventBus> {
        &self.filtered_bus
    }

    /// Start a stream and publish its filtered events
    pub async fn start_filtered_stream(
        &self,
        job_id: &str,
        kind: OutputKind,
    ) -> Result<CircularBuffer, StreamError> {
        let key = StreamKey::new(job_id, kind);

        // Subscribe first so the start event is not missed
        let subscription = self.streams.subscribe(job_id, kind);
        let subscription_id = subscription.id;

        let buffer = match self.streams.start_stream(job_id, kind).await {
            Ok(buffer) => buffer,
            Err(e) => {
                self.streams.unsubscribe(job_id, kind, subscription_id);
                return Err(e);
            }
        };

        self.searchers.write().insert(
            key.clone(),
            Arc::new(StreamSearcher::new(buffer.clone())),
        );

        let cancel = self.cancel.child_token();
        let pump = forward(
            subscription,
            Arc::clone(&self.filters),
            Arc::clone(&self.filtered_bus),
            cancel.clone(),
        );
        let forwarders = Arc::clone(&self.forwarders);
        let pump_key = key.clone();
        let task = tokio::spawn(async move {
            if pump.await {
                // Raw stream removed: forget this pump unless a restart replaced it
                let mut forwarders = forwarders.lock();
                if forwarders
                    .get(&pump_key)
                    .is_some_and(|f| f.subscription == subscription_id)
                {
                    forwarders.remove(&pump_key);
                }
            }
        });

        // A stream restarted within its grace period replaces the old pump
        let previous = self.forwarders.lock().insert(
            key.clone(),
            Forwarder {
                cancel,
                subscription: subscription_id,
                task,
            },
        );
        if let Some(old) = previous {
            old.cancel.cancel();
            self.streams.unsubscribe(job_id, kind, old.subscription);
        }

        debug!(key = %key, "filtered stream started");
        Ok(buffer)
    }

    /// Stop the stream; the stop event still reaches filtered subscribers
    pub async fn stop_filtered_stream(
        &self,
        job_id: &str,
        kind: OutputKind,
    ) -> Result<(), StreamError> {
        self.streams.stop_stream(job_id, kind).await?;
        self.searchers.write().remove(&StreamKey::new(job_id, kind));
        Ok(())
    }

    /// Filter `event` and republish it if anything is left
    ///
    /// Returns whether an event was published.
    pub fn emit_filtered_event(&self, event: &StreamEvent) -> bool {
        match filter_event(&self.filters, event, true) {
            Some(filtered) => {
                self.filtered_bus.publish(Arc::new(filtered));
                true
            }
            None => false,
        }
    }

    pub fn subscribe_filtered(&self, job_id: &str, kind: OutputKind) -> Subscription {
        self.filtered_bus.subscribe(
            &StreamKey::new(job_id, kind),
            self.streams.config().queue_capacity,
        )
    }

    pub fn unsubscribe_filtered(
        &self,
        job_id: &str,
        kind: OutputKind,
        id: SubscriptionId,
    ) -> bool {
        self.filtered_bus.unsubscribe(&StreamKey::new(job_id, kind), id)
    }

    /// Private filtered queue fed from a raw subscription
    ///
    /// The queue closes when `cancel` fires or the raw stream goes away.
    /// Filter statistics are left to the shared filtered pump.
    pub fn filtered_events(
        &self,
        job_id: &str,
        kind: OutputKind,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<SharedEvent> {
        let capacity = self.streams.config().queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let mut upstream = self.streams.subscribe(job_id, kind);
        let streams = Arc::clone(&self.streams);
        let filters = Arc::clone(&self.filters);
        let shutdown = self.cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    event = upstream.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let Some(filtered) = filter_event(&filters, &event, false) else {
                    continue;
                };
                match tx.try_send(Arc::new(filtered)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(key = %upstream.key, "derived queue full")
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            streams.unsubscribe(&upstream.key.job_id, upstream.key.kind, upstream.id);
        });

        let mut derived = self.derived.lock();
        derived.retain(|t| !t.is_finished());
        derived.push(task);

        rx
    }

    pub fn get_buffer(&self, job_id: &str, kind: OutputKind) -> Option<CircularBuffer> {
        self.streams.get_buffer(job_id, kind)
    }

    pub fn active_streams(&self) -> Vec<StreamKey> {
        self.streams.active_streams()
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub fn search(
        &self,
        job_id: &str,
        kind: OutputKind,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let searcher = self.searcher(job_id, kind)?;
        let results = searcher.search(query, options)?;
        self.history.lock().add(query);
        Ok(results)
    }

    pub fn search_next(
        &self,
        job_id: &str,
        kind: OutputKind,
        after_line: usize,
    ) -> Result<SearchResult, SearchError> {
        self.searcher(job_id, kind)?.search_next(after_line)
    }

    pub fn search_previous(
        &self,
        job_id: &str,
        kind: OutputKind,
        before_line: usize,
    ) -> Result<SearchResult, SearchError> {
        self.searcher(job_id, kind)?.search_previous(before_line)
    }

    /// Recent queries, newest first
    pub fn search_history(&self) -> Vec<String> {
        self.history.lock().entries()
    }

    /// Buffered lines accepted by the active chain, with highlights
    pub fn filtered_content(
        &self,
        job_id: &str,
        kind: OutputKind,
    ) -> Result<Vec<FilteredLine>, SearchError> {
        let searcher = self.searcher(job_id, kind)?;
        let chain = self.filters.active_chain();

        let content = searcher
            .buffer()
            .lines()
            .into_iter()
            .enumerate()
            .filter_map(|(index, text)| {
                let verdict = chain
                    .as_ref()
                    .map(|c| c.peek(&text))
                    .unwrap_or_else(ChainMatch::pass);
                if !verdict.matched {
                    return None;
                }
                let spans = merge_spans(verdict.spans().chain(searcher.spans(&text)));
                Some(FilteredLine {
                    line_number: index + 1,
                    text,
                    spans,
                })
            })
            .collect();

        Ok(content)
    }

    /// Filter and search highlights for a line of this stream
    ///
    /// Search highlights are only included while the stream has a searcher.
    pub fn highlight_spans(&self, job_id: &str, kind: OutputKind, line: &str) -> Vec<Span> {
        let filter_spans = self
            .filters
            .active_chain()
            .map(|chain| chain.peek(line).spans().collect::<Vec<_>>())
            .unwrap_or_default();
        let search_spans = self
            .searcher(job_id, kind)
            .map(|s| s.spans(line))
            .unwrap_or_default();
        merge_spans(filter_spans.into_iter().chain(search_spans))
    }

    pub fn stats(&self) -> FilteredStats {
        FilteredStats {
            streams: self.streams.stats(),
            filtered_topics: self.filtered_bus.topic_count(),
            filtered_dropped: self.filtered_bus.dropped_count(),
            searchers: self.searchers.read().len(),
            forwarders: self.forwarders.lock().len(),
            active_chain: self.filters.active_chain().map(|c| c.name().to_string()),
            filters: self.filters.filter_stats(),
        }
    }

    /// Stop every pump and derived queue, then close the stream manager
    pub fn close(&self) {
        self.cancel.cancel();
        for (_, forwarder) in self.forwarders.lock().drain() {
            forwarder.task.abort();
        }
        for task in self.derived.lock().drain(..) {
            task.abort();
        }
        self.searchers.write().clear();
        self.filtered_bus.clear();
        self.streams.close();
    }

    fn searcher(
        &self,
        job_id: &str,
        kind: OutputKind,
    ) -> Result<Arc<StreamSearcher>, SearchError> {
        let key = StreamKey::new(job_id, kind);
        self.searchers
            .read()
            .get(&key)
            .cloned()
            .ok_or(SearchError::UnknownStream(key))
    }
}

impl Drop for FilteredStreamManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returns `true` when the raw stream went away, `false` when cancelled
async fn forward(
    mut subscription: Subscription,
    filters: Arc<FilterManager>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) -> bool {
    let key = subscription.key.clone();
    loop {
        tokio::select! {
            // A replaced pump is cancelled before its queue closes
            biased;
            _ = cancel.cancelled() => return false,
            event = subscription.recv() => match event {
                Some(event) => {
                    if let Some(filtered) = filter_event(&filters, &event, true) {
                        bus.publish(Arc::new(filtered));
                    }
                }
                None => break,
            },
        }
    }

    // Raw stream removed: close filtered listeners too
    let closed = bus.unsubscribe_all(&key);
    debug!(key = %key, subscribers = closed, "filtered stream closed");
    true
}

/// Keep only the lines the active chain accepts
///
/// Non-output events pass unchanged. `record` decides whether filter
/// statistics are updated.
fn filter_event(
    filters: &FilterManager,
    event: &StreamEvent,
    record: bool,
) -> Option<StreamEvent> {
    let EventPayload::Output { lines, .. } = &event.payload else {
        return Some(event.clone());
    };

    let Some(chain) = filters.active_chain() else {
        return Some(event.clone());
    };

    let kept: Vec<String> = lines
        .iter()
        .filter(|line| {
            if record {
                chain.apply(line).matched
            } else {
                chain.peek(line).matched
            }
        })
        .cloned()
        .collect();

    if kept.is_empty() {
        return None;
    }

    let mut raw = kept.join("\n");
    raw.push('\n');
    Some(StreamEvent {
        key: event.key.clone(),
        timestamp: event.timestamp,
        payload: EventPayload::Output { raw, lines: kept },
    })
}
