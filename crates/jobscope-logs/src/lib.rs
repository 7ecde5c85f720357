//! Log streaming for jobscope
//!
//! This crate provides per-job output streams with bounded buffers, event
//! fan-out, line filters with presets, and search with highlighting.

mod buffer;
mod bus;
mod error;
mod filter;
mod filtered;
pub mod highlight;
mod parser;
mod presets;
mod search;
mod stream;
mod transport;

pub use buffer::{BufferStats, CircularBuffer, DEFAULT_CAPACITY, split_lines};
pub use bus::{DEFAULT_QUEUE_CAPACITY, EventBus, SharedEvent, Subscription, SubscriptionId};
pub use error::{FilterError, SearchError, StreamError};
pub use filter::{
    ChainMatch, ChainMode, FilterChain, FilterHighlight, FilterKind, FilterMatch, FilterSpec,
    FilterStats, FilterType, StreamFilter,
};
pub use filtered::{FilteredLine, FilteredStats, FilteredStreamManager};
pub use highlight::Span;
pub use parser::LogParser;
pub use presets::{FilterManager, FilterPreset, PRESETS_FILE, builtin_presets};
pub use search::{
    DEFAULT_HISTORY_SIZE, DEFAULT_MAX_RESULTS, SearchHistory, SearchOptions, SearchResult,
    StreamSearcher, compile_query,
};
pub use stream::{ManagerStats, StreamConfig, StreamInfo, StreamManager};
pub use transport::{
    DEFAULT_MAX_READ_BYTES, LocalTransport, OutputTransport, ReadChunk, RemoteTransport,
    StreamTarget,
};

// Re-export types used in our public API
pub use jobscope_types::{EventPayload, LogLevel, OutputKind, StreamEvent, StreamKey};
