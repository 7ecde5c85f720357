//! Shared types for jobscope
//!
//! This crate contains data structures used across multiple jobscope crates.

use chrono::{DateTime, Utc};
use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Scheduler Types
// ============================================================================

/// Job metadata as reported by the scheduler
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: String,
    pub name: Option<String>,
    pub user: Option<String>,
    pub state: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Declared stdout destination, unexpanded
    pub stdout: Option<String>,
    /// Declared stderr destination, unexpanded
    pub stderr: Option<String>,
    /// Node list in scheduler range syntax, e.g. `node[1-3],gpu01`
    pub node_list: String,
}

impl JobInfo {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    /// Declared output destination for the given kind
    pub fn declared_output(&self, kind: OutputKind) -> Option<&str> {
        match kind {
            OutputKind::Stdout => self.stdout.as_deref(),
            OutputKind::Stderr => self.stderr.as_deref(),
        }
    }
}

/// Which output file of a job is streamed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Parse "stdout"/"stderr" (also "out"/"err")
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "stdout" | "out" => Some(Self::Stdout),
            "stderr" | "err" => Some(Self::Stderr),
            _ => None,
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one stream: a job's stdout or stderr
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub job_id: String,
    pub kind: OutputKind,
}

impl StreamKey {
    pub fn new(job_id: impl Into<String>, kind: OutputKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_id, self.kind)
    }
}

// ============================================================================
// Stream Events
// ============================================================================

/// Payload of a stream event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// New content read from the output file
    Output { raw: String, lines: Vec<String> },
    /// A read failed on an active stream
    Error { message: String },
    Started,
    Stopped,
}

/// An immutable record of something that happened on a stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub key: StreamKey,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn new(key: StreamKey, payload: EventPayload) -> Self {
        Self {
            key,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn output(key: StreamKey, raw: String, lines: Vec<String>) -> Self {
        Self::new(key, EventPayload::Output { raw, lines })
    }

    pub fn error(key: StreamKey, message: impl Into<String>) -> Self {
        Self::new(
            key,
            EventPayload::Error {
                message: message.into(),
            },
        )
    }

    pub fn started(key: StreamKey) -> Self {
        Self::new(key, EventPayload::Started)
    }

    pub fn stopped(key: StreamKey) -> Self {
        Self::new(key, EventPayload::Stopped)
    }

    /// Lines carried by an output event
    pub fn lines(&self) -> Option<&[String]> {
        match &self.payload {
            EventPayload::Output { lines, .. } => Some(lines),
            _ => None,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self.payload, EventPayload::Output { .. })
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Relative time window for quick time-range filters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeRange {
    /// No lower bound
    #[default]
    All,
    /// Last 5 minutes
    Last5m,
    /// Last 15 minutes
    Last15m,
    /// Last 30 minutes
    Last30m,
    /// Last 1 hour
    Last1h,
    /// Last 6 hours
    Last6h,
    /// Last 24 hours
    Last24h,
}

impl TimeRange {
    /// Get the number of seconds for this time range
    pub fn as_seconds(&self) -> Option<i64> {
        match self {
            Self::All => None,
            Self::Last5m => Some(5 * 60),
            Self::Last15m => Some(15 * 60),
            Self::Last30m => Some(30 * 60),
            Self::Last1h => Some(60 * 60),
            Self::Last6h => Some(6 * 60 * 60),
            Self::Last24h => Some(24 * 60 * 60),
        }
    }

    /// Get display label for this time range
    pub fn label(&self) -> &'static str {
        match self {
            Self::All => "All",
            Self::Last5m => "5m",
            Self::Last15m => "15m",
            Self::Last30m => "30m",
            Self::Last1h => "1h",
            Self::Last6h => "6h",
            Self::Last24h => "24h",
        }
    }

    /// Parse a label produced by [`TimeRange::label`]
    pub fn from_label(label: &str) -> Option<Self> {
        [
            Self::All,
            Self::Last5m,
            Self::Last15m,
            Self::Last30m,
            Self::Last1h,
            Self::Last6h,
            Self::Last24h,
        ]
        .into_iter()
        .find(|r| r.label().eq_ignore_ascii_case(label))
    }

    /// Earliest instant covered by this window, relative to `now`
    pub fn start_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.as_seconds()
            .map(|secs| now - chrono::Duration::seconds(secs))
    }
}

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Get display color for this level
    pub fn color(&self) -> Color {
        match self {
            Self::Trace => Color::DarkGray,
            Self::Debug => Color::Cyan,
            Self::Info => Color::Green,
            Self::Warn => Color::Yellow,
            Self::Error => Color::Red,
            Self::Fatal => Color::Magenta,
            Self::Unknown => Color::White,
        }
    }

    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRC",
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
            Self::Unknown => "???",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_kind_parse() {
        assert_eq!(OutputKind::parse("STDOUT"), Some(OutputKind::Stdout));
        assert_eq!(OutputKind::parse("err"), Some(OutputKind::Stderr));
        assert_eq!(OutputKind::parse("stdin"), None);
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new("42", OutputKind::Stderr);
        assert_eq!(key.to_string(), "42:stderr");
    }

    #[test]
    fn test_event_lines_only_for_output() {
        let key = StreamKey::new("1", OutputKind::Stdout);
        let out = StreamEvent::output(key.clone(), "a\n".into(), vec!["a".into()]);
        assert_eq!(out.lines(), Some(&["a".to_string()][..]));
        assert!(StreamEvent::stopped(key).lines().is_none());
    }

    #[test]
    fn test_time_range_label_roundtrip() {
        assert_eq!(TimeRange::from_label("1h"), Some(TimeRange::Last1h));
        assert_eq!(TimeRange::from_label("all"), Some(TimeRange::All));
        assert_eq!(TimeRange::from_label("2d"), None);
    }

    #[test]
    fn test_level_aliases() {
        assert_eq!(LogLevel::from_str("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("crit"), LogLevel::Fatal);
        assert_eq!(LogLevel::from_str("verbose"), LogLevel::Unknown);
    }
}
