use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FilterError;
use crate::highlight::Span;
use crate::parser::LogParser;
use jobscope_types::{LogLevel, TimeRange};

/// Filter type tag, as chosen by the user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Keyword,
    Regex,
    TimeRange,
    LogLevel,
}

impl FilterType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "keyword" | "text" => Some(Self::Keyword),
            "regex" | "re" => Some(Self::Regex),
            "time_range" | "time" => Some(Self::TimeRange),
            "log_level" | "level" => Some(Self::LogLevel),
            _ => None,
        }
    }
}

/// What a filter tests, with its parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterKind {
    Keyword {
        keyword: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    Regex {
        pattern: String,
    },
    /// Inclusive bounds on the line's leading timestamp
    TimeRange {
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        #[serde(default)]
        end: Option<DateTime<Utc>>,
    },
    /// Level names, compared case-insensitively
    LogLevel {
        levels: Vec<String>,
    },
}

impl FilterKind {
    pub fn filter_type(&self) -> FilterType {
        match self {
            Self::Keyword { .. } => FilterType::Keyword,
            Self::Regex { .. } => FilterType::Regex,
            Self::TimeRange { .. } => FilterType::TimeRange,
            Self::LogLevel { .. } => FilterType::LogLevel,
        }
    }

    /// Build a kind from free text typed for the given type
    ///
    /// Log levels are comma separated (`error,fatal`). Time ranges are either a
    /// relative window label (`15m`, `1h`) or `START..END` in RFC 3339 with
    /// either side optional.
    pub fn from_pattern(pattern: &str, filter_type: FilterType) -> Result<Self, FilterError> {
        match filter_type {
            FilterType::Keyword => Ok(Self::Keyword {
                keyword: pattern.to_string(),
                case_sensitive: false,
            }),
            FilterType::Regex => Ok(Self::Regex {
                pattern: pattern.to_string(),
            }),
            FilterType::LogLevel => Ok(Self::LogLevel {
                levels: pattern
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
            FilterType::TimeRange => {
                if let Some(range) = TimeRange::from_label(pattern.trim()) {
                    return Ok(Self::TimeRange {
                        start: range.start_from(Utc::now()),
                        end: None,
                    });
                }
                let (start, end) = pattern.split_once("..").ok_or_else(|| {
                    FilterError::Invalid(format!("time range '{pattern}' is not START..END"))
                })?;
                Ok(Self::TimeRange {
                    start: parse_bound(start)?,
                    end: parse_bound(end)?,
                })
            }
        }
    }
}

fn parse_bound(s: &str) -> Result<Option<DateTime<Utc>>, FilterError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .map_err(|e| FilterError::Invalid(format!("bad timestamp '{s}': {e}")))
}

fn default_true() -> bool {
    true
}

/// Serializable definition of a filter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: FilterKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default = "default_true")]
    pub highlight: bool,
}

impl FilterSpec {
    pub fn new(name: impl Into<String>, kind: FilterKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            enabled: true,
            inverted: false,
            highlight: true,
        }
    }

    pub fn keyword(keyword: &str) -> Self {
        Self::new(
            keyword,
            FilterKind::Keyword {
                keyword: keyword.to_string(),
                case_sensitive: false,
            },
        )
    }

    pub fn regex(pattern: &str) -> Self {
        Self::new(
            pattern,
            FilterKind::Regex {
                pattern: pattern.to_string(),
            },
        )
    }

    pub fn log_level<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let levels: Vec<String> = levels.into_iter().map(Into::into).collect();
        Self::new(levels.join(","), FilterKind::LogLevel { levels })
    }

    pub fn case_sensitive(mut self) -> Self {
        if let FilterKind::Keyword { case_sensitive, .. } = &mut self.kind {
            *case_sensitive = true;
        }
        self
    }

    pub fn inverted(mut self) -> Self {
        self.inverted = true;
        self
    }

    pub fn without_highlight(mut self) -> Self {
        self.highlight = false;
        self
    }

    /// Same definition under a fresh id
    pub fn fresh_copy(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }
}

/// Compiled form of a [`FilterKind`]
enum Matcher {
    Keyword(Regex),
    Regex(Regex),
    TimeRange {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    LogLevel(HashSet<LogLevel>),
}

impl Matcher {
    fn compile(kind: &FilterKind) -> Result<Self, FilterError> {
        match kind {
            FilterKind::Keyword {
                keyword,
                case_sensitive,
            } => {
                if keyword.is_empty() {
                    return Err(FilterError::Invalid("keyword is empty".to_string()));
                }
                let escaped = regex::escape(keyword);
                let pattern = if *case_sensitive {
                    escaped
                } else {
                    format!("(?i){escaped}")
                };
                Regex::new(&pattern)
                    .map(Self::Keyword)
                    .map_err(|source| FilterError::InvalidRegex {
                        pattern: keyword.clone(),
                        source,
                    })
            }
            FilterKind::Regex { pattern } => {
                if pattern.is_empty() {
                    return Err(FilterError::Invalid("regex is empty".to_string()));
                }
                Regex::new(pattern)
                    .map(Self::Regex)
                    .map_err(|source| FilterError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    })
            }
            FilterKind::TimeRange { start, end } => {
                if let (Some(s), Some(e)) = (start, end) {
                    if s > e {
                        return Err(FilterError::Invalid(format!(
                            "time range starts after it ends ({s} > {e})"
                        )));
                    }
                }
                Ok(Self::TimeRange {
                    start: *start,
                    end: *end,
                })
            }
            FilterKind::LogLevel { levels } => {
                let mut set = HashSet::new();
                for name in levels {
                    let level = LogLevel::from_str(name);
                    if level == LogLevel::Unknown && !name.eq_ignore_ascii_case("unknown") {
                        return Err(FilterError::Invalid(format!("unknown log level '{name}'")));
                    }
                    set.insert(level);
                }
                if set.is_empty() {
                    return Err(FilterError::Invalid("no log levels given".to_string()));
                }
                Ok(Self::LogLevel(set))
            }
        }
    }

    /// The one place every filter type is evaluated
    fn check(&self, line: &str) -> (bool, Option<Span>) {
        match self {
            Self::Keyword(re) | Self::Regex(re) => match re.find(line) {
                Some(m) => (true, Some(m.into())),
                None => (false, None),
            },
            Self::TimeRange { start, end } => {
                let Some(ts) = LogParser::timestamp(line) else {
                    return (false, None);
                };
                let after_start = start.is_none_or(|s| ts >= s);
                let before_end = end.is_none_or(|e| ts <= e);
                (after_start && before_end, None)
            }
            Self::LogLevel(levels) => (levels.contains(&LogParser::level(line)), None),
        }
    }
}

/// Outcome of evaluating one filter against one line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterMatch {
    pub matched: bool,
    pub span: Option<Span>,
}

/// Snapshot of a filter's running statistics
#[derive(Clone, Debug, Serialize)]
pub struct FilterStats {
    pub id: String,
    pub name: String,
    pub filter_type: FilterType,
    pub enabled: bool,
    pub processed: u64,
    pub matched: u64,
    pub last_match: Option<DateTime<Utc>>,
}

/// A compiled, named line predicate with running statistics
pub struct StreamFilter {
    spec: FilterSpec,
    matcher: Matcher,
    enabled: AtomicBool,
    processed: AtomicU64,
    matched: AtomicU64,
    last_match: Mutex<Option<DateTime<Utc>>>,
}

impl StreamFilter {
    /// Compile a filter from its definition
    pub fn new(spec: FilterSpec) -> Result<Self, FilterError> {
        let matcher = Matcher::compile(&spec.kind)?;
        Ok(Self {
            enabled: AtomicBool::new(spec.enabled),
            spec,
            matcher,
            processed: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            last_match: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn filter_type(&self) -> FilterType {
        self.spec.kind.filter_type()
    }

    pub fn highlight(&self) -> bool {
        self.spec.highlight
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Current definition, including the live enabled flag
    pub fn spec(&self) -> FilterSpec {
        FilterSpec {
            enabled: self.is_enabled(),
            ..self.spec.clone()
        }
    }

    /// Test a line and record statistics
    ///
    /// Disabled filters never match and record nothing. Inverted filters
    /// never report a span.
    pub fn evaluate(&self, line: &str) -> FilterMatch {
        if !self.is_enabled() {
            return FilterMatch::default();
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        let (hit, span) = self.matcher.check(line);

        let matched = hit != self.spec.inverted;
        if matched {
            self.matched.fetch_add(1, Ordering::Relaxed);
            *self.last_match.lock() = Some(Utc::now());
        }

        FilterMatch {
            matched,
            span: if self.spec.inverted { None } else { span },
        }
    }

    /// Match without touching statistics (used for re-rendering)
    pub fn peek(&self, line: &str) -> FilterMatch {
        if !self.is_enabled() {
            return FilterMatch::default();
        }
        let (hit, span) = self.matcher.check(line);
        FilterMatch {
            matched: hit != self.spec.inverted,
            span: if self.spec.inverted { None } else { span },
        }
    }

    pub fn stats(&self) -> FilterStats {
        FilterStats {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            filter_type: self.filter_type(),
            enabled: self.is_enabled(),
            processed: self.processed.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            last_match: *self.last_match.lock(),
        }
    }
}

impl std::fmt::Debug for StreamFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFilter")
            .field("id", &self.spec.id)
            .field("kind", &self.spec.kind)
            .field("enabled", &self.is_enabled())
            .field("inverted", &self.spec.inverted)
            .finish()
    }
}

/// How a chain combines its filters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMode {
    /// Every filter must match
    #[default]
    All,
    /// At least one filter must match
    Any,
}

/// Highlight produced by one filter of a chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterHighlight {
    pub filter_id: String,
    pub span: Span,
}

/// Verdict of a chain for one line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainMatch {
    pub matched: bool,
    pub highlights: Vec<FilterHighlight>,
}

impl ChainMatch {
    pub fn pass() -> Self {
        Self {
            matched: true,
            highlights: Vec::new(),
        }
    }

    pub fn reject() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.highlights.iter().map(|h| h.span)
    }
}

/// Ordered filters combined with ALL/ANY semantics
#[derive(Debug)]
pub struct FilterChain {
    id: String,
    name: String,
    mode: ChainMode,
    filters: Vec<Arc<StreamFilter>>,
    active: AtomicBool,
}

impl FilterChain {
    pub fn new(name: impl Into<String>, mode: ChainMode, filters: Vec<Arc<StreamFilter>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            mode,
            filters,
            active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    pub fn filters(&self) -> &[Arc<StreamFilter>] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Decide whether `line` passes, collecting highlight spans
    pub fn apply(&self, line: &str) -> ChainMatch {
        self.run(line, StreamFilter::evaluate)
    }

    /// Like [`apply`](Self::apply) but leaves filter statistics untouched
    pub fn peek(&self, line: &str) -> ChainMatch {
        self.run(line, StreamFilter::peek)
    }

    fn run<F>(&self, line: &str, eval: F) -> ChainMatch
    where
        F: Fn(&StreamFilter, &str) -> FilterMatch,
    {
        if !self.is_active() || self.filters.is_empty() {
            return ChainMatch::pass();
        }

        let mut match_count = 0;
        let mut highlights = Vec::new();

        for filter in &self.filters {
            let result = eval(filter.as_ref(), line);
            if result.matched {
                match_count += 1;
                if filter.highlight() {
                    if let Some(span) = result.span {
                        highlights.push(FilterHighlight {
                            filter_id: filter.id().to_string(),
                            span,
                        });
                    }
                }
                if self.mode == ChainMode::Any {
                    break;
                }
            } else if self.mode == ChainMode::All {
                return ChainMatch::reject();
            }
        }

        let matched = match self.mode {
            ChainMode::All => match_count == self.filters.len(),
            ChainMode::Any => match_count > 0,
        };

        ChainMatch {
            matched,
            highlights: if matched { highlights } else { Vec::new() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(spec: FilterSpec) -> Arc<StreamFilter> {
        Arc::new(StreamFilter::new(spec).unwrap())
    }

    fn chain(mode: ChainMode, specs: Vec<FilterSpec>) -> FilterChain {
        let chain = FilterChain::new("test", mode, specs.into_iter().map(compiled).collect());
        chain.set_active(true);
        chain
    }

    #[test]
    fn test_keyword_case_insensitive_span() {
        let filter = compiled(FilterSpec::keyword("error"));
        let result = filter.evaluate("Fatal ERROR here");
        assert!(result.matched);
        assert_eq!(result.span, Some(Span::new(6, 11)));
    }

    #[test]
    fn test_keyword_case_sensitive() {
        let filter = compiled(FilterSpec::keyword("error").case_sensitive());
        assert!(!filter.evaluate("ERROR").matched);
        assert!(filter.evaluate("an error").matched);
    }

    #[test]
    fn test_keyword_is_literal() {
        let filter = compiled(FilterSpec::keyword("a.b"));
        assert!(!filter.evaluate("axb").matched);
        assert!(filter.evaluate("a.b").matched);
    }

    #[test]
    fn test_regex_first_span() {
        let filter = compiled(FilterSpec::regex(r"loss=\d+\.\d+"));
        let result = filter.evaluate("step 1 loss=0.50 loss=0.40");
        assert_eq!(result.span, Some(Span::new(7, 16)));
    }

    #[test]
    fn test_invalid_specs() {
        assert!(matches!(
            StreamFilter::new(FilterSpec::regex("(")),
            Err(FilterError::InvalidRegex { .. })
        ));
        assert!(StreamFilter::new(FilterSpec::keyword("")).is_err());
        assert!(StreamFilter::new(FilterSpec::log_level(["loud"])).is_err());
    }

    #[test]
    fn test_inverted_drops_span() {
        let filter = compiled(FilterSpec::keyword("debug").inverted());
        let hit = filter.evaluate("debug noise");
        assert!(!hit.matched);
        let miss = filter.evaluate("real output");
        assert!(miss.matched);
        assert!(miss.span.is_none());
    }

    #[test]
    fn test_time_range_inclusive() {
        let kind = FilterKind::from_pattern(
            "2024-01-15T10:00:00Z..2024-01-15T11:00:00Z",
            FilterType::TimeRange,
        )
        .unwrap();
        let filter = compiled(FilterSpec::new("window", kind));

        let at_start = filter.evaluate("2024-01-15T10:00:00Z boot");
        assert!(at_start.matched);
        assert!(at_start.span.is_none());
        assert!(filter.evaluate("2024-01-15T11:00:00Z end").matched);
        assert!(!filter.evaluate("2024-01-15T11:00:01Z late").matched);
        assert!(!filter.evaluate("no timestamp").matched);
    }

    #[test]
    fn test_time_range_rejects_reversed_bounds() {
        let kind = FilterKind::TimeRange {
            start: Some(Utc::now()),
            end: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        assert!(StreamFilter::new(FilterSpec::new("bad", kind)).is_err());
    }

    #[test]
    fn test_log_level_membership() {
        let filter = compiled(FilterSpec::log_level(["Error", "FATAL"]));
        let result = filter.evaluate("[ERROR] disk quota exceeded");
        assert!(result.matched);
        assert!(result.span.is_none());
        assert!(!filter.evaluate("[INFO] all good").matched);
    }

    #[test]
    fn test_stats_and_disabled() {
        let filter = compiled(FilterSpec::keyword("x"));
        filter.evaluate("x");
        filter.evaluate("y");
        let stats = filter.stats();
        assert_eq!((stats.processed, stats.matched), (2, 1));
        assert!(stats.last_match.is_some());

        filter.set_enabled(false);
        assert!(!filter.evaluate("x").matched);
        assert_eq!(filter.stats().processed, 2);
    }

    #[test]
    fn test_all_mode() {
        let chain = chain(
            ChainMode::All,
            vec![FilterSpec::keyword("error"), FilterSpec::keyword("db")],
        );
        let result = chain.apply("db error occurred");
        assert!(result.matched);
        assert_eq!(result.highlights.len(), 2);
        assert!(!chain.apply("network error").matched);
    }

    #[test]
    fn test_any_mode() {
        let chain = chain(
            ChainMode::Any,
            vec![FilterSpec::keyword("error"), FilterSpec::keyword("db")],
        );
        assert!(chain.apply("error only").matched);
        assert!(chain.apply("db only").matched);
        assert!(!chain.apply("neither").matched);
    }

    #[test]
    fn test_all_mode_short_circuits() {
        let chain = chain(
            ChainMode::All,
            vec![FilterSpec::keyword("error"), FilterSpec::keyword("db")],
        );
        chain.apply("nothing here");
        let second = &chain.filters()[1];
        assert_eq!(second.stats().processed, 0);
    }

    #[test]
    fn test_any_mode_short_circuits() {
        let chain = chain(
            ChainMode::Any,
            vec![FilterSpec::keyword("error"), FilterSpec::keyword("db")],
        );
        chain.apply("error");
        assert_eq!(chain.filters()[1].stats().processed, 0);
    }

    #[test]
    fn test_highlight_flag() {
        let chain = chain(
            ChainMode::All,
            vec![
                FilterSpec::keyword("error").without_highlight(),
                FilterSpec::keyword("db"),
            ],
        );
        let result = chain.apply("db error");
        assert_eq!(result.highlights.len(), 1);
        assert_eq!(result.highlights[0].filter_id, chain.filters()[1].id());
    }

    #[test]
    fn test_inactive_or_empty_chain_passes() {
        let inactive = FilterChain::new(
            "off",
            ChainMode::All,
            vec![compiled(FilterSpec::keyword("x"))],
        );
        assert!(inactive.apply("nothing").matched);

        let empty = chain(ChainMode::Any, vec![]);
        assert!(empty.apply("anything").matched);
    }

    #[test]
    fn test_peek_leaves_stats() {
        let chain = chain(ChainMode::All, vec![FilterSpec::keyword("x")]);
        assert!(chain.peek("x").matched);
        assert_eq!(chain.filters()[0].stats().processed, 0);
    }

    #[test]
    fn test_spec_json_shape() {
        let spec = FilterSpec::keyword("oom");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "keyword");
        assert_eq!(json["keyword"], "oom");
        let back: FilterSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_relative_time_pattern() {
        let kind = FilterKind::from_pattern("15m", FilterType::TimeRange).unwrap();
        assert!(matches!(kind, FilterKind::TimeRange { start: Some(_), end: None }));
        assert!(FilterKind::from_pattern("yesterday", FilterType::TimeRange).is_err());
    }
}
