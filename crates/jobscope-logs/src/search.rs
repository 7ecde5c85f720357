//! Full-text search over one stream's buffer

use std::collections::VecDeque;

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::buffer::CircularBuffer;
use crate::error::SearchError;
use crate::highlight::{Span, apply_markers, merge_spans};

/// Result cap used when options don't set one
pub const DEFAULT_MAX_RESULTS: usize = 1000;

/// Queries kept by [`SearchHistory::default`]
pub const DEFAULT_HISTORY_SIZE: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub case_sensitive: bool,
    pub whole_word: bool,
    /// Treat the query as a regex instead of literal text
    pub regex: bool,
    /// Scan newest lines first
    pub reverse: bool,
    /// 0 means no cap
    pub max_results: usize,
    pub context_lines: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            whole_word: false,
            regex: false,
            reverse: false,
            max_results: DEFAULT_MAX_RESULTS,
            context_lines: 0,
        }
    }
}

/// One matching line
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    /// 1-based position in the buffer snapshot
    pub line_number: usize,
    pub line: String,
    pub matches: Vec<Span>,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

#[derive(Default)]
struct SearchState {
    query: Option<String>,
    options: SearchOptions,
    pattern: Option<Regex>,
    results: Vec<SearchResult>,
}

/// Searches a stream's buffer; holds a shared handle, never a copy
pub struct StreamSearcher {
    buffer: CircularBuffer,
    state: RwLock<SearchState>,
}

impl StreamSearcher {
    pub fn new(buffer: CircularBuffer) -> Self {
        Self {
            buffer,
            state: RwLock::new(SearchState::default()),
        }
    }

    pub fn buffer(&self) -> &CircularBuffer {
        &self.buffer
    }

    /// Scan the current buffer contents for `query`
    pub fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let pattern = compile_query(query, &options)?;
        let lines = self.buffer.lines();
        let cap = match options.max_results {
            0 => usize::MAX,
            n => n,
        };

        let indices: Box<dyn Iterator<Item = usize>> = if options.reverse {
            Box::new((0..lines.len()).rev())
        } else {
            Box::new(0..lines.len())
        };

        let mut results = Vec::new();
        for index in indices {
            if results.len() >= cap {
                break;
            }
            if let Some(result) = match_at(&pattern, &lines, index, options.context_lines) {
                results.push(result);
            }
        }

        let mut state = self.state.write();
        state.query = Some(query.to_string());
        state.options = options;
        state.pattern = Some(pattern);
        state.results = results.clone();

        Ok(results)
    }

    /// First match strictly after 1-based `after_line`
    ///
    /// Pass 0 to start from the top.
    pub fn search_next(&self, after_line: usize) -> Result<SearchResult, SearchError> {
        let (pattern, context) = self.current_pattern()?;
        let lines = self.buffer.lines();

        (after_line..lines.len())
            .find_map(|index| match_at(&pattern, &lines, index, context))
            .ok_or(SearchError::NoMoreMatches)
    }

    /// Last match strictly before 1-based `before_line`
    pub fn search_previous(&self, before_line: usize) -> Result<SearchResult, SearchError> {
        let (pattern, context) = self.current_pattern()?;
        let lines = self.buffer.lines();
        let end = before_line.saturating_sub(1).min(lines.len());

        (0..end)
            .rev()
            .find_map(|index| match_at(&pattern, &lines, index, context))
            .ok_or(SearchError::NoMoreMatches)
    }

    /// Spans the current search matches in `line`
    pub fn spans(&self, line: &str) -> Vec<Span> {
        match &self.state.read().pattern {
            Some(pattern) => find_spans(pattern, line),
            None => Vec::new(),
        }
    }

    /// Wrap current search matches in `line` with markers
    pub fn highlighted_line(&self, line: &str, open: &str, close: &str) -> String {
        apply_markers(line, &merge_spans(self.spans(line)), open, close)
    }

    pub fn last_query(&self) -> Option<String> {
        self.state.read().query.clone()
    }

    pub fn last_results(&self) -> Vec<SearchResult> {
        self.state.read().results.clone()
    }

    pub fn clear(&self) {
        *self.state.write() = SearchState::default();
    }

    fn current_pattern(&self) -> Result<(Regex, usize), SearchError> {
        let state = self.state.read();
        state
            .pattern
            .clone()
            .map(|p| (p, state.options.context_lines))
            .ok_or(SearchError::NoActiveSearch)
    }
}

/// Build the search regex from a query and its options
pub fn compile_query(query: &str, options: &SearchOptions) -> Result<Regex, SearchError> {
    if query.trim().is_empty() {
        return Err(SearchError::EmptyQuery);
    }

    let body = if options.regex {
        query.to_string()
    } else {
        regex::escape(query)
    };
    let source = if options.whole_word {
        format!(r"\b(?:{body})\b")
    } else {
        body
    };

    RegexBuilder::new(&source)
        .case_insensitive(!options.case_sensitive)
        .build()
        .map_err(|source| SearchError::InvalidPattern {
            pattern: query.to_string(),
            source,
        })
}

fn find_spans(pattern: &Regex, line: &str) -> Vec<Span> {
    pattern
        .find_iter(line)
        .map(Span::from)
        .filter(|s| !s.is_empty())
        .collect()
}

fn match_at(
    pattern: &Regex,
    lines: &[String],
    index: usize,
    context: usize,
) -> Option<SearchResult> {
    let line = lines.get(index)?;
    let matches = find_spans(pattern, line);
    if matches.is_empty() {
        return None;
    }

    let after_end = (index + 1 + context).min(lines.len());
    Some(SearchResult {
        line_number: index + 1,
        line: line.clone(),
        matches,
        context_before: lines[index.saturating_sub(context)..index].to_vec(),
        context_after: lines[index + 1..after_end].to_vec(),
    })
}

/// Most-recently-used list of queries
#[derive(Clone, Debug)]
pub struct SearchHistory {
    entries: VecDeque<String>,
    capacity: usize,
}

impl SearchHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_HISTORY_SIZE
        } else {
            capacity
        };
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Put `query` at the front; an existing entry moves instead of repeating
    pub fn add(&mut self, query: &str) {
        let query = query.trim();
        if query.is_empty() {
            return;
        }

        if let Some(pos) = self.entries.iter().position(|q| q == query) {
            self.entries.remove(pos);
        }
        self.entries.push_front(query.to_string());
        self.entries.truncate(self.capacity);
    }

    /// Newest first
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for SearchHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn searcher(lines: &[&str]) -> StreamSearcher {
        let buffer = CircularBuffer::new(100);
        buffer.append_lines(lines.iter().map(|s| s.to_string()));
        StreamSearcher::new(buffer)
    }

    fn sample() -> StreamSearcher {
        searcher(&[
            "starting job",
            "Error: disk quota",
            "step 1 done",
            "ERROR: node lost",
            "finished",
        ])
    }

    #[test]
    fn test_case_insensitive_search() {
        let s = sample();
        let results = s.search("error", SearchOptions::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].line_number, 2);
        assert_eq!(results[1].line_number, 4);
        assert_eq!(results[0].matches, vec![Span::new(0, 5)]);
    }

    #[test]
    fn test_case_sensitive_search() {
        let s = sample();
        let options = SearchOptions {
            case_sensitive: true,
            ..Default::default()
        };
        let results = s.search("ERROR", options).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].line_number, 4);
    }

    #[test]
    fn test_search_next_and_previous() {
        let s = sample();
        s.search("error", SearchOptions::default()).unwrap();

        assert_eq!(s.search_next(0).unwrap().line_number, 2);
        assert_eq!(s.search_next(2).unwrap().line_number, 4);
        assert!(matches!(s.search_next(4), Err(SearchError::NoMoreMatches)));

        assert_eq!(s.search_previous(4).unwrap().line_number, 2);
        assert!(matches!(s.search_previous(2), Err(SearchError::NoMoreMatches)));
    }

    #[test]
    fn test_navigation_requires_search() {
        let s = sample();
        assert!(matches!(s.search_next(0), Err(SearchError::NoActiveSearch)));
    }

    #[test]
    fn test_literal_query_is_escaped() {
        let s = searcher(&["cost: $5.00", "cost: 5x00"]);
        let results = s.search("5.00", SearchOptions::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].line_number, 1);
    }

    #[test]
    fn test_whole_word_and_regex() {
        let s = searcher(&["error", "errors", "an error here"]);
        let options = SearchOptions {
            whole_word: true,
            ..Default::default()
        };
        let lines: Vec<_> = s
            .search("error", options)
            .unwrap()
            .iter()
            .map(|r| r.line_number)
            .collect();
        assert_eq!(lines, vec![1, 3]);

        let options = SearchOptions {
            regex: true,
            ..Default::default()
        };
        assert_eq!(s.search(r"errors?$", options).unwrap().len(), 2);
    }

    #[test]
    fn test_all_matches_per_line() {
        let s = searcher(&["fail, fail, fail"]);
        let results = s.search("fail", SearchOptions::default()).unwrap();
        assert_eq!(results[0].matches.len(), 3);
        assert_eq!(results[0].matches[2], Span::new(12, 16));
    }

    #[test]
    fn test_reverse_and_cap() {
        let s = sample();
        let options = SearchOptions {
            reverse: true,
            max_results: 1,
            ..Default::default()
        };
        let results = s.search("error", options).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].line_number, 4);
    }

    #[test]
    fn test_context_lines() {
        let s = sample();
        let options = SearchOptions {
            context_lines: 1,
            ..Default::default()
        };
        let results = s.search("quota", options).unwrap();
        assert_eq!(results[0].context_before, vec!["starting job"]);
        assert_eq!(results[0].context_after, vec!["step 1 done"]);

        let options = SearchOptions {
            context_lines: 2,
            ..Default::default()
        };
        let results = s.search("starting", options).unwrap();
        assert!(results[0].context_before.is_empty());
        assert_eq!(results[0].context_after.len(), 2);
    }

    #[test]
    fn test_invalid_and_empty_queries() {
        let s = sample();
        assert!(matches!(
            s.search("  ", SearchOptions::default()),
            Err(SearchError::EmptyQuery)
        ));
        let options = SearchOptions {
            regex: true,
            ..Default::default()
        };
        assert!(matches!(
            s.search("(unclosed", options),
            Err(SearchError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_highlighted_line() {
        let s = sample();
        assert_eq!(s.highlighted_line("no search yet", "[", "]"), "no search yet");
        s.search("node", SearchOptions::default()).unwrap();
        assert_eq!(
            s.highlighted_line("node lost, Node back", "<", ">"),
            "<node> lost, <Node> back"
        );
    }

    #[test]
    fn test_search_sees_new_lines() {
        let s = sample();
        assert_eq!(s.search("oom", SearchOptions::default()).unwrap().len(), 0);
        s.buffer().append("oom-killer invoked");
        assert_eq!(s.search_next(0).unwrap().line_number, 6);
    }

    #[test]
    fn test_history_mru() {
        let mut history = SearchHistory::new(3);
        history.add("a");
        history.add("b");
        history.add("c");
        history.add("a");
        assert_eq!(history.entries(), vec!["a", "c", "b"]);

        history.add("d");
        assert_eq!(history.entries(), vec!["d", "a", "c"]);

        history.add("   ");
        assert_eq!(history.len(), 3);
        assert_eq!(history.get(0), Some("d"));
    }
}
