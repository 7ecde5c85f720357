//! Highlight spans shared by filters and search

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span as StyledSpan};
use serde::{Deserialize, Serialize};

/// Byte range `[start, end)` within a line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl From<regex::Match<'_>> for Span {
    fn from(m: regex::Match<'_>) -> Self {
        Self::new(m.start(), m.end())
    }
}

/// Order spans by position and drop any that overlap one already placed
///
/// Spans starting at the same offset keep their input order, so the first
/// source wins.
pub fn merge_spans<I>(spans: I) -> Vec<Span>
where
    I: IntoIterator<Item = Span>,
{
    let mut spans: Vec<Span> = spans.into_iter().filter(|s| !s.is_empty()).collect();
    spans.sort_by_key(|s| s.start);

    let mut placed: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match placed.last() {
            Some(last) if last.overlaps(&span) => {}
            _ => placed.push(span),
        }
    }
    placed
}

/// Wrap each span of `line` with `open`/`close` markers
pub fn apply_markers(line: &str, spans: &[Span], open: &str, close: &str) -> String {
    let spans = valid_spans(line, spans);
    if spans.is_empty() {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len() + spans.len() * (open.len() + close.len()));
    let mut last_end = 0;
    for span in spans {
        out.push_str(&line[last_end..span.start]);
        out.push_str(open);
        out.push_str(&line[span.start..span.end]);
        out.push_str(close);
        last_end = span.end;
    }
    out.push_str(&line[last_end..]);
    out
}

/// Default style for highlighted text
pub fn highlight_style() -> Style {
    Style::default()
        .fg(Color::Black)
        .bg(Color::Yellow)
        .add_modifier(Modifier::BOLD)
}

/// Build a styled ratatui line with highlighted spans
pub fn to_line(line: &str, spans: &[Span], base: Style, highlight: Style) -> Line<'static> {
    let mut styled = Vec::new();
    let mut last_end = 0;

    for span in valid_spans(line, spans) {
        if span.start > last_end {
            styled.push(StyledSpan::styled(line[last_end..span.start].to_string(), base));
        }
        styled.push(StyledSpan::styled(
            line[span.start..span.end].to_string(),
            highlight,
        ));
        last_end = span.end;
    }
    if last_end < line.len() || styled.is_empty() {
        styled.push(StyledSpan::styled(line[last_end..].to_string(), base));
    }

    Line::from(styled)
}

/// Merged spans that fit inside `line` on char boundaries
fn valid_spans(line: &str, spans: &[Span]) -> Vec<Span> {
    merge_spans(spans.iter().copied())
        .into_iter()
        .filter(|s| {
            s.end <= line.len() && line.is_char_boundary(s.start) && line.is_char_boundary(s.end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_drops_later_overlap() {
        let filter = Span::new(3, 8);
        let search = Span::new(5, 10);
        assert_eq!(merge_spans([filter, search]), vec![filter]);
        assert_eq!(merge_spans([search, filter]), vec![filter]);
    }

    #[test]
    fn test_merge_same_start_keeps_first_source() {
        let a = Span::new(2, 4);
        let b = Span::new(2, 9);
        assert_eq!(merge_spans([a, b]), vec![a]);
        assert_eq!(merge_spans([b, a]), vec![b]);
    }

    #[test]
    fn test_merge_keeps_adjacent_and_sorts() {
        let spans = merge_spans([
            Span::new(6, 8),
            Span::new(0, 3),
            Span::new(3, 6),
            Span::new(4, 4),
        ]);
        assert_eq!(spans, vec![Span::new(0, 3), Span::new(3, 6), Span::new(6, 8)]);
    }

    #[test]
    fn test_apply_markers_with_overlap() {
        let line = "db error occurred";
        let spans = [Span::new(3, 8), Span::new(0, 2), Span::new(5, 12)];
        let out = apply_markers(line, &spans, "<", ">");
        assert_eq!(out, "<db> <error> occurred");
    }

    #[test]
    fn test_apply_markers_ignores_out_of_bounds() {
        assert_eq!(apply_markers("short", &[Span::new(2, 40)], "[", "]"), "short");
        assert_eq!(apply_markers("héllo", &[Span::new(0, 2)], "[", "]"), "héllo");
    }

    #[test]
    fn test_to_line_segments() {
        let spans = [Span::new(3, 8)];
        let line = to_line("an error here", &spans, Style::default(), highlight_style());
        let texts: Vec<_> = line.spans.iter().map(|s| s.content.to_string()).collect();
        assert_eq!(texts, vec!["an ", "error", " here"]);
        assert_eq!(line.spans[1].style, highlight_style());
    }
}
