use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use jobscope_types::LogLevel;

/// Extracts timestamps and severity from raw job output lines
pub struct LogParser;

impl LogParser {
    /// Leading timestamp of a line, if it has one
    ///
    /// Accepts RFC 3339 (`2024-01-15T10:30:00Z`), the same wrapped in brackets,
    /// and naive `2024-01-15 10:30:00` / `2024-01-15T10:30:00` which are read as UTC.
    pub fn timestamp(line: &str) -> Option<DateTime<Utc>> {
        let trimmed = line.trim_start();
        let trimmed = trimmed.strip_prefix('[').unwrap_or(trimmed);
        if trimmed.len() < 19 {
            return None;
        }

        // Timestamp ends at the first delimiter after the date part
        let end = trimmed
            .char_indices()
            .skip(19)
            .find(|(_, c)| c.is_whitespace() || *c == ']' || *c == ',')
            .map(|(i, _)| i)
            .unwrap_or(trimmed.len());
        let candidate = &trimmed[..end];

        if let Ok(ts) = DateTime::parse_from_rfc3339(candidate) {
            return Some(ts.with_timezone(&Utc));
        }

        // Space-separated date and time: the time part is the next token
        let date_time = Self::floor_char_boundary(trimmed, 19);
        let head = &trimmed[..date_time];
        for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(head, format) {
                return Some(naive.and_utc());
            }
        }

        None
    }

    /// Detected severity of a line
    pub fn level(line: &str) -> LogLevel {
        if let Some(level) = Self::level_from_json(line) {
            return level;
        }
        Self::level_from_text(line)
    }

    /// Find the largest valid char boundary <= the given byte index
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }

    fn level_from_json(line: &str) -> Option<LogLevel> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }

        let value: Value = serde_json::from_str(trimmed).ok()?;
        let obj = value.as_object()?;

        for field in ["level", "lvl", "severity", "log.level", "loglevel", "log_level"] {
            match obj.get(field) {
                Some(Value::String(s)) => return Some(LogLevel::from_str(s)),
                Some(Value::Number(n)) => {
                    // Numeric levels, bunyan/pino style
                    if let Some(num) = n.as_u64() {
                        return Some(match num {
                            0..=10 => LogLevel::Trace,
                            11..=20 => LogLevel::Debug,
                            21..=30 => LogLevel::Info,
                            31..=40 => LogLevel::Warn,
                            41..=50 => LogLevel::Error,
                            _ => LogLevel::Fatal,
                        });
                    }
                }
                _ => {}
            }
        }

        None
    }

    fn level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        let bracket_patterns = [
            ("[FATAL]", LogLevel::Fatal),
            ("[PANIC]", LogLevel::Fatal),
            ("[CRITICAL]", LogLevel::Fatal),
            ("[ERROR]", LogLevel::Error),
            ("[ERR]", LogLevel::Error),
            ("[WARN]", LogLevel::Warn),
            ("[WARNING]", LogLevel::Warn),
            ("[INFO]", LogLevel::Info),
            ("[DEBUG]", LogLevel::Debug),
            ("[TRACE]", LogLevel::Trace),
        ];

        for (pattern, level) in bracket_patterns {
            if upper.contains(pattern) {
                return level;
            }
        }

        let colon_patterns = [
            ("FATAL:", LogLevel::Fatal),
            ("PANIC:", LogLevel::Fatal),
            ("CRITICAL:", LogLevel::Fatal),
            ("ERROR:", LogLevel::Error),
            ("ERR:", LogLevel::Error),
            ("WARNING:", LogLevel::Warn),
            ("WARN:", LogLevel::Warn),
            ("INFO:", LogLevel::Info),
            ("DEBUG:", LogLevel::Debug),
            ("TRACE:", LogLevel::Trace),
        ];

        for (pattern, level) in colon_patterns {
            if upper.contains(pattern) {
                return level;
            }
        }

        let spaced_patterns = [
            (" FATAL ", LogLevel::Fatal),
            (" PANIC ", LogLevel::Fatal),
            (" ERROR ", LogLevel::Error),
            (" WARN ", LogLevel::Warn),
            (" WARNING ", LogLevel::Warn),
            (" INFO ", LogLevel::Info),
            (" DEBUG ", LogLevel::Debug),
            (" TRACE ", LogLevel::Trace),
        ];

        for (pattern, level) in spaced_patterns {
            if upper.contains(pattern) {
                return level;
            }
        }

        let start_patterns = [
            ("FATAL", LogLevel::Fatal),
            ("PANIC", LogLevel::Fatal),
            ("ERROR", LogLevel::Error),
            ("WARN", LogLevel::Warn),
            ("INFO", LogLevel::Info),
            ("DEBUG", LogLevel::Debug),
            ("TRACE", LogLevel::Trace),
        ];

        let trimmed_upper = upper.trim_start();
        for (pattern, level) in start_patterns {
            if trimmed_upper.starts_with(pattern) {
                return level;
            }
        }

        LogLevel::Unknown
    }
}
