//! Scheduler node-list expansion
//!
//! Node lists are comma separated names where any name may carry a bracket
//! group: `node[1-3]`, `node[1,3,5]`, `gpu[01-04,08]-ib`. Malformed groups are
//! kept as literal names instead of failing.

use tracing::warn;

/// Upper bound on names produced from one expression or one node list
const MAX_RANGE_EXPANSION: u64 = 65_536;

/// Expand a full node list into individual node names
pub fn expand_node_list(list: &str) -> Vec<String> {
    let list = list.trim();
    if list.is_empty() || list == "(null)" || list.eq_ignore_ascii_case("none assigned") {
        return Vec::new();
    }

    let mut names = Vec::new();
    for part in split_top_level(list).into_iter().map(str::trim) {
        if part.is_empty() {
            continue;
        }
        let expanded = expand_node_range(part);
        if (names.len() + expanded.len()) as u64 > MAX_RANGE_EXPANSION {
            warn!(list, "node list expands past {MAX_RANGE_EXPANSION} names, truncating");
            break;
        }
        names.extend(expanded);
    }
    names
}

/// Expand a single node expression such as `node[1-3]`
pub fn expand_node_range(expr: &str) -> Vec<String> {
    let Some(open) = expr.find('[') else {
        return vec![expr.to_string()];
    };
    let Some(close_rel) = expr[open..].find(']') else {
        return vec![expr.to_string()];
    };
    let close = open + close_rel;

    let prefix = &expr[..open];
    let inner = &expr[open + 1..close];
    let suffix = &expr[close + 1..];

    let Some(values) = expand_bracket(inner) else {
        return vec![expr.to_string()];
    };

    // A suffix may carry its own bracket group
    let tails = expand_node_range(suffix);
    let total = values.len().checked_mul(tails.len());
    if total.is_none_or(|n| n as u64 > MAX_RANGE_EXPANSION) {
        return vec![expr.to_string()];
    }
    let mut names = Vec::with_capacity(values.len() * tails.len());
    for value in &values {
        for tail in &tails {
            names.push(format!("{prefix}{value}{tail}"));
        }
    }
    names
}

/// Expand the inside of a bracket group; `None` means "treat as literal"
fn expand_bracket(inner: &str) -> Option<Vec<String>> {
    if inner.trim().is_empty() {
        return None;
    }

    let mut values = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }

        if let Some(range) = numeric_range(part) {
            let range = range?;
            if values.len() as u64 + range.len() as u64 > MAX_RANGE_EXPANSION {
                return None;
            }
            values.extend(range);
        } else if part.chars().all(|c| c.is_ascii_alphanumeric()) {
            values.push(part.to_string());
        } else {
            return None;
        }
    }

    Some(values)
}

/// `Some(None)` is a range-shaped part that is invalid, `None` is not a range
fn numeric_range(part: &str) -> Option<Option<Vec<String>>> {
    let (lo, hi) = part.split_once('-')?;
    let is_number = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !is_number(lo) || !is_number(hi) {
        return Some(None);
    }

    let (Ok(start), Ok(end)) = (lo.parse::<u64>(), hi.parse::<u64>()) else {
        return Some(None);
    };
    if start > end || end - start >= MAX_RANGE_EXPANSION {
        return Some(None);
    }

    // Leading zeros fix the width: node[01-10] -> node01..node10
    let width = if lo.len() > 1 && lo.starts_with('0') {
        lo.len()
    } else {
        0
    };

    Some(Some(
        (start..=end)
            .map(|n| format!("{n:0width$}"))
            .collect(),
    ))
}

/// Split on commas that are not inside a bracket group
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}
