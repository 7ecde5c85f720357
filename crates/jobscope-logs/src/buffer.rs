use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Capacity used when a non-positive capacity is requested
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bookkeeping cost of one slot, on top of the line's heap allocation
const SLOT_OVERHEAD: usize = std::mem::size_of::<String>();

struct Ring {
    lines: VecDeque<String>,
    capacity: usize,
}

/// Thread-safe ring buffer holding the most recent lines of one stream
#[derive(Clone)]
pub struct CircularBuffer {
    /// Visible window plus its capacity
    ring: Arc<RwLock<Ring>>,

    /// Lines ever appended, survives clear()
    total_lines: Arc<AtomicU64>,
}

impl CircularBuffer {
    /// Create a new buffer; a capacity of 0 uses [`DEFAULT_CAPACITY`]
    pub fn new(capacity: usize) -> Self {
        let capacity = normalize_capacity(capacity);
        Self {
            ring: Arc::new(RwLock::new(Ring {
                lines: VecDeque::with_capacity(capacity),
                capacity,
            })),
            total_lines: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append one line, evicting the oldest if at capacity
    pub fn append(&self, line: impl Into<String>) {
        let mut ring = self.ring.write();
        push_line(&mut ring, line.into());
        self.total_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Append pre-split lines under a single write lock
    pub fn append_lines<I>(&self, lines: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut ring = self.ring.write();
        let mut count = 0;
        for line in lines {
            push_line(&mut ring, line);
            count += 1;
        }
        self.total_lines.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Split `text` into lines and append them; returns the number appended
    pub fn append_str(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.append_lines(split_lines(text))
    }

    /// Ordered copy of the visible lines
    pub fn lines(&self) -> Vec<String> {
        self.ring.read().lines.iter().cloned().collect()
    }

    /// The `n` most recent lines, oldest first
    pub fn last_n(&self, n: usize) -> Vec<String> {
        let ring = self.ring.read();
        let start = ring.lines.len().saturating_sub(n);
        ring.lines.iter().skip(start).cloned().collect()
    }

    /// Get lines in a range (for virtual scrolling)
    pub fn range(&self, start: usize, count: usize) -> Vec<String> {
        let ring = self.ring.read();
        ring.lines.iter().skip(start).take(count).cloned().collect()
    }

    /// Line at a 0-based position in the visible window
    pub fn get(&self, index: usize) -> Option<String> {
        self.ring.read().lines.get(index).cloned()
    }

    /// Change capacity, keeping the most recent lines that fit
    pub fn resize(&self, capacity: usize) {
        let capacity = normalize_capacity(capacity);
        let mut ring = self.ring.write();
        let keep = ring.lines.len().min(capacity);
        let skip = ring.lines.len() - keep;

        let mut lines = VecDeque::with_capacity(capacity);
        lines.extend(ring.lines.drain(..).skip(skip));
        ring.lines = lines;
        ring.capacity = capacity;
    }

    /// Empty the visible window; the lifetime counter is kept
    pub fn clear(&self) {
        self.ring.write().lines.clear();
    }

    /// Visible line count
    pub fn len(&self) -> usize {
        self.ring.read().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.read().capacity
    }

    /// Lines appended over the buffer's lifetime
    pub fn total_lines(&self) -> u64 {
        self.total_lines.load(Ordering::Relaxed)
    }

    /// Approximate heap usage in bytes
    pub fn estimate_memory_usage(&self) -> usize {
        let ring = self.ring.read();
        estimate(&ring)
    }

    pub fn stats(&self) -> BufferStats {
        let ring = self.ring.read();
        let size = ring.lines.len();
        BufferStats {
            capacity: ring.capacity,
            size,
            total_lines: self.total_lines(),
            utilization: size as f64 / ring.capacity as f64,
            memory_bytes: estimate(&ring),
        }
    }
}

impl Default for CircularBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.read();
        f.debug_struct("CircularBuffer")
            .field("capacity", &ring.capacity)
            .field("size", &ring.lines.len())
            .field("total_lines", &self.total_lines())
            .finish()
    }
}

/// Capacity and memory snapshot of one buffer
#[derive(Clone, Debug, Default, Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub size: usize,
    pub total_lines: u64,
    /// Fill ratio in `0.0..=1.0`
    pub utilization: f64,
    pub memory_bytes: usize,
}

/// Split text on `\n`; a single trailing separator does not add a line
pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    body.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

fn normalize_capacity(capacity: usize) -> usize {
    if capacity == 0 {
        DEFAULT_CAPACITY
    } else {
        capacity
    }
}

fn push_line(ring: &mut Ring, line: String) {
    if ring.lines.len() >= ring.capacity {
        ring.lines.pop_front();
    }
    ring.lines.push_back(line);
}

fn estimate(ring: &Ring) -> usize {
    let used: usize = ring.lines.iter().map(|l| l.capacity() + SLOT_OVERHEAD).sum();
    let free_slots = ring.capacity.saturating_sub(ring.lines.len());
    used + free_slots * SLOT_OVERHEAD
}
