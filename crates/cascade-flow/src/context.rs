//! Bounded, time-filtered memory of recent transcript units.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::Clock;

/// Ring of `(text, inserted_at)` pairs.
///
/// Capacity is `max(1, window / chunk)` and never changes. Overflow evicts
/// the oldest entry; age is only applied as a filter when reading, so stale
/// entries linger until they are pushed out.
pub struct ContextWindow {
    window_secs: f64,
    capacity: usize,
    entries: VecDeque<(String, f64)>,
    clock: Arc<dyn Clock>,
}

impl ContextWindow {
    pub fn new(window_secs: f64, chunk_secs: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = if chunk_secs > 0.0 && window_secs > 0.0 {
            ((window_secs / chunk_secs).floor() as usize).max(1)
        } else {
            1
        };
        Self {
            window_secs,
            capacity,
            entries: VecDeque::new(),
            clock,
        }
    }

    /// A window, or `None` when `window_secs <= 0` disables context and the
    /// caller should forward units untouched.
    pub fn enabled(window_secs: f64, chunk_secs: f64, clock: Arc<dyn Clock>) -> Option<Self> {
        (window_secs > 0.0).then(|| Self::new(window_secs, chunk_secs, clock))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }

    /// Number of retained entries, including ones too old to be returned.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, text: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((text.into(), self.clock.now()));
    }

    /// Retained texts no older than the window, oldest first.
    pub fn get_context(&self) -> Vec<String> {
        if self.window_secs <= 0.0 {
            return Vec::new();
        }
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|(_, at)| now - at <= self.window_secs)
            .map(|(text, _)| text.clone())
            .collect()
    }

    pub fn get_context_text(&self) -> String {
        self.get_context().join(" ")
    }
}
