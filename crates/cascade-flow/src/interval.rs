//! Merges every `interval` consecutive text units into one.

/// Accumulation buffer that forwards one merged unit per `interval` inputs.
#[derive(Debug, Clone)]
pub struct IntervalGate {
    interval: usize,
    buffer: Vec<String>,
}

impl IntervalGate {
    /// An interval of 0 is treated as 1.
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            buffer: Vec::new(),
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Units waiting for the buffer to fill.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append a unit; returns the space-joined merge once `interval` units
    /// have arrived.
    pub fn submit(&mut self, unit: impl Into<String>) -> Option<String> {
        self.buffer.push(unit.into());
        if self.buffer.len() < self.interval {
            return None;
        }
        let merged = self.buffer.join(" ");
        self.buffer.clear();
        Some(merged)
    }

    /// Change the interval. Any partial buffer is discarded.
    pub fn set_interval(&mut self, interval: usize) {
        self.interval = interval.max(1);
        self.buffer.clear();
    }
}

impl Default for IntervalGate {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_one_passes_through() {
        let mut gate = IntervalGate::default();
        assert_eq!(gate.submit("hello").as_deref(), Some("hello"));
        assert_eq!(gate.pending(), 0);
    }

    #[test]
    fn test_merges_in_arrival_order() {
        let mut gate = IntervalGate::new(2);
        assert_eq!(gate.submit("a"), None);
        assert_eq!(gate.submit("b").as_deref(), Some("a b"));
        assert_eq!(gate.submit("c"), None);
        assert_eq!(gate.pending(), 1);
        assert_eq!(gate.submit("d").as_deref(), Some("c d"));
    }

    #[test]
    fn test_emits_once_per_interval() {
        let mut gate = IntervalGate::new(3);
        let emitted: Vec<_> = (0..9).filter_map(|i| gate.submit(i.to_string())).collect();
        assert_eq!(emitted, vec!["0 1 2", "3 4 5", "6 7 8"]);
    }

    #[test]
    fn test_set_interval_discards_partial_buffer() {
        let mut gate = IntervalGate::new(3);
        gate.submit("a");
        gate.submit("b");
        gate.set_interval(2);
        assert_eq!(gate.pending(), 0);
        assert_eq!(gate.submit("c"), None);
        assert_eq!(gate.submit("d").as_deref(), Some("c d"));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let mut gate = IntervalGate::new(0);
        assert_eq!(gate.interval(), 1);
        gate.set_interval(0);
        assert_eq!(gate.interval(), 1);
        assert_eq!(gate.submit("x").as_deref(), Some("x"));
    }
}
