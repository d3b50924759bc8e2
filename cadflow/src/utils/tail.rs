//! Bounded capture of the most recent output lines.

use std::collections::VecDeque;

/// Default number of lines kept per stream.
pub const DEFAULT_TAIL_LINES: usize = 50;

/// Keeps the last `capacity` lines pushed into it.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    /// Creates a tail keeping at most `capacity` lines (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Pushes a line, evicting the oldest once full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Number of lines held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Copies the held lines out, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent() {
        let mut tail = OutputTail::new(2);
        tail.push("a");
        tail.push("b");
        tail.push("c");
        assert_eq!(tail.to_vec(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut tail = OutputTail::new(0);
        tail.push("x");
        tail.push("y");
        assert_eq!(tail.len(), 1);
    }
}
