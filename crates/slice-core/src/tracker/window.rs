//! Sliding time window of QoS violations

use std::collections::VecDeque;
use std::time::Duration;

/// Violation timestamps (unix seconds) within a rolling window
#[derive(Debug, Clone)]
pub struct ViolationWindow {
    events: VecDeque<i64>,
    window_secs: i64,
}

impl ViolationWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            window_secs: window.as_secs() as i64,
        }
    }

    /// Record a violation observed at `timestamp`; returns the count inside the window
    pub fn record(&mut self, timestamp: i64) -> usize {
        self.expire(timestamp);
        // readings from several nodes may arrive out of order
        let pos = self
            .events
            .iter()
            .rposition(|ts| *ts <= timestamp)
            .map_or(0, |i| i + 1);
        self.events.insert(pos, timestamp);
        self.events.len()
    }

    /// Violations inside the window ending at `now`
    pub fn count(&mut self, now: i64) -> usize {
        self.expire(now);
        self.events.len()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn expire(&mut self, now: i64) {
        let cutoff = now - self.window_secs;
        while let Some(ts) = self.events.front() {
            if *ts < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_within_window() {
        let mut window = ViolationWindow::new(Duration::from_secs(60));
        assert_eq!(window.record(1000), 1);
        assert_eq!(window.record(1030), 2);
        assert_eq!(window.record(1060), 3);
        // 1000 falls out once the window moves past it
        assert_eq!(window.record(1061), 3);
        assert_eq!(window.count(2000), 0);
        assert!(window.is_empty());
    }

    #[test]
    fn test_out_of_order_events() {
        let mut window = ViolationWindow::new(Duration::from_secs(10));
        window.record(100);
        window.record(95);
        window.record(98);
        assert_eq!(window.count(106), 2);
    }
}
