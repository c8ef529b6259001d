//! Event rate tracking and metrics collection.

use std::collections::HashMap;
use std::time::Instant;

use bevy_ecs::prelude::Resource;

use crate::clock::EventKind;

/// Event processing rate metrics.
#[derive(Debug, Default, Resource)]
pub struct EventMetrics {
    /// Total events processed.
    pub events_processed: u64,
    /// Start time for rate calculation.
    pub start_time: Option<Instant>,
    /// Events per event kind.
    pub events_by_kind: HashMap<EventKind, u64>,
}

impl EventMetrics {
    /// Record an event being processed.
    pub fn record_event(&mut self, kind: EventKind) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
        self.events_processed += 1;
        *self.events_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.events_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Get current event processing rate (events per second).
    pub fn events_per_second(&self) -> f64 {
        if let Some(start) = self.start_time {
            let elapsed = start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.events_processed as f64 / elapsed
            } else {
                0.0
            }
        } else {
            0.0
        }
    }

    /// Print summary statistics.
    pub fn print_summary(&self) {
        println!("\n=== Event Processing Summary ===");
        println!("Total events processed: {}", self.events_processed);
        if let Some(start) = self.start_time {
            let elapsed = start.elapsed();
            println!("Total time: {:.2}s", elapsed.as_secs_f64());
            println!("Events per second: {:.0}", self.events_per_second());
        }

        println!("\nEvents by kind:");
        let mut entries: Vec<_> = self.events_by_kind.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1));
        for (kind, count) in entries {
            println!("  {:30} : {}", format!("{:?}", kind), count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_metrics_counts_by_kind() {
        let mut metrics = EventMetrics::default();
        metrics.record_event(EventKind::Optimize);
        metrics.record_event(EventKind::Optimize);
        metrics.record_event(EventKind::PassengerRelease);

        assert_eq!(metrics.events_processed, 3);
        assert_eq!(metrics.count(EventKind::Optimize), 2);
        assert_eq!(metrics.count(EventKind::Hold), 0);
    }
}
