//! Traffic Counters
//!
//! Lock-free message and byte counts per direction, updated from the
//! forwarding hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::rules::Direction;

/// Monotonic traffic counters
#[derive(Debug, Default)]
pub struct TrafficCounters {
    ingress_count: AtomicU64,
    ingress_bytes: AtomicU64,
    egress_count: AtomicU64,
    egress_bytes: AtomicU64,
}

/// Point-in-time copy of [`TrafficCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub ingress_count: u64,
    pub ingress_bytes: u64,
    pub egress_count: u64,
    pub egress_bytes: u64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one message of `wire_size` bytes travelling in `direction`
    pub fn record(&self, direction: Direction, wire_size: usize) {
        let (count, bytes) = match direction {
            Direction::LocalToCloud => (&self.egress_count, &self.egress_bytes),
            Direction::CloudToLocal => (&self.ingress_count, &self.ingress_bytes),
        };
        count.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(wire_size as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            ingress_count: self.ingress_count.load(Ordering::Relaxed),
            ingress_bytes: self.ingress_bytes.load(Ordering::Relaxed),
            egress_count: self.egress_count.load(Ordering::Relaxed),
            egress_bytes: self.egress_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_by_direction() {
        let counters = TrafficCounters::new();
        counters.record(Direction::LocalToCloud, 10);
        counters.record(Direction::LocalToCloud, 5);
        counters.record(Direction::CloudToLocal, 7);

        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                ingress_count: 1,
                ingress_bytes: 7,
                egress_count: 2,
                egress_bytes: 15,
            }
        );
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let counters = Arc::new(TrafficCounters::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.record(Direction::CloudToLocal, 3);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.ingress_count, 8000);
        assert_eq!(snapshot.ingress_bytes, 24000);
        assert_eq!(snapshot.egress_count, 0);
    }
}
