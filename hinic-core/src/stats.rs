// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Control channel statistics
//!
//! Counters for both engines and a latency histogram of synchronous
//! requests (command queue and management messages alike).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency histogram bucket boundaries (in nanoseconds)
const LATENCY_BUCKETS: [u64; 16] = [
    4_000,         // 4 μs
    16_000,        // 16 μs
    64_000,        // 64 μs
    256_000,       // 256 μs
    1_000_000,     // 1 ms
    2_000_000,     // 2 ms
    4_000_000,     // 4 ms
    8_000_000,     // 8 ms
    16_000_000,    // 16 ms
    32_000_000,    // 32 ms
    64_000_000,    // 64 ms
    128_000_000,   // 128 ms
    256_000_000,   // 256 ms
    512_000_000,   // 512 ms
    1_024_000_000, // ~1 s
    u64::MAX,      // 1+ s
];

const BUCKET_LABELS: [&str; 16] = [
    "   ≤4μs", "  ≤16μs", "  ≤64μs", " ≤256μs", "   ≤1ms", "   ≤2ms", "   ≤4ms", "   ≤8ms",
    "  ≤16ms", "  ≤32ms", "  ≤64ms", " ≤128ms", " ≤256ms", " ≤512ms", "    ≤1s", "    >1s",
];

/// Statistics of one device's control channel
pub struct ChannelStats {
    // Command queue
    cmdq_submitted: AtomicU64,
    cmdq_completed: AtomicU64,
    cmdq_async: AtomicU64,
    cmdq_timeouts: AtomicU64,
    cmdq_fake_timeouts: AtomicU64,
    cmdq_busy: AtomicU64,
    cmdq_flushed: AtomicU64,
    cmdq_errors: AtomicU64,

    // Management channel
    mgmt_sent: AtomicU64,
    mgmt_responses: AtomicU64,
    mgmt_timeouts: AtomicU64,
    mgmt_requests: AtomicU64,
    mgmt_dropped_segments: AtomicU64,
    mgmt_mismatches: AtomicU64,

    // Events
    aeq_events: AtomicU64,
    ceq_events: AtomicU64,

    // Latency tracking
    total_latency_ns: AtomicU64,
    latency_samples: AtomicU64,
    min_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
    latency_histogram: [AtomicU64; 16],
}

/// Point-in-time copy of [`ChannelStats`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    pub cmdq_submitted: u64,
    pub cmdq_completed: u64,
    pub cmdq_async: u64,
    pub cmdq_timeouts: u64,
    pub cmdq_fake_timeouts: u64,
    pub cmdq_busy: u64,
    pub cmdq_flushed: u64,
    pub cmdq_errors: u64,
    pub mgmt_sent: u64,
    pub mgmt_responses: u64,
    pub mgmt_timeouts: u64,
    pub mgmt_requests: u64,
    pub mgmt_dropped_segments: u64,
    pub mgmt_mismatches: u64,
    pub aeq_events: u64,
    pub ceq_events: u64,
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub p50_latency: Duration,
    pub p99_latency: Duration,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ChannelStats {
    pub const fn new() -> Self {
        Self {
            cmdq_submitted: AtomicU64::new(0),
            cmdq_completed: AtomicU64::new(0),
            cmdq_async: AtomicU64::new(0),
            cmdq_timeouts: AtomicU64::new(0),
            cmdq_fake_timeouts: AtomicU64::new(0),
            cmdq_busy: AtomicU64::new(0),
            cmdq_flushed: AtomicU64::new(0),
            cmdq_errors: AtomicU64::new(0),
            mgmt_sent: AtomicU64::new(0),
            mgmt_responses: AtomicU64::new(0),
            mgmt_timeouts: AtomicU64::new(0),
            mgmt_requests: AtomicU64::new(0),
            mgmt_dropped_segments: AtomicU64::new(0),
            mgmt_mismatches: AtomicU64::new(0),
            aeq_events: AtomicU64::new(0),
            ceq_events: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            min_latency_ns: AtomicU64::new(u64::MAX),
            max_latency_ns: AtomicU64::new(0),
            latency_histogram: [const { AtomicU64::new(0) }; 16],
        }
    }

    counter! {
        record_cmdq_submit => cmdq_submitted,
        record_cmdq_async => cmdq_async,
        record_cmdq_timeout => cmdq_timeouts,
        record_cmdq_fake_timeout => cmdq_fake_timeouts,
        record_cmdq_busy => cmdq_busy,
        record_cmdq_error => cmdq_errors,
        record_mgmt_send => mgmt_sent,
        record_mgmt_timeout => mgmt_timeouts,
        record_mgmt_request => mgmt_requests,
        record_dropped_segment => mgmt_dropped_segments,
        record_mismatch => mgmt_mismatches,
        record_aeq_event => aeq_events,
        record_ceq_event => ceq_events,
    }

    /// Record a completed sync command
    pub fn record_cmdq_complete(&self, latency: Duration) {
        self.cmdq_completed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Record a sync management response
    pub fn record_mgmt_response(&self, latency: Duration) {
        self.mgmt_responses.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Record commands force-completed by a flush
    pub fn record_cmdq_flushed(&self, count: usize) {
        self.cmdq_flushed.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let latency_ns = latency.as_nanos() as u64;
        self.total_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);

        // Update min latency
        let mut current_min = self.min_latency_ns.load(Ordering::Relaxed);
        while latency_ns < current_min {
            match self.min_latency_ns.compare_exchange_weak(
                current_min,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_min = x,
            }
        }

        // Update max latency
        let mut current_max = self.max_latency_ns.load(Ordering::Relaxed);
        while latency_ns > current_max {
            match self.max_latency_ns.compare_exchange_weak(
                current_max,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }

        for (i, &bucket) in LATENCY_BUCKETS.iter().enumerate() {
            if latency_ns <= bucket {
                self.latency_histogram[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Get statistics snapshot
    pub fn snapshot(&self) -> StatsReport {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let samples = load(&self.latency_samples);
        let avg_latency = if samples > 0 {
            Duration::from_nanos(load(&self.total_latency_ns) / samples)
        } else {
            Duration::ZERO
        };
        let min_latency_ns = load(&self.min_latency_ns);
        let (p50_latency, p99_latency) = self.calculate_percentiles();

        StatsReport {
            cmdq_submitted: load(&self.cmdq_submitted),
            cmdq_completed: load(&self.cmdq_completed),
            cmdq_async: load(&self.cmdq_async),
            cmdq_timeouts: load(&self.cmdq_timeouts),
            cmdq_fake_timeouts: load(&self.cmdq_fake_timeouts),
            cmdq_busy: load(&self.cmdq_busy),
            cmdq_flushed: load(&self.cmdq_flushed),
            cmdq_errors: load(&self.cmdq_errors),
            mgmt_sent: load(&self.mgmt_sent),
            mgmt_responses: load(&self.mgmt_responses),
            mgmt_timeouts: load(&self.mgmt_timeouts),
            mgmt_requests: load(&self.mgmt_requests),
            mgmt_dropped_segments: load(&self.mgmt_dropped_segments),
            mgmt_mismatches: load(&self.mgmt_mismatches),
            aeq_events: load(&self.aeq_events),
            ceq_events: load(&self.ceq_events),
            avg_latency,
            min_latency: if min_latency_ns == u64::MAX {
                Duration::ZERO
            } else {
                Duration::from_nanos(min_latency_ns)
            },
            max_latency: Duration::from_nanos(load(&self.max_latency_ns)),
            p50_latency,
            p99_latency,
        }
    }

    /// Calculate percentile latencies from histogram
    fn calculate_percentiles(&self) -> (Duration, Duration) {
        let mut histogram = [0u64; 16];
        let mut total = 0u64;
        for (i, bucket) in self.latency_histogram.iter().enumerate() {
            histogram[i] = bucket.load(Ordering::Relaxed);
            total += histogram[i];
        }

        if total == 0 {
            return (Duration::ZERO, Duration::ZERO);
        }

        let p50_threshold = (total + 1) / 2;
        let p99_threshold = (total * 99 + 99) / 100;

        let mut cumulative = 0u64;
        let mut p50 = None;
        let mut p99 = None;
        for (i, &count) in histogram.iter().enumerate() {
            cumulative += count;
            if p50.is_none() && cumulative >= p50_threshold {
                p50 = Some(LATENCY_BUCKETS[i]);
            }
            if p99.is_none() && cumulative >= p99_threshold {
                p99 = Some(LATENCY_BUCKETS[i]);
                break;
            }
        }

        let to_duration = |ns: Option<u64>| Duration::from_nanos(ns.unwrap_or(0));
        (to_duration(p50), to_duration(p99))
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.cmdq_submitted,
            &self.cmdq_completed,
            &self.cmdq_async,
            &self.cmdq_timeouts,
            &self.cmdq_fake_timeouts,
            &self.cmdq_busy,
            &self.cmdq_flushed,
            &self.cmdq_errors,
            &self.mgmt_sent,
            &self.mgmt_responses,
            &self.mgmt_timeouts,
            &self.mgmt_requests,
            &self.mgmt_dropped_segments,
            &self.mgmt_mismatches,
            &self.aeq_events,
            &self.ceq_events,
            &self.total_latency_ns,
            &self.latency_samples,
            &self.max_latency_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_latency_ns.store(u64::MAX, Ordering::Relaxed);
        for bucket in &self.latency_histogram {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    /// Get latency histogram as human-readable format
    pub fn latency_histogram_report(&self) -> String {
        let mut report = String::from("Latency Histogram:\n");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let count = self.latency_histogram[i].load(Ordering::Relaxed);
            if count > 0 {
                report.push_str(&format!("  {}: {}\n", label, count));
            }
        }
        report
    }
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_tracking() {
        let stats = ChannelStats::new();
        stats.record_cmdq_complete(Duration::from_micros(10));
        stats.record_cmdq_complete(Duration::from_micros(30));
        stats.record_mgmt_response(Duration::from_millis(3));

        let report = stats.snapshot();
        assert_eq!(report.cmdq_completed, 2);
        assert_eq!(report.mgmt_responses, 1);
        assert_eq!(report.min_latency, Duration::from_micros(10));
        assert_eq!(report.max_latency, Duration::from_millis(3));
        assert_eq!(report.p50_latency, Duration::from_micros(64));
        assert_eq!(report.p99_latency, Duration::from_millis(4));
    }

    #[test]
    fn test_empty_snapshot() {
        let report = ChannelStats::new().snapshot();
        assert_eq!(report, StatsReport::default());
    }

    #[test]
    fn test_reset() {
        let stats = ChannelStats::new();
        stats.record_cmdq_timeout();
        stats.record_cmdq_flushed(3);
        stats.record_cmdq_complete(Duration::from_millis(1));
        assert!(stats.latency_histogram_report().contains("≤1ms"));

        stats.reset();
        let report = stats.snapshot();
        assert_eq!(report.cmdq_timeouts, 0);
        assert_eq!(report.cmdq_flushed, 0);
        assert_eq!(report.min_latency, Duration::ZERO);
    }
}
