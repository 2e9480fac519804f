//! Transfer statistics
//!
//! [`RunStats`] is written by the driver thread only and read by anyone
//! holding the run context. Every field is an independent atomic scalar:
//! readers may see success and failure counts from slightly different
//! instants, which is fine for a rate display.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Shared, atomically updated statistics of the current (or last) run
#[derive(Debug, Default)]
pub struct RunStats {
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// Last published throughput in KB/s, stored as `f64` bits
    throughput_bits: AtomicU64,
    in_flight: AtomicUsize,
    total_bytes: AtomicU64,
    windows: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every field; only called while no run is active
    pub(crate) fn reset(&self) {
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.throughput_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.in_flight.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.windows.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, bytes: u64) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_throughput(&self, kbps: f64) {
        self.throughput_bits.store(kbps.to_bits(), Ordering::Relaxed);
        self.windows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_submitted(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_completed(&self) {
        // Saturate rather than wrap if a transport ever reports a completion
        // the engine did not count.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Last computed throughput in KB/s (1 KB = 1024 bytes)
    pub fn throughput_kbps(&self) -> f64 {
        f64::from_bits(self.throughput_bits.load(Ordering::Relaxed))
    }

    /// Requests currently owned by the transport
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Number of throughput samples computed so far
    pub fn windows(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            success_count: self.success_count(),
            failure_count: self.failure_count(),
            throughput_kbps: self.throughput_kbps(),
            in_flight: self.in_flight(),
            total_bytes: self.total_bytes(),
            windows: self.windows(),
        }
    }
}

/// Point-in-time copy of [`RunStats`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsSnapshot {
    pub success_count: u64,
    pub failure_count: u64,
    pub throughput_kbps: f64,
    pub in_flight: usize,
    pub total_bytes: u64,
    pub windows: u64,
}

impl StatsSnapshot {
    /// Fraction of completed requests that failed
    pub fn failure_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }
}

/// Rolling throughput window, private to the driver thread
///
/// Every `depth` completions it yields one throughput sample computed over
/// the time since the previous sample, then starts over.
#[derive(Debug)]
pub struct ThroughputWindow {
    depth: usize,
    bytes: u64,
    completions: usize,
    started: Instant,
}

impl ThroughputWindow {
    pub fn new(depth: usize, now: Instant) -> Self {
        Self {
            depth,
            bytes: 0,
            completions: 0,
            started: now,
        }
    }

    /// Restart the window at `now`, discarding anything accumulated
    pub fn restart(&mut self, now: Instant) {
        self.bytes = 0;
        self.completions = 0;
        self.started = now;
    }

    /// Account one completion of `bytes`; returns a KB/s sample when the window closes
    ///
    /// A window that closes with no measurable elapsed time yields no sample.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<f64> {
        self.bytes += bytes;
        self.completions += 1;

        if self.completions < self.depth {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.started);
        let sample = kbps(self.bytes, elapsed);
        self.restart(now);
        sample
    }

    pub fn completions(&self) -> usize {
        self.completions
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

fn kbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some((bytes as f64 / 1024.0) / secs)
    } else {
        None
    }
}
