/*
BSD 2-Clause License

Copyright (c) 2022, Diagnosis and Control of Clouds Laboratory
All rights reserved.

Redistribution and use in source and binary forms, with or without
modification, are permitted provided that the following conditions are met:

1. Redistributions of source code must retain the above copyright notice, this
   list of conditions and the following disclaimer.

2. Redistributions in binary form must reproduce the above copyright notice,
   this list of conditions and the following disclaimer in the documentation
   and/or other materials provided with the distribution.

THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

*/

//! Performance accounting for a running engine.
//!
//! Counters are relaxed atomics; they are incremented from producer threads
//! and the joiner and only ever read for snapshots, so commutative updates
//! with relaxed ordering are enough. Latency goes through an online
//! mean/stddev accumulator plus a histogram for percentiles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use histogram::Histogram;
use stats::OnlineStats;

use correlator_common::{CorrelatorError, LogEvent, PerformanceSnapshot};

pub struct PerformanceMonitor {
    started: Instant,
    start_epoch_ms: i64,
    events_processed: AtomicU64,
    correlations_found: AtomicU64,
    errors: AtomicU64,
    dropped_events: AtomicU64,
    latency: Mutex<LatencyTrack>,
}

struct LatencyTrack {
    online: OnlineStats,
    histogram: Histogram,
    samples: u64,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis();
        PerformanceMonitor {
            started: Instant::now(),
            start_epoch_ms: now_ms,
            events_processed: AtomicU64::new(0),
            correlations_found: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            latency: Mutex::new(LatencyTrack {
                online: OnlineStats::new(),
                histogram: Histogram::new(),
                samples: 0,
            }),
        }
    }

    pub fn record_event(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_correlation(&self) {
        self.correlations_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped_events.fetch_add(count, Ordering::Relaxed);
    }

    /// Joiner latency for one correlation, in milliseconds.
    pub fn record_latency_ms(&self, millis: u64) {
        let mut track = self.latency.lock().unwrap();
        track.online.add(millis);
        track.histogram.increment(millis).ok();
        track.samples += 1;
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn correlations_found(&self) -> u64 {
        self.correlations_found.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Latency percentile in milliseconds; 0 until samples arrive.
    pub fn latency_percentile(&self, percentile: f64) -> u64 {
        self.latency
            .lock()
            .unwrap()
            .histogram
            .percentile(percentile)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let uptime_ms = self.started.elapsed().as_millis() as i64;
        let events = self.events_processed.load(Ordering::Relaxed);
        let throughput = if uptime_ms > 0 {
            events as f64 * 1000.0 / uptime_ms as f64
        } else {
            0.0
        };
        let average_latency = {
            let track = self.latency.lock().unwrap();
            if track.samples == 0 {
                0.0
            } else {
                track.online.mean()
            }
        };
        PerformanceSnapshot {
            events_processed: events,
            correlations_found: self.correlations_found.load(Ordering::Relaxed),
            average_latency,
            throughput,
            memory_usage: memory_usage_mb(),
            errors: self.errors.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            start_time: self.start_epoch_ms,
            uptime: uptime_ms,
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        PerformanceMonitor::new()
    }
}

/// Resident set size of this process in MiB.
#[cfg(target_os = "linux")]
pub fn memory_usage_mb() -> f64 {
    let resident = procfs::process::Process::myself()
        .and_then(|p| p.statm())
        .map(|statm| statm.resident)
        .unwrap_or(0);
    (resident * procfs::page_size()) as f64 / (1024.0 * 1024.0)
}

#[cfg(not(target_os = "linux"))]
pub fn memory_usage_mb() -> f64 {
    0.0
}

/// The instrumentation adapter wrapped around every input stream: counts
/// events and upstream errors on the shared monitor as they flow through.
pub struct InstrumentedStream<I> {
    inner: I,
    monitor: Arc<PerformanceMonitor>,
}

impl<I> InstrumentedStream<I> {
    pub fn new(inner: I, monitor: Arc<PerformanceMonitor>) -> Self {
        InstrumentedStream { inner, monitor }
    }
}

impl<I> Iterator for InstrumentedStream<I>
where
    I: Iterator<Item = Result<LogEvent, CorrelatorError>>,
{
    type Item = Result<LogEvent, CorrelatorError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        match &item {
            Ok(_) => self.monitor.record_event(),
            Err(_) => self.monitor.record_error(),
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use correlator_common::ErrorKind;

    #[test]
    fn counters_accumulate() {
        let monitor = PerformanceMonitor::new();
        monitor.record_event();
        monitor.record_event();
        monitor.record_correlation();
        monitor.record_error();
        monitor.record_dropped(3);
        let snap = monitor.snapshot();
        assert_eq!(snap.events_processed, 2);
        assert_eq!(snap.correlations_found, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.dropped_events, 3);
        assert!(snap.uptime >= 0);
        assert!(snap.start_time > 0);
    }

    #[test]
    fn latency_mean_and_percentile() {
        let monitor = PerformanceMonitor::new();
        for ms in &[10u64, 20, 30] {
            monitor.record_latency_ms(*ms);
        }
        let snap = monitor.snapshot();
        assert!((snap.average_latency - 20.0).abs() < 1.0);
        assert!(monitor.latency_percentile(100.0) >= 30);
    }

    #[test]
    fn empty_monitor_reports_zeroes() {
        let snap = PerformanceMonitor::new().snapshot();
        assert_eq!(snap.events_processed, 0);
        assert_eq!(snap.average_latency, 0.0);
        assert_eq!(snap.dropped_events, 0);
    }

    #[test]
    fn instrumented_stream_counts_events_and_errors() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let items: Vec<Result<LogEvent, CorrelatorError>> = vec![
            Ok(LogEvent::new("2022-01-01T00:00:00Z", "a", "m")),
            Err(CorrelatorError::new(ErrorKind::Upstream, "boom")),
            Ok(LogEvent::new("2022-01-01T00:00:01Z", "a", "m")),
        ];
        let wrapped = InstrumentedStream::new(items.into_iter(), Arc::clone(&monitor));
        assert_eq!(wrapped.count(), 3);
        assert_eq!(monitor.events_processed(), 2);
        assert_eq!(monitor.errors(), 1);
    }

    #[test]
    fn memory_reading_does_not_panic() {
        let mb = memory_usage_mb();
        assert!(mb >= 0.0);
    }
}
