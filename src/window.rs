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

//! Time-windowed event store.
//!
//! One `TimeWindow` holds one side's events for one correlation pass, keyed
//! by join value. The map doubles as an LRU: iteration order is recency
//! order, so eviction under the byte budget pops from the front. All times
//! are event time in epoch milliseconds; wall clocks never enter admission
//! decisions.

use indexmap::IndexMap;

use correlator_common::LogEvent;

/// Rough per-event footprint used to derive the byte budget.
pub const EVENT_SIZE_ESTIMATE: usize = 1024;

const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub window_size_ms: i64,
    pub late_tolerance_ms: i64,
    pub max_events: usize,
    /// Byte budget over the estimated event footprint. LRU keys are evicted
    /// past this.
    pub max_bytes: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            window_size_ms: 5 * 60 * 1000,
            late_tolerance_ms: 30 * 1000,
            max_events: 10_000,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Outcome of offering an event to the window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Admission {
    Admitted,
    /// Older than `window_start - late_tolerance`.
    TooOld,
    /// Newer than `window_end`; belongs to a later window.
    Future,
    /// `max_events` reached; the event is dropped, the window stays usable.
    Full,
}

pub struct TimeWindow {
    config: WindowConfig,
    /// Anchored by the first admitted event.
    window_start: Option<i64>,
    buckets: IndexMap<String, Vec<LogEvent>>,
    total_events: usize,
    rejected_late: u64,
    rejected_future: u64,
    rejected_full: u64,
    evicted_keys: u64,
}

impl TimeWindow {
    pub fn new(config: WindowConfig) -> Self {
        TimeWindow {
            config,
            window_start: None,
            buckets: IndexMap::new(),
            total_events: 0,
            rejected_late: 0,
            rejected_future: 0,
            rejected_full: 0,
            evicted_keys: 0,
        }
    }

    pub fn window_start(&self) -> Option<i64> {
        self.window_start
    }

    pub fn window_end(&self) -> Option<i64> {
        self.window_start.map(|s| s + self.config.window_size_ms)
    }

    /// Offers an event under the admission rules. `timestamp_ms` is the
    /// event's parsed time; the key is its extracted join value.
    pub fn insert(&mut self, key: &str, event: LogEvent, timestamp_ms: i64) -> Admission {
        let start = *self.window_start.get_or_insert(timestamp_ms);
        if timestamp_ms < start - self.config.late_tolerance_ms {
            self.rejected_late += 1;
            return Admission::TooOld;
        }
        if timestamp_ms > start + self.config.window_size_ms {
            self.rejected_future += 1;
            return Admission::Future;
        }
        if self.total_events >= self.config.max_events {
            self.rejected_full += 1;
            return Admission::Full;
        }
        let mut bucket = self.buckets.shift_remove(key).unwrap_or_default();
        bucket.push(event);
        self.buckets.insert(key.to_string(), bucket);
        self.total_events += 1;
        self.enforce_budget();
        Admission::Admitted
    }

    /// Read without touching recency.
    pub fn peek(&self, key: &str) -> Option<&[LogEvent]> {
        self.buckets.get(key).map(|b| b.as_slice())
    }

    /// Read and refresh the key's recency.
    pub fn get(&mut self, key: &str) -> Option<&[LogEvent]> {
        let bucket = self.buckets.shift_remove(key)?;
        self.buckets.insert(key.to_string(), bucket);
        self.buckets.get(key).map(|b| b.as_slice())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<LogEvent>> {
        let bucket = self.buckets.shift_remove(key)?;
        self.total_events -= bucket.len();
        Some(bucket)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.buckets.keys()
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn event_count(&self) -> usize {
        self.total_events
    }

    pub fn estimated_bytes(&self) -> usize {
        self.total_events * EVENT_SIZE_ESTIMATE
    }

    /// `true` once `now` is past the window plus the late-arrival grace.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.window_end() {
            Some(end) => now_ms > end + self.config.late_tolerance_ms,
            None => false,
        }
    }

    /// Keys whose newest event has aged out under the key TTL
    /// (`window_size + late_tolerance`) relative to the watermark.
    pub fn expired_keys(&self, watermark_ms: i64) -> Vec<String> {
        let ttl = self.config.window_size_ms + self.config.late_tolerance_ms;
        self.buckets
            .iter()
            .filter(|(_, bucket)| {
                bucket
                    .iter()
                    .filter_map(|e| e.timestamp_millis().ok())
                    .max()
                    .map_or(false, |newest| watermark_ms - newest > ttl)
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.total_events = 0;
        self.window_start = None;
    }

    pub fn rejected_late(&self) -> u64 {
        self.rejected_late
    }

    pub fn rejected_future(&self) -> u64 {
        self.rejected_future
    }

    pub fn rejected_full(&self) -> u64 {
        self.rejected_full
    }

    pub fn evicted_keys(&self) -> u64 {
        self.evicted_keys
    }

    fn enforce_budget(&mut self) {
        while self.estimated_bytes() > self.config.max_bytes && self.buckets.len() > 1 {
            // Front of the map is the least recently touched key.
            if let Some((_, bucket)) = self.buckets.shift_remove_index(0) {
                self.total_events -= bucket.len();
                self.evicted_keys += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: &str) -> LogEvent {
        LogEvent::new(ts, "test", "m")
    }

    fn config(window_s: i64, tolerance_s: i64, max_events: usize) -> WindowConfig {
        WindowConfig {
            window_size_ms: window_s * 1000,
            late_tolerance_ms: tolerance_s * 1000,
            max_events,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    #[test]
    fn first_event_anchors_the_window() {
        let mut w = TimeWindow::new(config(300, 30, 100));
        assert_eq!(w.window_start(), None);
        assert_eq!(w.insert("k", event("2022-01-01T00:00:00Z"), 1_000_000), Admission::Admitted);
        assert_eq!(w.window_start(), Some(1_000_000));
        assert_eq!(w.window_end(), Some(1_300_000));
    }

    #[test]
    fn late_tolerance_boundary() {
        let mut w = TimeWindow::new(config(300, 30, 100));
        w.insert("k", event("t"), 1_000_000);
        // exactly at the tolerance bound: admitted
        assert_eq!(w.insert("k", event("t"), 1_000_000 - 30_000), Admission::Admitted);
        // one millisecond past: rejected
        assert_eq!(w.insert("k", event("t"), 1_000_000 - 30_001), Admission::TooOld);
        assert_eq!(w.rejected_late(), 1);
    }

    #[test]
    fn future_events_rejected() {
        let mut w = TimeWindow::new(config(300, 30, 100));
        w.insert("k", event("t"), 0);
        assert_eq!(w.insert("k", event("t"), 300_000), Admission::Admitted);
        assert_eq!(w.insert("k", event("t"), 300_001), Admission::Future);
        assert_eq!(w.rejected_future(), 1);
    }

    #[test]
    fn max_events_drops_inserts_not_the_window() {
        let mut w = TimeWindow::new(config(300, 30, 2));
        assert_eq!(w.insert("a", event("t"), 0), Admission::Admitted);
        assert_eq!(w.insert("b", event("t"), 1), Admission::Admitted);
        assert_eq!(w.insert("c", event("t"), 2), Admission::Full);
        assert_eq!(w.rejected_full(), 1);
        // existing buckets unaffected
        assert_eq!(w.peek("a").unwrap().len(), 1);
        assert_eq!(w.event_count(), 2);
    }

    #[test]
    fn buckets_keep_insertion_order() {
        let mut w = TimeWindow::new(config(300, 30, 100));
        w.insert("k", event("2022-01-01T00:00:02Z"), 2000);
        w.insert("k", event("2022-01-01T00:00:01Z"), 1000);
        let bucket = w.peek("k").unwrap();
        assert_eq!(bucket[0].timestamp, "2022-01-01T00:00:02Z");
        assert_eq!(bucket[1].timestamp, "2022-01-01T00:00:01Z");
    }

    #[test]
    fn lru_eviction_removes_least_recent_key() {
        let mut w = TimeWindow::new(WindowConfig {
            max_bytes: 3 * EVENT_SIZE_ESTIMATE,
            ..config(300, 30, 100)
        });
        w.insert("a", event("t"), 0);
        w.insert("b", event("t"), 1);
        w.insert("c", event("t"), 2);
        // refresh "a" so "b" is now the LRU key
        w.get("a");
        w.insert("d", event("t"), 3);
        assert!(w.contains_key("a"));
        assert!(!w.contains_key("b"));
        assert!(w.contains_key("c"));
        assert!(w.contains_key("d"));
        assert_eq!(w.evicted_keys(), 1);
    }

    #[test]
    fn expiry_uses_window_plus_tolerance() {
        let mut w = TimeWindow::new(config(300, 30, 100));
        assert!(!w.is_expired(i64::max_value()));
        w.insert("k", event("t"), 0);
        assert!(!w.is_expired(330_000));
        assert!(w.is_expired(330_001));
    }

    #[test]
    fn expired_keys_follow_ttl() {
        let mut w = TimeWindow::new(config(10, 2, 100));
        w.insert("old", event("1970-01-01T00:00:00Z"), 0);
        w.insert("new", event("1970-01-01T00:00:09Z"), 9000);
        let expired = w.expired_keys(12_500);
        assert_eq!(expired, vec!["old".to_string()]);
        let expired = w.expired_keys(9000);
        assert!(expired.is_empty());
    }

    #[test]
    fn randomized_inserts_keep_counts_consistent() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut w = TimeWindow::new(config(300, 30, 150));
        let mut admitted = 0usize;
        for _ in 0..200 {
            let key = format!("k{}", rng.gen_range(0, 10));
            let t: i64 = rng.gen_range(0, 200_000);
            if w.insert(&key, event("t"), t) == Admission::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(w.event_count(), admitted);
        assert!(w.event_count() <= 150);
        assert_eq!(
            w.event_count(),
            w.keys()
                .map(|k| w.peek(k).map_or(0, |b| b.len()))
                .sum::<usize>()
        );
    }

    #[test]
    fn remove_and_clear_track_counts() {
        let mut w = TimeWindow::new(config(300, 30, 100));
        w.insert("a", event("t"), 0);
        w.insert("a", event("t"), 1);
        w.insert("b", event("t"), 2);
        assert_eq!(w.event_count(), 3);
        assert_eq!(w.remove("a").unwrap().len(), 2);
        assert_eq!(w.event_count(), 1);
        w.clear();
        assert_eq!(w.event_count(), 0);
        assert_eq!(w.window_start(), None);
    }
}
