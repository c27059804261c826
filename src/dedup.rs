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

//! Windowed duplicate suppression.
//!
//! Aggregators re-deliver: a reconnect replays the last batch, a poll
//! overlaps the previous one. The deduplicator hashes event content with the
//! timestamp left out and drops repeats that land inside the window. Entries
//! age out as event time advances, so memory stays bounded by the window's
//! width.

use std::time::Duration;

use crypto::digest::Digest;
use crypto::sha2::Sha256;
use indexmap::IndexMap;

use correlator_common::{CorrelatorError, LogEvent};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

pub struct Deduplicator {
    window_ms: i64,
    /// content hash to timestamp last seen; insertion order doubles as age
    /// order for sweeping.
    seen: IndexMap<String, i64>,
    duplicates: u64,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Deduplicator {
            window_ms: window.as_millis() as i64,
            seen: IndexMap::new(),
            duplicates: 0,
        }
    }

    pub fn with_default_window() -> Self {
        Deduplicator::new(DEFAULT_WINDOW)
    }

    /// Content fingerprint: source, stream, message and sorted labels. The
    /// timestamp stays out so replays with jitter still collapse.
    pub fn fingerprint(event: &LogEvent) -> String {
        let mut hasher = Sha256::new();
        hasher.input_str(&event.source);
        hasher.input_str("\u{1f}");
        if let Some(stream) = &event.stream {
            hasher.input_str(stream);
        }
        hasher.input_str("\u{1f}");
        hasher.input_str(&event.message);
        let mut labels: Vec<(&String, &String)> = event.labels.iter().collect();
        labels.sort();
        for (name, value) in labels {
            hasher.input_str("\u{1f}");
            hasher.input_str(name);
            hasher.input_str("=");
            hasher.input_str(value);
        }
        hasher.result_str()
    }

    /// Whether this event repeats one already seen inside the window. Events
    /// with unparseable timestamps are never treated as duplicates.
    pub fn is_duplicate(&mut self, event: &LogEvent) -> bool {
        let timestamp = match event.timestamp_millis() {
            Ok(t) => t,
            Err(_) => return false,
        };
        self.sweep(timestamp);
        let hash = Deduplicator::fingerprint(event);
        match self.seen.get(&hash) {
            Some(&last) if (timestamp - last).abs() <= self.window_ms => {
                self.duplicates += 1;
                true
            }
            _ => {
                self.seen.shift_remove(&hash);
                self.seen.insert(hash, timestamp);
                false
            }
        }
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    fn sweep(&mut self, watermark: i64) {
        while let Some((_, &oldest)) = self.seen.iter().next() {
            if watermark - oldest > self.window_ms {
                self.seen.shift_remove_index(0);
            } else {
                break;
            }
        }
    }

    /// Wraps an event stream, dropping duplicates as they flow through.
    pub fn wrap<I>(self, inner: I) -> DedupStream<I>
    where
        I: Iterator<Item = Result<LogEvent, CorrelatorError>>,
    {
        DedupStream { inner, dedup: self }
    }
}

pub struct DedupStream<I> {
    inner: I,
    dedup: Deduplicator,
}

impl<I> DedupStream<I> {
    pub fn duplicates(&self) -> u64 {
        self.dedup.duplicates()
    }
}

impl<I> Iterator for DedupStream<I>
where
    I: Iterator<Item = Result<LogEvent, CorrelatorError>>,
{
    type Item = Result<LogEvent, CorrelatorError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(event) => {
                    if !self.dedup.is_duplicate(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: &str, message: &str) -> LogEvent {
        LogEvent::new(ts, "loki", message).with_label("service", "frontend")
    }

    #[test]
    fn repeats_inside_window_are_duplicates() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5));
        assert!(!dedup.is_duplicate(&event("2022-01-01T00:00:00Z", "hello")));
        assert!(dedup.is_duplicate(&event("2022-01-01T00:00:02Z", "hello")));
        assert_eq!(dedup.duplicates(), 1);
    }

    #[test]
    fn repeats_outside_window_pass() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5));
        assert!(!dedup.is_duplicate(&event("2022-01-01T00:00:00Z", "hello")));
        assert!(!dedup.is_duplicate(&event("2022-01-01T00:00:10Z", "hello")));
        assert_eq!(dedup.duplicates(), 0);
    }

    #[test]
    fn different_content_is_not_a_duplicate() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5));
        assert!(!dedup.is_duplicate(&event("2022-01-01T00:00:00Z", "a")));
        assert!(!dedup.is_duplicate(&event("2022-01-01T00:00:00Z", "b")));
        let with_label = event("2022-01-01T00:00:00Z", "a").with_label("extra", "1");
        assert!(!dedup.is_duplicate(&with_label));
    }

    #[test]
    fn fingerprint_ignores_label_order() {
        let mut a = LogEvent::new("2022-01-01T00:00:00Z", "s", "m");
        a.labels.insert("x".to_string(), "1".to_string());
        a.labels.insert("y".to_string(), "2".to_string());
        let mut b = LogEvent::new("2022-01-01T00:00:05Z", "s", "m");
        b.labels.insert("y".to_string(), "2".to_string());
        b.labels.insert("x".to_string(), "1".to_string());
        assert_eq!(Deduplicator::fingerprint(&a), Deduplicator::fingerprint(&b));
    }

    #[test]
    fn old_entries_are_swept() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5));
        for i in 0..50 {
            dedup.is_duplicate(&event(
                &format!("2022-01-01T00:{:02}:00Z", i),
                &format!("m{}", i),
            ));
        }
        // only entries inside the trailing window survive
        assert!(dedup.tracked() <= 2);
    }

    #[test]
    fn stream_wrapper_drops_duplicates_only() {
        let events = vec![
            Ok(event("2022-01-01T00:00:00Z", "a")),
            Ok(event("2022-01-01T00:00:01Z", "a")),
            Ok(event("2022-01-01T00:00:02Z", "b")),
        ];
        let out: Vec<_> = Deduplicator::new(Duration::from_secs(5))
            .wrap(events.into_iter())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "a");
        assert_eq!(out[1].message, "b");
    }
}
