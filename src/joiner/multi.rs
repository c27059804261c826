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

//! N-way generalization of the stream joiner.
//!
//! Each stream gets its own keyed window; the same key-extraction rule
//! applies to all of them. Emission happens at key closure, like the
//! two-stream joiner:
//!
//! - `and`: keys present in every buffer,
//! - `or`: keys present in at least one buffer,
//! - `unless`: keys present in exactly one buffer, whichever that is.
//!
//! The temporal bound is first-event anchored here: the assembled set is
//! trimmed to events within `d` of its earliest member.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use correlator_common::{
    format_timestamp, Completeness, CorrelatedEvent, CorrelatedSubEvent, CorrelationMetadata,
    CorrelatorError, LogEvent, TimeRange,
};

use super::{CorrelationIds, JoinerStats, KeyRule, StreamTag};
use crate::query::{GroupingSide, JoinType, ParsedQuery, PostFilter};
use crate::window::{Admission, TimeWindow, WindowConfig};

const SWEEP_INTERVAL_MS: i64 = 1_000;

/// Events the engine feeds a multi-way join, one boxed sequence per stream.
pub type EventStream = Box<dyn Iterator<Item = Result<LogEvent, CorrelatorError>> + Send>;

#[derive(Debug, Clone)]
pub struct MultiJoinerOptions {
    pub join_type: JoinType,
    pub join_keys: Vec<String>,
    pub label_mappings: Option<Vec<crate::query::LabelMapping>>,
    pub ignoring: Option<Vec<String>>,
    pub grouping: Option<crate::query::Grouping>,
    pub filter: Option<Vec<crate::query::FilterMatcher>>,
    pub temporal_ms: Option<i64>,
    pub window: WindowConfig,
    pub tags: Vec<StreamTag>,
}

impl MultiJoinerOptions {
    pub fn from_query(query: &ParsedQuery, window: WindowConfig) -> Self {
        MultiJoinerOptions {
            join_type: query.join_type,
            join_keys: query.join_keys.clone(),
            label_mappings: query.label_mappings.clone(),
            ignoring: query.ignoring.clone(),
            grouping: query.grouping.clone(),
            filter: query.filter.clone(),
            temporal_ms: query
                .temporal
                .map(correlator_common::time::duration_millis),
            window,
            tags: query
                .streams()
                .iter()
                .map(|s| StreamTag {
                    alias: s.alias.clone(),
                })
                .collect(),
        }
    }
}

struct KeyState {
    key_name: String,
    value: String,
    emitted: bool,
}

pub struct MultiStreamJoiner {
    options: MultiJoinerOptions,
    key_rule: KeyRule,
    filter: Option<PostFilter>,
    inputs: Vec<EventStream>,
    exhausted: Vec<bool>,
    windows: Vec<TimeWindow>,
    states: IndexMap<String, KeyState>,
    pending: VecDeque<CorrelatedEvent>,
    ids: CorrelationIds,
    stats: JoinerStats,
    watermark: i64,
    last_sweep: Option<i64>,
    cursor: usize,
    flushed: bool,
    failed: Option<CorrelatorError>,
    finished: bool,
}

impl MultiStreamJoiner {
    pub fn new(options: MultiJoinerOptions, inputs: Vec<EventStream>) -> Self {
        Self::with_ids(options, inputs, Arc::new(AtomicU64::new(1)))
    }

    pub fn with_ids(
        mut options: MultiJoinerOptions,
        inputs: Vec<EventStream>,
        ids: CorrelationIds,
    ) -> Self {
        let key_rule = KeyRule::from_parts(
            &options.label_mappings,
            &options.ignoring,
            &options.join_keys,
        );
        let filter = options
            .filter
            .as_ref()
            .map(|matchers| PostFilter::compile(matchers));
        options.tags.resize(inputs.len(), StreamTag::default());
        let windows = (0..inputs.len())
            .map(|_| TimeWindow::new(options.window))
            .collect();
        let exhausted = vec![false; inputs.len()];
        MultiStreamJoiner {
            options,
            key_rule,
            filter,
            inputs,
            exhausted,
            windows,
            states: IndexMap::new(),
            pending: VecDeque::new(),
            ids,
            stats: JoinerStats::default(),
            watermark: i64::min_value(),
            last_sweep: None,
            cursor: 0,
            flushed: false,
            failed: None,
            finished: false,
        }
    }

    pub fn stats(&self) -> &JoinerStats {
        &self.stats
    }

    pub fn stream_count(&self) -> usize {
        self.inputs.len()
    }

    /// Round-robin pull across live inputs.
    fn pull(&mut self) -> Option<(usize, Result<LogEvent, CorrelatorError>)> {
        let n = self.inputs.len();
        for _ in 0..n {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % n;
            if self.exhausted[index] {
                continue;
            }
            match self.inputs[index].next() {
                Some(item) => return Some((index, item)),
                None => self.exhausted[index] = true,
            }
        }
        None
    }

    fn process(&mut self, index: usize, event: LogEvent) {
        let timestamp = match event.timestamp_millis() {
            Ok(t) => t,
            Err(_) => {
                self.stats.events_skipped += 1;
                return;
            }
        };
        self.stats.events_processed += 1;
        if timestamp > self.watermark {
            self.watermark = timestamp;
        }
        let key = match self.key_rule.extract(&event) {
            Some(key) => key,
            None => {
                self.stats.unjoinable_events += 1;
                return;
            }
        };
        match self.windows[index].insert(&key.bucket, event, timestamp) {
            Admission::Admitted => {
                self.states.entry(key.bucket.clone()).or_insert(KeyState {
                    key_name: key.name,
                    value: key.value,
                    emitted: false,
                });
            }
            _ => {
                self.stats.window_rejections += 1;
            }
        }
        match self.last_sweep {
            None => self.last_sweep = Some(self.watermark),
            Some(last) if self.watermark - last >= SWEEP_INTERVAL_MS => {
                self.sweep();
                self.last_sweep = Some(self.watermark);
            }
            Some(_) => {}
        }
    }

    fn sweep(&mut self) {
        let mut closed: Vec<String> = Vec::new();
        for window in &self.windows {
            for key in window.expired_keys(self.watermark) {
                if !closed.contains(&key) {
                    closed.push(key);
                }
            }
        }
        for bucket in closed {
            self.resolve(&bucket);
            for window in &mut self.windows {
                window.remove(&bucket);
            }
            self.states.shift_remove(&bucket);
        }
    }

    fn flush(&mut self) {
        let buckets: Vec<String> = self.states.keys().cloned().collect();
        let before = self.pending.len();
        for bucket in buckets {
            self.resolve(&bucket);
        }
        let mut tail: Vec<CorrelatedEvent> = self.pending.drain(before..).collect();
        tail.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        self.pending.extend(tail);
        for window in &mut self.windows {
            window.clear();
        }
        self.states.clear();
    }

    fn resolve(&mut self, bucket: &str) {
        let emitted = match self.states.get(bucket) {
            Some(state) => state.emitted,
            None => return,
        };
        if emitted {
            return;
        }
        let present: Vec<usize> = (0..self.windows.len())
            .filter(|&i| self.windows[i].contains_key(bucket))
            .collect();
        let ready = match self.options.join_type {
            JoinType::And => present.len() == self.windows.len(),
            JoinType::Or => !present.is_empty(),
            // exactly-one rule; see DESIGN.md on the open question
            JoinType::Unless => present.len() == 1,
        };
        if !ready {
            return;
        }
        match self.options.grouping.as_ref().map(|g| g.side) {
            Some(side) => self.resolve_grouped(bucket, side),
            None => {
                let members = self.members_for(bucket, None);
                let members = self.apply_temporal_span(members);
                if members.is_empty() {
                    return;
                }
                if let Some(correlation) = self.build(bucket, members) {
                    if let Some(state) = self.states.get_mut(bucket) {
                        state.emitted = true;
                    }
                    self.stats.correlations_emitted += 1;
                    self.pending.push_back(correlation);
                }
            }
        }
    }

    /// Grouped fan-out: the grouped stream's multiplicity is preserved, every
    /// other stream's events ride along on each correlation.
    fn resolve_grouped(&mut self, bucket: &str, side: GroupingSide) {
        let grouped_index = match side {
            GroupingSide::Left => 0,
            GroupingSide::Right => 1,
        };
        if grouped_index >= self.windows.len() {
            return;
        }
        let count = self.windows[grouped_index]
            .peek(bucket)
            .map_or(0, |b| b.len());
        if count == 0 {
            return;
        }
        let carried_names: Vec<String> = self
            .options
            .grouping
            .as_ref()
            .map(|g| g.labels.clone())
            .unwrap_or_default();
        let mut any = false;
        for index in 0..count {
            let grouped_event = match self.windows[grouped_index]
                .peek(bucket)
                .and_then(|b| b.get(index))
            {
                Some(event) => event.clone(),
                None => continue,
            };
            let anchor = match grouped_event.timestamp_millis() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let carried: Vec<(String, String)> = carried_names
                .iter()
                .filter_map(|name| {
                    grouped_event
                        .labels
                        .get(name)
                        .map(|v| (name.clone(), v.clone()))
                })
                .collect();
            let mut members = vec![(grouped_index, grouped_event)];
            for (stream, window) in self.windows.iter().enumerate() {
                if stream == grouped_index {
                    continue;
                }
                for event in window.peek(bucket).unwrap_or(&[]) {
                    if let Some(limit) = self.options.temporal_ms {
                        match event.timestamp_millis() {
                            Ok(t) if (t - anchor).abs() <= limit => {}
                            _ => continue,
                        }
                    }
                    let mut event = event.clone();
                    for (name, value) in &carried {
                        event.labels.insert(name.clone(), value.clone());
                    }
                    members.push((stream, event));
                }
            }
            if self.options.join_type == JoinType::And && members.len() == 1 {
                continue;
            }
            if let Some(correlation) = self.build(bucket, members) {
                self.stats.correlations_emitted += 1;
                self.pending.push_back(correlation);
                any = true;
            }
        }
        if any {
            if let Some(state) = self.states.get_mut(bucket) {
                state.emitted = true;
            }
        }
    }

    fn members_for(&self, bucket: &str, only: Option<usize>) -> Vec<(usize, LogEvent)> {
        let mut members = Vec::new();
        for (stream, window) in self.windows.iter().enumerate() {
            if let Some(only) = only {
                if stream != only {
                    continue;
                }
            }
            for event in window.peek(bucket).unwrap_or(&[]) {
                members.push((stream, event.clone()));
            }
        }
        members
    }

    /// First-event anchored span bound: drop events further than `d` from the
    /// earliest member.
    fn apply_temporal_span(&self, members: Vec<(usize, LogEvent)>) -> Vec<(usize, LogEvent)> {
        let limit = match self.options.temporal_ms {
            Some(limit) => limit,
            None => return members,
        };
        let anchor = members
            .iter()
            .filter_map(|(_, e)| e.timestamp_millis().ok())
            .min();
        let anchor = match anchor {
            Some(anchor) => anchor,
            None => return Vec::new(),
        };
        members
            .into_iter()
            .filter(|(_, e)| match e.timestamp_millis() {
                Ok(t) => t - anchor <= limit,
                Err(_) => false,
            })
            .collect()
    }

    fn build(&mut self, bucket: &str, members: Vec<(usize, LogEvent)>) -> Option<CorrelatedEvent> {
        let state = self.states.get(bucket)?;
        let key_name = state.key_name.clone();
        let value = state.value.clone();

        let mut survivors: Vec<(usize, LogEvent, i64)> = Vec::new();
        for (stream, event) in members {
            if let Some(filter) = &self.filter {
                if !filter.matches(&event.labels) {
                    continue;
                }
            }
            let t = match event.timestamp_millis() {
                Ok(t) => t,
                Err(_) => continue,
            };
            survivors.push((stream, event, t));
        }
        if survivors.is_empty() {
            return None;
        }
        survivors.sort_by_key(|(_, _, t)| *t);

        let earliest = survivors[0].2;
        let latest = survivors[survivors.len() - 1].2;
        let mut matched_streams = Vec::new();
        let mut seen = Vec::new();
        for (stream, event, _) in &survivors {
            if !seen.contains(stream) {
                seen.push(*stream);
                matched_streams.push(event.source.clone());
            }
        }
        let completeness = if seen.len() == self.windows.len() {
            Completeness::Complete
        } else {
            Completeness::Partial
        };
        let events = survivors
            .iter()
            .map(|(stream, event, _)| {
                let alias = self
                    .options
                    .tags
                    .get(*stream)
                    .and_then(|t| t.alias.as_deref());
                CorrelatedSubEvent::from_event(event, alias)
            })
            .collect();
        Some(CorrelatedEvent {
            correlation_id: self.ids.fetch_add(1, Ordering::Relaxed),
            timestamp: format_timestamp(earliest),
            time_window: TimeRange {
                start: format_timestamp(earliest),
                end: format_timestamp(latest),
            },
            join_key: key_name,
            join_value: value,
            events,
            metadata: CorrelationMetadata {
                completeness,
                matched_streams,
                total_streams: self.windows.len(),
            },
        })
    }

    fn fail(&mut self, error: CorrelatorError) {
        for window in &mut self.windows {
            window.clear();
        }
        self.states.clear();
        self.pending.clear();
        self.failed = Some(error);
    }
}

impl Iterator for MultiStreamJoiner {
    type Item = Result<CorrelatedEvent, CorrelatorError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(correlation) = self.pending.pop_front() {
                return Some(Ok(correlation));
            }
            if let Some(error) = self.failed.take() {
                self.finished = true;
                return Some(Err(error));
            }
            if self.finished {
                return None;
            }
            match self.pull() {
                Some((_, Err(error))) => {
                    self.fail(error);
                }
                Some((index, Ok(event))) => {
                    self.process(index, event);
                }
                None => {
                    if !self.flushed {
                        self.flushed = true;
                        self.flush();
                    }
                    if self.pending.is_empty() {
                        self.finished = true;
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Grouping;

    fn event(ts: &str, source: &str, labels: &[(&str, &str)]) -> LogEvent {
        let mut e = LogEvent::new(ts, source, format!("{} event", source));
        for (k, v) in labels {
            e.labels.insert(k.to_string(), v.to_string());
        }
        e
    }

    fn boxed(events: Vec<LogEvent>) -> EventStream {
        Box::new(events.into_iter().map(Ok))
    }

    fn options(join_type: JoinType, keys: &[&str], n: usize) -> MultiJoinerOptions {
        MultiJoinerOptions {
            join_type,
            join_keys: keys.iter().map(|k| k.to_string()).collect(),
            label_mappings: None,
            ignoring: None,
            grouping: None,
            filter: None,
            temporal_ms: None,
            window: WindowConfig::default(),
            tags: vec![StreamTag::default(); n],
        }
    }

    fn run(options: MultiJoinerOptions, streams: Vec<Vec<LogEvent>>) -> Vec<CorrelatedEvent> {
        MultiStreamJoiner::new(options, streams.into_iter().map(boxed).collect())
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn and_needs_all_streams() {
        let streams = vec![
            vec![
                event("2022-01-01T00:00:00Z", "a", &[("id", "1")]),
                event("2022-01-01T00:00:00.100Z", "a", &[("id", "2")]),
            ],
            vec![
                event("2022-01-01T00:00:01Z", "b", &[("id", "1")]),
                event("2022-01-01T00:00:01.100Z", "b", &[("id", "2")]),
            ],
            vec![event("2022-01-01T00:00:02Z", "c", &[("id", "1")])],
        ];
        let out = run(options(JoinType::And, &["id"], 3), streams);
        assert_eq!(out.len(), 1);
        let c = &out[0];
        assert_eq!(c.join_value, "1");
        assert_eq!(c.events.len(), 3);
        assert_eq!(c.metadata.total_streams, 3);
        assert_eq!(c.metadata.matched_streams, vec!["a", "b", "c"]);
        assert_eq!(c.metadata.completeness, Completeness::Complete);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn or_emits_for_any_presence() {
        let streams = vec![
            vec![event("2022-01-01T00:00:00Z", "a", &[("id", "1")])],
            vec![event("2022-01-01T00:00:01Z", "b", &[("id", "2")])],
            vec![],
        ];
        let out = run(options(JoinType::Or, &["id"], 3), streams);
        assert_eq!(out.len(), 2);
        for c in &out {
            assert_eq!(c.metadata.completeness, Completeness::Partial);
            assert_eq!(c.metadata.total_streams, 3);
            assert_eq!(c.events.len(), 1);
        }
    }

    #[test]
    fn unless_means_exactly_one_stream() {
        let streams = vec![
            vec![
                event("2022-01-01T00:00:00Z", "a", &[("id", "only_a")]),
                event("2022-01-01T00:00:01Z", "a", &[("id", "shared")]),
            ],
            vec![
                event("2022-01-01T00:00:02Z", "b", &[("id", "shared")]),
                event("2022-01-01T00:00:03Z", "b", &[("id", "only_b")]),
            ],
            vec![],
        ];
        let out = run(options(JoinType::Unless, &["id"], 3), streams);
        // exactly-one rule: only_a and only_b qualify regardless of stream
        assert_eq!(out.len(), 2);
        let values: Vec<&str> = out.iter().map(|c| c.join_value.as_str()).collect();
        assert_eq!(values, vec!["only_a", "only_b"]);
    }

    #[test]
    fn temporal_span_is_first_event_anchored() {
        let streams = vec![
            vec![event("2022-01-01T00:00:00Z", "a", &[("id", "1")])],
            vec![event("2022-01-01T00:00:08Z", "b", &[("id", "1")])],
            vec![event("2022-01-01T00:00:30Z", "c", &[("id", "1")])],
        ];
        let mut opts = options(JoinType::And, &["id"], 3);
        opts.temporal_ms = Some(10_000);
        let out = run(opts, streams);
        assert_eq!(out.len(), 1);
        // the straggler from c is outside the span and drops out
        assert_eq!(out[0].events.len(), 2);
        assert_eq!(out[0].metadata.completeness, Completeness::Partial);
        assert_eq!(out[0].metadata.matched_streams, vec!["a", "b"]);
    }

    #[test]
    fn grouped_fan_out_across_three_streams() {
        let streams = vec![
            vec![
                event("2022-01-01T00:00:00Z", "a", &[("id", "1"), ("u", "u1")]),
                event("2022-01-01T00:00:01Z", "a", &[("id", "1"), ("u", "u2")]),
            ],
            vec![event("2022-01-01T00:00:02Z", "b", &[("id", "1")])],
            vec![event("2022-01-01T00:00:03Z", "c", &[("id", "1")])],
        ];
        let mut opts = options(JoinType::And, &["id"], 3);
        opts.grouping = Some(Grouping {
            side: GroupingSide::Left,
            labels: vec!["u".to_string()],
        });
        let out = run(opts, streams);
        assert_eq!(out.len(), 2);
        for c in &out {
            // one grouped event plus one from each other stream
            assert_eq!(c.events.len(), 3);
            assert_eq!(c.events.iter().filter(|e| e.source == "a").count(), 1);
        }
    }

    #[test]
    fn empty_inputs_produce_nothing() {
        let out = run(options(JoinType::Or, &["id"], 3), vec![vec![], vec![], vec![]]);
        assert!(out.is_empty());
    }

    #[test]
    fn upstream_error_propagates() {
        let bad: EventStream = Box::new(
            vec![Err(CorrelatorError::new(
                correlator_common::ErrorKind::Upstream,
                "adapter died",
            ))]
            .into_iter(),
        );
        let streams = vec![
            boxed(vec![event("2022-01-01T00:00:00Z", "a", &[("id", "1")])]),
            bad,
            boxed(vec![]),
        ];
        let mut joiner = MultiStreamJoiner::new(options(JoinType::And, &["id"], 3), streams);
        let results: Vec<_> = joiner.by_ref().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn aliases_attach_per_stream() {
        let mut opts = options(JoinType::And, &["id"], 2);
        opts.tags = vec![
            StreamTag {
                alias: Some("web".to_string()),
            },
            StreamTag { alias: None },
        ];
        let streams = vec![
            vec![event("2022-01-01T00:00:00Z", "a", &[("id", "1")])],
            vec![event("2022-01-01T00:00:01Z", "b", &[("id", "1")])],
        ];
        let out = run(opts, streams);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].events[0].alias.as_deref(), Some("web"));
        assert_eq!(out[0].events[1].alias, None);
    }
}
