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

//! The stream joiner.
//!
//! Consumes two lazy event sequences and emits one correlation per join key
//! once the key *closes*: either the event-time watermark ages it out while
//! the streams are still running, or the streams end. Closing is what makes
//! a key provably complete; emitting earlier would miss stragglers that
//! still belong to the window.
//!
//! All joiner state is event-time driven; wall clocks play no part, so the
//! same inputs always produce the same correlations.

pub mod multi;

use std::collections::VecDeque;
use std::iter::Fuse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crypto::digest::Digest;
use crypto::sha2::Sha256;
use indexmap::IndexMap;

use correlator_common::{
    format_timestamp, Completeness, CorrelatedEvent, CorrelatedSubEvent, CorrelationMetadata,
    CorrelatorError, LogEvent, TimeRange,
};

use crate::query::{
    FilterMatcher, Grouping, GroupingSide, JoinType, LabelMapping, ParsedQuery, PostFilter,
};
use crate::window::{Admission, TimeWindow, WindowConfig};

/// Synthetic key name reported when `ignoring` builds composite keys.
pub const COMPOSITE_KEY_NAME: &str = "composite";

/// How far (in event time) the watermark must advance between sweeps of
/// aged-out keys.
const SWEEP_INTERVAL_MS: i64 = 1_000;

/// How a join value is pulled out of an event. Priority order per the query
/// semantics: explicit label mappings, then composite `ignoring` keys, then
/// the declared key names.
#[derive(Debug, Clone)]
pub enum KeyRule {
    Mappings(Vec<LabelMapping>),
    Ignoring(Vec<String>),
    Keys(Vec<String>),
}

/// An extracted join value. `bucket` is the fixed-size bucketing key,
/// `value` the form shown on emitted correlations. They differ only for
/// composite keys, which can get arbitrarily long.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExtractedKey {
    pub bucket: String,
    pub value: String,
    pub name: String,
}

impl KeyRule {
    pub fn from_parts(
        mappings: &Option<Vec<LabelMapping>>,
        ignoring: &Option<Vec<String>>,
        keys: &[String],
    ) -> Self {
        if let Some(mappings) = mappings {
            if !mappings.is_empty() {
                return KeyRule::Mappings(mappings.clone());
            }
        }
        if let Some(ignoring) = ignoring {
            if !ignoring.is_empty() {
                return KeyRule::Ignoring(ignoring.clone());
            }
        }
        KeyRule::Keys(keys.to_vec())
    }

    /// Join value for one event; `None` means the event is un-joinable and
    /// gets skipped.
    pub fn extract(&self, event: &LogEvent) -> Option<ExtractedKey> {
        match self {
            KeyRule::Mappings(mappings) => {
                for mapping in mappings {
                    let value = event
                        .label_or_join_key(&mapping.left)
                        .or_else(|| event.label_or_join_key(&mapping.right));
                    if let Some(value) = value {
                        return Some(ExtractedKey {
                            bucket: value.to_string(),
                            value: value.to_string(),
                            name: mapping.left.clone(),
                        });
                    }
                }
                None
            }
            KeyRule::Ignoring(ignored) => {
                let mut pairs: Vec<(&str, &str)> = Vec::new();
                for (name, value) in event.labels.iter().chain(event.join_keys.iter()) {
                    if value.is_empty() || ignored.iter().any(|i| i == name) {
                        continue;
                    }
                    // join_keys shadow labels of the same name
                    match pairs.iter_mut().find(|(n, _)| *n == name.as_str()) {
                        Some(slot) => slot.1 = value,
                        None => pairs.push((name, value)),
                    }
                }
                if pairs.is_empty() {
                    return None;
                }
                pairs.sort();
                let value = pairs
                    .iter()
                    .map(|(n, v)| format!("{}:{}", n, v))
                    .collect::<Vec<_>>()
                    .join(",");
                Some(ExtractedKey {
                    bucket: hash_key(&value),
                    value,
                    name: COMPOSITE_KEY_NAME.to_string(),
                })
            }
            KeyRule::Keys(keys) => {
                for name in keys {
                    if let Some(value) = event.label_or_join_key(name) {
                        return Some(ExtractedKey {
                            bucket: value.to_string(),
                            value: value.to_string(),
                            name: name.clone(),
                        });
                    }
                }
                None
            }
        }
    }
}

/// Composite keys can run long; bucket on the digest, keep the string form
/// for display.
fn hash_key(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.input_str(value);
    hasher.result_str()
}

/// Per-stream identity inside a join. The adapter source name travels on
/// the events themselves; the alias is what the query called the stream.
#[derive(Debug, Clone, Default)]
pub struct StreamTag {
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JoinerOptions {
    pub join_type: JoinType,
    pub join_keys: Vec<String>,
    pub label_mappings: Option<Vec<LabelMapping>>,
    pub ignoring: Option<Vec<String>>,
    pub grouping: Option<Grouping>,
    pub filter: Option<Vec<FilterMatcher>>,
    /// `within(d)` in milliseconds.
    pub temporal_ms: Option<i64>,
    pub window: WindowConfig,
    pub left_tag: StreamTag,
    pub right_tag: StreamTag,
}

impl JoinerOptions {
    pub fn from_query(query: &ParsedQuery, window: WindowConfig) -> Self {
        JoinerOptions {
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
            left_tag: StreamTag {
                alias: query.left_stream.alias.clone(),
            },
            right_tag: StreamTag {
                alias: query.right_stream.alias.clone(),
            },
        }
    }
}

/// Counters a joiner keeps about one pass. Read through
/// [`StreamJoiner::stats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinerStats {
    pub events_processed: u64,
    pub events_skipped: u64,
    pub unjoinable_events: u64,
    pub window_rejections: u64,
    pub correlations_emitted: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Side {
    Left,
    Right,
}

/// Per-join-key bookkeeping across both windows.
struct KeyState {
    key_name: String,
    value: String,
    /// The key already produced its correlation(s) for this pass.
    emitted: bool,
}

impl KeyState {
    fn new(key: &ExtractedKey) -> Self {
        KeyState {
            key_name: key.name.clone(),
            value: key.value.clone(),
            emitted: false,
        }
    }
}

/// Monotonic correlation ids, shared across every joiner the engine runs.
pub type CorrelationIds = Arc<AtomicU64>;

pub struct StreamJoiner<L, R>
where
    L: Iterator<Item = Result<LogEvent, CorrelatorError>>,
    R: Iterator<Item = Result<LogEvent, CorrelatorError>>,
{
    options: JoinerOptions,
    key_rule: KeyRule,
    filter: Option<PostFilter>,
    left: Fuse<L>,
    right: Fuse<R>,
    left_window: TimeWindow,
    right_window: TimeWindow,
    states: IndexMap<String, KeyState>,
    pending: VecDeque<CorrelatedEvent>,
    ids: CorrelationIds,
    stats: JoinerStats,
    watermark: i64,
    last_sweep: Option<i64>,
    left_done: bool,
    right_done: bool,
    pull_left: bool,
    flushed: bool,
    failed: Option<CorrelatorError>,
    finished: bool,
}

impl<L, R> StreamJoiner<L, R>
where
    L: Iterator<Item = Result<LogEvent, CorrelatorError>>,
    R: Iterator<Item = Result<LogEvent, CorrelatorError>>,
{
    pub fn new(options: JoinerOptions, left: L, right: R) -> Self {
        Self::with_ids(options, left, right, Arc::new(AtomicU64::new(1)))
    }

    /// Joiner sharing the engine-wide correlation id counter.
    pub fn with_ids(options: JoinerOptions, left: L, right: R, ids: CorrelationIds) -> Self {
        let key_rule = KeyRule::from_parts(
            &options.label_mappings,
            &options.ignoring,
            &options.join_keys,
        );
        let filter = options
            .filter
            .as_ref()
            .map(|matchers| PostFilter::compile(matchers));
        let window_config = options.window;
        StreamJoiner {
            options,
            key_rule,
            filter,
            left: left.fuse(),
            right: right.fuse(),
            left_window: TimeWindow::new(window_config),
            right_window: TimeWindow::new(window_config),
            states: IndexMap::new(),
            pending: VecDeque::new(),
            ids,
            stats: JoinerStats::default(),
            watermark: i64::min_value(),
            last_sweep: None,
            left_done: false,
            right_done: false,
            pull_left: true,
            flushed: false,
            failed: None,
            finished: false,
        }
    }

    pub fn stats(&self) -> &JoinerStats {
        &self.stats
    }

    fn grouped_side(&self) -> Option<GroupingSide> {
        self.options.grouping.as_ref().map(|g| g.side)
    }

    /// Pulls one event, alternating sides while both are live.
    fn pull(&mut self) -> Option<(Side, Result<LogEvent, CorrelatorError>)> {
        for _ in 0..2 {
            let side = if self.pull_left { Side::Left } else { Side::Right };
            self.pull_left = !self.pull_left;
            let item = match side {
                Side::Left if !self.left_done => match self.left.next() {
                    Some(item) => Some(item),
                    None => {
                        self.left_done = true;
                        None
                    }
                },
                Side::Right if !self.right_done => match self.right.next() {
                    Some(item) => Some(item),
                    None => {
                        self.right_done = true;
                        None
                    }
                },
                _ => None,
            };
            if let Some(item) = item {
                return Some((side, item));
            }
        }
        None
    }

    fn process(&mut self, side: Side, event: LogEvent) {
        let timestamp = match event.timestamp_millis() {
            Ok(t) => t,
            Err(_) => {
                // Bad record, not a bad stream.
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
        let window = match side {
            Side::Left => &mut self.left_window,
            Side::Right => &mut self.right_window,
        };
        match window.insert(&key.bucket, event, timestamp) {
            Admission::Admitted => {
                self.states
                    .entry(key.bucket.clone())
                    .or_insert_with(|| KeyState::new(&key));
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

    /// Emits and drops keys the watermark has aged out. This is what makes
    /// results appear while the streams are still live instead of piling up
    /// until end-of-stream.
    fn sweep(&mut self) {
        let mut closed = self.left_window.expired_keys(self.watermark);
        for key in self.right_window.expired_keys(self.watermark) {
            if !closed.contains(&key) {
                closed.push(key);
            }
        }
        for bucket in closed {
            self.resolve(&bucket);
            self.left_window.remove(&bucket);
            self.right_window.remove(&bucket);
            self.states.shift_remove(&bucket);
        }
    }

    /// Both inputs exhausted: every remaining key closes at once, so their
    /// emissions are ordered by earliest event timestamp.
    fn flush(&mut self) {
        let buckets: Vec<String> = self.states.keys().cloned().collect();
        let before = self.pending.len();
        for bucket in buckets {
            self.resolve(&bucket);
        }
        let mut tail: Vec<CorrelatedEvent> = self.pending.drain(before..).collect();
        tail.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        self.pending.extend(tail);
        self.left_window.clear();
        self.right_window.clear();
        self.states.clear();
    }

    /// Endgame for one closed key: decide what, if anything, it emits.
    fn resolve(&mut self, bucket: &str) {
        match self.grouped_side() {
            Some(side) => self.resolve_grouped(bucket, side),
            None => self.resolve_plain(bucket),
        }
    }

    fn resolve_plain(&mut self, bucket: &str) {
        let emitted = match self.states.get(bucket) {
            Some(state) => state.emitted,
            None => return,
        };
        if emitted {
            return;
        }
        let left_present = self.left_window.contains_key(bucket);
        let right_present = self.right_window.contains_key(bucket);
        let members = match self.options.join_type {
            JoinType::And => {
                if !(left_present && right_present) {
                    return;
                }
                self.members_for(bucket, true, true)
            }
            JoinType::Or => {
                // left-outer: right-only keys expire silently
                if !left_present {
                    return;
                }
                self.members_for(bucket, true, true)
            }
            JoinType::Unless => {
                if !left_present || right_present {
                    return;
                }
                self.members_for(bucket, true, false)
            }
        };
        let members = self.apply_temporal(members);
        if members.is_empty() {
            return;
        }
        if let Some(correlation) = self.build(bucket, members) {
            self.push_emission(bucket, correlation);
        }
    }

    /// Closed key under a grouping modifier: the grouped side's multiplicity
    /// is preserved, one correlation per grouped event.
    fn resolve_grouped(&mut self, bucket: &str, grouped: GroupingSide) {
        let emitted = match self.states.get(bucket) {
            Some(state) => state.emitted,
            None => return,
        };
        if emitted {
            return;
        }
        let left_present = self.left_window.contains_key(bucket);
        let right_present = self.right_window.contains_key(bucket);
        match self.options.join_type {
            JoinType::And if !(left_present && right_present) => return,
            JoinType::Or if !left_present => return,
            JoinType::Unless if !left_present || right_present => return,
            _ => {}
        }
        let grouped_window = match grouped {
            GroupingSide::Left => &self.left_window,
            GroupingSide::Right => &self.right_window,
        };
        let count = grouped_window.peek(bucket).map_or(0, |b| b.len());
        if count == 0 {
            // nothing to fan out (or/unless with an empty grouped side);
            // the key still owes its left-anchored emission
            self.resolve_plain(bucket);
            return;
        }
        let require_partner = self.options.join_type == JoinType::And;
        let mut any = false;
        for index in 0..count {
            if let Some(correlation) = self.build_grouped(bucket, grouped, index, require_partner) {
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

    /// One correlation for the grouped-side event at `index` plus every
    /// other-side event for the key inside the temporal bound. Listed
    /// grouping labels are carried onto the other side's copies.
    fn build_grouped(
        &mut self,
        bucket: &str,
        grouped: GroupingSide,
        index: usize,
        require_partner: bool,
    ) -> Option<CorrelatedEvent> {
        let (grouped_window, other_window, grouped_side, other_side) = match grouped {
            GroupingSide::Left => (
                &self.left_window,
                &self.right_window,
                Side::Left,
                Side::Right,
            ),
            GroupingSide::Right => (
                &self.right_window,
                &self.left_window,
                Side::Right,
                Side::Left,
            ),
        };
        let grouped_event = grouped_window.peek(bucket)?.get(index)?.clone();
        let anchor = grouped_event.timestamp_millis().ok()?;
        let carried: Vec<(String, String)> = self
            .options
            .grouping
            .as_ref()
            .map(|g| {
                g.labels
                    .iter()
                    .filter_map(|name| {
                        grouped_event
                            .labels
                            .get(name)
                            .map(|v| (name.clone(), v.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut members = vec![(grouped_side, grouped_event)];
        for event in other_window.peek(bucket).unwrap_or(&[]) {
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
            members.push((other_side, event));
        }
        if require_partner && members.len() == 1 {
            // no partner inside the temporal bound
            return None;
        }
        self.build(bucket, members)
    }

    /// Collects buffered events for a key from the requested sides.
    fn members_for(
        &self,
        bucket: &str,
        include_left: bool,
        include_right: bool,
    ) -> Vec<(Side, LogEvent)> {
        let mut members = Vec::new();
        if include_left {
            for event in self.left_window.peek(bucket).unwrap_or(&[]) {
                members.push((Side::Left, event.clone()));
            }
        }
        if include_right {
            for event in self.right_window.peek(bucket).unwrap_or(&[]) {
                members.push((Side::Right, event.clone()));
            }
        }
        members
    }

    /// `within(d)`: keep events that belong to at least one cross-stream
    /// pair inside the bound; an empty survivor set suppresses the key.
    /// Single-sided member sets pass through untouched.
    fn apply_temporal(&self, members: Vec<(Side, LogEvent)>) -> Vec<(Side, LogEvent)> {
        let limit = match self.options.temporal_ms {
            Some(limit) => limit,
            None => return members,
        };
        let sides: Vec<Side> = members.iter().map(|(s, _)| *s).collect();
        if !sides.contains(&Side::Left) || !sides.contains(&Side::Right) {
            return members;
        }
        let times: Vec<Option<i64>> = members
            .iter()
            .map(|(_, e)| e.timestamp_millis().ok())
            .collect();
        members
            .iter()
            .enumerate()
            .filter(|(i, (side, _))| {
                let t = match times[*i] {
                    Some(t) => t,
                    None => return false,
                };
                members.iter().enumerate().any(|(j, (other_side, _))| {
                    if side == other_side {
                        return false;
                    }
                    match times[j] {
                        Some(u) => (t - u).abs() <= limit,
                        None => false,
                    }
                })
            })
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Assembles and post-filters a correlation. `None` means suppressed.
    fn build(&mut self, bucket: &str, members: Vec<(Side, LogEvent)>) -> Option<CorrelatedEvent> {
        let state = self.states.get(bucket)?;
        let key_name = state.key_name.clone();
        let value = state.value.clone();

        let mut survivors: Vec<(Side, LogEvent, i64)> = Vec::new();
        for (side, event) in members {
            if let Some(filter) = &self.filter {
                if !filter.matches(&event.labels) {
                    continue;
                }
            }
            let t = match event.timestamp_millis() {
                Ok(t) => t,
                Err(_) => continue,
            };
            survivors.push((side, event, t));
        }
        if survivors.is_empty() {
            return None;
        }
        survivors.sort_by_key(|(_, _, t)| *t);

        let earliest = survivors[0].2;
        let latest = survivors[survivors.len() - 1].2;
        let mut matched_streams = Vec::new();
        let mut seen_sides = Vec::new();
        for (side, event, _) in &survivors {
            if !seen_sides.contains(side) {
                seen_sides.push(*side);
                matched_streams.push(event.source.clone());
            }
        }
        let completeness = if seen_sides.len() == 2 {
            Completeness::Complete
        } else {
            Completeness::Partial
        };
        let events = survivors
            .iter()
            .map(|(side, event, _)| {
                let alias = match side {
                    Side::Left => self.options.left_tag.alias.as_deref(),
                    Side::Right => self.options.right_tag.alias.as_deref(),
                };
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
                total_streams: 2,
            },
        })
    }

    fn push_emission(&mut self, bucket: &str, correlation: CorrelatedEvent) {
        if let Some(state) = self.states.get_mut(bucket) {
            state.emitted = true;
        }
        self.stats.correlations_emitted += 1;
        self.pending.push_back(correlation);
    }

    /// Upstream produced an error: tear down all in-flight state and surface
    /// it once.
    fn fail(&mut self, error: CorrelatorError) {
        self.left_window.clear();
        self.right_window.clear();
        self.states.clear();
        self.pending.clear();
        self.failed = Some(error);
    }
}

impl<L, R> Iterator for StreamJoiner<L, R>
where
    L: Iterator<Item = Result<LogEvent, CorrelatorError>>,
    R: Iterator<Item = Result<LogEvent, CorrelatorError>>,
{
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
                Some((side, Ok(event))) => {
                    self.process(side, event);
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
