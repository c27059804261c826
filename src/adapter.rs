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

//! This module contains the DataSourceAdapter trait, the producer boundary
//! toward external log and metric sources.
//!
//! Real deployments plug in aggregator-specific adapters; this crate ships
//! an in-memory adapter and a JSON-file adapter, which are what the tests
//! and the CLI fixtures use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use correlator_common::{CorrelatorError, ErrorKind, LogEvent};

/// A lazy event sequence handed to the engine. Dropping it stops
/// production.
pub type EventStream = Box<dyn Iterator<Item = Result<LogEvent, CorrelatorError>> + Send>;

/// Options the engine passes when opening a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// How far back the stream should reach.
    pub time_range: Option<Duration>,
    /// Hard cap on produced events.
    pub limit: Option<usize>,
    /// Free-form pass-through the adapter may interpret.
    pub extra: HashMap<String, String>,
}

pub trait DataSourceAdapter: Send {
    /// Stable identifier; must match the source name used in queries.
    fn get_name(&self) -> &str;

    /// Opens a lazy sequence of events for the selector.
    fn create_stream(
        &mut self,
        selector: &str,
        options: &StreamOptions,
    ) -> Result<EventStream, CorrelatorError>;

    /// Pure check of the selector's own syntax.
    fn validate_query(&self, selector: &str) -> bool;

    /// Known stream names, for adapters that can enumerate them.
    fn get_available_streams(&self) -> Option<Vec<String>> {
        None
    }

    /// Idempotent teardown.
    fn destroy(&mut self) {}
}

lazy_static! {
    static ref SELECTOR_PAIR: Regex = Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*"([^"]*)""#).unwrap();
}

/// Label equalities out of a `{k="v", ...}` selector. Anything else in the
/// selector is ignored here; richer matching belongs to the real adapter.
pub fn selector_labels(selector: &str) -> Vec<(String, String)> {
    SELECTOR_PAIR
        .captures_iter(selector)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

fn selector_matches(selector: &str, event: &LogEvent) -> bool {
    selector_labels(selector)
        .iter()
        .all(|(name, value)| event.labels.get(name).map(String::as_str) == Some(value.as_str()))
}

fn well_formed_selector(selector: &str) -> bool {
    let mut depth = 0i32;
    let mut quotes = 0usize;
    for c in selector.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            '"' => quotes += 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0 && quotes % 2 == 0
}

/// In-memory producer over a fixed event list.
pub struct StaticAdapter {
    name: String,
    events: Vec<LogEvent>,
    destroyed: bool,
}

impl StaticAdapter {
    pub fn new(name: impl Into<String>, events: Vec<LogEvent>) -> Self {
        StaticAdapter {
            name: name.into(),
            events,
            destroyed: false,
        }
    }
}

impl DataSourceAdapter for StaticAdapter {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn create_stream(
        &mut self,
        selector: &str,
        options: &StreamOptions,
    ) -> Result<EventStream, CorrelatorError> {
        if self.destroyed {
            return Err(CorrelatorError::new(
                ErrorKind::Upstream,
                format!("adapter {} is destroyed", self.name),
            ));
        }
        let selector = selector.to_string();
        let limit = options.limit.unwrap_or(usize::max_value());
        let events: Vec<LogEvent> = self
            .events
            .iter()
            .filter(|e| selector_matches(&selector, e))
            .take(limit)
            .cloned()
            .collect();
        Ok(Box::new(events.into_iter().map(Ok)))
    }

    fn validate_query(&self, selector: &str) -> bool {
        well_formed_selector(selector)
    }

    fn get_available_streams(&self) -> Option<Vec<String>> {
        let mut names: Vec<String> = self
            .events
            .iter()
            .filter_map(|e| e.stream.clone())
            .collect();
        names.sort();
        names.dedup();
        Some(names)
    }

    fn destroy(&mut self) {
        self.destroyed = true;
        self.events.clear();
    }
}

/// Reads a JSON array of events from disk. The file is read lazily, when the
/// stream is first opened.
pub struct FileAdapter {
    name: String,
    path: PathBuf,
    destroyed: bool,
}

impl FileAdapter {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        FileAdapter {
            name: name.into(),
            path: path.into(),
            destroyed: false,
        }
    }
}

impl DataSourceAdapter for FileAdapter {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn create_stream(
        &mut self,
        selector: &str,
        options: &StreamOptions,
    ) -> Result<EventStream, CorrelatorError> {
        if self.destroyed {
            return Err(CorrelatorError::new(
                ErrorKind::Upstream,
                format!("adapter {} is destroyed", self.name),
            ));
        }
        let reader = std::fs::File::open(&self.path).map_err(|e| {
            CorrelatorError::new(
                ErrorKind::Upstream,
                format!("cannot open {:?}: {}", self.path, e),
            )
            .with_context("adapter", self.name.clone())
        })?;
        let raw: Vec<serde_json::Value> = serde_json::from_reader(reader).map_err(|e| {
            CorrelatorError::new(
                ErrorKind::Upstream,
                format!("cannot parse {:?}: {}", self.path, e),
            )
            .with_context("adapter", self.name.clone())
        })?;
        // adapters may hand over numbers or bools as label values
        let events = raw
            .iter()
            .map(LogEvent::from_json)
            .collect::<Result<Vec<LogEvent>, CorrelatorError>>()
            .map_err(|e| e.with_context("adapter", self.name.clone()))?;
        let selector = selector.to_string();
        let limit = options.limit.unwrap_or(usize::max_value());
        let filtered: Vec<LogEvent> = events
            .into_iter()
            .filter(|e| selector_matches(&selector, e))
            .take(limit)
            .collect();
        Ok(Box::new(filtered.into_iter().map(Ok)))
    }

    fn validate_query(&self, selector: &str) -> bool {
        well_formed_selector(selector)
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: &str, labels: &[(&str, &str)]) -> LogEvent {
        let mut e = LogEvent::new(ts, "static", "m");
        for (k, v) in labels {
            e.labels.insert(k.to_string(), v.to_string());
        }
        e
    }

    #[test]
    fn selector_labels_parse() {
        let labels = selector_labels(r#"{service="frontend", level="error"}"#);
        assert_eq!(
            labels,
            vec![
                ("service".to_string(), "frontend".to_string()),
                ("level".to_string(), "error".to_string())
            ]
        );
        assert!(selector_labels("*").is_empty());
    }

    #[test]
    fn static_adapter_filters_by_selector() {
        let mut adapter = StaticAdapter::new(
            "static",
            vec![
                event("2022-01-01T00:00:00Z", &[("service", "frontend")]),
                event("2022-01-01T00:00:01Z", &[("service", "backend")]),
            ],
        );
        let stream = adapter
            .create_stream(r#"{service="frontend"}"#, &StreamOptions::default())
            .unwrap();
        let events: Vec<_> = stream.map(|r| r.unwrap()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].labels["service"], "frontend");
    }

    #[test]
    fn empty_selector_passes_everything_and_limit_caps() {
        let mut adapter = StaticAdapter::new(
            "static",
            vec![
                event("2022-01-01T00:00:00Z", &[]),
                event("2022-01-01T00:00:01Z", &[]),
                event("2022-01-01T00:00:02Z", &[]),
            ],
        );
        let options = StreamOptions {
            limit: Some(2),
            ..StreamOptions::default()
        };
        let stream = adapter.create_stream("", &options).unwrap();
        assert_eq!(stream.count(), 2);
    }

    #[test]
    fn selector_validation() {
        let adapter = StaticAdapter::new("static", vec![]);
        assert!(adapter.validate_query(r#"{service="frontend"}"#));
        assert!(adapter.validate_query("*"));
        assert!(!adapter.validate_query(r#"{service="front"#));
        assert!(!adapter.validate_query("{{}"));
    }

    #[test]
    fn destroy_is_terminal_and_idempotent() {
        let mut adapter = StaticAdapter::new("static", vec![event("2022-01-01T00:00:00Z", &[])]);
        adapter.destroy();
        adapter.destroy();
        assert!(adapter
            .create_stream("", &StreamOptions::default())
            .is_err());
    }

    #[test]
    fn file_adapter_reads_json_events() {
        let dir = std::env::temp_dir();
        let path = dir.join("correlator_adapter_test_events.json");
        let events = vec![
            event("2022-01-01T00:00:00Z", &[("service", "frontend")]),
            event("2022-01-01T00:00:01Z", &[("service", "backend")]),
        ];
        std::fs::write(&path, serde_json::to_string(&events).unwrap()).unwrap();
        let mut adapter = FileAdapter::new("file", &path);
        let stream = adapter
            .create_stream("", &StreamOptions::default())
            .unwrap();
        assert_eq!(stream.count(), 2);
        let stream = adapter
            .create_stream(r#"{service="backend"}"#, &StreamOptions::default())
            .unwrap();
        assert_eq!(stream.count(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn file_adapter_reports_missing_file() {
        let mut adapter = FileAdapter::new("file", "/nonexistent/events.json");
        let err = match adapter.create_stream("", &StreamOptions::default()) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(err.context()["adapter"], "file");
    }
}
