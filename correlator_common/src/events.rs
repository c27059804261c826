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

//! The canonical event records exchanged between adapters and the engine.
//!

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::time::parse_timestamp;
use crate::CorrelatorError;
use crate::ErrorKind;

/// A single ingested record.
///
/// Adapters emit these as JSON; everything we get from a source needs to fit
/// this shape. `labels` and `join_keys` are never null, only possibly empty.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub join_keys: HashMap<String, String>,
}

impl LogEvent {
    pub fn new(
        timestamp: impl Into<String>,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LogEvent {
            timestamp: timestamp.into(),
            source: source.into(),
            stream: None,
            message: message.into(),
            labels: HashMap::new(),
            join_keys: HashMap::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_join_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.join_keys.insert(name.into(), value.into());
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Epoch milliseconds of `timestamp`. Events that fail here are skipped
    /// and counted by the joiner rather than tearing the stream down.
    pub fn timestamp_millis(&self) -> Result<i64, CorrelatorError> {
        parse_timestamp(&self.timestamp)
    }

    /// Checks the record invariants: a parseable timestamp and a defined
    /// source. Maps are guaranteed non-null by construction.
    pub fn validate(&self) -> Result<(), CorrelatorError> {
        if self.timestamp.is_empty() {
            return Err(CorrelatorError::new(
                ErrorKind::Upstream,
                "event has an empty timestamp",
            ));
        }
        self.timestamp_millis()?;
        Ok(())
    }

    /// Builds an event from loosely-typed adapter JSON, stringifying
    /// non-string label values on the way in. Timestamp problems are left
    /// for the consumer, which skips and counts bad records instead of
    /// failing the stream.
    pub fn from_json(value: &serde_json::Value) -> Result<LogEvent, CorrelatorError> {
        let object = value.as_object().ok_or_else(|| {
            CorrelatorError::new(ErrorKind::Upstream, "event is not a JSON object")
        })?;
        let text = |key: &str| {
            object
                .get(key)
                .map(stringify_label_value)
                .unwrap_or_default()
        };
        let mut event = LogEvent {
            timestamp: text("timestamp"),
            source: text("source"),
            stream: object
                .get("stream")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            message: text("message"),
            labels: HashMap::new(),
            join_keys: HashMap::new(),
        };
        if let Some(serde_json::Value::Object(labels)) = object.get("labels") {
            for (name, value) in labels {
                event.labels.insert(name.clone(), stringify_label_value(value));
            }
        }
        if let Some(serde_json::Value::Object(keys)) = object.get("joinKeys") {
            for (name, value) in keys {
                event
                    .join_keys
                    .insert(name.clone(), stringify_label_value(value));
            }
        }
        Ok(event)
    }

    /// Label lookup falling back to the pre-extracted join keys, which is the
    /// order every join-key extraction rule uses.
    pub fn label_or_join_key(&self, name: &str) -> Option<&str> {
        match self.labels.get(name) {
            Some(v) if !v.is_empty() => Some(v.as_str()),
            _ => match self.join_keys.get(name) {
                Some(v) if !v.is_empty() => Some(v.as_str()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{} {}] {}", self.timestamp, self.source, self.message)
    }
}

/// Adapters sometimes hand us numbers or bools where labels belong. They get
/// stringified here, before the event crosses into the engine.
pub fn stringify_label_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whether a correlation saw events from every declared stream.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Complete,
    Partial,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationMetadata {
    pub completeness: Completeness,
    pub matched_streams: Vec<String>,
    pub total_streams: usize,
}

/// One member of an emitted correlation, in the trimmed-down shape consumers
/// see.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedSubEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub source: String,
    pub timestamp: String,
    pub message: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl CorrelatedSubEvent {
    pub fn from_event(event: &LogEvent, alias: Option<&str>) -> Self {
        CorrelatedSubEvent {
            alias: alias.map(|a| a.to_string()),
            source: event.source.clone(),
            timestamp: event.timestamp.clone(),
            message: event.message.clone(),
            labels: event.labels.clone(),
        }
    }
}

/// An emitted correlation: all events that matched one join value inside one
/// window pass.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedEvent {
    pub correlation_id: u64,
    pub timestamp: String,
    pub time_window: TimeRange,
    pub join_key: String,
    pub join_value: String,
    pub events: Vec<CorrelatedSubEvent>,
    pub metadata: CorrelationMetadata,
}

impl CorrelatedEvent {
    /// Checks the emission invariants. Only used by tests and debug
    /// assertions; the joiner constructs correlations that hold these by
    /// construction.
    pub fn validate(&self) -> Result<(), CorrelatorError> {
        if self.events.is_empty() {
            return Err(CorrelatorError::new(
                ErrorKind::Upstream,
                "correlation with no events",
            ));
        }
        let mut last = i64::min_value();
        for e in &self.events {
            let t = parse_timestamp(&e.timestamp)?;
            if t < last {
                return Err(CorrelatorError::new(
                    ErrorKind::Upstream,
                    "correlation events out of timestamp order",
                ));
            }
            last = t;
            if !self.metadata.matched_streams.contains(&e.source) {
                return Err(CorrelatorError::new(
                    ErrorKind::Upstream,
                    format!("event source {} not in matched streams", e.source),
                ));
            }
        }
        let complete = self.metadata.matched_streams.len() == self.metadata.total_streams;
        let tagged = self.metadata.completeness == Completeness::Complete;
        if complete != tagged {
            return Err(CorrelatorError::new(
                ErrorKind::Upstream,
                "completeness does not match matched stream count",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_roundtrips_through_json() {
        let event = LogEvent::new("2022-01-01T00:00:00Z", "loki", "request started")
            .with_label("service", "frontend")
            .with_join_key("request_id", "r1");
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"joinKeys\""));
        let back: LogEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn missing_maps_deserialize_as_empty() {
        let event: LogEvent = serde_json::from_str(
            r#"{"timestamp": "2022-01-01T00:00:00Z", "source": "loki", "message": ""}"#,
        )
        .unwrap();
        assert!(event.labels.is_empty());
        assert!(event.join_keys.is_empty());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn empty_timestamp_fails_validation() {
        let event = LogEvent::new("", "loki", "m");
        assert!(event.validate().is_err());
    }

    #[test]
    fn label_lookup_prefers_labels_and_skips_empty() {
        let event = LogEvent::new("2022-01-01T00:00:00Z", "loki", "m")
            .with_label("request_id", "")
            .with_join_key("request_id", "r9");
        assert_eq!(event.label_or_join_key("request_id"), Some("r9"));
        assert_eq!(event.label_or_join_key("absent"), None);
    }

    #[test]
    fn from_json_stringifies_loose_labels() {
        let value = serde_json::json!({
            "timestamp": "2022-01-01T00:00:00Z",
            "source": "prometheus",
            "message": "scrape",
            "labels": {"code": 503, "up": false, "job": "api"},
            "joinKeys": {"request_id": 42}
        });
        let event = LogEvent::from_json(&value).unwrap();
        assert_eq!(event.labels["code"], "503");
        assert_eq!(event.labels["up"], "false");
        assert_eq!(event.labels["job"], "api");
        assert_eq!(event.join_keys["request_id"], "42");
        assert!(LogEvent::from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn non_string_values_stringify() {
        assert_eq!(stringify_label_value(&serde_json::json!(42)), "42");
        assert_eq!(stringify_label_value(&serde_json::json!(true)), "true");
        assert_eq!(stringify_label_value(&serde_json::json!("x")), "x");
        assert_eq!(stringify_label_value(&serde_json::Value::Null), "");
    }
}
