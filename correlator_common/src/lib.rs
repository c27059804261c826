#[macro_use]
extern crate lazy_static;

pub mod events;
pub mod metrics;
pub mod time;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

pub use crate::events::stringify_label_value;
pub use crate::events::Completeness;
pub use crate::events::CorrelatedEvent;
pub use crate::events::CorrelatedSubEvent;
pub use crate::events::CorrelationMetadata;
pub use crate::events::LogEvent;
pub use crate::events::TimeRange;

pub use crate::metrics::PerformanceSnapshot;

pub use crate::time::compare_timestamps;
pub use crate::time::format_timestamp;
pub use crate::time::parse_duration;
pub use crate::time::parse_timestamp;

/// What went wrong, coarsely. Matches the failure modes surfaced to users.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    QueryParse,
    AdapterExists,
    AdapterNotFound,
    AuthRequired,
    WindowFull,
    Upstream,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::QueryParse => "QUERY_PARSE_ERROR",
            ErrorKind::AdapterExists => "ADAPTER_EXISTS",
            ErrorKind::AdapterNotFound => "ADAPTER_NOT_FOUND",
            ErrorKind::AuthRequired => "AUTH_REQUIRED",
            ErrorKind::WindowFull => "WINDOW_FULL",
            ErrorKind::Upstream => "UPSTREAM_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Tagged error used across the engine. The context bag carries structured
/// details (offending token, available adapters, etc.) without forcing a
/// variant per call site.
#[derive(Debug, Clone)]
pub struct CorrelatorError {
    kind: ErrorKind,
    message: String,
    context: HashMap<String, String>,
}

impl CorrelatorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CorrelatorError {
            kind,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }
}

impl fmt::Display for CorrelatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.context.is_empty() {
            let mut keys: Vec<_> = self.context.keys().collect();
            keys.sort();
            write!(f, " (")?;
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, self.context[*k])?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl Error for CorrelatorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_kind_and_context() {
        let e = CorrelatorError::new(ErrorKind::AdapterNotFound, "no adapter named loki")
            .with_context("available", "graylog, prometheus");
        let text = format!("{}", e);
        assert!(text.starts_with("ADAPTER_NOT_FOUND: no adapter named loki"));
        assert!(text.contains("available=graylog, prometheus"));
    }
}
