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

//! The correlation query language.
//!
//! A query names two or more streams and how to join them:
//!
//! ```text
//! loki({service="frontend"})[5m] and on(request_id) graylog({service="backend"})[5m]
//!     within(30s) group_left(session_id) {status="error"}
//! ```
//!
//! `parser` turns the text into a [`ParsedQuery`]; `filter` evaluates the
//! trailing matcher list against emitted correlations.

mod filter;
mod parser;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use correlator_common::CorrelatorError;

pub use self::filter::PostFilter;
pub use self::parser::parse_query;

/// How matched keys combine events across streams.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    /// Inner join: a key must appear on every side.
    And,
    /// Left-outer join: every left key emits, matched or not.
    Or,
    /// Anti-join: left keys with no match on the other side.
    Unless,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JoinType::And => write!(f, "and"),
            JoinType::Or => write!(f, "or"),
            JoinType::Unless => write!(f, "unless"),
        }
    }
}

/// One stream reference: `source({selector})[5m] as alias`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamQuery {
    pub source: String,
    /// Raw selector text, passed through to the adapter untouched.
    pub selector: String,
    /// `[d]` suffix; the engine substitutes its default when absent.
    pub time_range: Option<Duration>,
    pub alias: Option<String>,
}

impl StreamQuery {
    /// Alias if given, source name otherwise. This is the name events are
    /// attributed to in emitted correlations.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.source)
    }
}

/// `on(session_id=trace_id)`: the left stream's label must equal the right
/// stream's label.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LabelMapping {
    pub left: String,
    pub right: String,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GroupingSide {
    Left,
    Right,
}

/// `group_left(labels)` / `group_right(labels)` cardinality modifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Grouping {
    pub side: GroupingSide,
    /// Labels carried over from the grouped side.
    pub labels: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MatchOp {
    Eq,
    Ne,
    Re,
    Nre,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MatchOp::Eq => write!(f, "="),
            MatchOp::Ne => write!(f, "!="),
            MatchOp::Re => write!(f, "=~"),
            MatchOp::Nre => write!(f, "!~"),
        }
    }
}

/// One matcher of the trailing post-filter, e.g. `status=~"5.."`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilterMatcher {
    pub label: String,
    pub op: MatchOp,
    pub value: String,
}

/// The parse-tree root the engine executes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub left_stream: StreamQuery,
    pub right_stream: StreamQuery,
    pub additional_streams: Vec<StreamQuery>,
    pub join_type: JoinType,
    /// Plain join key names, in declaration order. For `on(a=b)` entries the
    /// left name is recorded here and the pair goes to `label_mappings`.
    pub join_keys: Vec<String>,
    /// Join window: the widest declared stream range, if any was declared.
    pub time_window: Option<Duration>,
    /// `within(d)` bound on pairwise timestamp distance.
    pub temporal: Option<Duration>,
    pub grouping: Option<Grouping>,
    pub ignoring: Option<Vec<String>>,
    pub label_mappings: Option<Vec<LabelMapping>>,
    pub filter: Option<Vec<FilterMatcher>>,
}

impl ParsedQuery {
    pub fn stream_count(&self) -> usize {
        2 + self.additional_streams.len()
    }

    /// All stream references, left to right.
    pub fn streams(&self) -> Vec<&StreamQuery> {
        let mut all = Vec::with_capacity(self.stream_count());
        all.push(&self.left_stream);
        all.push(&self.right_stream);
        all.extend(self.additional_streams.iter());
        all
    }

    /// Structural checks the grammar alone cannot express.
    pub fn validate(&self) -> Result<(), CorrelatorError> {
        parser::validate_parsed(self)
    }
}

/// Trims and collapses internal whitespace. Idempotent.
pub fn normalize(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut in_string = false;
    let mut pending_space = false;
    for c in query.trim().chars() {
        if in_string {
            out.push(c);
            if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

/// Parse-only check; true iff `parse_query` would succeed.
pub fn validate_query(query: &str) -> bool {
    parse_query(query).is_ok()
}
