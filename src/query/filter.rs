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

//! Evaluation of the trailing `{...}` matcher list.
//!
//! Matchers apply to the events inside an assembled correlation, not to the
//! correlation itself. A matcher list is conjunctive; an absent label reads
//! as the empty string. A matcher whose regex fails to compile matches
//! nothing, so one bad pattern quietly filters instead of killing a
//! long-running stream.

use std::collections::HashMap;

use regex::Regex;

use super::{FilterMatcher, MatchOp};

enum Compiled {
    Eq { label: String, value: String },
    Ne { label: String, value: String },
    Re { label: String, regex: Option<Regex> },
    Nre { label: String, regex: Option<Regex> },
}

/// Compiled form of the filter, built once per correlation pass.
pub struct PostFilter {
    matchers: Vec<Compiled>,
}

impl PostFilter {
    pub fn compile(matchers: &[FilterMatcher]) -> Self {
        let compiled = matchers
            .iter()
            .map(|m| {
                let label = m.label.clone();
                match m.op {
                    MatchOp::Eq => Compiled::Eq {
                        label,
                        value: m.value.clone(),
                    },
                    MatchOp::Ne => Compiled::Ne {
                        label,
                        value: m.value.clone(),
                    },
                    MatchOp::Re => Compiled::Re {
                        label,
                        regex: anchored(&m.value),
                    },
                    MatchOp::Nre => Compiled::Nre {
                        label,
                        regex: anchored(&m.value),
                    },
                }
            })
            .collect();
        PostFilter { matchers: compiled }
    }

    /// Whether an event with these labels survives the filter.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.matchers.iter().all(|m| match m {
            Compiled::Eq { label, value } => label_value(labels, label) == value,
            Compiled::Ne { label, value } => label_value(labels, label) != value,
            Compiled::Re { label, regex } => match regex {
                Some(re) => re.is_match(label_value(labels, label)),
                None => false,
            },
            Compiled::Nre { label, regex } => match regex {
                Some(re) => !re.is_match(label_value(labels, label)),
                None => false,
            },
        })
    }
}

fn label_value<'a>(labels: &'a HashMap<String, String>, label: &str) -> &'a str {
    labels.get(label).map(String::as_str).unwrap_or("")
}

// Regex matchers match the whole value, as in PromQL.
fn anchored(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).ok()
}
