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

//! Recursive-descent parser for the correlation query language.
//!
//! Works on the normalized text with a byte cursor; every error carries the
//! cursor position and the offending token so the caller can point at the
//! bad fragment.

use std::time::Duration;

use correlator_common::{parse_duration, CorrelatorError, ErrorKind};

use super::{
    normalize, FilterMatcher, Grouping, GroupingSide, JoinType, LabelMapping, MatchOp,
    ParsedQuery, StreamQuery,
};

pub fn parse_query(input: &str) -> Result<ParsedQuery, CorrelatorError> {
    let text = normalize(input);
    let mut parser = Parser { text: &text, pos: 0 };
    let parsed = parser.query()?;
    validate_parsed(&parsed)?;
    Ok(parsed)
}

/// One `joinOp` clause as written, before the chain is folded into the
/// parse-tree root.
struct JoinClause {
    join_type: JoinType,
    keys: Vec<(String, Option<String>)>,
    within: Option<Duration>,
    grouping: Option<Grouping>,
    ignoring: Option<Vec<String>>,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn query(&mut self) -> Result<ParsedQuery, CorrelatorError> {
        let mut streams = vec![self.stream_ref()?];
        let mut clauses = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None | Some('{') => break,
                _ => {}
            }
            clauses.push(self.join_clause()?);
            streams.push(self.stream_ref()?);
        }
        if clauses.is_empty() {
            return Err(self.error("expected a join operator (and, or, unless)"));
        }
        let filter = match self.peek() {
            Some('{') => Some(self.filter()?),
            _ => None,
        };
        self.skip_ws();
        if self.peek().is_some() {
            return Err(self.error("unexpected trailing input"));
        }
        self.assemble(streams, clauses, filter)
    }

    fn assemble(
        &self,
        mut streams: Vec<StreamQuery>,
        clauses: Vec<JoinClause>,
        filter: Option<Vec<FilterMatcher>>,
    ) -> Result<ParsedQuery, CorrelatorError> {
        let join_type = clauses[0].join_type;
        for clause in &clauses[1..] {
            if clause.join_type != join_type {
                return Err(CorrelatorError::new(
                    ErrorKind::QueryParse,
                    format!(
                        "mixed join operators: {} and {}",
                        join_type, clause.join_type
                    ),
                ));
            }
        }

        let mut join_keys = Vec::new();
        let mut mappings = Vec::new();
        for clause in &clauses {
            for (left, right) in &clause.keys {
                if !join_keys.contains(left) {
                    join_keys.push(left.clone());
                }
                if let Some(right) = right {
                    let mapping = LabelMapping {
                        left: left.clone(),
                        right: right.clone(),
                    };
                    if !mappings.contains(&mapping) {
                        mappings.push(mapping);
                    }
                }
            }
        }

        // Modifier chains fold first-occurrence-wins.
        let temporal = clauses.iter().find_map(|c| c.within);
        let grouping = clauses.iter().find_map(|c| c.grouping.clone());
        let ignoring = clauses.iter().find_map(|c| c.ignoring.clone());

        let time_window = streams.iter().filter_map(|s| s.time_range).max();

        let mut rest = streams.split_off(2);
        let right_stream = streams.pop().unwrap();
        let left_stream = streams.pop().unwrap();
        let additional_streams = rest.drain(..).collect();

        Ok(ParsedQuery {
            left_stream,
            right_stream,
            additional_streams,
            join_type,
            join_keys,
            time_window,
            temporal,
            grouping,
            ignoring,
            label_mappings: if mappings.is_empty() {
                None
            } else {
                Some(mappings)
            },
            filter,
        })
    }

    // streamRef := IDENT ( '(' selector ')' )? ( '[' duration ']' )? ( 'as' IDENT )?
    fn stream_ref(&mut self) -> Result<StreamQuery, CorrelatorError> {
        let source = self.ident("stream source")?;
        let selector = if self.eat('(') {
            self.selector_text()?
        } else {
            String::new()
        };
        let time_range = if self.eat('[') {
            let text = self.until(']')?;
            self.expect(']')?;
            Some(parse_duration(&text).map_err(|e| self.rewrap(e))?)
        } else {
            None
        };
        let alias = if self.keyword("as") {
            Some(self.ident("stream alias")?)
        } else {
            None
        };
        Ok(StreamQuery {
            source,
            selector,
            time_range,
            alias,
        })
    }

    /// Free text balanced through the matching ')'. Parentheses inside
    /// double-quoted strings do not count toward the balance.
    fn selector_text(&mut self) -> Result<String, CorrelatorError> {
        let start = self.pos;
        let mut depth = 1usize;
        let mut in_string = false;
        let mut prev_backslash = false;
        while let Some(c) = self.peek() {
            if in_string {
                if prev_backslash {
                    prev_backslash = false;
                } else if c == '\\' {
                    prev_backslash = true;
                } else if c == '"' {
                    in_string = false;
                }
            } else {
                match c {
                    '"' => in_string = true,
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            let text = self.text[start..self.pos].to_string();
                            self.bump();
                            return Ok(text);
                        }
                    }
                    _ => {}
                }
            }
            self.bump();
        }
        self.pos = start;
        Err(self.error("unterminated selector, expected ')'"))
    }

    // joinOp := ( 'and' | 'or' | 'unless' ) 'on' '(' joinKeys ')' modifiers*
    fn join_clause(&mut self) -> Result<JoinClause, CorrelatorError> {
        let join_type = if self.keyword("and") {
            JoinType::And
        } else if self.keyword("or") {
            JoinType::Or
        } else if self.keyword("unless") {
            JoinType::Unless
        } else {
            return Err(self.error("expected a join operator (and, or, unless)"));
        };
        if !self.keyword("on") {
            return Err(self.error("expected 'on' after the join operator"));
        }
        self.expect('(')?;
        let mut keys = Vec::new();
        loop {
            let left = self.ident("join key")?;
            let right = if self.eat('=') {
                Some(self.ident("mapped join key")?)
            } else {
                None
            };
            keys.push((left, right));
            if !self.eat(',') {
                break;
            }
        }
        self.expect(')')?;

        let mut clause = JoinClause {
            join_type,
            keys,
            within: None,
            grouping: None,
            ignoring: None,
        };
        loop {
            if self.keyword("within") {
                self.expect('(')?;
                let text = self.until(')')?;
                self.expect(')')?;
                let d = parse_duration(&text).map_err(|e| self.rewrap(e))?;
                clause.within.get_or_insert(d);
            } else if self.keyword("group_left") {
                self.set_grouping(&mut clause, GroupingSide::Left)?;
            } else if self.keyword("group_right") {
                self.set_grouping(&mut clause, GroupingSide::Right)?;
            } else if self.keyword("ignoring") {
                self.expect('(')?;
                let labels = self.ident_list()?;
                self.expect(')')?;
                if labels.is_empty() {
                    return Err(self.error("ignoring() needs at least one label"));
                }
                clause.ignoring.get_or_insert(labels);
            } else {
                break;
            }
        }
        Ok(clause)
    }

    fn set_grouping(
        &mut self,
        clause: &mut JoinClause,
        side: GroupingSide,
    ) -> Result<(), CorrelatorError> {
        self.expect('(')?;
        let labels = self.ident_list()?;
        self.expect(')')?;
        if let Some(existing) = &clause.grouping {
            if existing.side != side {
                return Err(CorrelatorError::new(
                    ErrorKind::QueryParse,
                    "group_left and group_right are mutually exclusive",
                ));
            }
            return Ok(());
        }
        clause.grouping = Some(Grouping { side, labels });
        Ok(())
    }

    // filter := '{' matcher ( ',' matcher )* '}'
    fn filter(&mut self) -> Result<Vec<FilterMatcher>, CorrelatorError> {
        self.expect('{')?;
        let mut matchers = Vec::new();
        loop {
            let label = self.ident("filter label")?;
            let op = self.match_op()?;
            let value = self.quoted_string()?;
            matchers.push(FilterMatcher { label, op, value });
            if !self.eat(',') {
                break;
            }
        }
        self.expect('}')?;
        Ok(matchers)
    }

    fn match_op(&mut self) -> Result<MatchOp, CorrelatorError> {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        let (op, len) = if rest.starts_with("!=") {
            (MatchOp::Ne, 2)
        } else if rest.starts_with("!~") {
            (MatchOp::Nre, 2)
        } else if rest.starts_with("=~") {
            (MatchOp::Re, 2)
        } else if rest.starts_with('=') {
            (MatchOp::Eq, 1)
        } else {
            return Err(self.error("expected a matcher operator (=, !=, =~, !~)"));
        };
        self.pos += len;
        Ok(op)
    }

    fn quoted_string(&mut self) -> Result<String, CorrelatorError> {
        self.skip_ws();
        if !self.eat('"') {
            return Err(self.error("expected a quoted string"));
        }
        let mut out = String::new();
        while let Some(c) = self.bump() {
            match c {
                '"' => return Ok(out),
                '\\' => match self.bump() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => break,
                },
                _ => out.push(c),
            }
        }
        Err(self.error("unterminated string"))
    }

    fn ident_list(&mut self) -> Result<Vec<String>, CorrelatorError> {
        let mut labels = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    labels.push(self.ident("label")?);
                    if !self.eat(',') {
                        // also accept space-separated lists
                        continue;
                    }
                }
                _ => break,
            }
        }
        Ok(labels)
    }

    // ---- lexical helpers ----

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), CorrelatorError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", expected)))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, CorrelatorError> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let text = &self.text[start..self.pos];
        if text.is_empty() || text.chars().next().map_or(false, |c| c.is_ascii_digit()) {
            self.pos = start;
            return Err(self.error(&format!("expected an identifier ({})", what)));
        }
        Ok(text.to_string())
    }

    /// Consumes an identifier only if it equals `kw` at a word boundary.
    fn keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        if !rest.starts_with(kw) {
            return false;
        }
        match rest[kw.len()..].chars().next() {
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => false,
            _ => {
                self.pos += kw.len();
                true
            }
        }
    }

    /// Raw text up to (not including) `stop`.
    fn until(&mut self, stop: char) -> Result<String, CorrelatorError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == stop {
                return Ok(self.text[start..self.pos].to_string());
            }
            self.bump();
        }
        self.pos = start;
        Err(self.error(&format!("expected '{}'", stop)))
    }

    fn offending_token(&self) -> String {
        let rest = self.text[self.pos..].trim_start();
        if rest.is_empty() {
            return "<end of query>".to_string();
        }
        let token: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace())
            .take(20)
            .collect();
        token
    }

    fn error(&self, message: &str) -> CorrelatorError {
        CorrelatorError::new(
            ErrorKind::QueryParse,
            format!("{} at position {}", message, self.pos),
        )
        .with_context("position", self.pos.to_string())
        .with_context("token", self.offending_token())
    }

    /// Attaches the current position to an error raised by a sub-parser.
    fn rewrap(&self, inner: CorrelatorError) -> CorrelatorError {
        CorrelatorError::new(ErrorKind::QueryParse, inner.message().to_string())
            .with_context("position", self.pos.to_string())
    }
}

/// Structural validation beyond the grammar.
pub(super) fn validate_parsed(query: &ParsedQuery) -> Result<(), CorrelatorError> {
    let mut seen = Vec::new();
    for stream in query.streams() {
        let name = stream.display_name().to_string();
        if seen.contains(&name) {
            return Err(CorrelatorError::new(
                ErrorKind::QueryParse,
                format!("duplicate stream name {:?}; use 'as' to disambiguate", name),
            ));
        }
        seen.push(name);
    }
    if query.join_keys.is_empty() && query.ignoring.is_none() {
        return Err(CorrelatorError::new(
            ErrorKind::QueryParse,
            "join needs at least one key in on(...)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{validate_query, GroupingSide, JoinType, MatchOp};
    use super::*;

    #[test]
    fn parses_a_basic_inner_join() {
        let q = parse_query(
            "loki({service=\"frontend\"})[5m] and on(request_id) graylog({service=\"backend\"})[5m]",
        )
        .unwrap();
        assert_eq!(q.join_type, JoinType::And);
        assert_eq!(q.join_keys, vec!["request_id"]);
        assert_eq!(q.left_stream.source, "loki");
        assert_eq!(q.left_stream.selector, "{service=\"frontend\"}");
        assert_eq!(q.left_stream.time_range, Some(Duration::from_secs(300)));
        assert_eq!(q.right_stream.source, "graylog");
        assert_eq!(q.stream_count(), 2);
        assert!(q.temporal.is_none());
        assert!(q.filter.is_none());
    }

    #[test]
    fn parses_bare_stream_refs() {
        let q = parse_query("L[5m] unless on(id) R[5m]").unwrap();
        assert_eq!(q.join_type, JoinType::Unless);
        assert_eq!(q.left_stream.source, "L");
        assert_eq!(q.left_stream.selector, "");
        assert_eq!(q.right_stream.source, "R");
    }

    #[test]
    fn stream_without_range_gets_none() {
        let q = parse_query("a(x) and on(k) b(y)[1h]").unwrap();
        assert_eq!(q.left_stream.time_range, None);
        assert_eq!(q.right_stream.time_range, Some(Duration::from_secs(3600)));
        assert_eq!(q.time_window, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn parses_aliases() {
        let q = parse_query("loki(x)[5m] as web and on(k) loki(y)[5m] as api").unwrap();
        assert_eq!(q.left_stream.alias.as_deref(), Some("web"));
        assert_eq!(q.right_stream.alias.as_deref(), Some("api"));
    }

    #[test]
    fn parses_all_modifiers() {
        let q = parse_query(
            "a(x)[5m] and on(request_id) within(30s) group_left(session_id) b(y)[5m]",
        )
        .unwrap();
        assert_eq!(q.temporal, Some(Duration::from_secs(30)));
        let grouping = q.grouping.unwrap();
        assert_eq!(grouping.side, GroupingSide::Left);
        assert_eq!(grouping.labels, vec!["session_id"]);
    }

    #[test]
    fn parses_ignoring() {
        let q = parse_query("a(x)[5m] and on(k) ignoring(timestamp, level) b(y)[5m]").unwrap();
        assert_eq!(
            q.ignoring,
            Some(vec!["timestamp".to_string(), "level".to_string()])
        );
    }

    #[test]
    fn empty_ignoring_is_an_error() {
        let err = parse_query("a(x)[5m] and on(k) ignoring() b(y)[5m]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryParse);
    }

    #[test]
    fn parses_label_mappings() {
        let q = parse_query("a(x)[5m] and on(session_id=trace_id) b(y)[5m]").unwrap();
        assert_eq!(q.join_keys, vec!["session_id"]);
        let mappings = q.label_mappings.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].left, "session_id");
        assert_eq!(mappings[0].right, "trace_id");
    }

    #[test]
    fn parses_multiple_join_keys() {
        let q = parse_query("a(x)[5m] and on(request_id, trace_id) b(y)[5m]").unwrap();
        assert_eq!(q.join_keys, vec!["request_id", "trace_id"]);
    }

    #[test]
    fn parses_post_filter() {
        let q = parse_query(
            "a(x)[5m] and on(k) b(y)[5m] {status=\"success\", code=~\"5..\", env!=\"dev\", msg!~\".*noise.*\"}",
        )
        .unwrap();
        let filter = q.filter.unwrap();
        assert_eq!(filter.len(), 4);
        assert_eq!(filter[0].op, MatchOp::Eq);
        assert_eq!(filter[1].op, MatchOp::Re);
        assert_eq!(filter[2].op, MatchOp::Ne);
        assert_eq!(filter[3].op, MatchOp::Nre);
        assert_eq!(filter[0].value, "success");
    }

    #[test]
    fn parses_three_streams() {
        let q = parse_query("a(x)[5m] and on(k) b(y)[5m] and on(k) c(z)[10m]").unwrap();
        assert_eq!(q.stream_count(), 3);
        assert_eq!(q.additional_streams[0].source, "c");
        assert_eq!(q.time_window, Some(Duration::from_secs(600)));
    }

    #[test]
    fn mixed_join_operators_rejected() {
        let err = parse_query("a(x)[5m] and on(k) b(y)[5m] or on(k) c(z)[5m]").unwrap_err();
        assert!(err.message().contains("mixed join operators"));
    }

    #[test]
    fn selector_balances_parens_and_quotes() {
        let q = parse_query("a(count(rate(x[1m])))[5m] and on(k) b({v=\")\"})[5m]").unwrap();
        assert_eq!(q.left_stream.selector, "count(rate(x[1m]))");
        assert_eq!(q.right_stream.selector, "{v=\")\"}");
    }

    #[test]
    fn single_stream_is_invalid() {
        let err = parse_query("a(x)[5m]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryParse);
        assert!(err.message().contains("join operator"));
    }

    #[test]
    fn missing_on_is_invalid() {
        let err = parse_query("a(x)[5m] and b(y)[5m]").unwrap_err();
        assert!(err.message().contains("'on'"));
    }

    #[test]
    fn errors_carry_position_and_token() {
        let err = parse_query("a(x)[5m] and on(k) b(y)[5m] extra").unwrap_err();
        assert!(err.context().contains_key("position"));
        assert_eq!(err.context()["token"], "extra");
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let err = parse_query("a(x)[5q] and on(k) b(y)[5m]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryParse);
        assert!(err.message().contains("duration"));
    }

    #[test]
    fn duplicate_stream_names_rejected() {
        let err = parse_query("loki(x)[5m] and on(k) loki(y)[5m]").unwrap_err();
        assert!(err.message().contains("duplicate stream name"));
        assert!(validate_query(
            "loki(x)[5m] as a and on(k) loki(y)[5m] as b"
        ));
    }

    #[test]
    fn grouping_conflict_rejected() {
        let err =
            parse_query("a(x)[5m] and on(k) group_left() group_right() b(y)[5m]").unwrap_err();
        assert!(err.message().contains("mutually exclusive"));
    }

    #[test]
    fn unterminated_string_in_filter() {
        let err = parse_query("a(x)[5m] and on(k) b(y)[5m] {status=\"oops}").unwrap_err();
        assert!(err.message().contains("unterminated string"));
    }
}
