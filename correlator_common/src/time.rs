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

//! Duration strings and ISO-8601 timestamps.
//!
//! Everything downstream of the parser works in epoch milliseconds; the
//! string forms only exist at the adapter and query boundaries.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::CorrelatorError;
use crate::ErrorKind;

lazy_static! {
    static ref DURATION_RE: Regex = Regex::new(r"^\s*(\d+)\s*([smhd])\s*$").unwrap();
}

// Formats tried after RFC 3339 fails. Some aggregators drop the timezone
// designator; those timestamps are taken as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parses `30s` / `5m` / `2h` / `1d` into a Duration.
pub fn parse_duration(text: &str) -> Result<Duration, CorrelatorError> {
    let caps = DURATION_RE.captures(text).ok_or_else(|| {
        CorrelatorError::new(
            ErrorKind::QueryParse,
            format!("invalid duration {:?}, expected e.g. 30s, 5m, 2h, 1d", text),
        )
    })?;
    let amount: u64 = caps[1].parse().map_err(|_| {
        CorrelatorError::new(
            ErrorKind::QueryParse,
            format!("duration amount out of range in {:?}", text),
        )
    })?;
    let seconds = match &caps[2] {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        _ => unreachable!(),
    };
    Ok(Duration::from_secs(seconds))
}

/// Parses an ISO-8601 timestamp into epoch milliseconds.
pub fn parse_timestamp(text: &str) -> Result<i64, CorrelatorError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    Err(CorrelatorError::new(
        ErrorKind::Upstream,
        format!("unparseable timestamp {:?}", text),
    ))
}

/// Renders epoch milliseconds back into the RFC 3339 form used on emitted
/// correlations.
pub fn format_timestamp(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => format!("{}", millis),
    }
}

/// Compares two timestamp strings on the millisecond axis.
pub fn compare_timestamps(a: &str, b: &str) -> Result<Ordering, CorrelatorError> {
    Ok(parse_timestamp(a)?.cmp(&parse_timestamp(b)?))
}

pub fn duration_millis(d: Duration) -> i64 {
    d.as_millis() as i64
}
