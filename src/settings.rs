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

//! This file contains all the hard-coded settings and parsing code for the toml file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File, FileFormat};

use correlator_common::{parse_duration, CorrelatorError, ErrorKind};

use crate::window::{WindowConfig, EVENT_SIZE_ESTIMATE};

pub const SETTINGS_PATH: &str = "/etc/correlator/correlator.toml";

const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(300);
const MAX_EVENTS: usize = 10_000;
const LATE_TOLERANCE: Duration = Duration::from_secs(30);
const BUFFER_SIZE: usize = 1_000;
const PROCESSING_INTERVAL: Duration = Duration::from_millis(100);
const MAX_MEMORY_MB: u64 = 100;
const GC_INTERVAL: Duration = Duration::from_secs(30);
const N_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Used when a stream reference carries no `[d]` suffix.
    pub default_time_window: Duration,
    /// Per-window event cap.
    pub max_events: usize,
    pub late_tolerance: Duration,
    /// Back-pressure high watermark.
    pub buffer_size: usize,
    pub processing_interval: Duration,
    pub max_memory_mb: u64,
    pub gc_interval: Duration,
    /// Producer thread pool size floor; grows with stream count.
    pub n_workers: usize,
    /// `name=path` fixture adapters the CLI registers on startup.
    pub adapter_files: Vec<(String, PathBuf)>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            default_time_window: DEFAULT_TIME_WINDOW,
            max_events: MAX_EVENTS,
            late_tolerance: LATE_TOLERANCE,
            buffer_size: BUFFER_SIZE,
            processing_interval: PROCESSING_INTERVAL,
            max_memory_mb: MAX_MEMORY_MB,
            gc_interval: GC_INTERVAL,
            n_workers: N_WORKERS,
            adapter_files: Vec::new(),
        }
    }
}

impl Settings {
    pub fn read() -> Result<Settings, CorrelatorError> {
        Settings::read_from(SETTINGS_PATH)
    }

    pub fn read_from(path: &str) -> Result<Settings, CorrelatorError> {
        let mut settings = Config::default();
        settings
            .merge(File::new(path, FileFormat::Toml))
            .map_err(|e| {
                CorrelatorError::new(
                    ErrorKind::Upstream,
                    format!("cannot read settings from {}: {}", path, e),
                )
            })?;
        let results = settings
            .try_into::<HashMap<String, String>>()
            .map_err(|e| {
                CorrelatorError::new(ErrorKind::Upstream, format!("bad settings file: {}", e))
            })?;
        Settings::from_map(&results)
    }

    pub fn from_map(results: &HashMap<String, String>) -> Result<Settings, CorrelatorError> {
        let mut parsed = Settings::default();
        if let Some(text) = results.get("default_time_window") {
            parsed.default_time_window = parse_duration(text)?;
        }
        if let Some(text) = results.get("late_tolerance") {
            parsed.late_tolerance = parse_duration(text)?;
        }
        if let Some(text) = results.get("processing_interval") {
            parsed.processing_interval = parse_duration(text)?;
        }
        if let Some(text) = results.get("gc_interval") {
            parsed.gc_interval = parse_duration(text)?;
        }
        if let Some(text) = results.get("max_events") {
            parsed.max_events = parse_number(text, "max_events")?;
        }
        if let Some(text) = results.get("buffer_size") {
            parsed.buffer_size = parse_number(text, "buffer_size")?;
        }
        if let Some(text) = results.get("max_memory_mb") {
            parsed.max_memory_mb = parse_number(text, "max_memory_mb")? as u64;
        }
        if let Some(text) = results.get("n_workers") {
            parsed.n_workers = parse_number(text, "n_workers")?;
        }
        if let Some(text) = results.get("adapters") {
            if !text.is_empty() {
                for part in text.split(',') {
                    let mut halves = part.splitn(2, '=');
                    match (halves.next(), halves.next()) {
                        (Some(name), Some(path)) => parsed
                            .adapter_files
                            .push((name.trim().to_string(), PathBuf::from(path.trim()))),
                        _ => {
                            return Err(CorrelatorError::new(
                                ErrorKind::Upstream,
                                format!("bad adapter entry {:?}, expected name=path", part),
                            ))
                        }
                    }
                }
            }
        }
        Ok(parsed)
    }

    /// Window configuration for one correlation pass. The stream's own `[d]`
    /// range wins over the engine default; the byte budget splits the memory
    /// cap across the per-stream windows.
    pub fn window_config(&self, stream_range: Option<Duration>, streams: usize) -> WindowConfig {
        let window = stream_range.unwrap_or(self.default_time_window);
        let budget = (self.max_memory_mb as usize).saturating_mul(1024 * 1024) / streams.max(1);
        WindowConfig {
            window_size_ms: window.as_millis() as i64,
            late_tolerance_ms: self.late_tolerance.as_millis() as i64,
            max_events: self.max_events,
            max_bytes: budget.max(EVENT_SIZE_ESTIMATE),
        }
    }
}

fn parse_number(text: &str, key: &str) -> Result<usize, CorrelatorError> {
    text.trim().parse().map_err(|_| {
        CorrelatorError::new(
            ErrorKind::Upstream,
            format!("setting {} is not a number: {:?}", key, text),
        )
    })
}
