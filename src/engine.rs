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

//! The engine coordinator.
//!
//! Owns the adapter registry and turns a query string into a running
//! correlation pass: one producer thread per referenced stream feeding a
//! back-pressure channel, a joiner consuming the channels, and a
//! [`CorrelationStream`] handle the caller pulls. Dropping the handle
//! cancels its producers; `destroy` cancels everything.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use itertools::Itertools;
use threadpool::ThreadPool;
use uuid::Uuid;

use correlator_common::{
    CorrelatedEvent, CorrelatorError, ErrorKind, LogEvent, PerformanceSnapshot,
};

use crate::adapter::{DataSourceAdapter, StreamOptions};
use crate::backpressure::{self, BackpressureConfig, GateReceiver};
use crate::joiner::multi::{EventStream, MultiJoinerOptions, MultiStreamJoiner};
use crate::joiner::{CorrelationIds, JoinerOptions, StreamJoiner};
use crate::perf::{InstrumentedStream, PerformanceMonitor};
use crate::query::{parse_query, ParsedQuery};
use crate::settings::Settings;

/// What the engine tells its observers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    CorrelationFound(CorrelatedEvent),
    PerformanceMetrics(PerformanceSnapshot),
    MemoryWarning { used_mb: f64, max_mb: f64 },
    AdapterAdded(String),
}

type Observer = Box<dyn Fn(&EngineEvent) + Send + Sync>;
type Observers = Arc<Mutex<Vec<Observer>>>;
type Registry = Arc<Mutex<IndexMap<String, Box<dyn DataSourceAdapter>>>>;

pub struct CorrelationEngine {
    settings: Settings,
    adapters: Registry,
    observers: Observers,
    monitor: Arc<PerformanceMonitor>,
    ids: CorrelationIds,
    pool: Mutex<ThreadPool>,
    active_streams: Arc<AtomicUsize>,
    active_passes: Arc<Mutex<IndexMap<Uuid, Arc<AtomicBool>>>>,
    housekeeper_stop: Arc<AtomicBool>,
    housekeeper: Mutex<Option<thread::JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        CorrelationEngine::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let observers: Observers = Arc::new(Mutex::new(Vec::new()));
        let monitor = Arc::new(PerformanceMonitor::new());
        let housekeeper_stop = Arc::new(AtomicBool::new(false));
        let housekeeper = spawn_housekeeper(
            &settings,
            Arc::clone(&monitor),
            Arc::clone(&observers),
            Arc::clone(&housekeeper_stop),
        );
        let pool = ThreadPool::new(settings.n_workers.max(2));
        CorrelationEngine {
            settings,
            adapters: Arc::new(Mutex::new(IndexMap::new())),
            observers,
            monitor,
            ids: Arc::new(AtomicU64::new(1)),
            pool: Mutex::new(pool),
            active_streams: Arc::new(AtomicUsize::new(0)),
            active_passes: Arc::new(Mutex::new(IndexMap::new())),
            housekeeper_stop,
            housekeeper: Mutex::new(Some(housekeeper)),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Registers an observer for engine events.
    pub fn on_event(&self, observer: Observer) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Registers an adapter under `name`. Duplicate names are an error, not
    /// a replacement.
    pub fn add_adapter(
        &self,
        name: &str,
        adapter: Box<dyn DataSourceAdapter>,
    ) -> Result<(), CorrelatorError> {
        let mut adapters = self.adapters.lock().unwrap();
        if adapters.contains_key(name) {
            return Err(CorrelatorError::new(
                ErrorKind::AdapterExists,
                format!("adapter {:?} is already registered", name),
            ));
        }
        adapters.insert(name.to_string(), adapter);
        drop(adapters);
        emit(&self.observers, &EngineEvent::AdapterAdded(name.to_string()));
        Ok(())
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.lock().unwrap().keys().cloned().collect()
    }

    /// Canonical registry key for `name`: exact match first, then a
    /// case-insensitive fallback.
    pub fn resolve_adapter(&self, name: &str) -> Option<String> {
        let adapters = self.adapters.lock().unwrap();
        if adapters.contains_key(name) {
            return Some(name.to_string());
        }
        adapters
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Parse-only check of a query string.
    pub fn validate_query(&self, query: &str) -> bool {
        crate::query::validate_query(query)
    }

    /// Number of correlation passes currently live.
    pub fn active_passes(&self) -> usize {
        self.active_passes.lock().unwrap().len()
    }

    /// Parses the query, opens one stream per reference and starts the join.
    /// The returned stream is lazy; events only flow while it is pulled.
    pub fn correlate(&self, query: &str) -> Result<CorrelationStream, CorrelatorError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CorrelatorError::new(
                ErrorKind::Upstream,
                "engine is destroyed",
            ));
        }
        let parsed = parse_query(query)?;
        let streams = parsed.streams();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut receivers: Vec<GateReceiver<Result<LogEvent, CorrelatorError>>> =
            Vec::with_capacity(streams.len());

        // Resolve every adapter before starting anything; fail fast with the
        // available names when one is missing.
        let mut resolved = Vec::with_capacity(streams.len());
        for stream in &streams {
            let canonical = self.resolve_adapter(&stream.source).ok_or_else(|| {
                let available = self.adapter_names();
                CorrelatorError::new(
                    ErrorKind::AdapterNotFound,
                    format!("no adapter registered for source {:?}", stream.source),
                )
                .with_context("available", available.iter().join(", "))
            })?;
            resolved.push(canonical);
        }

        {
            let needed = self.active_streams.load(Ordering::SeqCst) + streams.len();
            let mut pool = self.pool.lock().unwrap();
            if pool.max_count() < needed.max(self.settings.n_workers) {
                pool.set_num_threads(needed.max(self.settings.n_workers));
            }
        }

        let gate_config = BackpressureConfig::with_buffer_size(self.settings.buffer_size);
        for (stream, canonical) in streams.iter().zip(resolved.iter()) {
            let options = StreamOptions {
                time_range: Some(
                    stream
                        .time_range
                        .unwrap_or(self.settings.default_time_window),
                ),
                limit: None,
                extra: Default::default(),
            };
            let opened = {
                let mut adapters = self.adapters.lock().unwrap();
                let adapter = adapters.get_mut(canonical).ok_or_else(|| {
                    CorrelatorError::new(
                        ErrorKind::AdapterNotFound,
                        format!("adapter {:?} disappeared", canonical),
                    )
                });
                adapter.and_then(|a| a.create_stream(&stream.selector, &options))
            };
            let upstream = match opened {
                Ok(upstream) => upstream,
                Err(e) => {
                    // producers already running for earlier streams must not
                    // spin against dropped receivers
                    cancel.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            };
            self.active_streams.fetch_add(1, Ordering::SeqCst);
            let instrumented = InstrumentedStream::new(upstream, Arc::clone(&self.monitor));
            let (sender, receiver) = backpressure::channel(gate_config);
            receivers.push(receiver);

            let cancel = Arc::clone(&cancel);
            let monitor = Arc::clone(&self.monitor);
            let active_streams = Arc::clone(&self.active_streams);
            self.pool.lock().unwrap().execute(move || {
                for item in instrumented {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let failed = item.is_err();
                    sender.send(item);
                    if failed {
                        break;
                    }
                }
                monitor.record_dropped(sender.dropped());
                active_streams.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let window = self
            .settings
            .window_config(parsed.time_window, streams.len());
        let joiner: Box<dyn Iterator<Item = Result<CorrelatedEvent, CorrelatorError>> + Send> =
            if streams.len() == 2 {
                let options = JoinerOptions::from_query(&parsed, window);
                let mut iter = receivers.into_iter();
                let left = iter.next().unwrap();
                let right = iter.next().unwrap();
                Box::new(StreamJoiner::with_ids(
                    options,
                    left,
                    right,
                    Arc::clone(&self.ids),
                ))
            } else {
                let options = MultiJoinerOptions::from_query(&parsed, window);
                let inputs: Vec<EventStream> = receivers
                    .into_iter()
                    .map(|r| Box::new(r) as EventStream)
                    .collect();
                Box::new(MultiStreamJoiner::with_ids(
                    options,
                    inputs,
                    Arc::clone(&self.ids),
                ))
            };

        let pass_id = Uuid::new_v4();
        self.active_passes
            .lock()
            .unwrap()
            .insert(pass_id, Arc::clone(&cancel));
        Ok(CorrelationStream {
            inner: joiner,
            query: parsed,
            pass_id,
            cancel,
            active_passes: Arc::clone(&self.active_passes),
            monitor: Arc::clone(&self.monitor),
            observers: Arc::clone(&self.observers),
        })
    }

    /// Cancels every pass, tears the adapters down concurrently and clears
    /// observers. Safe to call more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, cancel) in self.active_passes.lock().unwrap().iter() {
            cancel.store(true, Ordering::SeqCst);
        }
        self.housekeeper_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.housekeeper.lock().unwrap().take() {
            handle.join().ok();
        }
        let drained: Vec<(String, Box<dyn DataSourceAdapter>)> =
            self.adapters.lock().unwrap().drain(..).collect();
        let handles: Vec<_> = drained
            .into_iter()
            .map(|(_, mut adapter)| {
                thread::spawn(move || {
                    adapter.destroy();
                })
            })
            .collect();
        for handle in handles {
            handle.join().ok();
        }
        self.observers.lock().unwrap().clear();
    }
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        CorrelationEngine::new()
    }
}

impl Drop for CorrelationEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn emit(observers: &Observers, event: &EngineEvent) {
    for observer in observers.lock().unwrap().iter() {
        observer(event);
    }
}

/// Periodic housekeeping: metric snapshots and the memory warning.
fn spawn_housekeeper(
    settings: &Settings,
    monitor: Arc<PerformanceMonitor>,
    observers: Observers,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let tick = settings
        .processing_interval
        .max(Duration::from_millis(20));
    let gc_interval = settings.gc_interval;
    let max_memory_mb = settings.max_memory_mb;
    thread::spawn(move || {
        let mut last_gc = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(tick);
            if last_gc.elapsed() < gc_interval {
                continue;
            }
            last_gc = Instant::now();
            let snapshot = monitor.snapshot();
            let used_mb = snapshot.memory_usage;
            emit(&observers, &EngineEvent::PerformanceMetrics(snapshot));
            if used_mb > max_memory_mb as f64 {
                emit(
                    &observers,
                    &EngineEvent::MemoryWarning {
                        used_mb,
                        max_mb: max_memory_mb as f64,
                    },
                );
            }
        }
    })
}

/// Handle over one running correlation pass. Pull it like any iterator;
/// dropping it cancels the pass's producers.
pub struct CorrelationStream {
    inner: Box<dyn Iterator<Item = Result<CorrelatedEvent, CorrelatorError>> + Send>,
    query: ParsedQuery,
    pass_id: Uuid,
    cancel: Arc<AtomicBool>,
    active_passes: Arc<Mutex<IndexMap<Uuid, Arc<AtomicBool>>>>,
    monitor: Arc<PerformanceMonitor>,
    observers: Observers,
}

impl CorrelationStream {
    pub fn pass_id(&self) -> Uuid {
        self.pass_id
    }

    pub fn query(&self) -> &ParsedQuery {
        &self.query
    }

    /// Stops the pass without dropping the handle; remaining buffered
    /// correlations still drain.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl Iterator for CorrelationStream {
    type Item = Result<CorrelatedEvent, CorrelatorError>;

    fn next(&mut self) -> Option<Self::Item> {
        let started = Instant::now();
        let item = self.inner.next()?;
        if let Ok(correlation) = &item {
            self.monitor.record_correlation();
            self.monitor
                .record_latency_ms(started.elapsed().as_millis() as u64);
            emit(
                &self.observers,
                &EngineEvent::CorrelationFound(correlation.clone()),
            );
        }
        Some(item)
    }
}

impl Drop for CorrelationStream {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.active_passes.lock().unwrap().shift_remove(&self.pass_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StaticAdapter;
    use correlator_common::{Completeness, LogEvent};

    fn event(ts: &str, source: &str, labels: &[(&str, &str)]) -> LogEvent {
        let mut e = LogEvent::new(ts, source, format!("{} event", source));
        for (k, v) in labels {
            e.labels.insert(k.to_string(), v.to_string());
        }
        e
    }

    fn engine_with_fixtures() -> CorrelationEngine {
        let engine = CorrelationEngine::new();
        engine
            .add_adapter(
                "loki",
                Box::new(StaticAdapter::new(
                    "loki",
                    vec![
                        event(
                            "2022-01-01T00:00:00Z",
                            "loki",
                            &[("service", "frontend"), ("request_id", "r1")],
                        ),
                        event(
                            "2022-01-01T00:00:01Z",
                            "loki",
                            &[("service", "frontend"), ("request_id", "r1")],
                        ),
                    ],
                )),
            )
            .unwrap();
        engine
            .add_adapter(
                "graylog",
                Box::new(StaticAdapter::new(
                    "graylog",
                    vec![event(
                        "2022-01-01T00:00:00.050Z",
                        "graylog",
                        &[("service", "backend"), ("request_id", "r1")],
                    )],
                )),
            )
            .unwrap();
        engine
    }

    #[test]
    fn correlates_end_to_end() {
        let engine = engine_with_fixtures();
        let stream = engine
            .correlate(
                "loki({service=\"frontend\"})[5m] and on(request_id) graylog({service=\"backend\"})[5m]",
            )
            .unwrap();
        let results: Vec<_> = stream.map(|r| r.unwrap()).collect();
        assert_eq!(results.len(), 1);
        let c = &results[0];
        assert_eq!(c.join_value, "r1");
        assert_eq!(c.events.len(), 3);
        assert_eq!(c.metadata.completeness, Completeness::Complete);
        assert!(c.validate().is_ok());
        assert!(engine.monitor().events_processed() >= 3);
        assert!(engine.monitor().correlations_found() >= 1);
        engine.destroy();
    }

    #[test]
    fn missing_adapter_fails_fast_with_available_list() {
        let engine = engine_with_fixtures();
        let err = match engine.correlate("prometheus(up)[5m] and on(id) loki(x)[5m]") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::AdapterNotFound);
        let available = &err.context()["available"];
        assert!(available.contains("loki"));
        assert!(available.contains("graylog"));
        engine.destroy();
    }

    #[test]
    fn duplicate_adapter_registration_is_rejected() {
        let engine = CorrelationEngine::new();
        engine
            .add_adapter("loki", Box::new(StaticAdapter::new("loki", vec![])))
            .unwrap();
        let err = engine
            .add_adapter("loki", Box::new(StaticAdapter::new("loki", vec![])))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterExists);
        engine.destroy();
    }

    #[test]
    fn adapter_lookup_falls_back_to_case_insensitive() {
        let engine = CorrelationEngine::new();
        engine
            .add_adapter("Loki", Box::new(StaticAdapter::new("Loki", vec![])))
            .unwrap();
        assert_eq!(engine.resolve_adapter("Loki").as_deref(), Some("Loki"));
        assert_eq!(engine.resolve_adapter("loki").as_deref(), Some("Loki"));
        assert_eq!(engine.resolve_adapter("LOKI").as_deref(), Some("Loki"));
        assert!(engine.resolve_adapter("graylog").is_none());
        engine.destroy();
    }

    #[test]
    fn validate_query_is_parse_only() {
        let engine = CorrelationEngine::new();
        // no adapters registered; validation does not care
        assert!(engine.validate_query("a(x)[5m] and on(k) b(y)[5m]"));
        assert!(!engine.validate_query("a(x)[5m]"));
        engine.destroy();
    }

    #[test]
    fn three_stream_query_runs_the_multi_joiner() {
        let engine = engine_with_fixtures();
        engine
            .add_adapter(
                "metrics",
                Box::new(StaticAdapter::new(
                    "metrics",
                    vec![event(
                        "2022-01-01T00:00:00.500Z",
                        "metrics",
                        &[("request_id", "r1")],
                    )],
                )),
            )
            .unwrap();
        let stream = engine
            .correlate(
                "loki(x)[5m] and on(request_id) graylog(y)[5m] and on(request_id) metrics(z)[5m]",
            )
            .unwrap();
        let results: Vec<_> = stream.map(|r| r.unwrap()).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.total_streams, 3);
        assert_eq!(results[0].events.len(), 4);
        engine.destroy();
    }

    #[test]
    fn observers_see_adapter_and_correlation_events() {
        let engine = engine_with_fixtures();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.on_event(Box::new(move |event| {
            let tag = match event {
                EngineEvent::CorrelationFound(_) => "correlation",
                EngineEvent::PerformanceMetrics(_) => "metrics",
                EngineEvent::MemoryWarning { .. } => "memory",
                EngineEvent::AdapterAdded(_) => "adapter",
            };
            sink.lock().unwrap().push(tag.to_string());
        }));
        engine
            .add_adapter("extra", Box::new(StaticAdapter::new("extra", vec![])))
            .unwrap();
        let stream = engine
            .correlate("loki(x)[5m] and on(request_id) graylog(y)[5m]")
            .unwrap();
        let _results: Vec<_> = stream.collect();
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"adapter".to_string()));
        assert!(seen.contains(&"correlation".to_string()));
        engine.destroy();
    }

    #[test]
    fn dropping_the_stream_unregisters_the_pass() {
        let engine = engine_with_fixtures();
        let stream = engine
            .correlate("loki(x)[5m] and on(request_id) graylog(y)[5m]")
            .unwrap();
        assert_eq!(engine.active_passes(), 1);
        drop(stream);
        assert_eq!(engine.active_passes(), 0);
        engine.destroy();
    }

    #[test]
    fn destroy_is_idempotent_and_blocks_new_passes() {
        let engine = engine_with_fixtures();
        engine.destroy();
        engine.destroy();
        let err = match engine.correlate("loki(x)[5m] and on(request_id) graylog(y)[5m]") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.message().contains("destroyed"));
        assert!(engine.adapter_names().is_empty());
    }

    #[test]
    fn bad_query_surfaces_parse_error() {
        let engine = engine_with_fixtures();
        let err = match engine.correlate("loki(x)[5m]") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::QueryParse);
        engine.destroy();
    }
}
