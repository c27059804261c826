#[macro_use]
extern crate lazy_static;

pub mod adapter;
pub mod backpressure;
pub mod dedup;
pub mod engine;
pub mod joiner;
pub mod perf;
pub mod query;
pub mod settings;
pub mod window;

use std::error::Error;

pub use correlator_common::{
    CorrelatedEvent, CorrelatedSubEvent, CorrelatorError, ErrorKind, LogEvent,
    PerformanceSnapshot,
};

pub use crate::engine::{CorrelationEngine, CorrelationStream, EngineEvent};
pub use crate::query::{parse_query, validate_query, ParsedQuery};
pub use crate::settings::Settings;

use crate::adapter::FileAdapter;

/// Builds an engine from settings, registering the fixture adapters the
/// settings file names.
pub fn engine_from_settings(settings: Settings) -> Result<CorrelationEngine, CorrelatorError> {
    let adapter_files = settings.adapter_files.clone();
    let engine = CorrelationEngine::with_settings(settings);
    for (name, path) in adapter_files {
        engine.add_adapter(&name, Box::new(FileAdapter::new(name.clone(), path)))?;
    }
    Ok(engine)
}

/// Parses a query and prints either the parse tree or the offending
/// fragment.
pub fn check_query(query: &str) {
    match parse_query(query) {
        Ok(parsed) => {
            println!("query ok: {} streams, {} join", parsed.stream_count(), parsed.join_type);
            match serde_json::to_string_pretty(&parsed) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("could not render parse tree: {}", e),
            }
        }
        Err(e) => {
            eprintln!("{}", e);
        }
    }
}

/// Runs a query against the configured adapters and prints each correlation
/// as a JSON line.
pub fn run_query(settings: Settings, query: &str) -> Result<(), Box<dyn Error>> {
    let engine = engine_from_settings(settings)?;
    let stream = engine.correlate(query)?;
    let mut count = 0usize;
    for result in stream {
        let correlation = result?;
        println!("{}", serde_json::to_string(&correlation)?);
        count += 1;
    }
    eprintln!("{} correlations", count);
    let snapshot = engine.monitor().snapshot();
    eprintln!(
        "{} events processed, {} dropped, {} errors",
        snapshot.events_processed, snapshot.dropped_events, snapshot.errors
    );
    engine.destroy();
    Ok(())
}

pub fn show_config(settings: &Settings) {
    println!("{:?}", settings);
}
