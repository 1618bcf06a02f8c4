//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use trackline::prelude::*;

pub const WAIT: Option<Duration> = Some(Duration::from_secs(10));

pub fn engine(workers: usize) -> Engine {
    Engine::create(
        EngineConfig::new()
            .workers(WorkerCount::Fixed(workers))
            .kcall_threads(0),
    )
    .unwrap()
}

/// Ordered record of filter events across a track
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries().into_iter().filter(|e| e.starts_with(prefix)).collect()
    }
}

/// Wraps a process function and logs open and close
pub struct Probe<F> {
    name: &'static str,
    log: Log,
    process: F,
}

impl<F> Filter for Probe<F>
where
    F: FnMut(&mut TrackCtx<'_>) -> FilterResult + Send,
{
    fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult {
        (self.process)(t)
    }

    fn close(&mut self, _t: &mut TrackCtx<'_>) {
        self.log.push(format!("close {}", self.name));
    }
}

/// Descriptor whose instances run `make()`'s closure and log open/close
pub fn probe<F, M>(name: &'static str, log: &Log, make: M) -> Arc<FilterDescriptor>
where
    F: FnMut(&mut TrackCtx<'_>) -> FilterResult + Send + 'static,
    M: Fn() -> F + Send + Sync + 'static,
{
    let log = log.clone();
    FilterDescriptor::new(name, move |_| {
        log.push(format!("open {name}"));
        Ok(Opened::Instance(Box::new(Probe { name, log: log.clone(), process: make() })))
    })
}

/// Build, start and wait for a track running `chain` in order
pub fn run(engine: &Engine, config: TrackConfig, chain: &[Arc<FilterDescriptor>]) -> TrackReport {
    let track = engine.track_create(config).unwrap();
    for desc in chain {
        track.filter(desc, Position::Last).unwrap();
    }
    track.start().unwrap();
    track.wait(WAIT).expect("track did not close in time")
}
