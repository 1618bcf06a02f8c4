//! Pipeline demo
//!
//! Runs N tracks in parallel, each a synthetic tone source, a gain stage
//! and a file sink that writes through the kernel call bridge.
//!
//! ```text
//! pipeline [--tracks N] [--out DIR] [--chunks N] [--gain X]
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - log level filter
//! - `TRACKLINE_WORKERS`, `TRACKLINE_KCALL_THREADS`, ... - engine settings

use std::f32::consts::TAU;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trackline::prelude::*;

const RATE: f32 = 48_000.0;
const FRAMES: usize = 1024;

struct Args {
    tracks: usize,
    out: PathBuf,
    chunks: usize,
    gain: f32,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        tracks: 4,
        out: std::env::temp_dir().join("trackline"),
        chunks: 64,
        gain: 0.5,
    };
    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        let mut value = || it.next().ok_or_else(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--tracks" => args.tracks = value()?.parse().map_err(|e| format!("--tracks: {e}"))?,
            "--out" => args.out = PathBuf::from(value()?),
            "--chunks" => args.chunks = value()?.parse().map_err(|e| format!("--chunks: {e}"))?,
            "--gain" => args.gain = value()?.parse().map_err(|e| format!("--gain: {e}"))?,
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(args)
}

/// Sine tone as 16-bit little-endian mono PCM
struct Tone {
    freq: f32,
    phase: f32,
    left: usize,
}

impl Filter for Tone {
    fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult {
        if self.left == 0 {
            t.set_output(Vec::new());
            return FilterResult::Done;
        }
        self.left -= 1;

        let step = TAU * self.freq / RATE;
        let out = t.output_mut();
        out.clear();
        for _ in 0..FRAMES {
            let s = (self.phase.sin() * i16::MAX as f32) as i16;
            out.extend_from_slice(&s.to_le_bytes());
            self.phase = (self.phase + step) % TAU;
        }
        FilterResult::Data
    }
}

/// Scales samples in place
struct Gain(f32);

impl Filter for Gain {
    fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult {
        let mut data = t.take_input();
        if data.is_empty() && t.flags().first {
            t.set_output(data);
            return FilterResult::Done;
        }
        for pair in data.chunks_exact_mut(2) {
            let s = i16::from_le_bytes([pair[0], pair[1]]) as f32 * self.0;
            let s = s.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            pair.copy_from_slice(&s.to_le_bytes());
        }
        t.set_output(data);
        FilterResult::Ok
    }
}

type Slot = Arc<Mutex<Option<io::Result<KcallOutput>>>>;

/// Writes everything it receives to a file, one kernel call at a time
struct FileSink {
    path: PathBuf,
    file: Option<Arc<File>>,
    offset: u64,
    held: Vec<u8>,
    slot: Slot,
    in_flight: bool,
}

impl FileSink {
    fn submit(&mut self, t: &mut TrackCtx<'_>, op: KcallOp) -> FilterResult {
        let track = t.track();
        let slot = Arc::clone(&self.slot);
        let kev = t.worker().kev_alloc(move |cx, kev, ev| {
            if let KevEvent::Completed(r) = ev {
                *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(r);
                cx.kev_free(kev);
                let _ = track.wake();
            }
        });
        let submitted = kev.and_then(|kev| {
            t.worker().kcall(kev, op).inspect_err(|_| {
                t.worker().kev_free(kev);
            })
        });
        match submitted {
            Ok(()) => {
                self.in_flight = true;
                FilterResult::Async
            }
            Err(e) => {
                error!(track = %t.track_id(), error = %e, "kernel call not submitted");
                FilterResult::Err(-1)
            }
        }
    }
}

impl Filter for FileSink {
    fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult {
        if self.in_flight {
            let Some(result) = self.slot.lock().unwrap_or_else(|p| p.into_inner()).take() else {
                return FilterResult::Async;
            };
            self.in_flight = false;
            match result {
                Ok(KcallOutput::Opened(f)) => self.file = Some(Arc::new(f)),
                Ok(KcallOutput::Written(n)) => self.offset += n as u64,
                Ok(KcallOutput::Synced) => {
                    t.set_output(self.offset.to_string());
                    return FilterResult::Done;
                }
                Ok(_) => {}
                Err(e) => return t.fail_io(&e),
            }
        }

        if self.held.is_empty() {
            self.held = t.take_input();
        }
        let Some(file) = self.file.clone() else {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            return self.submit(t, KcallOp::Open { path: self.path.clone(), options });
        };
        if !self.held.is_empty() {
            let data = std::mem::take(&mut self.held);
            return self.submit(t, KcallOp::Write { file, offset: self.offset, data });
        }
        if t.flags().first {
            // Upstream is exhausted
            return self.submit(t, KcallOp::Fsync { file });
        }
        FilterResult::More
    }
}

fn descriptors(args: &Args) -> [Arc<FilterDescriptor>; 3] {
    let chunks = args.chunks;
    let tone = FilterDescriptor::new("tone", move |o| {
        let freq = match o.param("freq") {
            Some(f) => f.parse().map_err(|_| FilterError::Config(format!("freq {f}")))?,
            None => 440.0,
        };
        Ok(Opened::Instance(Box::new(Tone { freq, phase: 0.0, left: chunks })))
    });

    let gain = args.gain;
    let gain = FilterDescriptor::new("gain", move |_| {
        // Unity gain is a no-op for this track
        if (gain - 1.0).abs() < f32::EPSILON {
            return Ok(Opened::Skip);
        }
        Ok(Opened::Instance(Box::new(Gain(gain))))
    });

    let sink = FilterDescriptor::new("file-sink", |o| {
        let path = o
            .param("path")
            .ok_or_else(|| FilterError::Config("path is required".into()))?;
        Ok(Opened::Instance(Box::new(FileSink {
            path: PathBuf::from(path),
            file: None,
            offset: 0,
            held: Vec::new(),
            slot: Arc::new(Mutex::new(None)),
            in_flight: false,
        })))
    });

    [tone, gain, sink]
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("pipeline: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&args.out) {
        eprintln!("pipeline: cannot create {}: {e}", args.out.display());
        return ExitCode::FAILURE;
    }

    let engine = match Engine::create(EngineConfig::from_env()) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "engine creation failed");
            return ExitCode::FAILURE;
        }
    };
    let chain = descriptors(&args);

    println!("=== trackline pipeline ===\n");
    let start = Instant::now();
    let mut tracks = Vec::with_capacity(args.tracks);
    for i in 0..args.tracks {
        let path = args.out.join(format!("track-{i}.raw"));
        let config = TrackConfig::new(format!("track-{i}"))
            .param("freq", (220 * (i + 1)).to_string())
            .param("path", path.display().to_string());

        let track = match engine.track_create(config) {
            Ok(t) => t,
            Err(e) => {
                error!(track = i, error = %e, "track creation failed");
                continue;
            }
        };
        let added = chain.iter().try_for_each(|d| track.filter(d, Position::Last));
        if let Err(e) = added.and_then(|_| track.start()) {
            error!(track = %track.id(), error = %e, "track setup failed");
            track.stop();
        }
        tracks.push(track);
    }

    let mut failed = 0;
    for track in &tracks {
        match track.wait(Some(Duration::from_secs(30))) {
            Some(report) => {
                let written = String::from_utf8_lossy(&report.output).into_owned();
                match &report.error {
                    None => println!(
                        "{:<10} {:?} on {} calls={} bytes={}",
                        report.name,
                        report.state,
                        track.worker(),
                        report.invocations,
                        written
                    ),
                    Some(e) => {
                        failed += 1;
                        println!("{:<10} failed: {e} (code {})", report.name, e.code());
                    }
                }
            }
            None => {
                failed += 1;
                println!("{:<10} timed out in {:?}", track.name(), track.current_filter());
                track.stop();
            }
        }
    }

    let stats = engine.stats();
    info!(
        elapsed = ?start.elapsed(),
        workers = stats.workers.len(),
        kcalls = stats.bridge.submitted,
        "all tracks done"
    );
    println!("\nOutput in {}", args.out.display());
    engine.destroy();

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
