//! Worker services: tasks, kernel event slots, kernel calls, timers

mod common;

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{engine, probe, run, Log, WAIT};
use trackline::prelude::*;
use trackline::{current_worker_id, Assign, Interest, KcallStart, TrackError, WorkerId};

#[test]
fn test_task_post_is_idempotent() {
    let e = engine(1);
    let worker = e.worker(WorkerId::ZERO).unwrap();
    let (tx, rx) = mpsc::channel();

    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let inner = Task::new("counted", move |_| {
        let n = r.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = tx.send(n);
    });

    // Post twice from the worker itself so no drain can run in between
    let again = inner.clone();
    let (ptx, prx) = mpsc::channel();
    let outer = Task::new("poster", move |cx| {
        let first = cx.task(&again).unwrap();
        let second = cx.task(&again).unwrap();
        let _ = ptx.send((first, second));
    });
    worker.post(&outer).unwrap();

    assert_eq!(prx.recv_timeout(Duration::from_secs(5)).unwrap(), (true, false));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    // Fired tasks are reusable
    assert!(worker.post(&inner).unwrap());
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cancelled_task_does_not_run() {
    let e = engine(1);
    let worker = e.worker(WorkerId::ZERO).unwrap();
    let (tx, rx) = mpsc::channel();

    let victim = Task::new("victim", move |_| {
        let _ = tx.send("victim");
    });
    let v = victim.clone();
    let (dtx, drx) = mpsc::channel();
    let canceller = Task::new("canceller", move |cx| {
        cx.task(&v).unwrap();
        let _ = dtx.send(cx.cancel_task(&v));
    });
    worker.post(&canceller).unwrap();

    assert!(drx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(!victim.is_queued());
}

#[test]
fn test_stale_slot_completion_dropped() {
    let e = engine(1);
    let worker = e.worker(WorkerId::ZERO).unwrap();
    let stale_hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let hits = Arc::clone(&stale_hits);
    let task = Task::new("reuse", move |cx| {
        let hits = Arc::clone(&hits);
        let old = cx
            .kev_alloc(move |_, _, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        cx.kcall(old, KcallOp::Call(Box::new(|| -> io::Result<usize> { Ok(7) }))).unwrap();
        assert!(cx.kev_free(old));
        assert!(!cx.kev_live(old));

        let tx = tx.clone();
        let new = cx
            .kev_alloc(move |cx, kev, ev| {
                if let KevEvent::Completed(Ok(KcallOutput::Value(v))) = ev {
                    let _ = tx.send((kev, v));
                }
                cx.kev_free(kev);
            })
            .unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert!(cx.kev_live(new) && !cx.kev_live(old));
        cx.kcall(new, KcallOp::Call(Box::new(|| -> io::Result<usize> { Ok(9) }))).unwrap();
    });
    worker.post(&task).unwrap();

    let (kev, value) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(value, 9);
    assert_eq!(kev.index(), 0);
    assert_eq!(stale_hits.load(Ordering::SeqCst), 0);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_inline_kcall_full_ring_is_recoverable() {
    let e = Engine::create(
        EngineConfig::new()
            .workers(WorkerCount::One)
            .kcall_threads(0)
            .kcall_queue_depth(1),
    )
    .unwrap();
    let worker = e.worker(WorkerId::ZERO).unwrap();
    let (tx, rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let second_ran = Arc::new(AtomicUsize::new(0));

    let ran = Arc::clone(&second_ran);
    let task = Task::new("burst", move |cx| {
        let done_tx = done_tx.clone();
        let kev = cx
            .kev_alloc(move |cx, kev, ev| {
                if let KevEvent::Completed(Ok(KcallOutput::Value(v))) = ev {
                    let _ = done_tx.send(v);
                }
                cx.kev_free(kev);
            })
            .unwrap();
        let first = cx.kcall(kev, KcallOp::Call(Box::new(|| -> io::Result<usize> { Ok(1) })));
        let ran = Arc::clone(&ran);
        let second = cx.kcall(
            kev,
            KcallOp::Call(Box::new(move || -> io::Result<usize> {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })),
        );
        let full = matches!(
            second,
            Err(trackline::EngineError::Capacity(trackline::Resource::KcallQueue))
        );
        let _ = tx.send((first.is_ok(), full));
    });
    worker.post(&task).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (true, true));
    // The rejected call never ran; the accepted one still completes
    assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    drop(e);
}

#[test]
fn test_kev_alloc_back_pressure() {
    let e = Engine::create(
        EngineConfig::new()
            .workers(WorkerCount::One)
            .kcall_threads(0)
            .max_kevs(2),
    )
    .unwrap();
    let worker = e.worker(WorkerId::ZERO).unwrap();
    let (tx, rx) = mpsc::channel();

    let task = Task::new("fill", move |cx| {
        let a = cx.kev_alloc(|_, _, _| {}).is_ok();
        let b = cx.kev_alloc(|_, _, _| {}).is_ok();
        let c = cx.kev_alloc(|_, _, _| {});
        let full = matches!(
            c,
            Err(trackline::EngineError::Capacity(trackline::Resource::Kevs))
        );
        let _ = tx.send((a, b, full, cx.kevs_in_use()));
    });
    worker.post(&task).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (true, true, true, 2));
}

#[test]
fn test_readiness_reaches_handler() {
    let e = engine(1);
    let worker = e.worker(WorkerId::ZERO).unwrap();
    let (mut reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
    let (tx, rx) = mpsc::channel();

    let fd = writer.as_raw_fd();
    let task = Task::new("attach", move |cx| {
        let tx = tx.clone();
        let kev = cx
            .kev_alloc(move |cx, kev, ev| {
                if let KevEvent::Writable = ev {
                    let _ = tx.send(cx.id());
                    cx.kev_free(kev);
                }
            })
            .unwrap();
        cx.kq_attach(kev, fd, Interest::WRITABLE).unwrap();
    });
    worker.post(&task).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), WorkerId::ZERO);
    drop(writer);
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

/// Writes its input to a file through the kernel call bridge
struct FileSink {
    file: Arc<File>,
    offset: u64,
    result: Arc<Mutex<Option<io::Result<KcallOutput>>>>,
    in_flight: bool,
}

impl Filter for FileSink {
    fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult {
        if self.in_flight {
            let Some(result) = self.result.lock().unwrap().take() else {
                // Spurious wake
                return FilterResult::Async;
            };
            self.in_flight = false;
            match result {
                Ok(KcallOutput::Written(n)) => self.offset += n as u64,
                Ok(other) => panic!("unexpected {other:?}"),
                Err(e) => return t.fail_io(&e),
            }
            return if t.flags().first { FilterResult::Done } else { FilterResult::More };
        }

        let data = t.take_input();
        if data.is_empty() {
            return if t.flags().first { FilterResult::Done } else { FilterResult::More };
        }
        let track = t.track();
        let slot = Arc::clone(&self.result);
        let kev = t
            .worker()
            .kev_alloc(move |cx, kev, ev| {
                if let KevEvent::Completed(r) = ev {
                    *slot.lock().unwrap() = Some(r);
                    cx.kev_free(kev);
                    let _ = track.wake();
                }
            })
            .unwrap();
        let op = KcallOp::Write { file: Arc::clone(&self.file), offset: self.offset, data };
        t.worker().kcall(kev, op).unwrap();
        self.in_flight = true;
        FilterResult::Async
    }
}

fn write_through_bridge(kcall_threads: usize) {
    let e = Engine::create(
        EngineConfig::new()
            .workers(WorkerCount::Fixed(2))
            .kcall_threads(kcall_threads)
            .kcall_start(KcallStart::Lazy),
    )
    .unwrap();
    let log = Log::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.raw");
    let file = Arc::new(File::create(&path).unwrap());

    let src = probe("src", &log, || {
        let mut chunks = vec![b"world".to_vec(), b"hello ".to_vec()];
        move |t: &mut TrackCtx<'_>| match chunks.pop() {
            Some(chunk) => {
                t.set_output(chunk);
                FilterResult::Data
            }
            None => {
                t.set_output(Vec::new());
                FilterResult::Done
            }
        }
    });
    let sink = FilterDescriptor::new("sink", move |_| {
        Ok(Opened::Instance(Box::new(FileSink {
            file: Arc::clone(&file),
            offset: 0,
            result: Arc::new(Mutex::new(None)),
            in_flight: false,
        })))
    });

    let report = run(&e, TrackConfig::new("write"), &[src, sink]);
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(std::fs::read(&path).unwrap(), b"hello world");

    let stats = e.stats();
    if kcall_threads > 0 {
        assert_eq!(stats.bridge.submitted, 2);
        assert_eq!(stats.bridge.completed, 2);
        assert!(e.bridge().is_started());
    } else {
        assert_eq!(stats.bridge.submitted, 0);
        assert!(!e.bridge().is_started());
    }
}

#[test]
fn test_kcall_write_on_bridge() {
    write_through_bridge(2);
}

#[test]
fn test_kcall_write_inline() {
    write_through_bridge(0);
}

/// Filter driven by a closure, without open/close bookkeeping
struct FnFilter<F>(F);

impl<F> Filter for FnFilter<F>
where
    F: FnMut(&mut TrackCtx<'_>) -> FilterResult + Send,
{
    fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult {
        (self.0)(t)
    }
}

#[test]
fn test_kcall_error_reaches_filter() {
    let e = engine(1);
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing").join("file");
    let errno = File::open(&missing).unwrap_err().raw_os_error();

    let opener = FilterDescriptor::new("opener", move |_| {
        let path = missing.clone();
        let result: Arc<Mutex<Option<io::Result<KcallOutput>>>> = Arc::new(Mutex::new(None));
        let mut sent = false;
        Ok(Opened::Instance(Box::new(FnFilter(move |t: &mut TrackCtx<'_>| {
            if sent {
                return match result.lock().unwrap().take() {
                    Some(Err(e)) => t.fail_io(&e),
                    Some(Ok(_)) => FilterResult::Done,
                    None => FilterResult::Async,
                };
            }
            sent = true;
            let track = t.track();
            let slot = Arc::clone(&result);
            let kev = t
                .worker()
                .kev_alloc(move |cx, kev, ev| {
                    if let KevEvent::Completed(r) = ev {
                        *slot.lock().unwrap() = Some(r);
                        cx.kev_free(kev);
                        let _ = track.wake();
                    }
                })
                .unwrap();
            let mut options = std::fs::OpenOptions::new();
            options.read(true);
            t.worker().kcall(kev, KcallOp::Open { path: path.clone(), options }).unwrap();
            FilterResult::Async
        }))))
    });

    let report = run(&e, TrackConfig::new("missing"), &[opener]);
    assert_eq!(
        report.error,
        Some(TrackError::System { filter: "opener", errno: errno.unwrap() })
    );
}

#[test]
fn test_timer_resumes_track() {
    let e = engine(1);
    let log = Log::default();
    let delay = Duration::from_millis(30);

    let sleeper = probe("sleeper", &log, move || {
        let mut started: Option<Instant> = None;
        move |t: &mut TrackCtx<'_>| match started {
            None => {
                started = Some(Instant::now());
                let track = t.track();
                t.worker()
                    .timer(Timer::new(), Interval::Once(delay), move |_| {
                        let _ = track.wake();
                    })
                    .unwrap();
                FilterResult::Async
            }
            Some(at) => {
                t.set_output(at.elapsed().as_millis().to_le_bytes().to_vec());
                FilterResult::Done
            }
        }
    });

    let report = run(&e, TrackConfig::new("timer"), &[sleeper]);
    assert!(report.error.is_none());
    let mut ms = [0u8; 16];
    ms.copy_from_slice(&report.output);
    // Deadlines count from the worker's cached loop time
    assert!(u128::from_le_bytes(ms) + 5 >= delay.as_millis());
}

#[test]
fn test_periodic_timer_until_removed() {
    let e = engine(1);
    let worker = e.worker(WorkerId::ZERO).unwrap();
    let (tx, rx) = mpsc::channel();

    let task = Task::new("arm", move |cx| {
        let timer = Timer::new();
        let tx = tx.clone();
        let mut fired = 0;
        cx.timer(timer, Interval::from_millis(5), move |cx| {
            fired += 1;
            let _ = tx.send(fired);
            if fired == 3 {
                cx.cancel_timer(timer);
            }
        })
        .unwrap();
    });
    worker.post(&task).unwrap();

    for want in 1..=3 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), want);
    }
    assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
}

#[test]
fn test_tracks_stay_on_their_worker() {
    const TRACKS: usize = 4;
    let e = engine(TRACKS + 1);
    let violations = Arc::new(AtomicUsize::new(0));
    let log = Log::default();

    let handles: Vec<_> = (0..TRACKS)
        .map(|i| {
            let bad = Arc::clone(&violations);
            let src = probe("src", &log, move || {
                let bad = Arc::clone(&bad);
                let mut home: Option<thread::ThreadId> = None;
                let mut n = 0u32;
                move |t: &mut TrackCtx<'_>| {
                    let me = thread::current().id();
                    if *home.get_or_insert(me) != me
                        || current_worker_id() != Some(t.track().worker())
                        || t.worker().id() != t.track().worker()
                    {
                        bad.fetch_add(1, Ordering::SeqCst);
                    }
                    n += 1;
                    if n > 200 {
                        t.set_output(Vec::new());
                        return FilterResult::Done;
                    }
                    t.set_output(n.to_le_bytes().to_vec());
                    FilterResult::Data
                }
            });
            let sink = probe("sink", &log, || {
                |t: &mut TrackCtx<'_>| {
                    if t.flags().first {
                        FilterResult::Done
                    } else {
                        FilterResult::More
                    }
                }
            });
            let track = e
                .track_create(TrackConfig::new(format!("iso-{i}")).assign(Assign::LeastBusy))
                .unwrap();
            track.filter(&src, Position::Last).unwrap();
            track.filter(&sink, Position::Last).unwrap();
            track
        })
        .collect();

    let mut workers: Vec<WorkerId> = handles.iter().map(|t| t.worker()).collect();
    workers.sort_by_key(|w| w.as_u32());
    workers.dedup();
    assert_eq!(workers.len(), TRACKS);

    for t in &handles {
        t.start().unwrap();
    }
    for t in &handles {
        let report = t.wait(WAIT).unwrap();
        assert!(report.error.is_none());
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(e.stats().workers.iter().all(|w| w.jobs == 0));
}

#[test]
fn test_many_tracks_close_exactly_once() {
    let e = engine(3);
    let log = Log::default();
    let closes = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let fail = i % 3 == 0;
            let a = probe("a", &log, || {
                |t: &mut TrackCtx<'_>| {
                    t.set_output(b"z".to_vec());
                    FilterResult::Data
                }
            });
            let b = probe("b", &log, move || {
                move |t: &mut TrackCtx<'_>| {
                    if fail {
                        FilterResult::Err(-5)
                    } else {
                        let data = t.take_input();
                        t.set_output(data);
                        FilterResult::Done
                    }
                }
            });
            let c = Arc::clone(&closes);
            let config = TrackConfig::new(format!("t{i}")).on_close(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
            let track = e.track_create(config).unwrap();
            track.filter(&a, Position::Last).unwrap();
            track.filter(&b, Position::Last).unwrap();
            track.start().unwrap();
            track
        })
        .collect();

    for t in &handles {
        t.wait(WAIT).unwrap();
    }
    assert_eq!(closes.load(Ordering::SeqCst), 32);
    assert_eq!(log.with_prefix("open").len(), 64);
    assert_eq!(log.with_prefix("close").len(), 64);
    assert_eq!(e.live_tracks(), 0);
}
