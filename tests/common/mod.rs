#![allow(dead_code)] // each test binary uses a different subset

use stackpulse::runtime::Runtime;
use stackpulse::sampler::{Span, SpanStartCallback, Tracer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;

/// Minimal tracer honouring the consumed contract: the registered
/// callback fires synchronously on each span start, from the thread that
/// started the span.
pub struct TestTracer {
    callback: Mutex<Option<SpanStartCallback>>,
    next_span_id: AtomicU64,
}

impl TestTracer {
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            next_span_id: AtomicU64::new(1),
        }
    }

    #[allow(dead_code)]
    pub fn has_callback(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    pub fn start_span(&self, trace_id: u64) -> Arc<Span> {
        let span = Span::new(trace_id, self.next_span_id.fetch_add(1, Ordering::Relaxed));
        self.fire(&span);
        span
    }

    #[allow(dead_code)]
    pub fn start_child(&self, parent: &Arc<Span>) -> Arc<Span> {
        let span = parent.child(self.next_span_id.fetch_add(1, Ordering::Relaxed));
        self.fire(&span);
        span
    }

    fn fire(&self, span: &Arc<Span>) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(span);
        }
    }
}

impl Tracer for TestTracer {
    fn on_start_span(&self, callback: SpanStartCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn deregister_on_start_span(&self) {
        *self.callback.lock().unwrap() = None;
    }
}

/// A hosted thread that registered, published `frames`, and parked. It
/// stays sampleable until released.
pub struct Worker {
    pub tid: u64,
    release: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn stop(mut self) {
        let _ = self.release.send(());
        if let Some(join) = self.join.take() {
            join.join().unwrap();
        }
    }
}

pub fn parked_worker(
    runtime: &Arc<Runtime>,
    name: &'static str,
    frames: &'static [&'static str],
) -> Worker {
    let runtime = runtime.clone();
    let (tid_tx, tid_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let join = std::thread::spawn(move || {
        let handle = runtime.register_current(name);
        let mut guards = Vec::new();
        for &function in frames {
            guards.push(handle.enter(function));
        }
        tid_tx.send(handle.runtime_tid()).unwrap();
        release_rx.recv().unwrap();
    });
    Worker {
        tid: tid_rx.recv().unwrap(),
        release: release_tx,
        join: Some(join),
    }
}

/// Like [`parked_worker`] but spinning on the CPU instead of parking.
#[allow(dead_code)]
pub fn busy_worker(runtime: &Arc<Runtime>, name: &'static str) -> BusyWorker {
    let runtime = runtime.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let (tid_tx, tid_rx) = mpsc::channel();
    let join = std::thread::spawn(move || {
        let handle = runtime.register_current(name);
        let _frame = handle.enter("burn_cpu");
        tid_tx.send(handle.runtime_tid()).unwrap();
        let mut sum = 0u64;
        let mut i = 0u64;
        while !stop_flag.load(Ordering::Relaxed) {
            sum = sum.wrapping_add(i);
            std::hint::black_box(sum);
            i += 1;
        }
    });
    BusyWorker {
        tid: tid_rx.recv().unwrap(),
        stop,
        join: Some(join),
    }
}

pub struct BusyWorker {
    pub tid: u64,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl BusyWorker {
    #[allow(dead_code)]
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            join.join().unwrap();
        }
    }
}
