//! The long-running sampler service.
//!
//! A dedicated OS thread repeatedly runs a sampling pass, measures its own
//! cost, and stretches the following sleep so profiling stays at or under
//! the configured fraction of wall time. It is a real thread, never an
//! async task: it must keep sampling even when the application is not
//! yielding.

use crate::runtime::Runtime;
use crate::sampler::events::{EventSink, SampleEvent};
use crate::sampler::span_links::{SpanStartCallback, ThreadSpanLinks, Tracer};
use crate::sampler::stack_walker::{self, WalkConfig};
use crate::sampler::thread_time::{ThreadTime, monotonic_ns};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Lower bound on the inter-pass sleep, in seconds.
pub const MIN_INTERVAL_S: f64 = 0.01;

const SAMPLER_THREAD_NAME: &str = "stackpulse-sampler";

/// Runtime thread ids of every live sampler thread in the process.
/// Written on sampler start/stop, read during each pass.
static PROFILER_TIDS: LazyLock<Mutex<HashSet<u64>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Snapshot of the profiler's own thread ids. Threads in this set are
/// excluded from sampling when `ignore_profiler` is set.
pub fn profiler_thread_ids() -> HashSet<u64> {
    PROFILER_TIDS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Membership in [`PROFILER_TIDS`] for exactly as long as the sampler
/// thread runs, even if the loop unwinds through a panicking sink.
struct ProfilerTidGuard {
    tid: u64,
}

impl ProfilerTidGuard {
    fn register(tid: u64) -> Self {
        PROFILER_TIDS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tid);
        Self { tid }
    }
}

impl Drop for ProfilerTidGuard {
    fn drop(&mut self) {
        PROFILER_TIDS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.tid);
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_time_usage_pct must be within (0, 100], got {0}")]
    InvalidTimeUsagePct(f64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("collector is already running")]
    AlreadyRunning,
}

/// Sleep needed after a pass that cost `used_ns` so the pass amounts to at
/// most `max_time_usage_pct` of wall time: solving
/// `used / (used + sleep) = pct/100` for `sleep` gives
/// `used/(pct/100) - used`.
fn compute_interval(used_ns: u64, max_time_usage_pct: f64) -> f64 {
    let fraction = max_time_usage_pct / 100.0;
    ((used_ns as f64 / fraction - used_ns as f64) / 1e9).max(MIN_INTERVAL_S)
}

/// Cooperative stop flag with an interruptible sleep.
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    /// Sleep up to `timeout`; returns true if stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap();
        let (guard, _timeout_result) = self
            .condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap();
        *guard
    }
}

/// Configures and builds a [`StackCollector`].
pub struct StackCollectorBuilder {
    max_time_usage_pct: f64,
    max_nframes: usize,
    ignore_profiler: bool,
    tracer: Option<Arc<dyn Tracer>>,
}

impl StackCollectorBuilder {
    fn new() -> Self {
        Self {
            max_time_usage_pct: 2.0,
            max_nframes: 64,
            ignore_profiler: true,
            tracer: None,
        }
    }

    /// Upper bound on the sampler's duty cycle, in percent. Must be within
    /// `(0, 100]`.
    pub fn with_max_time_usage_pct(mut self, pct: f64) -> Self {
        self.max_time_usage_pct = pct;
        self
    }

    pub fn with_max_nframes(mut self, max_nframes: usize) -> Self {
        self.max_nframes = max_nframes;
        self
    }

    /// Whether the profiler's own sampler threads are excluded from
    /// samples. Defaults to true.
    pub fn with_ignore_profiler(mut self, ignore_profiler: bool) -> Self {
        self.ignore_profiler = ignore_profiler;
        self
    }

    /// Correlate samples with spans from this tracer. The collector
    /// registers a span-start callback on `start` and deregisters it on
    /// `stop`.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn build(
        self,
        runtime: Arc<Runtime>,
        sink: Arc<dyn EventSink>,
    ) -> Result<StackCollector, ConfigError> {
        if !(self.max_time_usage_pct > 0.0 && self.max_time_usage_pct <= 100.0) {
            return Err(ConfigError::InvalidTimeUsagePct(self.max_time_usage_pct));
        }
        Ok(StackCollector {
            runtime,
            sink,
            tracer: self.tracer,
            max_time_usage_pct: self.max_time_usage_pct,
            max_nframes: self.max_nframes,
            ignore_profiler: self.ignore_profiler,
            running: Mutex::new(None),
        })
    }
}

struct RunningState {
    stop: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

/// The periodic collector: owns the sampler thread and, while running,
/// the ThreadTime cache and span links.
pub struct StackCollector {
    runtime: Arc<Runtime>,
    sink: Arc<dyn EventSink>,
    tracer: Option<Arc<dyn Tracer>>,
    max_time_usage_pct: f64,
    max_nframes: usize,
    ignore_profiler: bool,
    running: Mutex<Option<RunningState>>,
}

impl StackCollector {
    pub fn builder() -> StackCollectorBuilder {
        StackCollectorBuilder::new()
    }

    /// Launch the sampler thread. Fails if the collector is already
    /// running; a stopped collector can be started again.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let span_links = self.tracer.as_ref().map(|tracer| {
            let links = Arc::new(ThreadSpanLinks::new());
            let callback_links = links.clone();
            let callback: SpanStartCallback =
                Arc::new(move |span| callback_links.link_span(span));
            tracer.on_start_span(callback);
            links
        });

        let stop = Arc::new(StopSignal::new());
        let task = SamplerTask {
            runtime: self.runtime.clone(),
            sink: self.sink.clone(),
            span_links,
            stop: stop.clone(),
            thread_time: ThreadTime::new(),
            max_time_usage_pct: self.max_time_usage_pct,
            max_nframes: self.max_nframes,
            ignore_profiler: self.ignore_profiler,
        };
        let thread = std::thread::Builder::new()
            .name(SAMPLER_THREAD_NAME.into())
            .spawn(move || task.run())
            .expect("failed to spawn sampler thread");

        log::debug!(
            "stack collector started (max_time_usage_pct={}, max_nframes={})",
            self.max_time_usage_pct,
            self.max_nframes
        );
        *running = Some(RunningState { stop, thread });
        Ok(())
    }

    /// Stop the sampler thread and join it. Idempotent; safe to call on a
    /// collector that never started.
    pub fn stop(&self) {
        let state = self.running.lock().unwrap().take();
        let Some(state) = state else {
            return;
        };
        state.stop.stop();
        let _ = state.thread.join();
        if let Some(tracer) = &self.tracer {
            tracer.deregister_on_start_span();
        }
        log::debug!("stack collector stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }
}

impl Drop for StackCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the sampler thread owns for its lifetime.
struct SamplerTask {
    runtime: Arc<Runtime>,
    sink: Arc<dyn EventSink>,
    span_links: Option<Arc<ThreadSpanLinks>>,
    stop: Arc<StopSignal>,
    thread_time: ThreadTime,
    max_time_usage_pct: f64,
    max_nframes: usize,
    ignore_profiler: bool,
}

impl SamplerTask {
    fn run(mut self) {
        // The sampler is itself a hosted thread, so turning
        // `ignore_profiler` off makes the profiler observable.
        let handle = self.runtime.register_current(SAMPLER_THREAD_NAME);
        let _profiler_tid = ProfilerTidGuard::register(handle.runtime_tid());
        let _loop_frame = handle.enter("sampler_loop");

        let mut interval_s = MIN_INTERVAL_S;
        let mut last_wall = monotonic_ns();

        while !self.stop.is_stopped() {
            let pass_start = monotonic_ns();
            let wall_time_ns = pass_start - last_wall;
            last_wall = pass_start;

            let (stacks, exceptions) = stack_walker::collect(
                &self.runtime,
                &mut self.thread_time,
                self.span_links.as_deref(),
                &WalkConfig {
                    ignore_profiler: self.ignore_profiler,
                    max_nframes: self.max_nframes,
                    interval_s,
                    wall_time_ns,
                },
            );

            let used_ns = monotonic_ns() - pass_start;
            interval_s = compute_interval(used_ns, self.max_time_usage_pct);

            let mut batch: Vec<SampleEvent> =
                Vec::with_capacity(stacks.len() + exceptions.len());
            batch.extend(stacks.into_iter().map(SampleEvent::Stack));
            batch.extend(exceptions.into_iter().map(SampleEvent::Exception));
            if !batch.is_empty() {
                self.sink.accept(batch);
            }

            if self.stop.wait(Duration::from_secs_f64(interval_s)) {
                break;
            }
        }
    }
}
