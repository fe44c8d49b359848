//! Event records produced by sampling passes, and the sink they flow to.
//!
//! The `Serialize` impls are a convenience for writing events to JSON.
//! They do not define a wire format.

use crate::framing::Frame;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// One stack sample for one live thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackSampleEvent {
    pub thread_id: u64,
    pub thread_native_id: u64,
    pub thread_name: String,
    /// Trace ids of the thread's unfinished leaf spans at sample time.
    pub trace_ids: BTreeSet<u64>,
    pub frames: Vec<Frame>,
    /// Total stack depth; `frames` is truncated to the configured limit.
    pub nframes: usize,
    #[serde(rename = "wall_ns")]
    pub wall_time_ns: u64,
    #[serde(rename = "cpu_ns")]
    pub cpu_time_ns: u64,
    #[serde(rename = "period_ns")]
    pub sampling_period_ns: u64,
}

/// One sample of a thread's topmost in-flight error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackExceptionSampleEvent {
    pub thread_id: u64,
    pub thread_native_id: u64,
    pub thread_name: String,
    pub frames: Vec<Frame>,
    pub nframes: usize,
    #[serde(rename = "period_ns")]
    pub sampling_period_ns: u64,
    pub exc_type: &'static str,
}

/// Typed union handed to the sink, one batch per sampling pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum SampleEvent {
    #[serde(rename = "stack")]
    Stack(StackSampleEvent),
    #[serde(rename = "exception")]
    Exception(StackExceptionSampleEvent),
}

impl SampleEvent {
    pub fn thread_id(&self) -> u64 {
        match self {
            SampleEvent::Stack(e) => e.thread_id,
            SampleEvent::Exception(e) => e.thread_id,
        }
    }

    pub fn thread_name(&self) -> &str {
        match self {
            SampleEvent::Stack(e) => &e.thread_name,
            SampleEvent::Exception(e) => &e.thread_name,
        }
    }

    pub fn sampling_period_ns(&self) -> u64 {
        match self {
            SampleEvent::Stack(e) => e.sampling_period_ns,
            SampleEvent::Exception(e) => e.sampling_period_ns,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, SampleEvent::Exception(_))
    }
}

/// Downstream consumer of sampled events. Implementations take ownership
/// of each batch; the sampler never inspects events after handoff.
pub trait EventSink: Send + Sync {
    fn accept(&self, batch: Vec<SampleEvent>);
}

/// Buffers batches in memory until drained. The default sink for tests
/// and embedders that pull rather than push.
pub struct CollectingSink {
    buffers: Mutex<Vec<Vec<SampleEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn drain(&self) -> Vec<Vec<SampleEvent>> {
        std::mem::take(&mut *self.buffers.lock().unwrap())
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CollectingSink {
    fn accept(&self, batch: Vec<SampleEvent>) {
        self.buffers.lock().unwrap().push(batch);
    }
}

/// Discards everything. Useful for overhead measurements.
pub struct NullSink;

impl EventSink for NullSink {
    fn accept(&self, _batch: Vec<SampleEvent>) {}
}
