//! The sampling core: per-thread CPU accounting, span correlation, the
//! per-pass stack walker, and the periodic collector that drives them.

pub mod collector;
pub mod events;
pub mod span_links;
pub mod stack_walker;
pub mod thread_time;

pub use collector::{
    ConfigError, MIN_INTERVAL_S, ServiceError, StackCollector, StackCollectorBuilder,
    profiler_thread_ids,
};
pub use events::{
    CollectingSink, EventSink, NullSink, SampleEvent, StackExceptionSampleEvent, StackSampleEvent,
};
pub use span_links::{Span, SpanStartCallback, ThreadSpanLinks, Tracer};
pub use stack_walker::{WalkConfig, collect};
pub use thread_time::ThreadTime;

/// What the sampling core can do on the current platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// Per-thread CPU clocks are available; otherwise CPU time is the
    /// process-wide split.
    pub cpu_time: bool,
    /// Pending-error enumeration is available.
    pub stack_exceptions: bool,
}

/// Report platform capabilities.
pub fn features() -> Features {
    Features {
        cpu_time: cfg!(target_os = "linux"),
        stack_exceptions: true,
    }
}
