//! One sampling pass: freeze the runtime's thread table, capture every
//! live thread's frame chain and pending error, then attribute CPU time
//! and span context to the captured references.

use crate::framing;
use crate::runtime::{ErrorState, FrameNode, Runtime, ThreadIdentity};
use crate::sampler::collector;
use crate::sampler::events::{StackExceptionSampleEvent, StackSampleEvent};
use crate::sampler::span_links::ThreadSpanLinks;
use crate::sampler::thread_time::ThreadTime;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Per-pass parameters, fixed by the collector.
pub struct WalkConfig {
    /// Exclude the profiler's own sampler threads from the live set.
    pub ignore_profiler: bool,
    /// Truncation limit for emitted frame lists.
    pub max_nframes: usize,
    /// The sampling interval currently in force, in seconds.
    pub interval_s: f64,
    /// Monotonic time since the previous pass started.
    pub wall_time_ns: u64,
}

/// Run one pass over `runtime` and return the stack and exception events
/// it produced. Holds no state between calls; CPU accounting lives in
/// `thread_time`.
pub fn collect(
    runtime: &Runtime,
    thread_time: &mut ThreadTime,
    span_links: Option<&ThreadSpanLinks>,
    config: &WalkConfig,
) -> (Vec<StackSampleEvent>, Vec<StackExceptionSampleEvent>) {
    // Every thread captured below must stay alive until this guard drops:
    // the CPU clock lookups in step 8 happen after the table mutex is
    // released and are only safe against live pthreads.
    let _pinned = runtime.pin_live_threads();

    // Steps 1-3: freeze, enumerate, release. While the table is frozen
    // this loop does nothing but load the published slots and collect the
    // references; the captured chains stay alive on their own refcounts.
    let mut stack_refs: Vec<(u64, Arc<FrameNode>)> = Vec::new();
    let mut exc_refs: Vec<(u64, Arc<ErrorState>)> = Vec::new();
    let mut frozen = true;
    match runtime.try_freeze() {
        Some(table) => {
            for (&tid, state) in table.iter() {
                if let Some(frame) = state.current_frame.load_full() {
                    stack_refs.push((tid, frame));
                }
                if let Some(error) = state.pending_error.load_full()
                    && error.traceback.is_some()
                {
                    exc_refs.push((tid, error));
                }
            }
        }
        None => {
            // Table contended: best-effort frames snapshot, no exception
            // enumeration this pass.
            stack_refs = runtime.current_frames();
            frozen = false;
        }
    }
    if !frozen {
        log::debug!("thread table contended; sampled frames without exceptions");
    }

    // Step 4: the live set covers every enumerated thread, whether it
    // surfaced a frame, a pending error, or both.
    let mut live: HashSet<u64> = stack_refs.iter().map(|(tid, _)| *tid).collect();
    live.extend(exc_refs.iter().map(|(tid, _)| *tid));

    // Step 5: prune span links down to live threads.
    if let Some(links) = span_links {
        links.clear_threads(&live);
    }

    // Step 6: drop our own sampler threads.
    if config.ignore_profiler {
        for tid in collector::profiler_thread_ids() {
            live.remove(&tid);
        }
    }

    // Step 7: resolve identities for whoever is left.
    let identities: HashMap<u64, ThreadIdentity> = live
        .iter()
        .map(|&tid| (tid, runtime.thread_identity(tid)))
        .collect();

    // Step 8: charge CPU time, strictly after frame capture.
    let native_ids: HashMap<u64, u64> = identities
        .values()
        .map(|id| (id.runtime_tid, id.native_id))
        .collect();
    let cpu_time = thread_time.delta(&native_ids);

    let sampling_period_ns = (config.interval_s * 1e9).round() as u64;

    // Step 9: stack events.
    let mut stack_events = Vec::with_capacity(stack_refs.len());
    for (tid, frame) in &stack_refs {
        let Some(identity) = identities.get(tid) else {
            continue;
        };
        let trace_ids: BTreeSet<u64> = match span_links {
            Some(links) => links
                .leaf_spans(*tid)
                .iter()
                .map(|span| span.trace_id())
                .collect(),
            None => BTreeSet::new(),
        };
        let (frames, nframes) = framing::framify(frame, config.max_nframes);
        stack_events.push(StackSampleEvent {
            thread_id: *tid,
            thread_native_id: identity.native_id,
            thread_name: identity.name.clone(),
            trace_ids,
            frames,
            nframes,
            wall_time_ns: config.wall_time_ns,
            cpu_time_ns: cpu_time.get(tid).copied().unwrap_or(0),
            sampling_period_ns,
        });
    }

    // Step 10: exception events.
    let mut exception_events = Vec::with_capacity(exc_refs.len());
    for (tid, error) in &exc_refs {
        let Some(identity) = identities.get(tid) else {
            continue;
        };
        let Some(traceback) = error.traceback.as_ref() else {
            continue;
        };
        let (frames, nframes) = framing::traceback_framify(traceback, config.max_nframes);
        exception_events.push(StackExceptionSampleEvent {
            thread_id: *tid,
            thread_native_id: identity.native_id,
            thread_name: identity.name.clone(),
            frames,
            nframes,
            sampling_period_ns,
            exc_type: error.exc_type,
        });
    }

    (stack_events, exception_events)
}
