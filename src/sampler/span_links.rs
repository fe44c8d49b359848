//! Thread-to-span correlation.
//!
//! An external tracer calls [`ThreadSpanLinks::link_span`] from every
//! thread that starts a span; the sampler asks for the unfinished *leaf*
//! spans of each thread it samples. Spans are held weakly so the profiler
//! never extends a span's lifetime: once the tracer drops its last strong
//! reference, the span vanishes from the mapping.

use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A tracing span as consumed by the profiler: a trace id, a finished
/// flag, and an optional parent.
#[derive(Debug)]
pub struct Span {
    trace_id: u64,
    span_id: u64,
    parent: Option<Arc<Span>>,
    finished: AtomicBool,
}

impl Span {
    pub fn new(trace_id: u64, span_id: u64) -> Arc<Self> {
        Arc::new(Self {
            trace_id,
            span_id,
            parent: None,
            finished: AtomicBool::new(false),
        })
    }

    /// A child span in the same trace.
    pub fn child(self: &Arc<Self>, span_id: u64) -> Arc<Self> {
        Arc::new(Self {
            trace_id: self.trace_id,
            span_id,
            parent: Some(self.clone()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    pub fn parent(&self) -> Option<&Arc<Span>> {
        self.parent.as_ref()
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Callback the profiler registers with the tracer; invoked synchronously
/// on each span start, from the thread that started the span.
pub type SpanStartCallback = Arc<dyn Fn(&Arc<Span>) + Send + Sync>;

/// The consumed tracer contract.
pub trait Tracer: Send + Sync {
    fn on_start_span(&self, callback: SpanStartCallback);
    fn deregister_on_start_span(&self);
}

/// Concurrency-safe mapping from thread id to that thread's currently
/// active spans.
///
/// The mutex protects only map and set mutation. Span state (`finished`,
/// `parent`) is inspected on a local snapshot, outside the lock.
pub struct ThreadSpanLinks {
    links: Mutex<HashMap<u64, Vec<Weak<Span>>>>,
}

impl ThreadSpanLinks {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `span` to the calling thread. Dead weaks accumulated on the
    /// same thread are pruned on the way in.
    pub fn link_span(&self, span: &Arc<Span>) {
        self.link_span_for(crate::runtime::current_runtime_thread_id(), span);
    }

    pub(crate) fn link_span_for(&self, tid: u64, span: &Arc<Span>) {
        let mut links = self.links.lock().unwrap();
        let set = links.entry(tid).or_default();
        set.retain(|weak| weak.strong_count() > 0);
        let weak = Arc::downgrade(span);
        if !set.iter().any(|existing| existing.ptr_eq(&weak)) {
            set.push(weak);
        }
    }

    /// Drop entries for threads not in `live`, and dead weaks everywhere
    /// else. Idempotent.
    pub fn clear_threads(&self, live: &HashSet<u64>) {
        let mut links = self.links.lock().unwrap();
        links.retain(|tid, set| {
            if !live.contains(tid) {
                return false;
            }
            set.retain(|weak| weak.strong_count() > 0);
            !set.is_empty()
        });
    }

    /// The unfinished leaf spans on `tid`: spans with no unfinished child
    /// in the current link set. The sample belongs to the deepest
    /// in-flight work, so an unfinished span's parent is never a leaf.
    pub fn leaf_spans(&self, tid: u64) -> Vec<Arc<Span>> {
        let snapshot: SmallVec<[Weak<Span>; 4]> = {
            let links = self.links.lock().unwrap();
            match links.get(&tid) {
                Some(set) => set.iter().cloned().collect(),
                None => return Vec::new(),
            }
        };
        // Strong references held locally from here on; the lock is not.
        let spans: SmallVec<[Arc<Span>; 4]> =
            snapshot.iter().filter_map(Weak::upgrade).collect();

        let mut keep: HashSet<*const Span> = spans.iter().map(Arc::as_ptr).collect();
        for span in &spans {
            if !span.finished()
                && let Some(parent) = span.parent()
            {
                keep.remove(&Arc::as_ptr(parent));
            }
        }
        spans
            .into_iter()
            .filter(|span| !span.finished() && keep.contains(&Arc::as_ptr(span)))
            .collect()
    }

    #[cfg(test)]
    fn linked_thread_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl Default for ThreadSpanLinks {
    fn default() -> Self {
        Self::new()
    }
}
