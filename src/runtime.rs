//! Host-runtime thread model: the thread table the sampler introspects.
//!
//! `Runtime` plays the role of the managed runtime hosting user threads.
//! Threads attach with [`Runtime::register_current`] and publish their
//! current call stack as a chain of refcounted frame nodes via RAII
//! [`FrameGuard`]s. The table of live threads is guarded by a mutex;
//! while the sampler holds it, no thread can register or retire, which is
//! what makes frame capture safe.
//!
//! Retirement is additionally gated by a second lock held shared for the
//! duration of a whole sampling pass: per-thread CPU clock lookups happen
//! *after* the table mutex is released, and looking up the CPU clock of a
//! destroyed pthread is undefined behaviour. A retiring thread blocks
//! until the in-flight pass has dropped every captured reference.

use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, TryLockError};

/// The host runtime's handle for the calling thread: its pthread.
///
/// This is also what the per-thread CPU clock lookup consumes, and it can
/// be recycled by the platform after a thread exits; [`ThreadTime`] pairs
/// it with the kernel tid for exactly that reason.
///
/// [`ThreadTime`]: crate::sampler::ThreadTime
pub fn current_runtime_thread_id() -> u64 {
    // SAFETY: pthread_self takes no arguments and always succeeds.
    (unsafe { libc::pthread_self() }) as u64
}

/// The kernel thread id of the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn current_native_thread_id() -> u64 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds; unsafe is
    // required because syscall() is a raw FFI function with no type checking.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

/// Stable per-thread hash standing in for a kernel tid on platforms that
/// do not expose one.
#[cfg(not(target_os = "linux"))]
pub(crate) fn current_native_thread_id() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

/// One level of a hosted thread's published call stack.
///
/// Nodes form a singly linked chain from the leaf to the root; the chain
/// stays alive as long as anything holds the leaf, so a sampling pass can
/// walk it after the thread table mutex has been released.
#[derive(Debug)]
pub struct FrameNode {
    pub(crate) function: &'static str,
    pub(crate) location: &'static Location<'static>,
    pub(crate) parent: Option<Arc<FrameNode>>,
}

/// A thread's topmost in-flight error, captured with the frame chain that
/// was current when it was recorded.
#[derive(Debug)]
pub(crate) struct ErrorState {
    pub(crate) exc_type: &'static str,
    pub(crate) traceback: Option<Arc<FrameNode>>,
}

/// Per-thread slots read by the sampler while the table is frozen.
/// Both are lock-free so enumeration never blocks on a hosted thread.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub(crate) current_frame: ArcSwapOption<FrameNode>,
    pub(crate) pending_error: ArcSwapOption<ErrorState>,
}

/// Resolved identity of a live thread, as it appears on emitted events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIdentity {
    pub runtime_tid: u64,
    pub native_id: u64,
    pub name: String,
}

struct DirectoryEntry {
    name: String,
    native_id: u64,
}

/// The host runtime: a table of live threads plus a user-facing directory
/// of their names and native ids.
pub struct Runtime {
    /// The thread-table mutex. Held by registration, retirement, and the
    /// sampler's enumeration step.
    table: Mutex<HashMap<u64, Arc<ThreadState>>>,
    /// Registered thread metadata. A thread can be live in `table` and
    /// absent here; identity resolution then falls back.
    directory: Mutex<HashMap<u64, DirectoryEntry>>,
    /// Held shared by a sampling pass, exclusively by thread retirement.
    retire: RwLock<()>,
    /// Recorded at construction so the bootstrap thread keeps its name
    /// even if it never appears in (or is evicted from) the directory.
    main_thread_id: u64,
}

impl Runtime {
    /// Create a runtime. The constructing thread is recorded as the
    /// bootstrap thread.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            directory: Mutex::new(HashMap::new()),
            retire: RwLock::new(()),
            main_thread_id: current_runtime_thread_id(),
        }
    }

    pub fn main_thread_id(&self) -> u64 {
        self.main_thread_id
    }

    /// Attach the calling thread to the runtime under `name`.
    ///
    /// The returned handle publishes frames and errors for the sampler and
    /// retires the thread when dropped. One handle per thread.
    pub fn register_current(self: &Arc<Self>, name: impl Into<String>) -> ThreadHandle {
        let runtime_tid = current_runtime_thread_id();
        let native_id = current_native_thread_id();
        let state = Arc::new(ThreadState::default());

        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(runtime_tid, state.clone());
        self.directory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                runtime_tid,
                DirectoryEntry {
                    name: name.into(),
                    native_id,
                },
            );

        ThreadHandle {
            runtime: self.clone(),
            runtime_tid,
            state,
            _not_send: PhantomData,
        }
    }

    /// Freeze the thread table without blocking. `None` means another
    /// thread is mid-registration or mid-retirement; callers fall back to
    /// [`Runtime::current_frames`].
    pub(crate) fn try_freeze(&self) -> Option<MutexGuard<'_, HashMap<u64, Arc<ThreadState>>>> {
        match self.table.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Best-effort snapshot of every thread's current frame. Blocks
    /// briefly on the table mutex; carries no exception information.
    pub(crate) fn current_frames(&self) -> Vec<(u64, Arc<FrameNode>)> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .iter()
            .filter_map(|(&tid, state)| state.current_frame.load_full().map(|frame| (tid, frame)))
            .collect()
    }

    /// Keep every currently live thread alive (and its CPU clock valid)
    /// until the returned guard is dropped. Retiring threads block on the
    /// write side.
    pub(crate) fn pin_live_threads(&self) -> RwLockReadGuard<'_, ()> {
        self.retire.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve the identity of `tid` against the directory.
    ///
    /// The bootstrap thread is always `"MainThread"`, whatever the
    /// directory says; a thread the directory does not know gets an
    /// anonymous name and its runtime id as native id.
    pub fn thread_identity(&self, tid: u64) -> ThreadIdentity {
        let directory = self.directory.lock().unwrap_or_else(|e| e.into_inner());
        let entry = directory.get(&tid);
        let native_id = entry.map_or(tid, |e| e.native_id);
        let name = if tid == self.main_thread_id {
            "MainThread".to_string()
        } else {
            entry.map_or_else(|| format!("Anonymous Thread {tid}"), |e| e.name.clone())
        };
        ThreadIdentity {
            runtime_tid: tid,
            native_id,
            name,
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// A hosted thread's attachment to the runtime. Not `Send`: frames and
/// errors are published from the owning thread only.
pub struct ThreadHandle {
    runtime: Arc<Runtime>,
    runtime_tid: u64,
    state: Arc<ThreadState>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadHandle {
    pub fn runtime_tid(&self) -> u64 {
        self.runtime_tid
    }

    /// Push a frame onto the published stack. The call site supplies the
    /// file and line; the frame pops when the guard drops. Guards nest and
    /// must drop in reverse order of creation, which ordinary scoping
    /// guarantees.
    #[track_caller]
    pub fn enter(&self, function: &'static str) -> FrameGuard<'_> {
        let parent = self.state.current_frame.load_full();
        let node = Arc::new(FrameNode {
            function,
            location: Location::caller(),
            parent: parent.clone(),
        });
        self.state.current_frame.store(Some(node));
        FrameGuard {
            state: &self.state,
            parent,
        }
    }

    /// Record an in-flight error of type `exc_type`, capturing the current
    /// frame chain as its traceback. The error clears when the guard
    /// drops. A thread has at most one pending error; recording another
    /// replaces it.
    pub fn record_error(&self, exc_type: &'static str) -> ErrorGuard<'_> {
        let traceback = self.state.current_frame.load_full();
        self.state.pending_error.store(Some(Arc::new(ErrorState {
            exc_type,
            traceback,
        })));
        ErrorGuard { state: &self.state }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // Wait out any in-flight sampling pass before the thread's CPU
        // clock becomes unreachable.
        let _retire = self.runtime.retire.write().unwrap_or_else(|e| e.into_inner());
        self.runtime
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.runtime_tid);
        self.runtime
            .directory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.runtime_tid);
    }
}

/// Pops its frame on drop, restoring the previous stack top.
pub struct FrameGuard<'a> {
    state: &'a Arc<ThreadState>,
    parent: Option<Arc<FrameNode>>,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.state.current_frame.store(self.parent.take());
    }
}

/// Clears the pending error on drop.
pub struct ErrorGuard<'a> {
    state: &'a Arc<ThreadState>,
}

impl Drop for ErrorGuard<'_> {
    fn drop(&mut self) {
        self.state.pending_error.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_retire() {
        let runtime = Arc::new(Runtime::new());
        let tid = {
            let handle = runtime.register_current("worker");
            let tid = handle.runtime_tid();
            assert!(runtime.try_freeze().unwrap().contains_key(&tid));
            tid
        };
        assert!(!runtime.try_freeze().unwrap().contains_key(&tid));
    }

    #[test]
    fn frame_guards_nest_and_pop() {
        let runtime = Arc::new(Runtime::new());
        let handle = runtime.register_current("worker");

        assert!(handle.state.current_frame.load_full().is_none());
        {
            let _outer = handle.enter("outer");
            let top = handle.state.current_frame.load_full().unwrap();
            assert_eq!(top.function, "outer");
            {
                let _inner = handle.enter("inner");
                let top = handle.state.current_frame.load_full().unwrap();
                assert_eq!(top.function, "inner");
                assert_eq!(top.parent.as_ref().unwrap().function, "outer");
            }
            let top = handle.state.current_frame.load_full().unwrap();
            assert_eq!(top.function, "outer");
        }
        assert!(handle.state.current_frame.load_full().is_none());
    }

    #[test]
    fn captured_chain_survives_pop() {
        let runtime = Arc::new(Runtime::new());
        let handle = runtime.register_current("worker");

        let captured = {
            let _outer = handle.enter("outer");
            let _inner = handle.enter("inner");
            handle.state.current_frame.load_full().unwrap()
        };
        // Both guards dropped; the captured chain is still walkable.
        assert_eq!(captured.function, "inner");
        assert_eq!(captured.parent.as_ref().unwrap().function, "outer");
        assert!(handle.state.current_frame.load_full().is_none());
    }

    #[test]
    fn error_guard_captures_traceback_and_clears() {
        let runtime = Arc::new(Runtime::new());
        let handle = runtime.register_current("worker");

        let _frame = handle.enter("failing_op");
        {
            let _error = handle.record_error("TimeoutError");
            let error = handle.state.pending_error.load_full().unwrap();
            assert_eq!(error.exc_type, "TimeoutError");
            assert_eq!(error.traceback.as_ref().unwrap().function, "failing_op");
        }
        assert!(handle.state.pending_error.load_full().is_none());
    }

    #[test]
    fn error_without_frames_has_no_traceback() {
        let runtime = Arc::new(Runtime::new());
        let handle = runtime.register_current("worker");

        let _error = handle.record_error("ValueError");
        let error = handle.state.pending_error.load_full().unwrap();
        assert!(error.traceback.is_none());
    }

    #[test]
    fn bootstrap_thread_is_main_thread_even_when_unregistered() {
        let runtime = Arc::new(Runtime::new());
        let identity = runtime.thread_identity(runtime.main_thread_id());
        assert_eq!(identity.name, "MainThread");
    }

    #[test]
    fn bootstrap_thread_name_overrides_registered_name() {
        let runtime = Arc::new(Runtime::new());
        let handle = runtime.register_current("not-the-main-name");
        let identity = runtime.thread_identity(handle.runtime_tid());
        assert_eq!(identity.name, "MainThread");
        assert_ne!(identity.native_id, 0);
    }

    #[test]
    fn unknown_thread_is_anonymous_with_tid_as_native_id() {
        let runtime = Arc::new(Runtime::new());
        let identity = runtime.thread_identity(424_242);
        assert_eq!(identity.name, "Anonymous Thread 424242");
        assert_eq!(identity.native_id, 424_242);
        assert_eq!(identity.runtime_tid, 424_242);
    }

    #[test]
    fn registered_worker_keeps_its_name() {
        let runtime = Arc::new(Runtime::new());
        let (tid, identity) = std::thread::scope(|s| {
            s.spawn(|| {
                let handle = runtime.register_current("worker-7");
                let tid = handle.runtime_tid();
                (tid, runtime.thread_identity(tid))
            })
            .join()
            .unwrap()
        });
        assert_eq!(identity.name, "worker-7");
        assert_eq!(identity.runtime_tid, tid);
    }

    #[test]
    fn retirement_waits_for_pinned_pass() {
        use std::sync::mpsc;
        use std::time::Duration;

        let runtime = Arc::new(Runtime::new());
        let pin = runtime.pin_live_threads();

        let (started_tx, started_rx) = mpsc::channel();
        let (retired_tx, retired_rx) = mpsc::channel();
        let rt = runtime.clone();
        let worker = std::thread::spawn(move || {
            let handle = rt.register_current("short-lived");
            started_tx.send(handle.runtime_tid()).unwrap();
            drop(handle);
            retired_tx.send(()).unwrap();
        });

        let _tid = started_rx.recv().unwrap();
        // While the pass is pinned the worker cannot finish retiring.
        assert!(
            retired_rx
                .recv_timeout(Duration::from_millis(50))
                .is_err()
        );
        drop(pin);
        retired_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("retirement should complete once the pass ends");
        worker.join().unwrap();
    }
}
