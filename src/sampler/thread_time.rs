//! Per-thread CPU accounting.
//!
//! Two regimes, picked at start time: on Linux every thread is charged
//! from its own POSIX CPU clock; elsewhere the process CPU delta is
//! divided evenly across live threads.

use std::collections::HashMap;
use std::io;

/// Read `CLOCK_MONOTONIC` in nanoseconds.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, initialized timespec on the stack.
    // CLOCK_MONOTONIC is always available and always succeeds.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Read the whole process's CPU time in nanoseconds.
fn process_cpu_ns() -> io::Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, initialized timespec on the stack.
    if unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// Read the CPU time of the thread identified by `runtime_tid` (a pthread)
/// through its per-thread CPU clock.
///
/// The caller must guarantee the thread cannot be destroyed for the
/// duration of the call: the clock lookup on a dead pthread is undefined
/// behaviour. The sampler guarantees this by holding the runtime's retire
/// lock for the whole pass.
#[cfg(target_os = "linux")]
fn thread_cpu_ns(runtime_tid: u64) -> io::Result<u64> {
    let mut clock: libc::clockid_t = 0;
    // SAFETY: `clock` is a valid out-pointer and `runtime_tid` names a
    // live pthread per this function's contract.
    let rc = unsafe { libc::pthread_getcpuclockid(runtime_tid as libc::pthread_t, &mut clock) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, initialized timespec on the stack and
    // `clock` was just produced by pthread_getcpuclockid.
    if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// Composite identity a per-thread clock reading is cached under. Both
/// halves are required: the platform can recycle either id after a thread
/// dies, but recycling both at once is not a practical concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ThreadKey {
    runtime_tid: u64,
    native_tid: u64,
}

/// CPU nanoseconds charged to each live thread since the previous call.
///
/// `delta` takes the live set as `runtime_tid → native_tid` and never
/// errors: an unreadable clock silently charges zero for that thread this
/// pass.
pub enum ThreadTime {
    #[cfg(target_os = "linux")]
    PerThread(PerThreadTime),
    ProcessWide(ProcessTime),
}

impl ThreadTime {
    /// Pick the most capable variant the platform supports.
    pub fn new() -> Self {
        #[cfg(target_os = "linux")]
        {
            ThreadTime::PerThread(PerThreadTime::default())
        }
        #[cfg(not(target_os = "linux"))]
        {
            ThreadTime::ProcessWide(ProcessTime::new())
        }
    }

    /// Force the process-wide split, also on platforms with per-thread
    /// clocks.
    pub fn process_wide() -> Self {
        ThreadTime::ProcessWide(ProcessTime::new())
    }

    pub fn delta(&mut self, live: &HashMap<u64, u64>) -> HashMap<u64, u64> {
        match self {
            #[cfg(target_os = "linux")]
            ThreadTime::PerThread(t) => t.delta(live),
            ThreadTime::ProcessWide(t) => t.delta(live),
        }
    }
}

impl Default for ThreadTime {
    fn default() -> Self {
        Self::new()
    }
}

/// Linux variant: one POSIX CPU clock per thread, cached readings keyed by
/// [`ThreadKey`].
#[cfg(target_os = "linux")]
#[derive(Default)]
pub struct PerThreadTime {
    last_cpu_ns: HashMap<ThreadKey, u64>,
}

#[cfg(target_os = "linux")]
impl PerThreadTime {
    fn delta(&mut self, live: &HashMap<u64, u64>) -> HashMap<u64, u64> {
        let mut deltas = HashMap::with_capacity(live.len());
        let mut next = HashMap::with_capacity(live.len());
        for (&runtime_tid, &native_tid) in live {
            let key = ThreadKey {
                runtime_tid,
                native_tid,
            };
            let previous = self.last_cpu_ns.get(&key).copied();
            let current = match thread_cpu_ns(runtime_tid) {
                Ok(ns) => ns,
                // Unreadable clock: reuse the cached reading so this pass
                // charges zero.
                Err(_) => previous.unwrap_or(0),
            };
            // First observation of a key charges zero; a reuse collision
            // can make `current` go backwards, which clamps to zero too.
            deltas.insert(runtime_tid, current.saturating_sub(previous.unwrap_or(current)));
            next.insert(key, current);
        }
        // The cache holds exactly the keys observed this call.
        self.last_cpu_ns = next;
        deltas
    }
}

/// Portable variant: one process-wide reading, divided evenly. Unfair per
/// pass, unbiased in aggregate.
pub struct ProcessTime {
    last_process_cpu_ns: u64,
}

impl ProcessTime {
    pub(crate) fn new() -> Self {
        Self {
            last_process_cpu_ns: process_cpu_ns().unwrap_or(0),
        }
    }

    fn delta(&mut self, live: &HashMap<u64, u64>) -> HashMap<u64, u64> {
        let current = match process_cpu_ns() {
            Ok(ns) => ns,
            Err(_) => self.last_process_cpu_ns,
        };
        let elapsed = current.saturating_sub(self.last_process_cpu_ns);
        self.last_process_cpu_ns = current;
        split_evenly(elapsed, live)
    }
}

fn split_evenly(total_ns: u64, live: &HashMap<u64, u64>) -> HashMap<u64, u64> {
    let n = live.len() as u64;
    if n == 0 {
        return HashMap::new();
    }
    live.keys().map(|&tid| (tid, total_ns / n)).collect()
}
