use criterion::{Criterion, black_box, criterion_group, criterion_main};
use stackpulse::runtime::Runtime;
use stackpulse::sampler::{ThreadTime, WalkConfig, collect};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;

struct ParkedThreads {
    release: Vec<mpsc::Sender<()>>,
    joins: Vec<JoinHandle<()>>,
}

impl ParkedThreads {
    /// Spawn `count` registered threads, each with a `depth`-deep
    /// published stack, parked until dropped.
    fn spawn(runtime: &Arc<Runtime>, count: usize, depth: usize) -> Self {
        let mut release = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for _ in 0..count {
            let runtime = runtime.clone();
            let (ready_tx, ready_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel::<()>();
            joins.push(std::thread::spawn(move || {
                let handle = runtime.register_current("bench-worker");
                let mut guards = Vec::with_capacity(depth);
                for _ in 0..depth {
                    guards.push(handle.enter("frame"));
                }
                ready_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }));
            ready_rx.recv().unwrap();
            release.push(release_tx);
        }
        Self { release, joins }
    }
}

impl Drop for ParkedThreads {
    fn drop(&mut self) {
        for release in &self.release {
            let _ = release.send(());
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

fn bench_pass(c: &mut Criterion) {
    let config = WalkConfig {
        ignore_profiler: true,
        max_nframes: 64,
        interval_s: 0.01,
        wall_time_ns: 10_000_000,
    };

    for threads in [1usize, 8, 32] {
        let runtime = Arc::new(Runtime::new());
        let parked = ParkedThreads::spawn(&runtime, threads, 16);
        let mut thread_time = ThreadTime::new();

        c.bench_function(&format!("pass_{threads}_threads"), |b| {
            b.iter(|| {
                let events = collect(&runtime, &mut thread_time, None, &config);
                black_box(events);
            });
        });

        drop(parked);
    }
}

criterion_group!(benches, bench_pass);
criterion_main!(benches);
