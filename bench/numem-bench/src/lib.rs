use std::hint::black_box;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use criterion::{Criterion, criterion_group, criterion_main};
use numem::{AllocationRegistry, Backend, NumaSystem, Reclamation};

const BUFSIZES: &[u64] = &[64, 1024, 4096, 64 << 10, 1 << 20];

const BATCH: usize = 64;

type BenchFn = fn(&AllocationRegistry, usize, u64) -> Duration;

fn registry(reclamation: Reclamation) -> AllocationRegistry {
    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }
    AllocationRegistry::builder()
        .reclamation(reclamation)
        .build(Backend::from_env())
}

fn node(reg: &AllocationRegistry) -> i32 {
    fastrand::i32(0..reg.backend().node_count() as i32)
}

/// Allocate and release explicitly through the handle.
fn release(reg: &AllocationRegistry, iters: usize, size: u64) -> Duration {
    let start = Instant::now();
    for _ in 0..iters {
        let mem = reg.allocate(size, node(reg)).unwrap();
        reg.release(black_box(mem.handle()));
    }
    start.elapsed()
}

/// Allocate a batch, write to it, and let the guards go. Includes waiting for
/// the reclamation to finish.
fn dropped(reg: &AllocationRegistry, iters: usize, size: u64) -> Duration {
    let mut blocks = Vec::with_capacity(BATCH);
    let start = Instant::now();
    for i in 0..iters {
        let mut mem = reg.allocate(size, node(reg)).unwrap();
        mem.put_u64(0, black_box(i as u64)).unwrap();
        blocks.push(mem);
        if blocks.len() == BATCH {
            blocks.clear();
        }
    }
    blocks.clear();
    reg.quiesce();
    start.elapsed()
}

fn groups(c: &mut Criterion) {
    macro_rules! benches {
        ($($name:ident),* $(,)?) => ([$((stringify!($name), $name as BenchFn),)*]);
    }

    let mut g = c.benchmark_group("numem_benchmark");

    for reclamation in [Reclamation::Deferred, Reclamation::Inline] {
        let reg = registry(reclamation);
        let mode = format!("{reclamation:?}").to_lowercase();

        for (i, bufsize) in BUFSIZES.iter().copied().enumerate() {
            let bsize = ByteSize::b(bufsize).display().iec_short();

            for (name, f) in benches![release, dropped] {
                let id = format!("numem_benchmark_{i:02}_{bsize:.0}_{mode}_{name}");
                g.bench_function(&id, |b| b.iter_custom(|iters| f(&reg, iters as usize, bufsize)));
            }
        }
        assert_eq!(reg.live_allocations(), 0);
    }
}

criterion_group!(
    name = numem_benchmark;
    config = Criterion::default().sample_size(50).measurement_time(Duration::from_secs(10));
    targets = groups
);

criterion_main!(numem_benchmark);
