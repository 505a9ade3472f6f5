use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

use super::mock::{MockBackend, mock_registry};
use crate::error::Error;
use crate::registry::{AllocationRegistry, Reclamation};
use crate::tests::prob;

fn assert_balanced(reg: &AllocationRegistry<MockBackend>, nodes: i32) {
    for n in 0..nodes {
        assert_eq!(reg.allocated_size(n), 0, "node {} not balanced", n);
    }
    assert_eq!(reg.live_allocations(), 0);
    assert_eq!(reg.backend().live(), 0);
    assert_eq!(reg.backend().double_frees(), 0);
    assert_eq!(reg.backend().allocs(), reg.backend().frees());
}

#[test]
fn release_races_collector() {
    const ROUNDS: usize = 500;

    let reg = mock_registry(2, Reclamation::Deferred);
    let barrier = Barrier::new(2);
    for round in 0..ROUNDS {
        let node = (round % 2) as i32;
        let mem = reg.allocate(fastrand::u64(1..=4096), node).unwrap();
        let handle = mem.handle();
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                drop(mem);
            });
            barrier.wait();
            reg.release(handle);
        });
    }
    reg.quiesce();
    assert_eq!(reg.backend().allocs(), ROUNDS);
    assert_balanced(&reg, 2);
}

#[test]
fn release_races_inline_drop() {
    const ROUNDS: usize = 500;

    let reg = mock_registry(1, Reclamation::Inline);
    let barrier = Barrier::new(2);
    for _ in 0..ROUNDS {
        let mem = reg.allocate(128, 0).unwrap();
        let handle = mem.handle();
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                reg.release(handle);
            });
            barrier.wait();
            if prob(0.5) {
                mem.release();
            } else {
                drop(mem);
            }
        });
    }
    assert_balanced(&reg, 1);
}

#[test]
fn access_races_release() {
    let reg = mock_registry(1, Reclamation::Deferred);
    for _ in 0..100 {
        let mut mem = reg.allocate(64, 0).unwrap();
        mem.put_u64(0, 7).unwrap();
        let handle = mem.handle();
        let reads = AtomicUsize::new(0);
        let barrier = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                loop {
                    match mem.get_u64(0) {
                        Ok(v) => assert_eq!(v, 7),
                        Err(err) => {
                            assert_eq!(err, Error::Released);
                            break;
                        }
                    }
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            });
            barrier.wait();
            reg.release(handle);
        });
        assert!(mem.is_released());
        drop(mem);
    }
    reg.quiesce();
    assert_balanced(&reg, 1);
}

#[test]
fn concurrent_counters_stay_exact() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let reg = mock_registry(4, Reclamation::Deferred);
    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                let mut kept = Vec::new();
                for _ in 0..PER_THREAD {
                    let node = fastrand::i32(0..4);
                    let size = fastrand::u64(1..=2048);
                    let mem = reg.allocate(size, node).unwrap();
                    assert!(reg.allocated_size(node) >= size);
                    match fastrand::u8(0..3) {
                        0 => reg.release(mem.handle()),
                        1 => drop(mem),
                        _ => kept.push(mem),
                    }
                }
                if prob(0.5) {
                    kept.into_iter().for_each(|m| m.release());
                }
            });
        }
    });
    reg.quiesce();
    assert_eq!(reg.backend().allocs(), THREADS * PER_THREAD);
    assert_balanced(&reg, 4);
}

#[test]
fn collector_survives_panic() {
    let reg = mock_registry(1, Reclamation::Deferred);
    let bad = reg.allocate(32, 0).unwrap();
    reg.backend().poison(bad.address());
    drop(bad);
    reg.quiesce();
    assert_eq!(reg.live_allocations(), 0);
    assert_eq!(reg.allocated_size(0), 0);

    let good = reg.allocate(32, 0).unwrap();
    let frees = reg.backend().frees();
    drop(good);
    reg.quiesce();
    assert_eq!(reg.backend().frees(), frees + 1);
    assert_eq!(reg.live_allocations(), 0);
    assert!(!reg.is_shut_down());
}

#[test]
fn shutdown_drains() {
    let reg = mock_registry(2, Reclamation::Deferred);
    let blocks: Vec<_> = (0..256)
        .map(|i| reg.allocate(512, (i % 2) as i32).unwrap())
        .collect();
    drop(blocks);
    reg.shutdown();
    assert_balanced(&reg, 2);
}

#[test]
fn drops_racing_shutdown() {
    const THREADS: usize = 4;

    let reg = mock_registry(1, Reclamation::Deferred);
    let barrier = Barrier::new(THREADS + 1);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let blocks: Vec<_> = (0..100).map(|_| reg.allocate(64, 0).unwrap()).collect();
                barrier.wait();
                drop(blocks);
            });
        }
        barrier.wait();
        reg.shutdown();
    });
    assert_balanced(&reg, 1);
}

#[test]
fn guards_outlive_registry() {
    let reg = mock_registry(1, Reclamation::Deferred);
    let mem = reg.allocate(64, 0).unwrap();
    let handle = mem.handle();
    drop(reg);
    assert_eq!(handle.size(), 64);
    assert!(!mem.is_released());
    drop(mem);
}
