use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use hostcrt_core::pthread::{MutexCounters, PTHREAD_MUTEX_RECURSIVE};
use hostcrt_core::{CrtError, MutexAttr, Runtime, RuntimeConfig, TryLockOutcome};

const M: usize = 0xA000;

fn runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeConfig::default())
}

fn wait_for_counter_increase(
    rt: &Runtime,
    label: &str,
    before: MutexCounters,
    timeout: Duration,
) -> MutexCounters {
    let start = Instant::now();
    loop {
        let now = rt.mutexes().counters();
        if now.contended_waits > before.contended_waits {
            return now;
        }
        if start.elapsed() > timeout {
            panic!("timeout waiting for contended wait ({label}): before={before:?} now={now:?}");
        }
        std::thread::yield_now();
    }
}

struct Occupancy {
    current: AtomicUsize,
    max: AtomicUsize,
    pairs: AtomicUsize,
}

impl Occupancy {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            pairs: AtomicUsize::new(0),
        })
    }

    fn critical_section(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        std::hint::spin_loop();
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.pairs.fetch_add(1, Ordering::SeqCst);
    }
}

fn hammer(rt: &Arc<Runtime>, threads: usize, cycles: usize) -> Arc<Occupancy> {
    let occupancy = Occupancy::new();
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let occupancy = Arc::clone(&occupancy);
            let barrier = Arc::clone(&barrier);
            rt.spawn(move |tls| {
                barrier.wait();
                let mutexes = tls.runtime().mutexes();
                for _ in 0..cycles {
                    mutexes.lock(M, tls.thread_id()).unwrap();
                    occupancy.critical_section();
                    mutexes.unlock(M, tls.thread_id()).unwrap();
                }
                0
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        assert_eq!(rt.join(handle).unwrap(), 0);
    }
    occupancy
}

#[test]
fn normal_mutex_excludes_under_many_threads() {
    let rt = runtime();
    rt.mutexes().init(M, None).unwrap();
    let occupancy = hammer(&rt, 8, 500);
    assert_eq!(occupancy.max.load(Ordering::SeqCst), 1);
    assert_eq!(occupancy.pairs.load(Ordering::SeqCst), 8 * 500);
    assert!(rt.teardown().leaked_blocks == 0);
}

#[test]
fn two_threads_hundred_cycles_each() {
    let rt = runtime();
    let occupancy = hammer(&rt, 2, 100);
    assert_eq!(occupancy.pairs.load(Ordering::SeqCst), 200);
    assert_eq!(occupancy.max.load(Ordering::SeqCst), 1);
    let snap = rt.mutexes().snapshot(M).unwrap();
    assert_eq!(snap.hold_count, 0);
    assert_eq!(snap.owner, None);
}

#[test]
fn recursive_needs_k_unlocks_before_other_thread_acquires() {
    let rt = runtime();
    let mut attr = MutexAttr::new();
    attr.set_kind(PTHREAD_MUTEX_RECURSIVE).unwrap();
    rt.mutexes().init(M, Some(&attr)).unwrap();

    let main = rt.create_tls().unwrap();
    const K: usize = 5;
    for _ in 0..K {
        rt.mutexes().lock(M, main.thread_id()).unwrap();
    }

    let before = rt.mutexes().counters();
    let acquired = Arc::new(AtomicBool::new(false));
    let acquired_child = Arc::clone(&acquired);
    let child = rt
        .spawn(move |tls| {
            let mutexes = tls.runtime().mutexes();
            mutexes.lock(M, tls.thread_id()).unwrap();
            acquired_child.store(true, Ordering::SeqCst);
            mutexes.unlock(M, tls.thread_id()).unwrap();
            0
        })
        .unwrap();
    wait_for_counter_increase(&rt, "recursive", before, Duration::from_secs(5));

    for remaining in (1..K).rev() {
        rt.mutexes().unlock(M, main.thread_id()).unwrap();
        let snap = rt.mutexes().snapshot(M).unwrap();
        assert_eq!(snap.hold_count as usize, remaining);
        assert_eq!(snap.owner, Some(main.thread_id()));
        assert!(!acquired.load(Ordering::SeqCst));
    }
    rt.mutexes().unlock(M, main.thread_id()).unwrap();
    rt.join(child).unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    rt.destroy_tls(main).unwrap();
}

#[test]
fn trylock_on_held_normal_mutex_is_prompt_busy() {
    let rt = runtime();
    let main = rt.create_tls().unwrap();
    rt.mutexes().lock(M, main.thread_id()).unwrap();

    let child = rt
        .spawn(|tls| {
            let start = Instant::now();
            let outcome = tls.runtime().mutexes().try_lock(M, tls.thread_id()).unwrap();
            assert_eq!(outcome, TryLockOutcome::Busy);
            start.elapsed().as_millis() as usize
        })
        .unwrap();
    let elapsed_ms = rt.join(child).unwrap();
    assert!(elapsed_ms < 1000, "try_lock took {elapsed_ms}ms");
    rt.mutexes().unlock(M, main.thread_id()).unwrap();
    rt.destroy_tls(main).unwrap();
}

#[test]
fn normal_self_relock_blocks_until_reinit() {
    let rt = runtime();
    rt.mutexes().init(M, None).unwrap();
    let before = rt.mutexes().counters();
    let child = rt
        .spawn(|tls| {
            let mutexes = tls.runtime().mutexes();
            mutexes.lock(M, tls.thread_id()).unwrap();
            // Second lock by the same owner parks until the mutex is reset.
            mutexes.lock(M, tls.thread_id()).unwrap();
            mutexes.unlock(M, tls.thread_id()).unwrap();
            42
        })
        .unwrap();
    wait_for_counter_increase(&rt, "self-relock", before, Duration::from_secs(5));
    assert_eq!(rt.threads().is_finished(child), Some(false));

    rt.mutexes().init(M, None).unwrap();
    assert_eq!(rt.join(child).unwrap(), 42);
    let warned = rt
        .log()
        .snapshot()
        .into_iter()
        .any(|r| r.event == "reinit" && r.outcome == "reset_while_locked");
    assert!(warned);
}

#[test]
fn concurrent_first_use_creates_one_mutex() {
    let rt = runtime();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let winners = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            rt.spawn(move |tls| {
                barrier.wait();
                let outcome = tls.runtime().mutexes().try_lock(M, tls.thread_id()).unwrap();
                if outcome == TryLockOutcome::Acquired {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                0
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        rt.join(handle).unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(rt.mutexes().counters().lazy_creations, 1);
    assert_eq!(rt.mutexes().len(), 1);
}

#[test]
fn unlock_contract_violations_surface_as_fatal_errors() {
    let rt = runtime();
    let a = rt.create_tls().unwrap();
    let b = rt.create_tls().unwrap();

    let err = rt.mutexes().unlock(M, a.thread_id()).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CrtError::UseViolation { mutex: M, .. }));

    let mut attr = MutexAttr::new();
    attr.set_kind(PTHREAD_MUTEX_RECURSIVE).unwrap();
    rt.mutexes().init(M, Some(&attr)).unwrap();
    rt.mutexes().lock(M, a.thread_id()).unwrap();
    let err = rt.mutexes().unlock(M, b.thread_id()).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        err,
        CrtError::WrongOwner {
            op: "unlock",
            mutex: M,
            owner: a.thread_id(),
            caller: b.thread_id()
        }
    );
    rt.mutexes().unlock(M, a.thread_id()).unwrap();
    rt.destroy_tls(a).unwrap();
    rt.destroy_tls(b).unwrap();
}
