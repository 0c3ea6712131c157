use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::ThreadPool;

#[test]
fn runs_all_scheduled_jobs() {
    let pool = ThreadPool::new(4);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        pool.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    pool.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 100);
    assert!(!pool.has_errors());
}

#[test]
fn zero_threads_selects_hardware_concurrency() {
    let pool = ThreadPool::new(0);
    assert!(pool.n_threads() >= 1);
}

#[test]
fn captures_panicking_jobs() {
    let pool = ThreadPool::new(2);
    let counter = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        let counter = Arc::clone(&counter);
        pool.schedule(move || {
            if i == 3 {
                panic!("job {i} went sideways");
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    pool.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 9);
    assert!(pool.has_errors());
    let errors = pool.drain_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("went sideways"));
    // Draining clears the backlog and the pool keeps working.
    assert!(!pool.has_errors());
    pool.schedule(|| {});
    pool.wait();
}
