//! Serial-executor ordering: coroutines resumed through one serial queue
//! interleave strictly by submission order.

use cofiber::coroutine;
use cofiber::executor::{SerialExecutor, ThreadPoolExecutor};
use cofiber::test_utils::init_test_logging;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_test(name: &str) {
    init_test_logging();
    cofiber::test_phase!(name);
}

const COUNT: usize = 10_000;

#[test]
fn serial_executor_runs_coroutines_in_submission_order() {
    init_test("serial_executor_runs_coroutines_in_submission_order");
    let pool = ThreadPoolExecutor::new(2, 8);
    let serial = SerialExecutor::new(pool);

    let counter = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    for index in 0..COUNT {
        let counter = Arc::clone(&counter);
        let violations = Arc::clone(&violations);
        coroutine::start(serial.clone(), move || {
            // Strict order: at the moment coroutine `index` runs, exactly
            // `index` predecessors have run.
            if counter.fetch_add(1, Ordering::SeqCst) != index {
                violations.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while counter.load(Ordering::SeqCst) < COUNT && Instant::now() < deadline {
        std::thread::yield_now();
    }
    cofiber::assert_with_log!(
        counter.load(Ordering::SeqCst) == COUNT,
        "all coroutines ran",
        COUNT,
        counter.load(Ordering::SeqCst)
    );
    cofiber::assert_with_log!(
        violations.load(Ordering::SeqCst) == 0,
        "strict interleave by submission order",
        0,
        violations.load(Ordering::SeqCst)
    );
    cofiber::test_complete!("serial_executor_runs_coroutines_in_submission_order");
}

#[test]
fn resumes_through_a_serial_executor_stay_ordered() {
    init_test("resumes_through_a_serial_executor_stay_ordered");
    let pool = ThreadPoolExecutor::new(2, 8);
    let serial = SerialExecutor::new(pool);

    // Each coroutine suspends once mid-flight; the serial queue still
    // never runs two of them concurrently.
    let running = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let futures: Vec<_> = (0..100)
        .map(|i| {
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            coroutine::submit(serial.clone(), move || {
                if running.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                let value =
                    coroutine::await_callback(|resume| resume.resume(i))?;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(value)
            })
        })
        .collect();

    for (i, future) in futures.into_iter().enumerate() {
        let value = future.wait_blocking().expect("coroutine failed");
        assert_eq!(value, i);
    }
    cofiber::assert_with_log!(
        overlap.load(Ordering::SeqCst) == 0,
        "no concurrent execution through the serial queue",
        0,
        overlap.load(Ordering::SeqCst)
    );
    cofiber::test_complete!("resumes_through_a_serial_executor_stay_ordered");
}
