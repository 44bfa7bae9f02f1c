//! Terminal lifecycles under suspension: close with waiting senders,
//! destruction with suspended coroutines.

use cofiber::coroutine;
use cofiber::executor::ThreadPoolExecutor;
use cofiber::test_utils::init_test_logging;
use cofiber::{CoChannel, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_test(name: &str) {
    init_test_logging();
    cofiber::test_phase!(name);
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let limit = Instant::now() + deadline;
    while !done() && Instant::now() < limit {
        std::thread::yield_now();
    }
}

#[test]
fn close_fails_waiting_sender_but_keeps_its_element_deliverable() {
    init_test("close_fails_waiting_sender_but_keeps_its_element_deliverable");
    let pool = ThreadPoolExecutor::new(2, 4);
    // Rendezvous channel: the send can only park.
    let channel = CoChannel::<i32>::new(0);
    let parked = Arc::new(AtomicUsize::new(0));

    let sender_channel = channel.clone();
    let p = Arc::clone(&parked);
    let sender = coroutine::submit(pool, move || {
        p.fetch_add(1, Ordering::SeqCst);
        sender_channel.await_send(42)
    });

    wait_until(Duration::from_secs(5), || parked.load(Ordering::SeqCst) == 1);
    wait_until(Duration::from_secs(5), || channel.buffered() == 1);
    channel.close();

    // The sender learns of the close...
    let err = sender.wait_blocking().expect_err("send must fail");
    cofiber::assert_with_log!(
        err.kind() == ErrorKind::ChannelClosed,
        "sender saw closed",
        ErrorKind::ChannelClosed,
        err.kind()
    );
    // ...while its element stays buffered and deliverable.
    let polled = channel.poll();
    cofiber::assert_with_log!(polled == Some(42), "element survives close", Some(42), polled);
    let after = channel.poll();
    cofiber::assert_with_log!(after.is_none(), "buffer drained", None::<i32>, after);
    cofiber::test_complete!("close_fails_waiting_sender_but_keeps_its_element_deliverable");
}

#[test]
fn scope_teardown_resumes_a_suspended_sender_with_cancelled() {
    init_test("scope_teardown_resumes_a_suspended_sender_with_cancelled");
    let pool = ThreadPoolExecutor::new(2, 4);
    let channel = CoChannel::<i32>::new(0);
    let parked = Arc::new(AtomicUsize::new(0));

    let scope = cofiber::CoScope::new();
    scope.add(channel.clone());

    let sender_channel = channel.clone();
    let p = Arc::clone(&parked);
    let sender = coroutine::submit(pool, move || {
        p.fetch_add(1, Ordering::SeqCst);
        sender_channel.await_send(7)
    });

    wait_until(Duration::from_secs(5), || parked.load(Ordering::SeqCst) == 1);
    wait_until(Duration::from_secs(5), || channel.buffered() == 1);
    // Tearing the owning scope down must resume the suspended sender, not
    // leak it.
    drop(scope);

    let err = sender.wait_blocking().expect_err("send must fail");
    cofiber::assert_with_log!(
        err.kind() == ErrorKind::ChannelCancelled,
        "sender cancelled at scope teardown",
        ErrorKind::ChannelCancelled,
        err.kind()
    );
    let polled = channel.poll();
    cofiber::assert_with_log!(polled.is_none(), "element dropped by cancel", None::<i32>, polled);
    cofiber::test_complete!("scope_teardown_resumes_a_suspended_sender_with_cancelled");
}

#[test]
fn receive_after_close_drains_then_fails() {
    init_test("receive_after_close_drains_then_fails");
    let pool = ThreadPoolExecutor::new(2, 4);
    let channel = CoChannel::<i32>::new(8);
    for i in 0..3 {
        assert!(channel.offer(i));
    }
    channel.close();

    let receiver_channel = channel.clone();
    let receiver = coroutine::submit(pool, move || {
        let mut drained = Vec::new();
        loop {
            match receiver_channel.await_receive() {
                Ok(v) => drained.push(v),
                Err(e) => return Ok((drained, e.kind())),
            }
        }
    });
    let (drained, kind) = receiver.wait_blocking().expect("receiver failed");
    cofiber::assert_with_log!(drained == vec![0, 1, 2], "drained in order", 3, drained.len());
    cofiber::assert_with_log!(
        kind == ErrorKind::ChannelClosed,
        "then closed",
        ErrorKind::ChannelClosed,
        kind
    );
    cofiber::test_complete!("receive_after_close_drains_then_fails");
}
