//! Bounded FIFO channels with backpressure.
//!
//! A [`CoChannel`] buffers up to `max_buffer` elements. Senders suspend on a
//! full buffer ([`CoChannel::await_send`]) or decline without suspending
//! ([`CoChannel::offer`]); receivers suspend on an empty buffer
//! ([`CoChannel::await_receive`]) or poll. Receive order equals send order.
//!
//! # Lifecycle
//!
//! - [`CoChannel::close`]: buffered elements remain deliverable; waiting
//!   senders and receivers fail with `ChannelClosed`; receive drains the
//!   buffer, then fails.
//! - [`CoChannel::cancel`]: buffered elements are dropped; everyone fails
//!   with `ChannelCancelled`.
//! - Dropping the last handle of an open channel cancels it, so suspended
//!   coroutines are resumed rather than leaked.
//!
//! Completion callbacks ([`CoChannel::when_complete`]) fire exactly once,
//! when a terminal channel's buffer is drained.

mod co_channel;
mod receiver;

pub use co_channel::CoChannel;
pub use receiver::{ChannelIter, MapIter, MapReceiver};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn offer_and_poll_roundtrip_in_order() {
        init_test("offer_and_poll_roundtrip_in_order");
        let channel = CoChannel::<i32>::new(8);
        for i in 0..5 {
            assert!(channel.offer(i));
        }
        crate::assert_with_log!(channel.buffered() == 5, "buffered", 5, channel.buffered());
        let drained: Vec<_> = std::iter::from_fn(|| channel.poll()).collect();
        crate::assert_with_log!(drained == vec![0, 1, 2, 3, 4], "fifo", "0..5", drained.len());
        crate::test_complete!("offer_and_poll_roundtrip_in_order");
    }

    #[test]
    fn offer_refuses_when_full() {
        init_test("offer_refuses_when_full");
        let channel = CoChannel::<i32>::new(2);
        assert!(channel.offer(1));
        assert!(channel.offer(2));
        let refused = !channel.offer(3);
        crate::assert_with_log!(refused, "full channel refuses", true, refused);
        crate::test_complete!("offer_refuses_when_full");
    }

    #[test]
    fn close_keeps_buffer_deliverable_then_fails() {
        init_test("close_keeps_buffer_deliverable_then_fails");
        let channel = CoChannel::<i32>::new(4);
        channel.offer(10);
        channel.offer(20);
        assert!(channel.close());
        assert!(!channel.close(), "second close is a no-op");
        assert!(channel.is_closed());
        // Buffered elements survive the close.
        assert_eq!(channel.poll(), Some(10));
        assert_eq!(channel.poll(), Some(20));
        assert_eq!(channel.poll(), None);
        // Offers after close are refused.
        let refused = !channel.offer(30);
        crate::assert_with_log!(refused, "offer after close refused", true, refused);
        crate::test_complete!("close_keeps_buffer_deliverable_then_fails");
    }

    #[test]
    fn cancel_drops_buffered_elements() {
        init_test("cancel_drops_buffered_elements");
        let channel = CoChannel::<i32>::new(4);
        channel.offer(1);
        channel.offer(2);
        channel.cancel();
        assert!(channel.is_cancelled());
        let polled = channel.poll();
        crate::assert_with_log!(polled.is_none(), "buffer dropped", None::<i32>, polled);
        crate::assert_with_log!(channel.buffered() == 0, "count zero", 0, channel.buffered());
        crate::test_complete!("cancel_drops_buffered_elements");
    }

    #[test]
    fn completion_fires_once_when_closed_buffer_drains() {
        init_test("completion_fires_once_when_closed_buffer_drains");
        let channel = CoChannel::<i32>::new(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        channel.when_complete(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        channel.offer(1);
        channel.close();
        crate::assert_with_log!(fired.load(Ordering::SeqCst) == 0, "not fired while buffered", 0, fired.load(Ordering::SeqCst));
        channel.poll();
        crate::assert_with_log!(fired.load(Ordering::SeqCst) == 1, "fired at drain", 1, fired.load(Ordering::SeqCst));
        // Registration after completion fires inline, exactly once.
        let f = Arc::clone(&fired);
        channel.when_complete(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        crate::assert_with_log!(fired.load(Ordering::SeqCst) == 2, "late registration inline", 2, fired.load(Ordering::SeqCst));
        crate::test_complete!("completion_fires_once_when_closed_buffer_drains");
    }

    #[test]
    fn when_cancelled_distinguishes_cancel_from_close() {
        init_test("when_cancelled_distinguishes_cancel_from_close");
        let closed = CoChannel::<i32>::new(1);
        let cancelled = CoChannel::<i32>::new(1);
        let close_hits = Arc::new(AtomicUsize::new(0));
        let cancel_hits = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&close_hits);
        closed.when_cancelled(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&cancel_hits);
        cancelled.when_cancelled(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        closed.close();
        cancelled.cancel();
        crate::assert_with_log!(close_hits.load(Ordering::SeqCst) == 0, "close does not trip it", 0, close_hits.load(Ordering::SeqCst));
        crate::assert_with_log!(cancel_hits.load(Ordering::SeqCst) == 1, "cancel trips it", 1, cancel_hits.load(Ordering::SeqCst));
        crate::test_complete!("when_cancelled_distinguishes_cancel_from_close");
    }

    #[test]
    fn when_receive_delivers_buffered_or_waits() {
        init_test("when_receive_delivers_buffered_or_waits");
        let channel = CoChannel::<i32>::new(4);
        let seen = Arc::new(AtomicUsize::new(0));

        // Buffered element: fires inline.
        channel.offer(7);
        let s = Arc::clone(&seen);
        channel.when_receive(move |result| {
            s.store(result.expect("buffered element") as usize, Ordering::SeqCst);
        });
        crate::assert_with_log!(seen.load(Ordering::SeqCst) == 7, "inline delivery", 7, seen.load(Ordering::SeqCst));

        // Empty buffer: parks until the next offer.
        let s = Arc::clone(&seen);
        channel.when_receive(move |result| {
            s.store(result.expect("handed-off element") as usize, Ordering::SeqCst);
        });
        crate::assert_with_log!(seen.load(Ordering::SeqCst) == 7, "parked", 7, seen.load(Ordering::SeqCst));
        channel.offer(9);
        crate::assert_with_log!(seen.load(Ordering::SeqCst) == 9, "hand-off", 9, seen.load(Ordering::SeqCst));
        crate::test_complete!("when_receive_delivers_buffered_or_waits");
    }

    #[test]
    fn when_receive_sees_terminal_errors() {
        init_test("when_receive_sees_terminal_errors");
        let channel = CoChannel::<i32>::new(1);
        channel.close();
        let kind = Arc::new(std::sync::Mutex::new(None));
        let k = Arc::clone(&kind);
        channel.when_receive(move |result| {
            *k.lock().unwrap() = Some(result.expect_err("closed").kind());
        });
        crate::assert_with_log!(
            *kind.lock().unwrap() == Some(ErrorKind::ChannelClosed),
            "closed error",
            Some(ErrorKind::ChannelClosed),
            *kind.lock().unwrap()
        );
        crate::test_complete!("when_receive_sees_terminal_errors");
    }

    #[test]
    fn send_future_forwards_success_and_drops_failure() {
        init_test("send_future_forwards_success_and_drops_failure");
        let channel = CoChannel::<i32>::new(4);
        channel.send_future(&crate::future::CoFuture::resolved(5));
        let polled = channel.poll();
        crate::assert_with_log!(polled == Some(5), "forwarded", Some(5), polled);
        channel.send_future(&crate::future::CoFuture::failed(crate::error::Error::new(
            ErrorKind::User,
        )));
        let polled = channel.poll();
        crate::assert_with_log!(polled.is_none(), "failure dropped", None::<i32>, polled);
        crate::test_complete!("send_future_forwards_success_and_drops_failure");
    }

    #[test]
    fn map_receiver_transforms_and_shares_lifecycle() {
        init_test("map_receiver_transforms_and_shares_lifecycle");
        let channel = CoChannel::<i32>::new(4);
        let doubled = channel.map(|v| v * 2);
        channel.offer(21);
        let polled = doubled.poll();
        crate::assert_with_log!(polled == Some(42), "transformed", Some(42), polled);
        let strings = doubled.map(|v| format!("n={v}"));
        channel.offer(3);
        let s = strings.poll().expect("buffered");
        crate::assert_with_log!(s == "n=6", "composed", "n=6", s);
        doubled.close();
        assert!(channel.is_closed(), "lifecycle shared with the channel");
        crate::test_complete!("map_receiver_transforms_and_shares_lifecycle");
    }

    #[test]
    fn iterator_polls_outside_coroutines() {
        init_test("iterator_polls_outside_coroutines");
        let channel = CoChannel::<i32>::new(8);
        for i in 0..4 {
            channel.offer(i);
        }
        let collected: Vec<_> = channel.iter().collect();
        crate::assert_with_log!(collected == vec![0, 1, 2, 3], "polled order", "0..4", collected.len());
        crate::test_complete!("iterator_polls_outside_coroutines");
    }

    #[test]
    fn rendezvous_channel_hands_off_to_waiting_receiver() {
        init_test("rendezvous_channel_hands_off_to_waiting_receiver");
        let channel = CoChannel::<i32>::new(0);
        // No waiting receiver: a rendezvous channel refuses offers.
        assert!(!channel.offer(1));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        channel.when_receive(move |result| {
            s.store(result.expect("hand-off") as usize, Ordering::SeqCst);
        });
        // Receiver is parked; the offer hands off directly.
        assert!(channel.offer(17));
        crate::assert_with_log!(seen.load(Ordering::SeqCst) == 17, "direct hand-off", 17, seen.load(Ordering::SeqCst));
        crate::test_complete!("rendezvous_channel_hands_off_to_waiting_receiver");
    }

    #[test]
    fn drop_with_parked_receiver_cancels_it() {
        init_test("drop_with_parked_receiver_cancels_it");
        let channel = CoChannel::<i32>::new(1);
        let kind = Arc::new(std::sync::Mutex::new(None));
        let k = Arc::clone(&kind);
        channel.when_receive(move |result| {
            *k.lock().unwrap() = Some(result.expect_err("cancelled").kind());
        });
        drop(channel);
        crate::assert_with_log!(
            *kind.lock().unwrap() == Some(ErrorKind::ChannelCancelled),
            "cancelled on drop",
            Some(ErrorKind::ChannelCancelled),
            *kind.lock().unwrap()
        );
        crate::test_complete!("drop_with_parked_receiver_cancels_it");
    }
}
