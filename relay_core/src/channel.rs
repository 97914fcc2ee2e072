use std::collections::{HashSet, VecDeque};
use std::sync::Weak;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{
    CloseError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError, TrySendError,
};
use crate::select::SelectSignal;

/// A send that could not complete immediately. Ticketed entries belong to a
/// sender parked on the channel; it learns its fate through the `delivered`
/// set. Unticketed entries are handoffs already committed by `try_send`
/// against a parked receiver.
struct WaitingSend<T> {
    ticket: Option<u64>,
    value: T,
}

struct State<T> {
    buffer: VecDeque<T>,
    waiting_senders: VecDeque<WaitingSend<T>>,
    delivered: HashSet<u64>,
    parked_receivers: usize,
    next_ticket: u64,
    closed: bool,
    select_signals: Vec<Weak<SelectSignal>>,
}

impl<T> State<T> {
    /// Wake every select currently registered on this channel. Called on any
    /// state change that could make a registered operation ready.
    fn notify_selects(&mut self) {
        self.select_signals.retain(|signal| match signal.upgrade() {
            Some(signal) => {
                signal.notify();
                true
            }
            None => false,
        });
    }

    /// Next value owed to a receiver, in FIFO order: buffered items first,
    /// then parked-sender handoffs. After close, ticketed entries are no
    /// longer deliverable (their owners reclaim them and fail), but committed
    /// handoffs still are.
    fn pop_deliverable(&mut self) -> Option<WaitingSend<T>> {
        if self.closed {
            let index = self
                .waiting_senders
                .iter()
                .position(|waiting| waiting.ticket.is_none())?;
            self.waiting_senders.remove(index)
        } else {
            self.waiting_senders.pop_front()
        }
    }
}

/// A thread-safe, capacity-bounded FIFO queue with Go channel semantics.
///
/// Capacity 0 gives rendezvous behavior: a send completes only once a
/// receiver has taken the value. Capacity n > 0 buffers up to n items
/// without a waiting receiver. Closing is explicit, one-shot, and wakes
/// every blocked party; receivers drain whatever is buffered and then
/// observe end-of-stream.
///
/// Share one instance between tasks with `Arc`; any number of instances
/// coexist without shared hidden state.
pub struct BoundedChannel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    senders: Condvar,
    receivers: Condvar,
}

impl<T> BoundedChannel<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                waiting_senders: VecDeque::new(),
                delivered: HashSet::new(),
                parked_receivers: 0,
                next_ticket: 0,
                closed: false,
                select_signals: Vec::new(),
            }),
            senders: Condvar::new(),
            receivers: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered items. Always 0 for a rendezvous channel.
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().buffer.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // === Sending ===

    /// Block until the value is handed over or the channel closes.
    ///
    /// With buffer space free this returns immediately. On a full or
    /// zero-capacity channel the caller parks until a receiver makes room
    /// (or takes the handoff directly), or until close fails the call and
    /// returns the value.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        match self.send_inner(value, None) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(value)) => Err(SendError(value)),
            // No deadline was armed, so expiry cannot be the cause.
            Err(SendTimeoutError::Timeout(value)) => Err(SendError(value)),
        }
    }

    /// `send` with a deadline. Expiry reclaims the value and leaves the
    /// channel untouched for every other waiter.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.send_inner(value, Some(Instant::now() + timeout))
    }

    /// Non-blocking send. `Full` hands the value back; on a zero-capacity
    /// channel the send only succeeds when a parked receiver is guaranteed
    /// to take it.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if self.capacity > 0 {
            if state.waiting_senders.is_empty() && state.buffer.len() < self.capacity {
                state.buffer.push_back(value);
                self.receivers.notify_one();
                state.notify_selects();
                return Ok(());
            }
            return Err(TrySendError::Full(value));
        }
        // Rendezvous: commit the handoff only if a parked receiver is not
        // already spoken for by an earlier waiting send.
        if state.parked_receivers > state.waiting_senders.len() {
            state.waiting_senders.push_back(WaitingSend {
                ticket: None,
                value,
            });
            self.receivers.notify_one();
            state.notify_selects();
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    fn send_inner(&self, value: T, deadline: Option<Instant>) -> Result<(), SendTimeoutError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SendTimeoutError::Closed(value));
        }

        // Fast path: buffer space free and nobody queued ahead of us.
        if self.capacity > 0
            && state.waiting_senders.is_empty()
            && state.buffer.len() < self.capacity
        {
            state.buffer.push_back(value);
            self.receivers.notify_one();
            state.notify_selects();
            return Ok(());
        }

        // Park this send until a receiver takes the value, buffers it, or
        // the channel closes under us.
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting_senders.push_back(WaitingSend {
            ticket: Some(ticket),
            value,
        });
        self.receivers.notify_one();
        state.notify_selects();

        let mut timed_out = false;
        loop {
            if state.delivered.remove(&ticket) {
                return Ok(());
            }
            if state.closed {
                let value = Self::reclaim(&mut state, ticket);
                return Err(SendTimeoutError::Closed(value));
            }
            if timed_out {
                let value = Self::reclaim(&mut state, ticket);
                return Err(SendTimeoutError::Timeout(value));
            }
            match deadline {
                Some(deadline) => {
                    timed_out = self.senders.wait_until(&mut state, deadline).timed_out();
                }
                None => self.senders.wait(&mut state),
            }
        }
    }

    /// Take back a parked send. The entry must still be queued: the caller
    /// checked `delivered` under the same lock.
    fn reclaim(state: &mut State<T>, ticket: u64) -> T {
        let index = state
            .waiting_senders
            .iter()
            .position(|waiting| waiting.ticket == Some(ticket))
            .expect("parked send missing from wait queue");
        let waiting = state
            .waiting_senders
            .remove(index)
            .expect("wait queue index out of range");
        waiting.value
    }

    // === Receiving ===

    /// Block until a value is available. `None` means closed-and-drained;
    /// that state is terminal and repeatable.
    pub fn recv(&self) -> Option<T> {
        match self.recv_inner(None) {
            Ok(received) => received,
            // No deadline was armed.
            Err(RecvTimeoutError) => None,
        }
    }

    /// `recv` with a deadline. A value that arrives before expiry wins over
    /// the timeout, even on the same wakeup.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, RecvTimeoutError> {
        self.recv_inner(Some(Instant::now() + timeout))
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut state = self.state.lock();
        if let Some(value) = self.take_next(&mut state) {
            return Ok(value);
        }
        if state.closed {
            return Err(TryRecvError::Closed);
        }
        Err(TryRecvError::Empty)
    }

    fn recv_inner(&self, deadline: Option<Instant>) -> Result<Option<T>, RecvTimeoutError> {
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            if let Some(value) = self.take_next(&mut state) {
                return Ok(Some(value));
            }
            if state.closed {
                return Ok(None);
            }
            if timed_out {
                return Err(RecvTimeoutError);
            }
            state.parked_receivers += 1;
            // A newly parked receiver makes rendezvous send intents ready.
            state.notify_selects();
            match deadline {
                Some(deadline) => {
                    timed_out = self.receivers.wait_until(&mut state, deadline).timed_out();
                }
                None => self.receivers.wait(&mut state),
            }
            state.parked_receivers -= 1;
        }
    }

    /// Remove the next deliverable value, keeping FIFO order across the
    /// buffer and the wait queue, and wake whoever that unblocks.
    fn take_next(&self, state: &mut State<T>) -> Option<T> {
        if let Some(value) = state.buffer.pop_front() {
            // Freed space belongs to the longest-waiting sender.
            if let Some(next) = state.pop_deliverable() {
                state.buffer.push_back(next.value);
                if let Some(ticket) = next.ticket {
                    state.delivered.insert(ticket);
                    // Only the ticket's owner can act on this; wake them all
                    // and let the rest re-park.
                    self.senders.notify_all();
                }
            }
            state.notify_selects();
            return Some(value);
        }
        let next = state.pop_deliverable()?;
        if let Some(ticket) = next.ticket {
            state.delivered.insert(ticket);
            self.senders.notify_all();
        }
        state.notify_selects();
        Some(next.value)
    }

    // === Closing ===

    /// Close the channel. Blocked senders fail and reclaim their values;
    /// blocked receivers drain the remaining buffered items and then observe
    /// `None`. Closing twice is an error.
    pub fn close(&self) -> Result<(), CloseError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CloseError);
        }
        state.closed = true;
        self.senders.notify_all();
        self.receivers.notify_all();
        state.notify_selects();
        Ok(())
    }

    // === Select support ===

    pub(crate) fn register_select(&self, signal: Weak<SelectSignal>) {
        self.state.lock().select_signals.push(signal);
    }

    // === Iteration ===

    /// Receive until closed-and-drained, Go's `for v := range ch`.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }
}

pub struct Iter<'a, T> {
    channel: &'a BoundedChannel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.recv()
    }
}

impl<'a, T> IntoIterator for &'a BoundedChannel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn buffered_values_arrive_in_send_order() {
        let ch = BoundedChannel::new(3);
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        ch.send(3).unwrap();
        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.recv(), Some(2));
        assert_eq!(ch.recv(), Some(3));
    }

    #[test]
    fn burst_up_to_capacity_never_blocks() {
        let ch = BoundedChannel::new(2);
        ch.try_send(1).unwrap();
        ch.try_send(2).unwrap();
        match ch.try_send(3) {
            Err(TrySendError::Full(3)) => {}
            other => panic!("expected Full(3), got {:?}", other),
        }
        assert_eq!(ch.len(), 2);
    }

    #[test]
    fn send_blocks_when_buffer_full() {
        let ch = Arc::new(BoundedChannel::new(1));
        ch.send(1).unwrap();

        let returned = Arc::new(AtomicBool::new(false));
        let sender = {
            let ch = ch.clone();
            let returned = returned.clone();
            thread::spawn(move || {
                ch.send(2).unwrap();
                returned.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst), "send returned with a full buffer");

        assert_eq!(ch.recv(), Some(1));
        sender.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));
        assert_eq!(ch.recv(), Some(2));
    }

    #[test]
    fn rendezvous_send_waits_for_receiver() {
        let ch = Arc::new(BoundedChannel::new(0));
        let returned = Arc::new(AtomicBool::new(false));

        let sender = {
            let ch = ch.clone();
            let returned = returned.clone();
            thread::spawn(move || {
                ch.send(42).unwrap();
                returned.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst), "send returned before any receive");

        assert_eq!(ch.recv(), Some(42));
        sender.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));
    }

    #[test]
    fn close_drains_then_signals_end_of_stream() {
        let ch = BoundedChannel::new(3);
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        ch.send(3).unwrap();
        ch.close().unwrap();

        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.recv(), Some(2));
        assert_eq!(ch.recv(), Some(3));
        assert_eq!(ch.recv(), None);
        // Terminal and repeatable.
        assert_eq!(ch.recv(), None);
    }

    #[test]
    fn double_close_is_rejected() {
        let ch = BoundedChannel::<i32>::new(1);
        ch.close().unwrap();
        assert!(ch.close().is_err());
    }

    #[test]
    fn send_after_close_fails_every_time() {
        let ch = BoundedChannel::new(1);
        ch.close().unwrap();
        for attempt in 0..3 {
            match ch.send(attempt) {
                Err(err) => assert_eq!(err.into_inner(), attempt),
                Ok(()) => panic!("send succeeded on a closed channel"),
            }
        }
    }

    #[test]
    fn close_fails_blocked_sender_and_returns_value() {
        let ch = Arc::new(BoundedChannel::new(0));
        let sender = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(7))
        };

        thread::sleep(Duration::from_millis(100));
        ch.close().unwrap();

        let result = sender.join().unwrap();
        assert_eq!(result.unwrap_err().into_inner(), 7);
        // Nothing was left behind for receivers.
        assert_eq!(ch.recv(), None);
    }

    #[test]
    fn recv_timeout_expires_on_an_idle_channel() {
        let ch = BoundedChannel::<i32>::new(1);
        let err = ch.recv_timeout(Duration::from_millis(50));
        assert!(err.is_err());
        // The channel is still usable afterwards.
        ch.send(1).unwrap();
        assert_eq!(ch.recv(), Some(1));
    }

    #[test]
    fn recv_timeout_returns_value_when_present() {
        let ch = BoundedChannel::new(1);
        ch.send(9).unwrap();
        assert_eq!(ch.recv_timeout(Duration::from_millis(50)), Ok(Some(9)));
    }

    #[test]
    fn send_timeout_expires_on_a_full_channel() {
        let ch = BoundedChannel::new(1);
        ch.send(1).unwrap();
        match ch.send_timeout(2, Duration::from_millis(50)) {
            Err(err) => {
                assert!(err.is_timeout());
                assert_eq!(err.into_inner(), 2);
            }
            Ok(()) => panic!("send completed on a full channel"),
        }
        // The timed-out send left no residue.
        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.len(), 0);
    }

    #[test]
    fn try_recv_reports_empty_then_closed() {
        let ch = BoundedChannel::<i32>::new(1);
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
        ch.close().unwrap();
        assert_eq!(ch.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn rendezvous_try_send_needs_a_parked_receiver() {
        let ch = Arc::new(BoundedChannel::new(0));
        match ch.try_send(1) {
            Err(TrySendError::Full(1)) => {}
            other => panic!("expected Full(1), got {:?}", other),
        }

        let receiver = {
            let ch = ch.clone();
            thread::spawn(move || ch.recv())
        };
        // Let the receiver park.
        thread::sleep(Duration::from_millis(100));
        ch.try_send(2).unwrap();
        assert_eq!(receiver.join().unwrap(), Some(2));
    }

    #[test]
    fn iteration_ends_at_close() {
        let ch = Arc::new(BoundedChannel::new(0));
        let sender = {
            let ch = ch.clone();
            thread::spawn(move || {
                for i in 1..=3 {
                    ch.send(i).unwrap();
                }
                ch.close().unwrap();
            })
        };

        let received: Vec<i32> = ch.iter().collect();
        sender.join().unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[test]
    fn blocked_sends_complete_in_fifo_order() {
        let ch = Arc::new(BoundedChannel::new(1));
        ch.send(0).unwrap();

        // Two senders park, strictly one after the other.
        let first = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(1).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        let second = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(2).unwrap())
        };
        thread::sleep(Duration::from_millis(50));

        assert_eq!(ch.recv(), Some(0));
        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.recv(), Some(2));
        first.join().unwrap();
        second.join().unwrap();
    }
}
