use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::channel::BoundedChannel;
use crate::error::{TryRecvError, TrySendError};

/// Shared wakeup flag between one waiting select and every channel it is
/// registered on. Channels hold it weakly; a finished select is dropped
/// from their lists on the next notification sweep.
pub(crate) struct SelectSignal {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl SelectSignal {
    fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cond.notify_one();
    }

    fn reset(&self) {
        *self.ready.lock() = false;
    }

    fn wait_ready(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.cond.wait(&mut ready);
        }
    }
}

enum Op<'a, T> {
    Recv(&'a BoundedChannel<T>),
    // The value sits here until the send completes; `try_wait` hands it
    // back inside the builder when nothing was ready.
    Send(&'a BoundedChannel<T>, Option<T>),
}

impl<'a, T> Op<'a, T> {
    fn channel(&self) -> &'a BoundedChannel<T> {
        match self {
            Op::Recv(channel) => *channel,
            Op::Send(channel, _) => *channel,
        }
    }
}

/// How the winning operation of a select completed.
#[derive(Debug, PartialEq, Eq)]
pub enum SelectEvent<T> {
    /// A receive intent took a value.
    Received(T),
    /// A receive intent observed closed-and-drained.
    Closed,
    /// A send intent handed its value over.
    Sent,
    /// A send intent observed a closed channel; the value comes back.
    SendClosed(T),
}

/// Index of the completed operation, in registration order, plus its
/// outcome.
#[derive(Debug, PartialEq, Eq)]
pub struct Selected<T> {
    pub index: usize,
    pub event: SelectEvent<T>,
}

/// Waits on several channel operations at once and completes exactly one.
///
/// Register receive and send intents, then `wait` (blocking) or `try_wait`
/// (polling). When several operations are ready on the same attempt the
/// winner is picked from a randomized starting offset, so no position is
/// structurally favored over many calls.
///
/// The check-then-block race is closed by registering a shared signal on
/// every involved channel before the readiness pass: any state change that
/// happens between a failed pass and the wait flips the signal, and the
/// wait falls through.
pub struct Select<'a, T> {
    ops: Vec<Op<'a, T>>,
}

impl<'a, T> Select<'a, T> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Add a receive intent; returns its index.
    pub fn recv(&mut self, channel: &'a BoundedChannel<T>) -> usize {
        self.ops.push(Op::Recv(channel));
        self.ops.len() - 1
    }

    /// Add a send intent; returns its index. The value is stored until the
    /// select completes it or gives it back.
    pub fn send(&mut self, channel: &'a BoundedChannel<T>, value: T) -> usize {
        self.ops.push(Op::Send(channel, Some(value)));
        self.ops.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Block until one registered operation completes.
    pub fn wait(mut self) -> Selected<T> {
        assert!(
            !self.ops.is_empty(),
            "select over no operations would block forever"
        );

        let signal = Arc::new(SelectSignal::new());
        for op in &self.ops {
            op.channel().register_select(Arc::downgrade(&signal));
        }

        loop {
            signal.reset();
            if let Some(selected) = self.attempt() {
                return selected;
            }
            signal.wait_ready();
        }
    }

    /// Single readiness pass. Returns the builder (send values intact) when
    /// nothing is ready, so the caller can poll again later.
    pub fn try_wait(mut self) -> Result<Selected<T>, Self> {
        match self.attempt() {
            Some(selected) => Ok(selected),
            None => Err(self),
        }
    }

    /// One pass over the operations from a random starting offset.
    fn attempt(&mut self) -> Option<Selected<T>> {
        let len = self.ops.len();
        if len == 0 {
            return None;
        }
        let start = rand::random::<u64>() as usize % len;
        for step in 0..len {
            let index = (start + step) % len;
            match &mut self.ops[index] {
                Op::Recv(channel) => match channel.try_recv() {
                    Ok(value) => {
                        return Some(Selected {
                            index,
                            event: SelectEvent::Received(value),
                        })
                    }
                    Err(TryRecvError::Closed) => {
                        return Some(Selected {
                            index,
                            event: SelectEvent::Closed,
                        })
                    }
                    Err(TryRecvError::Empty) => {}
                },
                Op::Send(channel, slot) => {
                    let value = slot.take().expect("send intent already completed");
                    match channel.try_send(value) {
                        Ok(()) => {
                            return Some(Selected {
                                index,
                                event: SelectEvent::Sent,
                            })
                        }
                        Err(TrySendError::Closed(value)) => {
                            return Some(Selected {
                                index,
                                event: SelectEvent::SendClosed(value),
                            })
                        }
                        Err(TrySendError::Full(value)) => *slot = Some(value),
                    }
                }
            }
        }
        None
    }
}

impl<'a, T> Default for Select<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}
