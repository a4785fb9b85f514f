//! A capacity-bounded multi-producer multi-consumer queue with suspending
//! push/pop and explicit close.
//!
//! Generalizes this crate's fiber channel (there, a fixed-capacity queue
//! backed by a single allocation per message) to a plain `VecDeque` plus two
//! FIFO waiter lists, one per direction, since every instance here lives
//! entirely in safe Rust rather than wrapping a C ring buffer.
//!
//! This type is `Rc`-shared among fibers on a single reactor only. Its
//! `RefCell` makes it `!Sync`, so the type system itself refuses to let it
//! cross threads. The pipeline executor's per-reactor Record Queue is
//! exactly this (every pusher and its one popper share a reactor); the
//! cross-reactor File-name Queue needs genuine thread-safety instead, which
//! [`super::shared::SharedChannel`] provides with the same push/pop/close
//! shape over a `Mutex` in place of the `RefCell`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// Returned by [`Channel::push`]: the channel was already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

/// Returned by [`Channel::try_push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPushError {
    Full,
    Closed,
}

/// Returned by [`Channel::try_pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopError {
    Empty,
    Closed,
}

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    push_waiters: VecDeque<Waker>,
    pop_waiters: VecDeque<Waker>,
}

/// A bounded FIFO channel. Cloning is not provided: share a `Channel`
/// through an `Rc`/`Arc` the way every caller in this crate does (fibers on
/// one reactor share via `Rc`, cross-reactor sharing uses `Arc` since the
/// channel itself carries no thread affinity).
pub struct Channel<T> {
    inner: RefCell<Inner<T>>,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            inner: RefCell::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(256)),
                capacity,
                closed: false,
                push_waiters: VecDeque::new(),
                pop_waiters: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Suspends the calling fiber if the queue is full; resumes when a
    /// consumer makes space or the channel is closed.
    pub fn push(&self, value: T) -> Push<'_, T> {
        Push {
            chan: self,
            value: Some(value),
        }
    }

    /// Pushes `value` without yielding if there is capacity.
    pub fn try_push(&self, value: T) -> Result<(), (TryPushError, T)> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err((TryPushError::Closed, value));
        }
        if inner.queue.len() >= inner.capacity {
            return Err((TryPushError::Full, value));
        }
        inner.queue.push_back(value);
        if let Some(w) = inner.pop_waiters.pop_front() {
            w.wake();
        }
        Ok(())
    }

    /// Suspends the calling fiber when empty; resumes on a push or close.
    pub fn pop(&self) -> Pop<'_, T> {
        Pop { chan: self }
    }

    /// Pops without yielding if an element is already available.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.queue.pop_front() {
            if let Some(w) = inner.push_waiters.pop_front() {
                w.wake();
            }
            Ok(v)
        } else if inner.closed {
            Err(TryPopError::Closed)
        } else {
            Err(TryPopError::Empty)
        }
    }

    /// Marks the channel closed and wakes *all* waiters. Pushes after this
    /// return `closed`; pops drain whatever remains before observing
    /// `closed`.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        for w in inner.push_waiters.drain(..) {
            w.wake();
        }
        for w in inner.pop_waiters.drain(..) {
            w.wake();
        }
    }

    /// Marks the channel closed but wakes only consumers. Producers that
    /// are already suspended on `push` remain suspended (the caller is
    /// expected to know no more capacity will free up for them); producers
    /// that haven't yet tried to push will see `closed` immediately.
    pub fn start_closing(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        for w in inner.pop_waiters.drain(..) {
            w.wake();
        }
    }
}

pub struct Push<'a, T> {
    chan: &'a Channel<T>,
    value: Option<T>,
}

impl<'a, T> Future for Push<'a, T> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.chan.inner.borrow_mut();
        if inner.closed {
            this.value = None;
            return Poll::Ready(Err(Closed));
        }
        if inner.queue.len() < inner.capacity {
            inner.queue.push_back(this.value.take().expect("polled after completion"));
            if let Some(w) = inner.pop_waiters.pop_front() {
                w.wake();
            }
            return Poll::Ready(Ok(()));
        }
        inner.push_waiters.push_back(cx.waker().clone());
        Poll::Pending
    }
}

pub struct Pop<'a, T> {
    chan: &'a Channel<T>,
}

impl<'a, T> Future for Pop<'a, T> {
    type Output = Result<T, Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.chan.inner.borrow_mut();
        if let Some(v) = inner.queue.pop_front() {
            if let Some(w) = inner.push_waiters.pop_front() {
                w.wake();
            }
            return Poll::Ready(Ok(v));
        }
        if inner.closed {
            return Poll::Ready(Err(Closed));
        }
        inner.pop_waiters.push_back(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn cx(waker: &Waker) -> Context<'_> {
        Context::from_waker(waker)
    }

    #[test]
    fn fifo_order_is_preserved_across_blocking_push() {
        let chan = Channel::new(2);
        let waker = noop_waker();

        assert!(chan.try_push(1).is_ok());
        assert!(chan.try_push(2).is_ok());
        // Capacity 2, already full: a third push must suspend.
        let mut pending = Box::pin(chan.push(3));
        assert_eq!(pending.as_mut().poll(&mut cx(&waker)), Poll::Pending);

        assert_eq!(chan.try_pop(), Ok(1));
        // Popping wakes the blocked pusher, and polling it again must succeed.
        assert_eq!(pending.as_mut().poll(&mut cx(&waker)), Poll::Ready(Ok(())));

        assert_eq!(chan.try_pop(), Ok(2));
        assert_eq!(chan.try_pop(), Ok(3));
    }

    #[test]
    fn close_wakes_both_sides_and_drains_remaining_elements() {
        let chan = Channel::new(4);
        let waker = noop_waker();

        chan.try_push(1).unwrap();
        let mut blocked_pop = Box::pin(chan.pop());
        // Prime a second, genuinely empty popper.
        chan.try_pop().unwrap();
        let mut empty_pop = Box::pin(chan.pop());
        assert_eq!(empty_pop.as_mut().poll(&mut cx(&waker)), Poll::Pending);

        chan.close();
        assert_eq!(blocked_pop.as_mut().poll(&mut cx(&waker)), Poll::Ready(Err(Closed)));
        assert_eq!(empty_pop.as_mut().poll(&mut cx(&waker)), Poll::Ready(Err(Closed)));
        assert!(matches!(
            chan.try_push(2),
            Err((TryPushError::Closed, _))
        ));
    }

    #[test]
    fn start_closing_only_wakes_consumers() {
        let chan = Channel::new(1);
        let waker = noop_waker();

        chan.try_push(1).unwrap();
        let mut blocked_push = Box::pin(chan.push(2));
        assert_eq!(blocked_push.as_mut().poll(&mut cx(&waker)), Poll::Pending);

        chan.start_closing();
        // The already-blocked producer is not woken by start_closing.
        assert_eq!(blocked_push.as_mut().poll(&mut cx(&waker)), Poll::Pending);

        // Consumers still drain what's left, then observe closed.
        assert_eq!(chan.try_pop(), Ok(1));
        assert_eq!(chan.try_pop(), Err(TryPopError::Closed));
    }
}
