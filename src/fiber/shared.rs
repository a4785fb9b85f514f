//! A capacity-bounded multi-producer multi-consumer queue usable across
//! reactor threads, for the one entity in this crate's data model that
//! genuinely needs it: the pipeline executor's File-name Queue (spec.md §3),
//! popped by a worker fiber on every reactor in the pool.
//!
//! [`super::Channel`] cannot serve this role: its `RefCell` makes it `!Sync`,
//! so the type system itself refuses to share one across threads. This type
//! is the same push/pop/close shape over a `Mutex<VecDeque<T>>` instead.
//! Waking a suspended fiber's [`Waker`] from a thread other than the one
//! driving it is sound and is exactly what this crate's reactor
//! [`crate::reactor::Handle`] already does for cross-thread dispatch, so a
//! consumer fiber on reactor B can be woken by a push happening on reactor A
//! (or on a plain non-fiber thread, e.g. the thread that called
//! [`crate::pipeline::Pipeline::run`]).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Condvar, Mutex};
use std::task::{Context, Poll, Waker};

use super::channel::Closed;

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    push_waiters: VecDeque<Waker>,
    pop_waiters: VecDeque<Waker>,
}

/// A bounded FIFO channel safe to share across OS threads via `Arc`.
pub struct SharedChannel<T> {
    inner: Mutex<Inner<T>>,
    /// Lets [`SharedChannel::push_blocking`] park a plain (non-fiber) thread
    /// instead of busy-polling while the queue is full.
    space_available: Condvar,
}

impl<T> SharedChannel<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(256)),
                capacity,
                closed: false,
                push_waiters: VecDeque::new(),
                pop_waiters: VecDeque::new(),
            }),
            space_available: Condvar::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes from a plain OS thread that is not itself driving a fiber
    /// reactor, e.g. the thread that called [`crate::pipeline::Pipeline::run`]
    /// to expand globs and feed file names in. Blocks the calling thread
    /// (not a fiber yield, since there is no reactor to yield to here) while
    /// the queue is full. Returns `Err(Closed)` immediately if the channel
    /// was already closed; if the queue closes mid-push, the remaining
    /// specs are dropped, so callers should stop feeding once this returns
    /// `Err`.
    pub fn push_blocking(&self, value: T) -> Result<(), Closed> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(Closed);
            }
            if inner.queue.len() < inner.capacity {
                inner.queue.push_back(value);
                if let Some(w) = inner.pop_waiters.pop_front() {
                    w.wake();
                }
                return Ok(());
            }
            inner = self.space_available.wait(inner).unwrap();
        }
    }

    /// Suspends the calling fiber when empty; resumes on a push or close.
    pub fn pop(&self) -> Pop<'_, T> {
        Pop { chan: self }
    }

    /// Marks the channel closed and wakes every waiter (fiber and blocked
    /// pusher thread alike).
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        for w in inner.push_waiters.drain(..) {
            w.wake();
        }
        for w in inner.pop_waiters.drain(..) {
            w.wake();
        }
        drop(inner);
        self.space_available.notify_all();
    }
}

pub struct Pop<'a, T> {
    chan: &'a SharedChannel<T>,
}

impl<'a, T> Future for Pop<'a, T> {
    type Output = Result<T, Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.chan.inner.lock().unwrap();
        if let Some(v) = inner.queue.pop_front() {
            drop(inner);
            self.chan.space_available.notify_one();
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
    use std::sync::Arc;

    #[test]
    fn push_blocking_then_pop_preserves_order() {
        let chan: SharedChannel<i32> = SharedChannel::new(2);
        chan.push_blocking(1).unwrap();
        chan.push_blocking(2).unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut pop1 = Box::pin(chan.pop());
        assert_eq!(pop1.as_mut().poll(&mut cx), Poll::Ready(Ok(1)));
        let mut pop2 = Box::pin(chan.pop());
        assert_eq!(pop2.as_mut().poll(&mut cx), Poll::Ready(Ok(2)));
    }

    #[test]
    fn close_wakes_pending_pop_and_future_pushes_fail() {
        let chan: SharedChannel<i32> = SharedChannel::new(1);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut pending = Box::pin(chan.pop());
        assert_eq!(pending.as_mut().poll(&mut cx), Poll::Pending);

        chan.close();
        assert_eq!(pending.as_mut().poll(&mut cx), Poll::Ready(Err(Closed)));
        assert_eq!(chan.push_blocking(1), Err(Closed));
    }

    #[test]
    fn push_blocking_wakes_once_a_consumer_thread_drains_it() {
        let chan = Arc::new(SharedChannel::new(1));
        chan.push_blocking(1).unwrap();

        let consumer = {
            let chan = chan.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                let waker = noop_waker();
                let mut cx = Context::from_waker(&waker);
                let mut pop = Box::pin(chan.pop());
                matches!(pop.as_mut().poll(&mut cx), Poll::Ready(Ok(1)))
            })
        };
        // Second push blocks until the consumer thread above drains slot 1.
        chan.push_blocking(2).unwrap();
        assert!(consumer.join().unwrap());
    }
}
