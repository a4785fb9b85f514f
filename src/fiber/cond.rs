//! A condition variable for fibers.
//!
//! - call [`Cond::wait`] or [`Cond::wait_timeout`] to suspend the calling
//!   fiber until a signal arrives.
//! - call [`Cond::signal`] to wake a single waiting fiber.
//! - call [`Cond::broadcast`] to wake every waiting fiber.
//!
//! Unlike `pthread_cond`, [`Cond`] doesn't require mutex wrapping: each
//! fiber only ever runs on its own reactor thread, so there is no race
//! between checking a predicate and registering to wait.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::clock;

#[derive(Default)]
pub struct Cond {
    waiters: RefCell<Vec<Waker>>,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes one fiber waiting on the cond. Does nothing if no one is
    /// waiting. Does not yield.
    pub fn signal(&self) {
        let mut waiters = self.waiters.borrow_mut();
        if !waiters.is_empty() {
            waiters.remove(0).wake();
        }
    }

    /// Wakes every fiber waiting on the cond. Does not yield.
    pub fn broadcast(&self) {
        for waker in self.waiters.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    /// Suspends the calling fiber until [`signal`](Self::signal) or
    /// [`broadcast`](Self::broadcast) is called. Like `pthread_cond`, this
    /// can wake up spuriously (e.g. if the fiber socket it's layered under
    /// is cancelled); callers should re-check their predicate in a loop.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            cond: self,
            registered: false,
        }
    }

    /// Shortcut for [`wait`](Self::wait) with a deadline. Resolves to
    /// `true` on signal, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitTimeout<'_> {
        WaitTimeout {
            cond: self,
            deadline: clock::now() + timeout,
            registered: false,
        }
    }
}

pub struct Wait<'a> {
    cond: &'a Cond,
    registered: bool,
}

impl<'a> Future for Wait<'a> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.registered {
            return Poll::Ready(());
        }
        self.cond.waiters.borrow_mut().push(cx.waker().clone());
        self.registered = true;
        Poll::Pending
    }
}

pub struct WaitTimeout<'a> {
    cond: &'a Cond,
    deadline: std::time::Instant,
    registered: bool,
}

impl<'a> Future for WaitTimeout<'a> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        if self.registered {
            return Poll::Ready(clock::now() < self.deadline);
        }
        if clock::now() >= self.deadline {
            return Poll::Ready(false);
        }
        crate::reactor::context::request_wakeup(self.deadline);
        self.cond.waiters.borrow_mut().push(cx.waker().clone());
        self.registered = true;
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn signal_wakes_exactly_one_waiter() {
        let cond = Cond::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut a = Box::pin(cond.wait());
        let mut b = Box::pin(cond.wait());
        assert_eq!(a.as_mut().poll(&mut cx), Poll::Pending);
        assert_eq!(b.as_mut().poll(&mut cx), Poll::Pending);
        assert_eq!(cond.waiters.borrow().len(), 2);

        cond.signal();
        assert_eq!(cond.waiters.borrow().len(), 1);
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let cond = Cond::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut a = Box::pin(cond.wait());
        let mut b = Box::pin(cond.wait());
        let _ = a.as_mut().poll(&mut cx);
        let _ = b.as_mut().poll(&mut cx);

        cond.broadcast();
        assert!(cond.waiters.borrow().is_empty());
        assert_eq!(a.as_mut().poll(&mut cx), Poll::Ready(()));
        assert_eq!(b.as_mut().poll(&mut cx), Poll::Ready(()));
    }
}
