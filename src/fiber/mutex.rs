//! A lock for the cooperative multitasking environment.
//!
//! See [`Mutex`] for the common case (an async-friendly guard around a
//! value); [`Latch`] is the bare lock underneath it for callers that only
//! need mutual exclusion without an associated value (e.g. guarding a
//! section of reactor bookkeeping that must not be re-entered).

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// A lock with no associated data: [`Latch::lock`] suspends the calling
/// fiber until the latch is free, `Drop`ping the returned [`LatchGuard`]
/// releases it and wakes the next waiter in FIFO order.
#[derive(Default)]
pub struct Latch {
    locked: Cell<bool>,
    waiters: RefCell<VecDeque<Waker>>,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends the calling fiber until the latch can be acquired.
    pub async fn lock(&self) -> LatchGuard<'_> {
        struct Lock<'a> {
            latch: &'a Latch,
        }
        impl<'a> Future for Lock<'a> {
            type Output = LatchGuard<'a>;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                if self.latch.locked.get() {
                    self.latch.waiters.borrow_mut().push_back(cx.waker().clone());
                    Poll::Pending
                } else {
                    Poll::Ready(LatchGuard::new(self.latch))
                }
            }
        }
        Lock { latch: self }.await
    }

    /// Acquires the latch without yielding, or returns `None` if it is held.
    pub fn try_lock(&self) -> Option<LatchGuard<'_>> {
        if self.locked.get() {
            None
        } else {
            Some(LatchGuard::new(self))
        }
    }

    fn wake_one(&self) {
        if let Some(waker) = self.waiters.borrow_mut().pop_front() {
            waker.wake();
        }
    }
}

/// An RAII guard: dropping it releases the latch.
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl<'a> LatchGuard<'a> {
    fn new(latch: &'a Latch) -> Self {
        latch.locked.set(true);
        Self { latch }
    }
}

impl<'a> Drop for LatchGuard<'a> {
    fn drop(&mut self) {
        self.latch.locked.set(false);
        self.latch.wake_one();
    }
}

/// An async-friendly `Mutex`-like type: [`Mutex::lock`] is an async method,
/// so it doesn't block the reactor, and the returned guard can be held
/// across further `.await` points.
pub struct Mutex<T: ?Sized> {
    latch: Latch,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Self {
            latch: Latch::new(),
            data: UnsafeCell::new(t),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Suspends the calling fiber until the lock is acquired, then returns a
    /// guard. The lock is released when the guard is dropped.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        let _permit = self.latch.lock().await;
        MutexGuard {
            mutex: self,
            _permit,
        }
    }

    /// Acquires the lock without yielding, or returns `None` if it's held.
    /// Does not yield.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let permit = self.latch.try_lock()?;
        Some(MutexGuard {
            mutex: self,
            _permit: permit,
        })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

/// A handle to a held [`Mutex`]. Access the guarded value through
/// [`Deref`]/[`DerefMut`]. The lock is released when this is dropped.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _permit: LatchGuard<'a>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn try_lock_excludes_a_second_holder() {
        let m = Mutex::new(0);
        let g1 = m.try_lock().unwrap();
        assert!(m.try_lock().is_none());
        drop(g1);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn lock_suspends_while_held_and_wakes_on_release() {
        let m = Mutex::new(0);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let g1 = m.try_lock().unwrap();
        let mut pending = Box::pin(m.lock());
        assert!(pending.as_mut().poll(&mut cx).is_pending());

        drop(g1);
        match pending.as_mut().poll(&mut cx) {
            Poll::Ready(mut g2) => *g2 = 5,
            Poll::Pending => panic!("lock should resolve once the holder releases it"),
        }
    }
}
