//! Carries a wakeup deadline out of a leaf future's `poll`, alongside the
//! `Poll::Pending` it returns.
//!
//! The source this crate is modeled on solves the same problem by
//! reinterpreting the `&mut Context` pointer as a `#[repr(C)]` struct with
//! extra fields following the real `Context`, so a leaf future can stash a
//! deadline the executor reads back after polling. That trick depends on
//! layout assumptions about a type the standard library does not guarantee
//! the shape of. This crate gets the same effect (a fiber that is `Pending`
//! on a timed wait tells its reactor "wake me by T even if nothing else
//! does") through a thread-local instead, which is sound because a reactor
//! only ever polls fibers from its own OS thread.

use std::cell::Cell;
use std::time::Instant;

thread_local! {
    static PENDING_DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Requests that the current fiber be woken again no later than `deadline`,
/// even if nothing else wakes it first. Called by a leaf future (condition
/// variable wait, channel op, fiber socket op) on every `Pending` poll that
/// has a deadline.
pub fn request_wakeup(deadline: Instant) {
    PENDING_DEADLINE.with(|cell| {
        let merged = match cell.get() {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        cell.set(Some(merged));
    });
}

/// Takes and clears the deadline requested during the just-finished poll, if
/// any. Called by the scheduler immediately after `Future::poll` returns
/// `Poll::Pending`.
pub(crate) fn take_requested_wakeup() -> Option<Instant> {
    PENDING_DEADLINE.with(|cell| cell.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn request_wakeup_keeps_the_earlier_deadline() {
        let near = Instant::now() + Duration::from_millis(10);
        let far = near + Duration::from_secs(10);
        request_wakeup(far);
        request_wakeup(near);
        assert_eq!(take_requested_wakeup(), Some(near));
        assert_eq!(take_requested_wakeup(), None);
    }
}
