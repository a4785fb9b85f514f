//! The general-purpose reactor: an `mio`-driven event loop plus the shared
//! [`super::Scheduler`].
//!
//! Wraps `mio::Poll` directly rather than a third-party C event loop, since
//! there is no FFI boundary to cross for epoll here.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};

use super::io::IoHandle;
use super::{drain_inbox, drain_tasks, enter, run_ready_fibers, Handle, Scheduler, TimerWheel};

/// `Token` reserved for the cross-thread wakeup `mio::Waker`; never reused
/// for a socket fd since `RawFd` values never reach `usize::MAX`.
const WAKER_TOKEN: Token = Token(usize::MAX);

#[derive(Default)]
struct FdWakers {
    read: Option<Waker>,
    write: Option<Waker>,
}

/// The general reactor's I/O driver: an `mio::Registry` plus a per-fd table
/// of wakers suspended on readability/writability. Lives in an `Rc` so
/// [`crate::socket::FiberSocket`] can reach it through the thread-local
/// current-reactor context without borrowing the reactor itself.
pub struct Io {
    registry: mio::Registry,
    fds: RefCell<HashMap<RawFd, FdWakers>>,
}

impl Io {
    fn new(registry: mio::Registry) -> Self {
        Self {
            registry,
            fds: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, fd: RawFd) -> Result<()> {
        let mut source = SourceFd(&fd);
        self.registry
            .register(&mut source, Token(fd as usize), Interest::READABLE | Interest::WRITABLE)
            .map_err(Error::Io)?;
        self.fds.borrow_mut().entry(fd).or_default();
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) {
        let mut source = SourceFd(&fd);
        let _ = self.registry.deregister(&mut source);
        self.fds.borrow_mut().remove(&fd);
    }

    /// Replaces whatever waker was previously registered for `fd`'s read
    /// side, so an idle fiber that re-polls on every deadline (e.g. the
    /// accept server's listener, which re-checks its stop flag every
    /// `STOP_POLL_INTERVAL`) keeps exactly one stored waker instead of
    /// accumulating one per poll.
    pub(crate) fn want_read(&self, fd: RawFd, waker: Waker) {
        self.fds.borrow_mut().entry(fd).or_default().read = Some(waker);
    }

    /// Same replacement behaviour as [`Io::want_read`], for the write side.
    pub(crate) fn want_write(&self, fd: RawFd, waker: Waker) {
        self.fds.borrow_mut().entry(fd).or_default().write = Some(waker);
    }

    fn dispatch(&self, token: Token, readable: bool, writable: bool) {
        if token == WAKER_TOKEN {
            return;
        }
        let fd = token.0 as RawFd;
        let mut fds = self.fds.borrow_mut();
        if let Some(w) = fds.get_mut(&fd) {
            if readable {
                if let Some(waker) = w.read.take() {
                    waker.wake();
                }
            }
            if writable {
                if let Some(waker) = w.write.take() {
                    waker.wake();
                }
            }
        }
    }
}

/// RAII "keep this reactor's drive loop alive" marker, returned by
/// [`GeneralReactor::hold`]. Mirrors spec.md §3's "service work-guard
/// counter": the accept server and pipeline executor hold one for as long
/// as they have externally-driven work pending on this reactor, so the
/// drive loop doesn't exit between fiber wakeups.
pub struct WorkGuard {
    count: Rc<Cell<usize>>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
    }
}

/// A general-purpose per-thread reactor: `mio::Poll` plus a cooperative
/// fiber [`Scheduler`] and a min-heap sentinel timer.
pub struct GeneralReactor {
    poll: RefCell<Poll>,
    io: Rc<Io>,
    sched: Rc<RefCell<Scheduler>>,
    handle: Arc<Handle>,
    stopped: Arc<AtomicBool>,
    guards: Rc<Cell<usize>>,
    timers: RefCell<TimerWheel>,
}

impl GeneralReactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(Error::Io)?;
        let registry = poll.registry().try_clone().map_err(Error::Io)?;
        let waker = mio::Waker::new(&registry, WAKER_TOKEN).map_err(Error::Io)?;
        Ok(Self {
            poll: RefCell::new(poll),
            io: Rc::new(Io::new(registry)),
            sched: Rc::new(RefCell::new(Scheduler::new())),
            handle: Arc::new(Handle::new_general(Arc::new(waker))),
            stopped: Arc::new(AtomicBool::new(false)),
            guards: Rc::new(Cell::new(0)),
            timers: RefCell::new(TimerWheel::default()),
        })
    }

    pub fn handle(&self) -> Arc<Handle> {
        self.handle.clone()
    }

    /// A thread-safe flag the pool can set from any thread to request this
    /// reactor's drive loop exit; `notify()` must be called alongside it to
    /// break the current blocking wait.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    /// Increments the work-guard counter for as long as the returned
    /// [`WorkGuard`] lives.
    pub fn hold(&self) -> WorkGuard {
        self.guards.set(self.guards.get() + 1);
        WorkGuard {
            count: self.guards.clone(),
        }
    }

    /// Requests that the drive loop exit once every ready fiber has run and
    /// no work-guard is outstanding.
    pub fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::Relaxed);
        self.handle.notify();
    }

    /// Runs the drive loop: while not stopped (or a fiber/guard keeps it
    /// alive), drain ready fibers non-blockingly when any exist, otherwise
    /// block for one I/O event or the nearest timer deadline (spec.md §4.1).
    pub fn run(&mut self) -> Result<()> {
        let _enter = enter(
            self.sched.clone(),
            self.handle.clone(),
            IoHandle::General(self.io.clone()),
        );
        let mut events = Events::with_capacity(1024);

        loop {
            drain_tasks(&self.handle.tasks);
            drain_inbox(&self.sched, &self.handle.inbox);

            let has_ready = self.sched.borrow().has_ready();
            if self.stopped.load(AtomicOrdering::Relaxed)
                && self.guards.get() == 0
                && self.sched.borrow().fiber_count() == 0
            {
                break;
            }

            let timeout = if has_ready {
                Some(Duration::ZERO)
            } else {
                self.timers
                    .borrow()
                    .next_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()))
            };

            match self.poll.borrow_mut().poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }

            for event in events.iter() {
                self.io.dispatch(
                    event.token(),
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable() || event.is_write_closed() || event.is_error(),
                );
            }

            let now = Instant::now();
            let mut sched = self.sched.borrow_mut();
            for id in self.timers.borrow_mut().pop_expired(now) {
                sched.awakened(id);
            }
            drop(sched);

            run_ready_fibers(&self.sched, &self.handle, |deadline, id| {
                self.timers.borrow_mut().schedule(deadline, id);
            });
        }
        Ok(())
    }
}
