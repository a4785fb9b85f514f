//! The io_uring reactor: a ring-backed drive loop plus the shared
//! [`super::Scheduler`].
//!
//! A thin layer over the ring offering `assign`/`add_poll_in`-style
//! submission, a drain loop that batches completions, and the
//! `IOSQE_IO_LINK` optimisation for chaining a poll-add with the recv/send
//! that follows it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use io_uring::{opcode, squeue, types, IoUring};

use crate::config::Config;
use crate::error::{Error, Result};

use super::io::{IoHandle, LinkedSubmission};
use super::{drain_inbox, drain_tasks, enter, run_ready_fibers, Handle, Scheduler, TimerWheel};

/// `user_data` of `0` is reserved: it marks the first half of a linked
/// poll+recv/send pair, whose success is implied by the completion that
/// follows.
const NULL_TOKEN: u64 = 0;
const TIMER_TOKEN: u64 = u64::MAX;
const EVENTFD_TOKEN: u64 = u64::MAX - 1;

enum PendingKind {
    /// A bare poll-add: the caller will retry its syscall once woken.
    Poll,
    /// A linked recv: the kernel writes directly into this owned buffer.
    /// Boxed so the allocation's address survives the entry moving between
    /// maps (only the `Box`'s pointer moves, never the backing bytes).
    Recv { buf: Box<[u8]> },
}

struct Pending {
    waker: Waker,
    kind: PendingKind,
}

struct Completed {
    result: i32,
    kind: PendingKind,
}

/// Process-wide eventfd used to interrupt an io_uring reactor's blocking
/// wait from another thread (mio has `Waker` for this; raw `io_uring` has
/// nothing equivalent, so this plays the same role).
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    fn new() -> Result<Self> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::Resource(format!("eventfd: {}", io::Error::last_os_error())));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Wakes whichever reactor thread is blocked waiting on this eventfd's
    /// completion. Safe to call from any thread, any number of times; the
    /// eventfd counter simply accumulates until drained.
    pub fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.raw(), &one as *const u64 as *const _, 8);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.raw(), buf.as_mut_ptr() as *mut _, 8);
        }
    }
}

struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    fn new() -> Result<Self> {
        let raw = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if raw < 0 {
            return Err(Error::Resource(format!("timerfd_create: {}", io::Error::last_os_error())));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn arm(&self, deadline: Instant) {
        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now).max(Duration::from_nanos(1));
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: remaining.as_secs() as libc::time_t,
                tv_nsec: remaining.subsec_nanos() as libc::c_long,
            },
        };
        unsafe {
            libc::timerfd_settime(self.raw(), 0, &spec, std::ptr::null_mut());
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.raw(), buf.as_mut_ptr() as *mut _, 8);
        }
    }
}

/// The io_uring reactor's I/O driver: the ring itself, a backlog of entries
/// awaiting a free submission slot (SQE exhaustion waits for capacity
/// rather than failing), and the token tables backing `want_read`/
/// `want_write`/linked recv.
pub struct Io {
    ring: RefCell<IoUring>,
    backlog: RefCell<VecDeque<squeue::Entry>>,
    pending: RefCell<HashMap<u64, Pending>>,
    completed: RefCell<HashMap<u64, Completed>>,
    fd_tokens: RefCell<HashMap<RawFd, Vec<u64>>>,
    next_token: Cell<u64>,
    linked_sqe: bool,
    #[allow(dead_code)] // diagnostics only; surfaced via varz once wired up by a caller
    completions_seen: AtomicI32,
}

impl Io {
    fn alloc_token(&self) -> u64 {
        loop {
            let token = self.next_token.get();
            self.next_token.set(token.wrapping_add(1));
            if token != NULL_TOKEN && token != TIMER_TOKEN && token != EVENTFD_TOKEN {
                return token;
            }
        }
    }

    fn enqueue(&self, fd: RawFd, token: u64, entry: squeue::Entry) {
        self.fd_tokens.borrow_mut().entry(fd).or_default().push(token);
        self.backlog.borrow_mut().push_back(entry);
    }

    pub(crate) fn want_read(&self, fd: RawFd, waker: Waker) {
        let token = self.alloc_token();
        self.pending.borrow_mut().insert(
            token,
            Pending {
                waker,
                kind: PendingKind::Poll,
            },
        );
        let entry = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
            .build()
            .user_data(token);
        self.enqueue(fd, token, entry);
    }

    pub(crate) fn want_write(&self, fd: RawFd, waker: Waker) {
        let token = self.alloc_token();
        self.pending.borrow_mut().insert(
            token,
            Pending {
                waker,
                kind: PendingKind::Poll,
            },
        );
        let entry = opcode::PollAdd::new(types::Fd(fd), libc::POLLOUT as u32)
            .build()
            .user_data(token);
        self.enqueue(fd, token, entry);
    }

    /// Submits a chained poll-add + recv under `IOSQE_IO_LINK`, or `None`
    /// if `linked_sqe` wasn't requested in this reactor's config.
    pub(crate) fn submit_linked_recv(self: &Rc<Self>, fd: RawFd, buf_len: usize, waker: Waker) -> Option<LinkedSubmission> {
        if !self.linked_sqe {
            return None;
        }
        let token = self.alloc_token();
        let mut buf = vec![0u8; buf_len].into_boxed_slice();
        let ptr = buf.as_mut_ptr();
        let len = buf.len() as u32;

        self.pending.borrow_mut().insert(
            token,
            Pending {
                waker,
                kind: PendingKind::Recv { buf },
            },
        );

        let poll_entry = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
            .build()
            .flags(squeue::Flags::IO_LINK)
            .user_data(NULL_TOKEN);
        let recv_entry = opcode::Recv::new(types::Fd(fd), ptr, len).build().user_data(token);

        self.fd_tokens.borrow_mut().entry(fd).or_default().push(token);
        {
            let mut backlog = self.backlog.borrow_mut();
            backlog.push_back(poll_entry);
            backlog.push_back(recv_entry);
        }

        Some(LinkedSubmission {
            token,
            io: self.clone(),
        })
    }

    /// Takes the result of a completed linked recv, if it has arrived.
    pub(crate) fn poll_linked_recv(&self, token: u64, out: &mut [u8], waker: &Waker) -> std::task::Poll<Result<usize>> {
        if let Some(completed) = self.completed.borrow_mut().remove(&token) {
            let PendingKind::Recv { buf } = completed.kind else {
                unreachable!("linked recv token resolved to a non-recv completion");
            };
            return std::task::Poll::Ready(if completed.result < 0 {
                Err(Error::Io(io::Error::from_raw_os_error(-completed.result)))
            } else {
                let n = (completed.result as usize).min(out.len());
                out[..n].copy_from_slice(&buf[..n]);
                Ok(n)
            });
        }
        // Not yet arrived: make sure we'll be woken again (re-register the
        // waker in case this is a different task than the one that
        // originally submitted, e.g. after the future was re-polled).
        if let Some(pending) = self.pending.borrow_mut().get_mut(&token) {
            pending.waker = waker.clone();
        }
        std::task::Poll::Pending
    }

    /// Drops bookkeeping for `fd`'s outstanding operations. Completions
    /// that arrive afterward for a stale token are silently ignored (the
    /// token is simply absent from `pending`/`completed`).
    pub(crate) fn cancel(&self, fd: RawFd) {
        if let Some(tokens) = self.fd_tokens.borrow_mut().remove(&fd) {
            let mut pending = self.pending.borrow_mut();
            let mut completed = self.completed.borrow_mut();
            for token in tokens {
                if let Some(p) = pending.remove(&token) {
                    p.waker.wake();
                }
                completed.remove(&token);
            }
        }
    }

    /// Drops bookkeeping for a single outstanding token, without waking
    /// anyone. Used when a [`LinkedSubmission`] is dropped before its
    /// completion arrives (a cancelled or timed-out linked recv): the
    /// future that owned it is already gone, so there is nothing left to
    /// wake, but the token must still be reclaimed or the entry (and its
    /// owned recv buffer) would live in `pending`/`completed` forever.
    pub(crate) fn forget_token(&self, token: u64) {
        self.pending.borrow_mut().remove(&token);
        self.completed.borrow_mut().remove(&token);
    }

    /// Pushes queued entries into the ring's submission queue, carrying
    /// over anything that doesn't fit to the next call.
    fn flush_backlog(&self, ring: &mut IoUring) {
        let mut backlog = self.backlog.borrow_mut();
        let mut sq = ring.submission();
        while let Some(entry) = backlog.front() {
            if unsafe { sq.push(entry) }.is_err() {
                break;
            }
            backlog.pop_front();
        }
        sq.sync();
    }

    fn process_completions(&self, ring: &mut IoUring) -> Vec<SpecialEvent> {
        // Batch-peek up to 32 completions, so one very busy reactor can't
        // starve fiber scheduling behind an unbounded completion drain.
        let mut cq = ring.completion();
        cq.sync();
        let mut special = Vec::new();
        let mut count = 0i32;
        for cqe in cq.by_ref().take(32) {
            let token = cqe.user_data();
            count += 1;
            if token == NULL_TOKEN {
                // First half of a linked pair; its success is implied by
                // the completion that follows.
                continue;
            }
            if token == TIMER_TOKEN {
                special.push(SpecialEvent::Timer);
                continue;
            }
            if token == EVENTFD_TOKEN {
                special.push(SpecialEvent::EventFd);
                continue;
            }
            if let Some(pending) = self.pending.borrow_mut().remove(&token) {
                match pending.kind {
                    PendingKind::Poll => pending.waker.wake(),
                    PendingKind::Recv { buf } => {
                        self.completed.borrow_mut().insert(
                            token,
                            Completed {
                                result: cqe.result(),
                                kind: PendingKind::Recv { buf },
                            },
                        );
                        pending.waker.wake();
                    }
                }
            }
        }
        self.completions_seen.fetch_add(count, Ordering::Relaxed);
        special
    }
}

/// Completions carrying the sentinel timer or cross-thread eventfd tokens,
/// reported back to the drive loop instead of a fiber waker.
enum SpecialEvent {
    Timer,
    EventFd,
}

/// A per-thread reactor driving fibers against a raw `io_uring` ring.
pub struct UringReactor {
    io: Rc<Io>,
    sched: Rc<RefCell<Scheduler>>,
    handle: Arc<Handle>,
    stopped: Arc<AtomicBool>,
    guards: Rc<Cell<usize>>,
    timers: RefCell<TimerWheel>,
    timerfd: TimerFd,
    eventfd: Arc<EventFd>,
    armed_deadline: Cell<Option<Instant>>,
}

impl UringReactor {
    pub fn new(config: &Config) -> Result<Self> {
        let ring = IoUring::new(config.ring_entries).map_err(|e| Error::Resource(format!("io_uring init: {e}")))?;
        let eventfd = Arc::new(EventFd::new()?);
        let timerfd = TimerFd::new()?;
        Ok(Self {
            io: Rc::new(Io {
                ring: RefCell::new(ring),
                backlog: RefCell::new(VecDeque::new()),
                pending: RefCell::new(HashMap::new()),
                completed: RefCell::new(HashMap::new()),
                fd_tokens: RefCell::new(HashMap::new()),
                next_token: Cell::new(1),
                linked_sqe: config.linked_sqe,
                completions_seen: AtomicI32::new(0),
            }),
            sched: Rc::new(RefCell::new(Scheduler::new())),
            handle: Arc::new(Handle::new_uring(eventfd.clone())),
            stopped: Arc::new(AtomicBool::new(false)),
            guards: Rc::new(Cell::new(0)),
            timers: RefCell::new(TimerWheel::default()),
            timerfd,
            eventfd,
            armed_deadline: Cell::new(None),
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

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.handle.notify();
    }

    fn submit_eventfd_poll(&self) {
        let entry = opcode::PollAdd::new(types::Fd(self.eventfd.raw()), libc::POLLIN as u32)
            .build()
            .user_data(EVENTFD_TOKEN);
        self.io.backlog.borrow_mut().push_back(entry);
    }

    fn rearm_timer_if_needed(&self) {
        let next = self.timers.borrow().next_deadline();
        if next == self.armed_deadline.get() {
            return;
        }
        if let Some(deadline) = next {
            self.timerfd.arm(deadline);
            let entry = opcode::PollAdd::new(types::Fd(self.timerfd.raw()), libc::POLLIN as u32)
                .build()
                .user_data(TIMER_TOKEN);
            self.io.backlog.borrow_mut().push_back(entry);
        }
        self.armed_deadline.set(next);
    }

    pub fn run(&mut self) -> Result<()> {
        let _enter = enter(self.sched.clone(), self.handle.clone(), IoHandle::Uring(self.io.clone()));
        self.submit_eventfd_poll();

        loop {
            drain_tasks(&self.handle.tasks);
            drain_inbox(&self.sched, &self.handle.inbox);
            self.rearm_timer_if_needed();

            let has_ready = self.sched.borrow().has_ready();
            if self.stopped.load(Ordering::Relaxed)
                && self.guards.get() == 0
                && self.sched.borrow().fiber_count() == 0
            {
                break;
            }

            {
                let mut ring = self.io.ring.borrow_mut();
                self.io.flush_backlog(&mut ring);
                let result = if has_ready {
                    ring.submit()
                } else {
                    ring.submit_and_wait(1)
                };
                match result {
                    Ok(_) => {}
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
                    Err(e) => return Err(Error::Io(e)),
                }

                let special = self.io.process_completions(&mut ring);
                drop(ring);
                for event in special {
                    match event {
                        SpecialEvent::Timer => {
                            self.timerfd.drain();
                            self.armed_deadline.set(None);
                        }
                        SpecialEvent::EventFd => {
                            self.eventfd.drain();
                            self.submit_eventfd_poll();
                        }
                    }
                }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_allocator_skips_reserved_values() {
        let io = Io {
            ring: RefCell::new(IoUring::new(8).expect("ring init")),
            backlog: RefCell::new(VecDeque::new()),
            pending: RefCell::new(HashMap::new()),
            completed: RefCell::new(HashMap::new()),
            fd_tokens: RefCell::new(HashMap::new()),
            next_token: Cell::new(u64::MAX - 2),
            linked_sqe: false,
            completions_seen: AtomicI32::new(0),
        };
        for _ in 0..8 {
            let token = io.alloc_token();
            assert_ne!(token, NULL_TOKEN);
            assert_ne!(token, TIMER_TOKEN);
            assert_ne!(token, EVENTFD_TOKEN);
        }
    }
}
