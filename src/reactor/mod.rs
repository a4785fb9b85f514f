//! Per-thread reactor and the cooperative fiber scheduler it drives.
//!
//! A [`Scheduler`] owns an arena of fiber slots and a FIFO ready queue, the
//! systems rendering of this crate's design notes on replacing an
//! intrusively linked ready queue with arena-allocated nodes plus stable
//! indices. Two reactor flavours ([`GeneralReactor`], [`UringReactor`])
//! embed a `Scheduler` and drive it against their own I/O primitive, per
//! the shared scheduling contract: `awakened`, `pick_next`, `has_ready`,
//! `suspend_until`, `notify`.

pub mod context;
pub mod general;
pub(crate) mod io;
pub mod pool;
#[cfg(target_os = "linux")]
pub mod uring;

use std::cell::RefCell;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Instant;

use crossbeam_queue::SegQueue;

use crate::arena::Arena;
use crate::fiber::waker::{waker_for, WakeSink};
use crate::fiber::{BoxedFiberFuture, FiberId, State};

pub use general::GeneralReactor;
pub use pool::ReactorPool;
#[cfg(target_os = "linux")]
pub use uring::UringReactor;

/// Either reactor flavour, held without dynamic dispatch so a pool's `Vec`
/// stays homogeneous on the hot path.
pub enum Reactor {
    General(GeneralReactor),
    #[cfg(target_os = "linux")]
    Uring(UringReactor),
}

impl Reactor {
    pub fn run(&mut self) -> crate::error::Result<()> {
        match self {
            Reactor::General(r) => r.run(),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.run(),
        }
    }

    pub fn stop(&self) {
        match self {
            Reactor::General(r) => r.stop(),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.stop(),
        }
    }

    /// A thread-safe handle that, combined with [`Handle::notify`], lets a
    /// caller on another thread request this reactor stop without owning
    /// the (thread-confined) `Reactor` value itself.
    pub fn stop_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        match self {
            Reactor::General(r) => r.stop_flag(),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.stop_flag(),
        }
    }

    pub fn handle(&self) -> Arc<Handle> {
        match self {
            Reactor::General(r) => r.handle(),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.handle(),
        }
    }
}

struct FiberSlot {
    future: Option<BoxedFiberFuture>,
    #[allow(dead_code)] // kept for panic/log diagnostics
    name: String,
    state: State,
    queued: bool,
    join_waiters: Vec<Waker>,
}

/// The ready queue plus fiber arena shared by both reactor flavours.
pub struct Scheduler {
    slab: Arena<FiberSlot>,
    ready: VecDeque<FiberId>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            slab: Arena::new(),
            ready: VecDeque::new(),
        }
    }

    /// Attaches `id` to the ready queue, unless it is already queued or has
    /// already reached a terminal state. There is no explicit "dispatcher
    /// fiber" entry in the slab to exclude: the reactor's own drive loop is
    /// never itself a slab entry, so it can never be handed to `awakened`.
    fn awakened(&mut self, id: FiberId) {
        if let Some(slot) = self.slab.get_mut(id.to_key()) {
            if !slot.queued && slot.state != State::Terminated {
                slot.queued = true;
                slot.state = State::Ready;
                self.ready.push_back(id);
            }
        }
    }

    fn pick_next(&mut self) -> Option<FiberId> {
        let id = self.ready.pop_front()?;
        if let Some(slot) = self.slab.get_mut(id.to_key()) {
            slot.queued = false;
        }
        Some(id)
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn fiber_count(&self) -> usize {
        self.slab.len()
    }
}

/// A thunk that constructs and spawns a fiber on whichever reactor thread
/// eventually runs it. Must be `Send` (it crosses threads) even though the
/// future it produces is not: the future is only ever created once already
/// running on the target reactor's own OS thread.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Thread-safe side of a reactor: a cross-thread inbox of wakeups, a queue
/// of dispatched tasks, and whatever primitive breaks the reactor's
/// blocking wait. Cheap to clone and share with other threads (channels,
/// `await_on_all` dispatch, the accept server's round-robin hand-off).
pub struct Handle {
    inbox: Arc<SegQueue<FiberId>>,
    tasks: Arc<SegQueue<Task>>,
    notifier: Notifier,
}

enum Notifier {
    General(Arc<mio::Waker>),
    #[cfg(target_os = "linux")]
    Uring(Arc<uring::EventFd>),
}

impl Handle {
    pub(crate) fn new_general(waker: Arc<mio::Waker>) -> Self {
        Self {
            inbox: Arc::new(SegQueue::new()),
            tasks: Arc::new(SegQueue::new()),
            notifier: Notifier::General(waker),
        }
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn new_uring(eventfd: Arc<uring::EventFd>) -> Self {
        Self {
            inbox: Arc::new(SegQueue::new()),
            tasks: Arc::new(SegQueue::new()),
            notifier: Notifier::Uring(eventfd),
        }
    }

    /// Arms the sentinel timer to fire immediately; produces at most one
    /// spurious wake (spec.md §4.1 `notify()`).
    pub fn notify(&self) {
        match &self.notifier {
            Notifier::General(w) => {
                let _ = w.wake();
            }
            #[cfg(target_os = "linux")]
            Notifier::Uring(e) => e.notify(),
        }
    }

    /// Hands `task` to this reactor's own thread and wakes it. `task`
    /// typically closes over a `FnOnce` that calls [`spawn`]; it must do so
    /// from inside the target reactor's own run loop, since `spawn` reads
    /// thread-local reactor state.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        self.tasks.push(Box::new(task));
        self.notify();
    }
}

impl WakeSink for Handle {
    fn wake_fiber(&self, id: FiberId) {
        self.inbox.push(id);
        self.notify();
    }
}

/// A monotonic min-heap of `(deadline, fiber)` pairs, used by both reactor
/// flavours as the sentinel timer's backing store (neither `mio` nor raw
/// `io_uring` ships a timer wheel). Entries are never explicitly cancelled;
/// a fiber woken by something else before its deadline simply causes a
/// harmless no-op wake when the entry eventually expires, since `awakened`
/// ignores fibers that are not currently waiting.
#[derive(Default)]
pub(crate) struct TimerWheel {
    heap: BinaryHeap<std::cmp::Reverse<(Instant, u64, FiberId)>>,
    sequence: u64,
}

impl TimerWheel {
    pub fn schedule(&mut self, deadline: Instant, id: FiberId) {
        self.sequence += 1;
        self.heap
            .push(std::cmp::Reverse((deadline, self.sequence, id)));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|std::cmp::Reverse((d, _, _))| *d)
    }

    /// Pops every entry whose deadline has passed `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<FiberId> {
        let mut expired = Vec::new();
        while let Some(std::cmp::Reverse((deadline, _, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let std::cmp::Reverse((_, _, id)) = self.heap.pop().unwrap();
            expired.push(id);
        }
        expired
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentReactor>> = const { RefCell::new(None) };
}

#[derive(Clone)]
struct CurrentReactor {
    sched: Rc<RefCell<Scheduler>>,
    handle: Arc<Handle>,
    io: io::IoHandle,
}

/// RAII marker that a reactor is driving the calling thread; fiber
/// operations (`spawn`, `yield_now`, channel/cond suspensions) only make
/// sense while one of these is alive.
pub(crate) struct EnterGuard {
    previous: Option<CurrentReactor>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| *cell.borrow_mut() = self.previous.take());
    }
}

pub(crate) fn enter(sched: Rc<RefCell<Scheduler>>, handle: Arc<Handle>, io: io::IoHandle) -> EnterGuard {
    let previous = CURRENT.with(|cell| {
        cell.borrow_mut()
            .replace(CurrentReactor { sched, handle, io })
    });
    EnterGuard { previous }
}

fn with_current<R>(f: impl FnOnce(&Rc<RefCell<Scheduler>>, &Arc<Handle>) -> R) -> R {
    CURRENT.with(|cell| {
        let borrowed = cell.borrow();
        let current = borrowed
            .as_ref()
            .expect("fiber operation invoked outside of a running reactor");
        f(&current.sched, &current.handle)
    })
}

/// The I/O driver backing the reactor currently driving this thread. Used by
/// [`crate::socket::FiberSocket`] to register/await readiness without
/// needing to know which reactor flavour it's bound to.
pub(crate) fn current_io() -> io::IoHandle {
    CURRENT.with(|cell| {
        let borrowed = cell.borrow();
        borrowed
            .as_ref()
            .expect("fiber socket operation invoked outside of a running reactor")
            .io
            .clone()
    })
}

/// Polls one ready fiber to its next suspension point or completion. Any
/// deadline it requested via [`context::request_wakeup`] is handed to
/// `arm_timer`.
fn poll_one(
    sched: &Rc<RefCell<Scheduler>>,
    handle: &Arc<Handle>,
    id: FiberId,
    arm_timer: impl FnOnce(Instant, FiberId),
) {
    let mut future = {
        let mut s = sched.borrow_mut();
        match s.slab.get_mut(id.to_key()) {
            Some(slot) => {
                slot.state = State::Running;
                match slot.future.take() {
                    Some(f) => f,
                    None => return,
                }
            }
            None => return,
        }
    };

    let waker = waker_for(handle.clone(), id);
    let mut cx = TaskContext::from_waker(&waker);

    // A panicking fiber must not take the reactor down with it (spec.md §7:
    // "panics within a fiber are caught at the fiber entry point, logged,
    // and turned into a fiber termination"). `AssertUnwindSafe` is sound
    // here: on unwind we drop `future` without resuming it, so no
    // half-mutated state it closed over is ever observed again.
    let poll_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

    let poll_result = match poll_result {
        Ok(r) => r,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("fiber panicked: {message}");
            Poll::Ready(())
        }
    };

    match poll_result {
        Poll::Ready(()) => {
            let mut s = sched.borrow_mut();
            if let Some(slot) = s.slab.get_mut(id.to_key()) {
                slot.state = State::Terminated;
                for waiter in slot.join_waiters.drain(..) {
                    waiter.wake();
                }
            }
            s.slab.remove(id.to_key());
        }
        Poll::Pending => {
            let deadline = context::take_requested_wakeup();
            {
                let mut s = sched.borrow_mut();
                if let Some(slot) = s.slab.get_mut(id.to_key()) {
                    slot.future = Some(future);
                    slot.state = State::Waiting;
                }
            }
            if let Some(d) = deadline {
                arm_timer(d, id);
            }
        }
    }
}

/// Drains every ready fiber, polling each at most once per call (a fiber
/// that re-wakes itself, e.g. via [`crate::fiber::yield_now`], is polled
/// again only on the next call, giving other ready fibers a turn first).
fn run_ready_fibers(
    sched: &Rc<RefCell<Scheduler>>,
    handle: &Arc<Handle>,
    mut arm_timer: impl FnMut(Instant, FiberId),
) {
    let batch: Vec<FiberId> = {
        let mut s = sched.borrow_mut();
        std::iter::from_fn(|| s.pick_next()).collect()
    };
    for id in batch {
        poll_one(sched, handle, id, |d, id| arm_timer(d, id));
    }
}

fn drain_inbox(sched: &Rc<RefCell<Scheduler>>, inbox: &SegQueue<FiberId>) {
    let mut s = sched.borrow_mut();
    while let Some(id) = inbox.pop() {
        s.awakened(id);
    }
}

/// Runs every dispatched [`Task`] queued for this reactor. Must be called
/// from inside the reactor's own `enter()` context so tasks that call
/// [`spawn`] succeed.
fn drain_tasks(tasks: &SegQueue<Task>) {
    while let Some(task) = tasks.pop() {
        task();
    }
}

/// Spawns a fiber on the reactor currently driving this thread.
pub fn spawn<F>(name: impl Into<String>, future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    with_current(|sched, handle| {
        let _ = handle;
        let result = Rc::new(RefCell::new(None));
        let result_slot = result.clone();
        let boxed: BoxedFiberFuture = Box::pin(async move {
            let value = future.await;
            *result_slot.borrow_mut() = Some(value);
        });
        let mut s = sched.borrow_mut();
        let key = s.slab.insert(FiberSlot {
            future: Some(boxed),
            name: name.into(),
            state: State::Ready,
            queued: true,
            join_waiters: Vec::new(),
        });
        let id = FiberId::from_key(key);
        s.ready.push_back(id);
        drop(s);
        JoinHandle {
            id,
            sched: sched.clone(),
            result,
        }
    })
}

/// The number of live fibers on the reactor currently driving this thread.
pub fn fiber_count() -> usize {
    with_current(|sched, _| sched.borrow().fiber_count())
}

/// A handle to a spawned fiber's eventual result.
pub struct JoinHandle<T> {
    #[allow(dead_code)]
    id: FiberId,
    sched: Rc<RefCell<Scheduler>>,
    result: Rc<RefCell<Option<T>>>,
}

impl<T> JoinHandle<T> {
    pub fn join(self) -> Join<T> {
        Join { handle: self }
    }
}

pub struct Join<T> {
    handle: JoinHandle<T>,
}

impl<T> Future for Join<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<T> {
        if let Some(v) = self.handle.result.borrow_mut().take() {
            return Poll::Ready(v);
        }
        let mut s = self.handle.sched.borrow_mut();
        if let Some(slot) = s.slab.get_mut(self.handle.id.to_key()) {
            slot.join_waiters.push(cx.waker().clone());
            Poll::Pending
        } else {
            drop(s);
            match self.handle.result.borrow_mut().take() {
                Some(v) => Poll::Ready(v),
                None => panic!("joined fiber vanished without producing a result"),
            }
        }
    }
}

/// Reentrancy guard for [`ReactorPool::await_on_all`]: set while the calling
/// fiber is blocked dispatching work to every reactor, cleared on return.
/// See this crate's concurrency model: `await_on_all` must not be called
/// again from within one of the fibers it dispatched.
thread_local! {
    static INSIDE_DISPATCHER: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

pub(crate) fn enter_dispatcher() -> Result<DispatcherGuard, crate::error::Error> {
    let already_inside = INSIDE_DISPATCHER.with(|c| c.replace(true));
    if already_inside {
        INSIDE_DISPATCHER.with(|c| c.set(true));
        return Err(crate::error::Error::Internal("reentrant await_on_all"));
    }
    Ok(DispatcherGuard)
}

pub(crate) struct DispatcherGuard;

impl Drop for DispatcherGuard {
    fn drop(&mut self) {
        INSIDE_DISPATCHER.with(|c| c.set(false));
    }
}

/// Generates the next reactor index for round-robin selection, shared by
/// the accept server and the pipeline executor's reactor iteration.
pub(crate) struct RoundRobin(AtomicUsize);

impl RoundRobin {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn next(&self, len: usize) -> usize {
        self.0.fetch_add(1, AtomicOrdering::Relaxed) % len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_wheel_pops_only_expired_entries_in_deadline_order() {
        let mut arena: crate::arena::Arena<()> = crate::arena::Arena::new();
        let a = FiberId::from_key(arena.insert(()));
        let b = FiberId::from_key(arena.insert(()));

        let base = Instant::now();
        let mut wheel = TimerWheel::default();
        wheel.schedule(base + std::time::Duration::from_secs(2), a);
        wheel.schedule(base + std::time::Duration::from_secs(1), b);

        assert_eq!(wheel.next_deadline(), Some(base + std::time::Duration::from_secs(1)));
        assert!(wheel.pop_expired(base).is_empty());

        let expired = wheel.pop_expired(base + std::time::Duration::from_secs(1));
        assert_eq!(expired, vec![b]);
    }

    #[test]
    fn round_robin_cycles_through_every_index() {
        let rr = RoundRobin::new();
        let picks: Vec<_> = (0..5).map(|_| rr.next(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }
}
