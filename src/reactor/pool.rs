//! A fixed-size set of reactors, each pinned to its own OS thread.
//!
//! Offers round-robin reactor selection (used by the accept server and the
//! pipeline executor to fan work out across reactors) and
//! [`ReactorPool::await_on_all`], which schedules a future on every reactor
//! and suspends the calling fiber until all of them finish.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::task::{Context, Poll};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};

use super::general::GeneralReactor;
#[cfg(target_os = "linux")]
use super::uring::UringReactor;
use super::{Handle, Reactor, RoundRobin};

/// Which reactor flavour a [`ReactorPool`] should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorKind {
    General,
    #[cfg(target_os = "linux")]
    Uring,
}

/// A pool of reactors, one per OS thread, started together and joined
/// together. Each reactor is constructed on its own thread (its internals
/// are `Rc`-based and thus thread-confined); only the cross-thread
/// [`Handle`] and stop flag ever leave that thread.
pub struct ReactorPool {
    handles: Vec<Arc<Handle>>,
    stop_flags: Vec<Arc<AtomicBool>>,
    threads: Vec<JoinHandle<Result<()>>>,
    cursor: RoundRobin,
}

impl ReactorPool {
    /// Starts `config.reactor_threads` reactors of the requested flavour.
    /// Blocks until every reactor thread has registered its handle. Startup
    /// resource errors (ring init, in particular) are surfaced here, since
    /// a reactor that fails to start is always fatal to the pool.
    pub fn start(config: Config, kind: ReactorKind) -> Result<Self> {
        let n = config.reactor_threads.max(1);
        let (tx, rx) = mpsc::channel::<Result<(Arc<Handle>, Arc<AtomicBool>)>>();
        let mut threads = Vec::with_capacity(n);

        for index in 0..n {
            let tx = tx.clone();
            let config = config.clone();
            let builder = std::thread::Builder::new().name(format!("fiberun-reactor-{index}"));
            let join = builder
                .spawn(move || -> Result<()> {
                    let mut reactor = match kind {
                        ReactorKind::General => match GeneralReactor::new() {
                            Ok(r) => Reactor::General(r),
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                return Ok(());
                            }
                        },
                        #[cfg(target_os = "linux")]
                        ReactorKind::Uring => match UringReactor::new(&config) {
                            Ok(r) => Reactor::Uring(r),
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                return Ok(());
                            }
                        },
                    };
                    let handle = reactor.handle();
                    let stop_flag = reactor.stop_flag();
                    if tx.send(Ok((handle, stop_flag))).is_err() {
                        // The pool gave up waiting for us (another reactor
                        // failed to start); nothing left to run for.
                        return Ok(());
                    }
                    reactor.run()
                })
                .map_err(Error::Io)?;
            threads.push(join);
        }
        drop(tx);

        let mut handles = Vec::with_capacity(n);
        let mut stop_flags = Vec::with_capacity(n);
        let mut startup_error = None;
        for _ in 0..n {
            match rx.recv() {
                Ok(Ok((handle, flag))) => {
                    handles.push(handle);
                    stop_flags.push(flag);
                }
                Ok(Err(e)) => startup_error = startup_error.or(Some(e)),
                Err(_) => {
                    startup_error = startup_error.or(Some(Error::Internal(
                        "reactor thread exited before registering its handle",
                    )))
                }
            }
        }

        if let Some(e) = startup_error {
            for flag in &stop_flags {
                flag.store(true, Ordering::Relaxed);
            }
            for handle in &handles {
                handle.notify();
            }
            for join in threads {
                let _ = join.join();
            }
            return Err(e);
        }

        Ok(Self {
            handles,
            stop_flags,
            threads,
            cursor: RoundRobin::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handle(&self, index: usize) -> Arc<Handle> {
        self.handles[index].clone()
    }

    /// The next reactor index in round-robin order, shared across every
    /// caller of this pool (accept server hand-off, pipeline worker
    /// placement).
    pub fn next_index(&self) -> usize {
        self.cursor.next(self.handles.len())
    }

    /// Hands `task` to reactor `index`'s own thread; `task` runs there
    /// inside that reactor's `enter()` context, so it may call
    /// [`super::spawn`].
    pub fn dispatch(&self, index: usize, task: impl FnOnce() + Send + 'static) {
        self.handles[index].dispatch(task);
    }

    /// Schedules `make_future(index)` as a fiber on every reactor in the
    /// pool and suspends the calling fiber until all of them complete.
    ///
    /// Must be called from within a fiber (it's an `async fn`-shaped
    /// future); calling it again from inside one of the futures it
    /// dispatches would deadlock, so it is rejected instead with
    /// [`Error::Internal`]. [`ReactorPool::dispatch`] is the non-blocking
    /// variant to use from inside a fiber already driven by this pool.
    pub fn await_on_all<F, Fut>(&self, make_future: F) -> AwaitOnAll<F>
    where
        F: Fn(usize) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        AwaitOnAll {
            handles: self.handles.clone(),
            make_future,
            remaining: None,
            _guard: None,
        }
    }

    /// Sets every reactor's stop flag and wakes it; does not wait for the
    /// reactors to actually exit (use [`ReactorPool::join`] for that).
    pub fn stop(&self) {
        for (flag, handle) in self.stop_flags.iter().zip(self.handles.iter()) {
            flag.store(true, Ordering::Relaxed);
            handle.notify();
        }
    }

    /// Waits for every reactor thread to exit. A panic inside any one
    /// reactor's drive loop, propagated up through a fiber, is surfaced
    /// here as the first error seen, after every other reactor has still
    /// been allowed to join.
    pub fn join(self) -> Result<()> {
        let mut first_err = None;
        for join in self.threads {
            match join.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err = first_err.or(Some(e)),
                Err(panic) => {
                    log::error!("reactor thread panicked: {}", panic_message(&*panic));
                    first_err = first_err.or(Some(Error::Internal("reactor thread panicked")));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Future returned by [`ReactorPool::await_on_all`].
pub struct AwaitOnAll<F> {
    handles: Vec<Arc<Handle>>,
    make_future: F,
    remaining: Option<Arc<AtomicUsize>>,
    _guard: Option<super::DispatcherGuard>,
}

impl<F, Fut> Future for AwaitOnAll<F>
where
    F: Fn(usize) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.remaining.is_none() {
            let guard = match super::enter_dispatcher() {
                Ok(g) => g,
                Err(e) => return Poll::Ready(Err(e)),
            };
            if this.handles.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let remaining = Arc::new(AtomicUsize::new(this.handles.len()));
            for (index, handle) in this.handles.iter().enumerate() {
                let make_future = this.make_future.clone();
                let remaining = remaining.clone();
                let waker = cx.waker().clone();
                handle.dispatch(move || {
                    let fut = make_future(index);
                    super::spawn(format!("await_on_all-{index}"), async move {
                        fut.await;
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            waker.wake();
                        }
                    });
                });
            }
            this.remaining = Some(remaining);
            this._guard = Some(guard);
            return Poll::Pending;
        }

        let remaining = this.remaining.as_ref().unwrap();
        if remaining.load(Ordering::Acquire) == 0 {
            this._guard = None;
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}
