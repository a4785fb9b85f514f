//! Cooperative multitasking module.
//!
//! With the fiber module, fibers can be spawned onto the reactor currently
//! driving the calling thread, suspended on I/O, channels, condition
//! variables and mutexes, and joined. Unlike the source this crate takes its
//! shape from, there is no real stack switch: a fiber here is a boxed
//! [`Future`], and "cooperative scheduling" means the reactor polls it to
//! the next suspension point rather than swapping stacks.
//!
//! See also:
//! - [`Cond`], [`Mutex`]: synchronization primitives
//! - [`Channel`]: the bounded multi-producer multi-consumer queue

use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::task::{Context, Poll};

pub mod channel;
pub mod cond;
pub mod mutex;
pub mod shared;
pub mod waker;

pub use channel::Channel;
pub use cond::Cond;
pub use mutex::{Latch, LatchGuard, Mutex};
pub use shared::SharedChannel;

/// A stable, type-erased reference to a fiber slot in its owning reactor's
/// scheduler arena. Valid only relative to that one reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u32, NonZeroU32);

impl FiberId {
    pub(crate) fn from_key<T>(key: crate::arena::Key<T>) -> Self {
        let (index, generation) = key.to_raw();
        FiberId(index, generation)
    }

    pub(crate) fn to_key<T>(self) -> crate::arena::Key<T> {
        crate::arena::Key::from_raw(self.0, self.1)
    }
}

/// A fiber's lifecycle state, tracked in its scheduler slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Running,
    Waiting,
    Terminated,
}

/// The boxed future a fiber slot drives to completion. Fibers in this crate
/// never return a value directly to their spawner except through a
/// [`JoinHandle`]'s internal slot, so the future's output is erased to `()`
/// and the actual result (if any) is stashed by the future itself before it
/// completes.
pub(crate) type BoxedFiberFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Configures a fiber before spawning it, mirroring this crate's chained
/// setter style for fiber creation.
#[derive(Debug, Default, Clone)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self { name: None }
    }

    /// Names the fiber-to-be; used only for diagnostics (logging, panics).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn take_name(&mut self) -> String {
        self.name.take().unwrap_or_else(|| "<fiber>".to_string())
    }
}

/// Yields to the reactor once, giving every other ready fiber a turn before
/// this one is polled again. Used by long-running loops (the pipeline
/// executor's mapper fiber yields every 1000 records) to stay cooperative
/// without an explicit suspension point like I/O or a channel operation.
pub fn yield_now() -> YieldNow {
    YieldNow { polled: false }
}

#[doc(hidden)]
pub struct YieldNow {
    polled: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.polled {
            Poll::Ready(())
        } else {
            self.polled = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_id_round_trips_through_raw_key() {
        let mut arena: crate::arena::Arena<i32> = crate::arena::Arena::new();
        let key = arena.insert(7);
        let id = FiberId::from_key(key);
        let key_back: crate::arena::Key<i32> = id.to_key();
        assert_eq!(arena.get(key_back), Some(&7));
    }
}
