//! A [`std::task::Waker`] that re-enqueues a fiber's slab index onto its
//! owning reactor's ready queue, instead of resuming it inline.
//!
//! Grounded on this crate's fiber-async runtime, which builds a
//! [`std::task::RawWaker`] by hand around an `Rc<Cond>` so that waking a
//! future broadcasts a condition variable the dispatcher is waiting on. The
//! same shape is generalized here from "one `Cond` per `block_on` call" to
//! "one sink shared by every fiber on a reactor, keyed by fiber id", because
//! a reactor runs many fibers concurrently rather than blocking on exactly
//! one future.

use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

use super::FiberId;

/// Implemented by a reactor's handle: receives wake notifications for one of
/// its fibers from any thread, including its own.
pub trait WakeSink: Send + Sync {
    fn wake_fiber(&self, id: FiberId);
}

/// Builds a [`Waker`] that calls `sink.wake_fiber(id)` when woken, from any
/// thread, any number of times, including after the fiber has already
/// completed (the sink is expected to ignore wakes for unknown/dead ids).
pub fn waker_for(sink: Arc<dyn WakeSink>, id: FiberId) -> Waker {
    let data = Box::into_raw(Box::new(WakerData { sink, id })).cast();
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

struct WakerData {
    sink: Arc<dyn WakeSink>,
    id: FiberId,
}

static VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_waker, wake_by_ref_waker, drop_waker);

unsafe fn clone_waker(data: *const ()) -> RawWaker {
    let data = &*(data as *const WakerData);
    let cloned = Box::into_raw(Box::new(WakerData {
        sink: data.sink.clone(),
        id: data.id,
    }));
    RawWaker::new(cloned.cast(), &VTABLE)
}

/// `fn wake(self)`, must consume the data.
unsafe fn wake_waker(data: *const ()) {
    let data = Box::from_raw(data as *mut WakerData);
    data.sink.wake_fiber(data.id);
}

/// `fn wake_by_ref(&self)`, must not consume the data.
unsafe fn wake_by_ref_waker(data: *const ()) {
    let data = &*(data as *const WakerData);
    data.sink.wake_fiber(data.id);
}

unsafe fn drop_waker(data: *const ()) {
    drop(Box::from_raw(data as *mut WakerData));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use std::sync::Mutex;

    struct RecordingSink {
        woken: Mutex<Vec<FiberId>>,
    }

    impl WakeSink for RecordingSink {
        fn wake_fiber(&self, id: FiberId) {
            self.woken.lock().unwrap().push(id);
        }
    }

    #[test]
    fn wake_and_wake_by_ref_both_reach_the_sink() {
        let mut arena: Arena<()> = Arena::new();
        let key = arena.insert(());
        let id = FiberId::from_key(key);

        let sink = Arc::new(RecordingSink {
            woken: Mutex::new(Vec::new()),
        });
        let waker = waker_for(sink.clone(), id);
        waker.wake_by_ref();
        let cloned = waker.clone();
        cloned.wake();

        assert_eq!(sink.woken.lock().unwrap().len(), 2);
    }
}
