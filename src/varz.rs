//! Process-wide counter registry.
//!
//! Every reactor, the accept server and the pipeline executor register a
//! handful of named atomic counters (connections accepted, bytes in/out,
//! QPS, parse-error counts) before `main` runs, via [`linkme::distributed_slice`].
//! Iteration is lock-free: each counter is a plain [`AtomicU64`] read with
//! relaxed ordering, matching the "safe to read with relaxed ordering" note
//! for counters in this crate's concurrency model.

use std::sync::atomic::{AtomicU64, Ordering};

/// A single named counter, registered once at link time.
pub struct Varz {
    name: &'static str,
    value: AtomicU64,
}

impl Varz {
    /// Declares a new counter. Used by the `static` definitions below; not
    /// meant to be constructed piecemeal at runtime.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// The counter's registered name, e.g. `"connections_accepted"`.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The counter's current value, read with relaxed ordering.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Adds `n` to the counter, relaxed ordering.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Adds one to the counter, relaxed ordering.
    pub fn incr(&self) {
        self.add(1);
    }
}

/// *INTERNAL API*, only `pub` so the macro-free `static` definitions below
/// can register themselves. The slice's symbol name is namespaced to avoid
/// colliding with another crate's distributed slice of the same shape.
#[doc(hidden)]
#[linkme::distributed_slice]
pub static FIBERUN_VARZ: [Varz] = [..];

/// All registered counters, in unspecified order.
pub fn all() -> &'static [Varz] {
    &FIBERUN_VARZ
}

/// Looks up a registered counter by name. `O(n)` in the number of counters,
/// which is small and fixed, so this is fine for the status-line use case.
pub fn find(name: &str) -> Option<&'static Varz> {
    all().iter().find(|v| v.name() == name)
}

#[linkme::distributed_slice(FIBERUN_VARZ)]
static CONNECTIONS_ACCEPTED: Varz = Varz::new("connections_accepted");

#[linkme::distributed_slice(FIBERUN_VARZ)]
static BYTES_IN: Varz = Varz::new("bytes_in");

#[linkme::distributed_slice(FIBERUN_VARZ)]
static BYTES_OUT: Varz = Varz::new("bytes_out");

#[linkme::distributed_slice(FIBERUN_VARZ)]
static REQUESTS_HANDLED: Varz = Varz::new("requests_handled");

#[linkme::distributed_slice(FIBERUN_VARZ)]
static PARSE_ERRORS: Varz = Varz::new("parse_errors");

#[linkme::distributed_slice(FIBERUN_VARZ)]
static RECORDS_MAPPED: Varz = Varz::new("records_mapped");

#[linkme::distributed_slice(FIBERUN_VARZ)]
static RECORDS_DROPPED: Varz = Varz::new("records_dropped");

/// Counter for successful `accept()` completions.
pub fn connections_accepted() -> &'static Varz {
    &CONNECTIONS_ACCEPTED
}

/// Counter for bytes read off the wire.
pub fn bytes_in() -> &'static Varz {
    &BYTES_IN
}

/// Counter for bytes written to the wire.
pub fn bytes_out() -> &'static Varz {
    &BYTES_OUT
}

/// Counter for completed request/response cycles.
pub fn requests_handled() -> &'static Varz {
    &REQUESTS_HANDLED
}

/// Counter for records that failed to decode.
pub fn parse_errors() -> &'static Varz {
    &PARSE_ERRORS
}

/// Counter for records passed to the user map function.
pub fn records_mapped() -> &'static Varz {
    &RECORDS_MAPPED
}

/// Counter for records skipped because `map_limit` was reached.
pub fn records_dropped() -> &'static Varz {
    &RECORDS_DROPPED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_registered_and_addressable() {
        assert!(find("connections_accepted").is_some());
        assert!(find("no_such_counter").is_none());
        assert!(all().len() >= 7);
    }

    #[test]
    fn incr_and_add_are_relaxed_but_visible() {
        let before = requests_handled().get();
        requests_handled().incr();
        requests_handled().add(41);
        assert_eq!(requests_handled().get(), before + 42);
    }
}
