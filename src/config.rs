//! Runtime configuration.
//!
//! [`Config`] carries every recognised runtime flag plus the ring/reactor
//! sizing knobs. Parsing flags from `std::env::args` is out of scope for
//! the crate itself; `demos/echo_server.rs` shows a minimal hand-rolled
//! reader that populates this struct.
//!
//! Built with a chained-setter [`Builder`].

/// Runtime configuration for a reactor pool, accept server and/or pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Status/varz HTTP port. A negative value disables the status server.
    /// The status/varz presentation layer itself is out of scope for this
    /// crate; this field only carries the flag's value for a caller that
    /// wires its own presentation layer in.
    pub http_port: i32,

    /// Service listen port for the accept server. `0` asks the kernel to
    /// choose a port (see [`crate::accept::AcceptServer::add_listener`]).
    pub port: u16,

    /// Caps the number of records mapped per reactor in a pipeline run.
    /// `0` disables the limit.
    pub map_limit: u64,

    /// Enables `IOSQE_IO_LINK` chaining of poll-add and the following
    /// recv/send on the io_uring reactor.
    pub linked_sqe: bool,

    /// Client-mode endpoint (`host:port`) for workload generators; unused
    /// by the server-side runtime itself.
    pub connect: Option<String>,

    /// Client workload size: total request count.
    pub count: u64,

    /// Client workload size: number of concurrent connections.
    pub num_connections: u32,

    /// Number of reactor threads in the pool.
    pub reactor_threads: usize,

    /// Number of entries in the io_uring submission/completion queues.
    /// Must be a power of two; a capacity of at least 4096 is recommended.
    pub ring_entries: u32,

    /// Number of worker fibers per reactor in the pipeline executor.
    pub workers_per_reactor: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: -1,
            port: 0,
            map_limit: 0,
            linked_sqe: false,
            connect: None,
            count: 0,
            num_connections: 1,
            reactor_threads: 1,
            ring_entries: 4096,
            workers_per_reactor: 1,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }
}

/// Chained-setter builder for [`Config`].
#[derive(Debug, Default, Clone)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn http_port(mut self, http_port: i32) -> Self {
        self.config.http_port = http_port;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn map_limit(mut self, map_limit: u64) -> Self {
        self.config.map_limit = map_limit;
        self
    }

    pub fn linked_sqe(mut self, linked_sqe: bool) -> Self {
        self.config.linked_sqe = linked_sqe;
        self
    }

    pub fn connect(mut self, connect: impl Into<String>) -> Self {
        self.config.connect = Some(connect.into());
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.config.count = count;
        self
    }

    pub fn num_connections(mut self, num_connections: u32) -> Self {
        self.config.num_connections = num_connections;
        self
    }

    pub fn reactor_threads(mut self, reactor_threads: usize) -> Self {
        self.config.reactor_threads = reactor_threads;
        self
    }

    pub fn ring_entries(mut self, ring_entries: u32) -> Self {
        self.config.ring_entries = ring_entries;
        self
    }

    pub fn workers_per_reactor(mut self, workers_per_reactor: usize) -> Self {
        self.config.workers_per_reactor = workers_per_reactor;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.http_port, -1);
        assert_eq!(config.map_limit, 0);
        assert!(!config.linked_sqe);
        assert_eq!(config.workers_per_reactor, 1);
        assert_eq!(config.ring_entries, 4096);
    }

    #[test]
    fn builder_chains_overrides() {
        let config = Config::builder()
            .port(7777)
            .map_limit(5)
            .linked_sqe(true)
            .reactor_threads(4)
            .workers_per_reactor(2)
            .build();
        assert_eq!(config.port, 7777);
        assert_eq!(config.map_limit, 5);
        assert!(config.linked_sqe);
        assert_eq!(config.reactor_threads, 4);
        assert_eq!(config.workers_per_reactor, 2);
    }
}
