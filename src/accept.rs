//! TCP accept server: one accept fiber per listener on a dedicated reactor,
//! handing each accepted connection off round-robin to a worker reactor.
//!
//! Built on [`crate::socket`]'s fiber socket for the accept/read/write
//! primitives, and on this crate's arena ([`crate::arena::Arena`]) for the
//! connection list, which holds just enough per-connection state (its raw
//! fd, for a forced shutdown) to implement a graceful stop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::reactor::{self, Handle, ReactorPool};
use crate::socket::FiberSocket;
use crate::varz;

/// How long an accept fiber waits on `accept()` before re-checking the stop
/// flag. There is no portable way to wake a fiber blocked on socket
/// readiness from code that isn't itself a reactor fiber, so a graceful
/// stop is observed by polling at this grain instead; 100ms leaves ample
/// margin to drain a handful of connections within a second.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A connection handler bound to an already-accepted [`FiberSocket`].
/// Implementations drive their own request/response loop until the peer
/// disconnects or an unrecoverable error occurs (`demos/echo_server.rs`
/// keeps one example state machine).
pub trait Connection: 'static {
    fn handle_requests(self: Box<Self>, socket: FiberSocket) -> Pin<Box<dyn Future<Output = ()>>>;
}

/// Constructs a [`Connection`] for a newly accepted peer. Must be
/// `Send + Sync` since one factory is shared across every reactor thread a
/// connection might land on; the `Connection` it produces is not required to
/// be `Send` since it only ever runs on the one reactor thread it's
/// constructed on.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn new_connection(&self, peer: SocketAddr) -> Box<dyn Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(SocketAddr) -> Box<dyn Connection> + Send + Sync + 'static,
{
    fn new_connection(&self, peer: SocketAddr) -> Box<dyn Connection> {
        self(peer)
    }
}

/// A bound, not-yet-driven listener: socket plus its handler factory,
/// waiting for [`AcceptServer::run`] to hand it to the accept reactor.
struct PendingListener {
    fd: OwnedFd,
    port: u16,
    factory: Arc<dyn ConnectionFactory>,
}

/// The connection list: every accepted [`Connection`] is linked in from the
/// moment its fd is accepted until its handler returns. Lives behind an
/// `Arc<Mutex<_>>` rather than the accept reactor's thread-confined `Rc`
/// machinery because [`AcceptServer::stop`] needs to read (and the accept
/// reactor needs to mutate) it from different threads; all *mutation* is
/// still only ever issued by code running on the accept reactor itself;
/// `stop` only dispatches there rather than touching the arena directly.
#[derive(Default)]
struct ConnectionList {
    entries: Mutex<Arena<RawFd>>,
}

impl ConnectionList {
    fn insert(&self, fd: RawFd) -> crate::arena::Key<RawFd> {
        self.entries.lock().unwrap().insert(fd)
    }

    fn remove(&self, key: crate::arena::Key<RawFd>) {
        self.entries.lock().unwrap().remove(key);
    }

    fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Forces every live connection's socket to half-close, so a fiber
    /// blocked in a read observes EOF. Calling `shutdown(2)` on a fd from a
    /// thread other than the one driving it is
    /// safe and well-defined. It only affects the socket's TCP state, never
    /// the fd table entry itself, so it can't race with that fd's owning
    /// reactor closing it.
    fn shutdown_all(&self) {
        for (_, &fd) in self.entries.lock().unwrap().iter() {
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }
    }
}

/// State shared between [`AcceptServer`] (on whichever thread calls it) and
/// the accept fibers running on the dedicated accept reactor.
struct Running {
    accept_handle: Arc<Handle>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    connections: Arc<ConnectionList>,
}

/// Listens on one or more TCP ports, accepting connections on one dedicated
/// reactor and fanning each accepted socket out round-robin across the rest
/// of the pool.
pub struct AcceptServer {
    pool: Arc<ReactorPool>,
    accept_index: usize,
    pending: Mutex<Vec<PendingListener>>,
    running: Mutex<Option<Running>>,
}

impl AcceptServer {
    /// Builds a server that will run its accept fibers on reactor
    /// `accept_index` of `pool` and fan accepted connections out to every
    /// reactor in `pool` (accept_index included).
    pub fn new(pool: Arc<ReactorPool>, accept_index: usize) -> Self {
        Self {
            pool,
            accept_index,
            pending: Mutex::new(Vec::new()),
            running: Mutex::new(None),
        }
    }

    /// Binds a listening socket for `port` (`0` asks the kernel to choose)
    /// and registers `factory` to construct a [`Connection`] for each
    /// accepted peer. Returns the actually-bound port. Must be called before
    /// [`AcceptServer::run`].
    pub fn add_listener<F>(&self, port: u16, factory: F) -> Result<u16>
    where
        F: ConnectionFactory,
    {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(Error::Io)?;
        socket.set_reuse_address(true).map_err(Error::Io)?;
        socket.set_nonblocking(true).map_err(Error::Io)?;
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        socket.bind(&addr.into()).map_err(Error::Io)?;
        socket.listen(1024).map_err(Error::Io)?;
        let assigned = socket
            .local_addr()
            .map_err(Error::Io)?
            .as_socket()
            .ok_or(Error::Internal("bound listener has no socket address"))?
            .port();

        let std_socket: std::net::TcpListener = socket.into();
        let fd = unsafe { OwnedFd::from_raw_fd(std_socket.into_raw_fd()) };

        self.pending.lock().unwrap().push(PendingListener {
            fd,
            port: assigned,
            factory: Arc::new(factory),
        });
        Ok(assigned)
    }

    /// Hands every listener added so far to the accept reactor and starts
    /// one accept fiber per listener. Returns once the accept reactor has
    /// acknowledged startup; does not block waiting for connections (the
    /// reactor pool's own threads are already driving the event loops that
    /// service accepted connections).
    pub fn run(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        if pending.is_empty() {
            return Err(Error::Internal("AcceptServer::run called with no listeners"));
        }

        let pool = self.pool.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let connections = Arc::new(ConnectionList::default());
        let accept_handle = self.pool.handle(self.accept_index);

        let (tx, rx) = mpsc::channel::<Result<()>>();
        let stop_for_fibers = stop.clone();
        let connections_for_fibers = connections.clone();
        let accept_handle_for_fibers = accept_handle.clone();

        self.pool.dispatch(self.accept_index, move || {
            for listener in pending {
                let socket = match FiberSocket::from_owned_fd(listener.fd) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                spawn_accept_fiber(
                    socket,
                    listener.port,
                    listener.factory,
                    pool.clone(),
                    accept_handle_for_fibers.clone(),
                    stop_for_fibers.clone(),
                    connections_for_fibers.clone(),
                );
            }
            let _ = tx.send(Ok(()));
        });

        rx.recv()
            .map_err(|_| Error::Internal("accept reactor exited before starting listeners"))??;

        *self.running.lock().unwrap() = Some(Running {
            accept_handle,
            stop,
            connections,
        });
        Ok(())
    }

    /// Stops accepting new connections. If `wait_for_connections`, also asks
    /// every live connection to half-close and blocks the calling thread
    /// until the connection list drains.
    pub fn stop(&self, wait_for_connections: bool) {
        let running = self.running.lock().unwrap();
        let Some(running) = running.as_ref() else {
            return;
        };
        running.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if wait_for_connections {
            running.connections.shutdown_all();
            while !running.connections.is_empty() {
                std::thread::sleep(STOP_POLL_INTERVAL);
            }
        }
    }

    /// `true` once every in-flight connection has finished. Only meaningful
    /// after [`AcceptServer::run`].
    pub fn is_idle(&self) -> bool {
        match self.running.lock().unwrap().as_ref() {
            Some(running) => running.connections.is_empty(),
            None => true,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_accept_fiber(
    socket: Arc<FiberSocket>,
    port: u16,
    factory: Arc<dyn ConnectionFactory>,
    pool: Arc<ReactorPool>,
    accept_handle: Arc<Handle>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    connections: Arc<ConnectionList>,
) {
    reactor::spawn(format!("accept-{port}"), async move {
        loop {
            if stop.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            match socket.accept(STOP_POLL_INTERVAL).await {
                Ok((accepted, peer)) => {
                    varz::connections_accepted().incr();
                    let fd = accepted.detach();
                    let raw = fd.as_raw_fd();
                    let key = connections.insert(raw);

                    let target = pool.next_index();
                    let factory = factory.clone();
                    let accept_handle = accept_handle.clone();
                    let connections = connections.clone();
                    pool.dispatch(target, move || {
                        let socket = match FiberSocket::from_owned_fd(fd) {
                            Ok(s) => s,
                            Err(e) => {
                                log::warn!("fiberun: failed to bind accepted socket peer={peer} err={e}");
                                accept_handle.dispatch(move || connections.remove(key));
                                return;
                            }
                        };
                        let connection = factory.new_connection(peer);
                        reactor::spawn(format!("conn-{peer}"), async move {
                            connection.handle_requests(socket).await;
                            accept_handle.dispatch(move || connections.remove(key));
                        });
                    });
                }
                Err(e) if e.is_shutdown() => {
                    // Timed out re-checking `stop`, or the listener itself
                    // was closed out from under us; either way loop back to
                    // the stop check above.
                    continue;
                }
                Err(e) => {
                    log::warn!("fiberun: accept error on port {port}: {e}");
                }
            }
        }
    });
}

/// Binds a plain, non-fiber TCP listener for use outside the reactor
/// machinery (e.g. a client workload generator probing `connect`). Kept
/// here since it shares [`AcceptServer::add_listener`]'s socket2 setup.
pub fn bind_nonblocking(port: u16) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_list_tracks_insert_and_remove() {
        let list = ConnectionList::default();
        assert!(list.is_empty());
        let a = list.insert(3);
        let b = list.insert(4);
        assert!(!list.is_empty());
        list.remove(a);
        assert!(!list.is_empty());
        list.remove(b);
        assert!(list.is_empty());
    }
}
