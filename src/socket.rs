//! Fiber sockets: non-blocking file descriptors bound to one reactor.
//!
//! `read`/`write`/`accept`/`connect` all follow the
//! same shape: try the syscall, and on `EWOULDBLOCK` register interest with
//! the owning reactor's I/O driver and suspend until it wakes the fiber.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::clock;
use crate::error::{Error, Result};
use crate::reactor::{self, context};

/// A non-blocking socket bound to the reactor that was driving the calling
/// thread when it was constructed. Every operation checks that it is still
/// being called from that same reactor; a mismatch is a programming error,
/// not a runtime condition to recover from, so it is reported as
/// [`Error::Internal`] rather than silently proxied across threads.
pub struct FiberSocket {
    fd: Option<OwnedFd>,
    io: reactor::io::IoHandle,
}

impl FiberSocket {
    /// Takes ownership of an already-nonblocking `fd` and registers it with
    /// the current reactor's I/O driver.
    pub(crate) fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        let io = reactor::current_io();
        io.register(fd.as_raw_fd())?;
        Ok(Self { fd: Some(fd), io })
    }

    /// Opens a client connection to `addr`, suspending the calling fiber
    /// until the connection completes, fails, or `timeout` elapses.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let socket = Self::from_owned_fd(fd)?;

        let (sockaddr, len) = sockaddr_from(addr);
        let rc = unsafe { libc::connect(socket.raw_fd(), &sockaddr as *const _ as *const libc::sockaddr, len) };
        if rc == 0 {
            return Ok(socket);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(Error::Io(err));
        }

        ConnectComplete {
            socket: &socket,
            deadline: clock::deadline_from(timeout),
            registered: false,
        }
        .await?;
        Ok(socket)
    }

    /// Accepts one pending connection, suspending until one arrives, a
    /// genuine error occurs, or `timeout` elapses.
    pub fn accept(&self, timeout: Duration) -> Accept<'_> {
        Accept {
            socket: self,
            deadline: clock::deadline_from(timeout),
        }
    }

    /// Reads into `buf`, returning the byte count (`0` means EOF).
    pub fn read<'a>(&'a self, buf: &'a mut [u8], timeout: Duration) -> Read<'a> {
        Read {
            socket: self,
            buf,
            deadline: clock::deadline_from(timeout),
            registered: false,
            linked: None,
        }
    }

    /// Writes `buf`, returning the byte count actually written (short writes
    /// are possible, matching plain `write(2)` semantics).
    pub fn write<'a>(&'a self, buf: &'a [u8], timeout: Duration) -> Write<'a> {
        Write {
            socket: self,
            buf,
            deadline: clock::deadline_from(timeout),
        }
    }

    /// Deregisters this socket's fd from the current reactor's I/O driver
    /// and hands it back without touching its TCP state, so the accept
    /// server can move a freshly accepted connection to another reactor and
    /// rebind it there. Only meaningful on a socket with no operation
    /// currently suspended on it.
    pub(crate) fn detach(mut self) -> OwnedFd {
        let fd = self.fd.take().expect("detach of an already-closed socket");
        self.io.deregister(fd.as_raw_fd());
        fd
    }

    /// Half-closes (`SHUT_RDWR`) before the final `close`, so a peer blocked
    /// in a read sees EOF rather than a reset.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            let raw = fd.as_raw_fd();
            unsafe {
                libc::shutdown(raw, libc::SHUT_RDWR);
            }
            self.io.deregister(raw);
            drop(fd);
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().expect("use of a closed FiberSocket").as_raw_fd()
    }

    fn check_owning_reactor(&self) -> Result<()> {
        let current = reactor::current_io();
        if self.io.same_reactor(&current) {
            Ok(())
        } else {
            Err(Error::Internal("fiber socket used from a reactor other than its owner"))
        }
    }
}

impl Drop for FiberSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Checks `deadline` against the current instant, requesting a future wakeup
/// if it hasn't passed yet. Shared by every suspending socket operation.
fn check_deadline(deadline: Option<Instant>) -> std::result::Result<(), Error> {
    if let Some(d) = deadline {
        if clock::now() >= d {
            return Err(Error::Cancelled);
        }
        context::request_wakeup(d);
    }
    Ok(())
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

pub struct Read<'a> {
    socket: &'a FiberSocket,
    buf: &'a mut [u8],
    deadline: Option<Instant>,
    registered: bool,
    linked: Option<reactor::io::LinkedSubmission>,
}

impl<'a> Future for Read<'a> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Err(e) = this.socket.check_owning_reactor() {
            return Poll::Ready(Err(e));
        }

        if let Some(linked) = &this.linked {
            return match linked.io.poll_linked_recv(linked.token, this.buf, cx.waker()) {
                Poll::Ready(result) => Poll::Ready(result),
                Poll::Pending => {
                    if let Err(e) = check_deadline(this.deadline) {
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending
                }
            };
        }

        let fd = this.socket.raw_fd();
        let n = unsafe { libc::read(fd, this.buf.as_mut_ptr().cast(), this.buf.len()) };
        if n >= 0 {
            return Poll::Ready(Ok(n as usize));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Poll::Ready(Err(Error::Io(err)));
        }

        if !this.registered {
            if let Some(linked) = this.socket.io.linked_sqe_recv(fd, this.buf.len(), cx.waker().clone()) {
                this.linked = Some(linked);
                this.registered = true;
                if let Err(e) = check_deadline(this.deadline) {
                    return Poll::Ready(Err(e));
                }
                return Poll::Pending;
            }
        }

        this.socket.io.want_read(fd, cx.waker().clone());
        this.registered = true;
        if let Err(e) = check_deadline(this.deadline) {
            return Poll::Ready(Err(e));
        }
        Poll::Pending
    }
}

pub struct Write<'a> {
    socket: &'a FiberSocket,
    buf: &'a [u8],
    deadline: Option<Instant>,
}

impl<'a> Future for Write<'a> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Err(e) = this.socket.check_owning_reactor() {
            return Poll::Ready(Err(e));
        }

        let fd = this.socket.raw_fd();
        let n = unsafe { libc::write(fd, this.buf.as_ptr().cast(), this.buf.len()) };
        if n >= 0 {
            return Poll::Ready(Ok(n as usize));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Poll::Ready(Err(Error::Io(err)));
        }

        this.socket.io.want_write(fd, cx.waker().clone());
        if let Err(e) = check_deadline(this.deadline) {
            return Poll::Ready(Err(e));
        }
        Poll::Pending
    }
}

pub struct Accept<'a> {
    socket: &'a FiberSocket,
    deadline: Option<Instant>,
}

impl<'a> Future for Accept<'a> {
    type Output = Result<(FiberSocket, SocketAddr)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Err(e) = this.socket.check_owning_reactor() {
            return Poll::Ready(Err(e));
        }

        let fd = this.socket.raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let accepted = unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if accepted >= 0 {
            let peer = match sockaddr_to_std(&storage) {
                Some(p) => p,
                None => return Poll::Ready(Err(Error::Protocol("unsupported peer address family".into()))),
            };
            let owned = unsafe { OwnedFd::from_raw_fd(accepted) };
            return Poll::Ready(FiberSocket::from_owned_fd(owned).map(|s| (s, peer)));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Poll::Ready(Err(Error::Io(err)));
        }

        this.socket.io.want_read(fd, cx.waker().clone());
        if let Err(e) = check_deadline(this.deadline) {
            return Poll::Ready(Err(e));
        }
        Poll::Pending
    }
}

struct ConnectComplete<'a> {
    socket: &'a FiberSocket,
    deadline: Option<Instant>,
    registered: bool,
}

impl<'a> Future for ConnectComplete<'a> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let fd = this.socket.raw_fd();

        if this.registered {
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 {
                return Poll::Ready(Err(Error::Io(io::Error::last_os_error())));
            }
            if err != 0 {
                return Poll::Ready(Err(Error::Io(io::Error::from_raw_os_error(err))));
            }
            return Poll::Ready(Ok(()));
        }

        this.socket.io.want_write(fd, cx.waker().clone());
        this.registered = true;
        if let Err(e) = check_deadline(this.deadline) {
            return Poll::Ready(Err(e));
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trips_through_libc_storage() {
        let addr: SocketAddr = "127.0.0.1:4444".parse().unwrap();
        let (storage, _len) = sockaddr_from(addr);
        assert_eq!(sockaddr_to_std(&storage), Some(addr));
    }
}
