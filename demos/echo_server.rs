//! Manual exercise binary for the accept server: a length-prefixed echo
//! protocol, the kind of example handler an accept-server consumer would
//! write. Not part of the library's public contract. Flag parsing here is
//! a hand-rolled `std::env::args` reader since a CLI crate is out of scope
//! for the library itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use fiberun::accept::{AcceptServer, Connection};
use fiberun::config::Config;
use fiberun::reactor::pool::ReactorKind;
use fiberun::reactor::ReactorPool;
use fiberun::socket::FiberSocket;
use fiberun::varz;

const MAX_FRAME: usize = 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(60);

struct EchoHandler;

impl Connection for EchoHandler {
    fn handle_requests(self: Box<Self>, socket: FiberSocket) -> Pin<Box<dyn Future<Output = ()>>> {
        Box::pin(async move {
            let mut socket = socket;
            let mut body = vec![0u8; MAX_FRAME];
            loop {
                let mut len_buf = [0u8; 4];
                match read_exact(&socket, &mut len_buf).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => break,
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len == 0 || len > MAX_FRAME {
                    log::warn!("fiberun-echo: frame length {len} out of bounds, closing");
                    break;
                }
                match read_exact(&socket, &mut body[..len]).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => break,
                }
                varz::bytes_in().add((4 + len) as u64);

                if write_all(&socket, &len_buf).await.is_err() {
                    break;
                }
                if write_all(&socket, &body[..len]).await.is_err() {
                    break;
                }
                varz::bytes_out().add((4 + len) as u64);
                varz::requests_handled().incr();
            }
            socket.close();
        })
    }
}

/// Reads exactly `buf.len()` bytes, `Ok(false)` on a clean EOF before any
/// byte arrived, and propagates a short read mid-frame as an error (a half
/// frame means the peer hung up or misbehaved; no point continuing).
async fn read_exact(socket: &FiberSocket, buf: &mut [u8]) -> fiberun::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = socket.read(&mut buf[filled..], READ_TIMEOUT).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(false)
            } else {
                Err(fiberun::Error::Protocol("peer closed mid-frame".into()))
            };
        }
        filled += n;
    }
    Ok(true)
}

async fn write_all(socket: &FiberSocket, mut buf: &[u8]) -> fiberun::Result<()> {
    while !buf.is_empty() {
        let n = socket.write(buf, READ_TIMEOUT).await?;
        buf = &buf[n..];
    }
    Ok(())
}

fn parse_args() -> Config {
    let mut builder = Config::builder();
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--port" => {
                if let Some(v) = args.next().and_then(|s| s.parse().ok()) {
                    builder = builder.port(v);
                }
            }
            "--reactor-threads" => {
                if let Some(v) = args.next().and_then(|s| s.parse().ok()) {
                    builder = builder.reactor_threads(v);
                }
            }
            other => {
                log::warn!("fiberun-echo: ignoring unrecognised flag {other}");
            }
        }
    }
    builder.build()
}

fn main() -> fiberun::Result<()> {
    fiberun::log::init(log::LevelFilter::Info);
    let config = parse_args();

    let pool = Arc::new(ReactorPool::start(config.clone(), ReactorKind::General)?);
    let server = AcceptServer::new(pool.clone(), 0);
    let port = server.add_listener(config.port, |_peer| Box::new(EchoHandler) as Box<dyn Connection>)?;
    server.run()?;
    log::info!("fiberun-echo: listening port={port}");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
