//! Integration tests driving the real `Reactor`/`ReactorPool`/`AcceptServer`/
//! `Pipeline` types end to end. No mocks for the scheduling loop itself;
//! only the `Runner`/`Connection` implementations below are test doubles.

use std::future::Future;
use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fiberun::accept::{AcceptServer, Connection};
use fiberun::config::Config;
use fiberun::error::{Error, Result};
use fiberun::fiber::Channel;
use fiberun::pipeline::{FileSpec, InputSpec, Pipeline, Runner};
use fiberun::reactor::pool::ReactorKind;
use fiberun::reactor::ReactorPool;
use fiberun::socket::FiberSocket;

const OP_TIMEOUT: Duration = Duration::from_secs(5);

struct EchoHandler;

impl Connection for EchoHandler {
    fn handle_requests(self: Box<Self>, socket: FiberSocket) -> Pin<Box<dyn Future<Output = ()>>> {
        Box::pin(async move {
            let mut socket = socket;
            loop {
                let mut len_buf = [0u8; 4];
                if read_exact(&socket, &mut len_buf).await != Some(4) {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut body = vec![0u8; len];
                if read_exact(&socket, &mut body).await != Some(len) {
                    break;
                }
                if socket.write(&len_buf, OP_TIMEOUT).await.is_err() {
                    break;
                }
                if socket.write(&body, OP_TIMEOUT).await.is_err() {
                    break;
                }
            }
            socket.close();
        })
    }
}

async fn read_exact(socket: &FiberSocket, buf: &mut [u8]) -> Option<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match socket.read(&mut buf[filled..], OP_TIMEOUT).await {
            Ok(0) => return if filled == 0 { None } else { Some(filled) },
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    Some(filled)
}

fn send_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

#[test]
fn echo_server_round_trips_several_frames() {
    let config = Config::builder().reactor_threads(1).build();
    let pool = Arc::new(ReactorPool::start(config, ReactorKind::General).unwrap());
    let server = AcceptServer::new(pool.clone(), 0);
    let port = server
        .add_listener(0, |_peer| Box::new(EchoHandler) as Box<dyn Connection>)
        .unwrap();
    server.run().unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    for payload in [&b"hello"[..], &b"a bit longer frame this time"[..], &b"x"[..]] {
        let echoed = send_frame(&mut stream, payload).unwrap();
        assert_eq!(echoed, payload);
    }

    drop(stream);
    server.stop(true);
    assert!(server.is_idle());
    pool.stop();
}

#[test]
fn accept_server_stop_drains_multiple_connections() {
    let config = Config::builder().reactor_threads(2).build();
    let pool = Arc::new(ReactorPool::start(config, ReactorKind::General).unwrap());
    let server = AcceptServer::new(pool.clone(), 0);
    let port = server
        .add_listener(0, |_peer| Box::new(EchoHandler) as Box<dyn Connection>)
        .unwrap();
    server.run().unwrap();

    let streams: Vec<_> = (0..8)
        .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
        .collect();
    for mut s in streams {
        let echoed = send_frame(&mut s, b"ping").unwrap();
        assert_eq!(echoed, b"ping");
    }

    server.stop(true);
    assert!(server.is_idle());
    pool.stop();
}

/// A [`Runner`] whose "glob expansion" is the identity (tests pass exact
/// file paths instead of real patterns) and whose decoder treats each line
/// of a file as one record. Mapped records are collected into a shared
/// `Vec` so assertions can inspect them from the calling thread.
struct CollectingRunner {
    mapped: Arc<Mutex<Vec<String>>>,
}

impl Runner for CollectingRunner {
    type Record = String;
    type Context = ();

    fn create_context(&self, _table: &str) -> Self::Context {}

    fn expand_glob(&self, pattern: &str, visit: &mut dyn FnMut(String)) {
        visit(pattern.to_string());
    }

    async fn process_file(&self, path: &str, _format: &str, queue: &Channel<Self::Record>) -> Result<u64> {
        let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
        let mut count = 0;
        for line in contents.lines() {
            queue.push(line.to_string()).await.map_err(|_| Error::Closed)?;
            count += 1;
        }
        Ok(count)
    }

    async fn map(&self, _context: &mut Self::Context, record: Self::Record) -> Result<()> {
        self.mapped.lock().unwrap().push(record);
        Ok(())
    }
}

fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn pipeline_decodes_every_file_and_maps_every_record() {
    let file_a = write_lines(&["a1", "a2", "a3"]);
    let file_b = write_lines(&["b1", "b2"]);

    let config = Config::builder().reactor_threads(2).workers_per_reactor(2).build();
    let pool = Arc::new(ReactorPool::start(config.clone(), ReactorKind::General).unwrap());
    let mapped = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(pool.clone(), CollectingRunner { mapped: mapped.clone() }, &config);

    let inputs = vec![InputSpec {
        name: "fixtures".to_string(),
        file_specs: vec![
            FileSpec {
                url_glob: file_a.path().to_str().unwrap().to_string(),
                format: "text".to_string(),
            },
            FileSpec {
                url_glob: file_b.path().to_str().unwrap().to_string(),
                format: "text".to_string(),
            },
        ],
    }];

    let report = pipeline.run(inputs, "records").unwrap();
    assert_eq!(report.files_processed, 2);
    assert_eq!(report.records_processed, 5);
    assert_eq!(report.records_mapped, 5);
    assert_eq!(report.records_dropped, 0);
    assert_eq!(report.parse_errors, 0);

    let mut got = mapped.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec!["a1", "a2", "a3", "b1", "b2"]);

    pool.stop();
}

#[test]
fn pipeline_drops_records_past_map_limit() {
    let file = write_lines(&["r1", "r2", "r3", "r4", "r5"]);

    let config = Config::builder().reactor_threads(1).map_limit(2).build();
    let pool = Arc::new(ReactorPool::start(config.clone(), ReactorKind::General).unwrap());
    let mapped = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(pool.clone(), CollectingRunner { mapped: mapped.clone() }, &config);

    let inputs = vec![InputSpec {
        name: "fixtures".to_string(),
        file_specs: vec![FileSpec {
            url_glob: file.path().to_str().unwrap().to_string(),
            format: "text".to_string(),
        }],
    }];

    let report = pipeline.run(inputs, "records").unwrap();
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.records_processed, 5);
    assert_eq!(report.records_mapped, 2);
    assert_eq!(report.records_dropped, 3);
    assert_eq!(mapped.lock().unwrap().len(), 2);

    pool.stop();
}

#[test]
fn pipeline_localises_a_missing_file_error_without_aborting_the_run() {
    let good = write_lines(&["ok1", "ok2"]);

    let config = Config::builder().reactor_threads(1).build();
    let pool = Arc::new(ReactorPool::start(config.clone(), ReactorKind::General).unwrap());
    let mapped = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(pool.clone(), CollectingRunner { mapped: mapped.clone() }, &config);

    let inputs = vec![InputSpec {
        name: "fixtures".to_string(),
        file_specs: vec![
            FileSpec {
                url_glob: "/nonexistent/path/does-not-exist.txt".to_string(),
                format: "text".to_string(),
            },
            FileSpec {
                url_glob: good.path().to_str().unwrap().to_string(),
                format: "text".to_string(),
            },
        ],
    }];

    let report = pipeline.run(inputs, "records").unwrap();
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.parse_errors, 1);
    assert_eq!(report.records_mapped, 2);

    pool.stop();
}
