//! Batch record-processing pipeline: glob-expand input file specs into a
//! shared file-name queue, decode them in parallel across every reactor,
//! and drive the decoded records through a user map function.
//!
//! Built on [`crate::accept`]'s "dispatch a fiber, block the calling thread
//! on an mpsc ack" shape for driving fiber-native work from a plain OS
//! thread, and on two queue types: [`crate::fiber::shared::SharedChannel`]
//! for the cross-reactor file-name queue, [`crate::fiber::channel::Channel`]
//! for each reactor's own record queue.

use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fiber::{self, Channel, SharedChannel};
use crate::reactor::{self, ReactorPool};
use crate::varz;

/// Capacity of the file-name queue shared across every reactor (a fixed
/// value, not a tuning knob).
const FILE_QUEUE_CAPACITY: usize = 16;

/// Capacity of each reactor's own record queue.
const RECORD_QUEUE_CAPACITY: usize = 256;

/// How many records a mapper fiber processes before yielding, so a reactor
/// with a very large backlog still services other fibers.
const MAPPER_YIELD_INTERVAL: u64 = 1000;

/// One glob pattern plus the format tag the runner should decode matches
/// with.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub url_glob: String,
    pub format: String,
}

/// One named input, carrying the file specs that make it up.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: String,
    pub file_specs: Vec<FileSpec>,
}

struct FileTask {
    path: String,
    format: String,
}

/// Aggregate result of one [`Pipeline::run`], summed across every reactor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineReport {
    pub files_processed: u64,
    pub records_processed: u64,
    pub records_mapped: u64,
    pub records_dropped: u64,
    pub parse_errors: u64,
}

impl PipelineReport {
    fn add(&mut self, other: ReactorStats) {
        self.files_processed += other.files_processed;
        self.records_processed += other.records_processed;
        self.records_mapped += other.records_mapped;
        self.records_dropped += other.records_dropped;
        self.parse_errors += other.parse_errors;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReactorStats {
    files_processed: u64,
    records_processed: u64,
    records_mapped: u64,
    records_dropped: u64,
    parse_errors: u64,
}

/// The interface the pipeline core consumes from a caller-supplied runner.
/// A plain generic bound rather than a trait object: these are native
/// `async fn`s, which aren't dyn-compatible, and nothing here needs dynamic
/// dispatch, since one `Pipeline` is built for exactly one `Runner` type.
pub trait Runner: Send + Sync + 'static {
    /// The decoded record type [`Runner::process_file`] produces and
    /// [`Runner::map`] consumes. Lives entirely inside one reactor's record
    /// queue and never crosses a thread, so it carries no `Send` bound.
    type Record: 'static;

    /// Per-reactor state for one mapping operator: created by
    /// [`Runner::create_context`], bracketed by `operator_start`/`operator_end`,
    /// threaded through every [`Runner::map`] call on that reactor.
    type Context;

    /// Called once, before any reactor stage starts.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Called once, after every reactor stage has finished draining.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Builds this reactor's context for `table`.
    fn create_context(&self, table: &str) -> Self::Context;

    /// Runs once per reactor, right after its context is created.
    async fn operator_start(&self, context: &mut Self::Context) -> Result<()> {
        let _ = context;
        Ok(())
    }

    /// Runs once per reactor, right before its context is dropped.
    async fn operator_end(&self, context: &mut Self::Context) -> Result<()> {
        let _ = context;
        Ok(())
    }

    /// Expands `pattern` into concrete paths, calling `visit` once per
    /// match. Glob expansion itself is out of scope for this crate; the
    /// runner owns it entirely.
    fn expand_glob(&self, pattern: &str, visit: &mut dyn FnMut(String));

    /// Decodes `path` (tagged `format`) and pushes every record it contains
    /// into `queue`, returning the count pushed. An error here is localised
    /// to this one file by the caller, so it does not abort the worker.
    async fn process_file(&self, path: &str, format: &str, queue: &Channel<Self::Record>) -> Result<u64>;

    /// Invoked once per record popped off a reactor's record queue, in
    /// order, with that reactor's context.
    async fn map(&self, context: &mut Self::Context, record: Self::Record) -> Result<()>;
}

struct Running {
    file_queue: Arc<SharedChannel<FileTask>>,
    stop: Arc<AtomicBool>,
}

/// Drives one pipeline run across a [`ReactorPool`] for a given [`Runner`].
pub struct Pipeline<R: Runner> {
    pool: Arc<ReactorPool>,
    runner: Arc<R>,
    workers_per_reactor: usize,
    map_limit: u64,
    running: Mutex<Option<Running>>,
}

impl<R: Runner> Pipeline<R> {
    pub fn new(pool: Arc<ReactorPool>, runner: R, config: &Config) -> Self {
        Self {
            pool,
            runner: Arc::new(runner),
            workers_per_reactor: config.workers_per_reactor.max(1),
            map_limit: config.map_limit,
            running: Mutex::new(None),
        }
    }

    /// Executes one pipeline run for `table` over `inputs`. Blocks the
    /// calling thread until every reactor has drained; safe to call from a
    /// plain (non-fiber) thread, since every fiber-native hook on [`Runner`]
    /// is driven on its owning reactor's own thread internally.
    pub fn run(&self, inputs: Vec<InputSpec>, table: &str) -> Result<PipelineReport> {
        block_on_reactor(&self.pool, 0, {
            let runner = self.runner.clone();
            move || async move { runner.init().await }
        })?;

        let file_queue = Arc::new(SharedChannel::<FileTask>::new(FILE_QUEUE_CAPACITY));
        let stop = Arc::new(AtomicBool::new(false));
        *self.running.lock().unwrap() = Some(Running {
            file_queue: file_queue.clone(),
            stop: stop.clone(),
        });

        let reactor_count = self.pool.len();
        let mut stage_rx = Vec::with_capacity(reactor_count);
        for index in 0..reactor_count {
            let (tx, rx) = mpsc::channel::<Result<ReactorStats>>();
            stage_rx.push(rx);
            spawn_reactor_stage(
                &self.pool,
                index,
                self.runner.clone(),
                file_queue.clone(),
                stop.clone(),
                table.to_string(),
                self.workers_per_reactor,
                self.map_limit,
                tx,
            );
        }

        'inputs: for input in &inputs {
            for spec in &input.file_specs {
                let mut closed = false;
                let format = spec.format.clone();
                self.runner.expand_glob(&spec.url_glob, &mut |path| {
                    if closed {
                        return;
                    }
                    let task = FileTask {
                        path,
                        format: format.clone(),
                    };
                    if file_queue.push_blocking(task).is_err() {
                        closed = true;
                    }
                });
                if closed {
                    break 'inputs;
                }
            }
        }
        file_queue.close();

        let mut report = PipelineReport::default();
        let mut first_error = None;
        for rx in stage_rx {
            match rx.recv() {
                Ok(Ok(stats)) => report.add(stats),
                Ok(Err(e)) => first_error = first_error.or(Some(e)),
                Err(_) => {
                    first_error = first_error.or(Some(Error::Internal(
                        "reactor panicked during pipeline run",
                    )))
                }
            }
        }

        *self.running.lock().unwrap() = None;

        block_on_reactor(&self.pool, 0, {
            let runner = self.runner.clone();
            move || async move { runner.shutdown().await }
        })?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Closes the file-name queue and sets every reactor's stop flag.
    /// Workers observe this between file pops; mappers keep draining
    /// whatever is already in their record queue but see no new work. A
    /// no-op if no run is currently in flight.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().unwrap().as_ref() {
            running.stop.store(true, Ordering::Relaxed);
            running.file_queue.close();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_reactor_stage<R: Runner>(
    pool: &ReactorPool,
    index: usize,
    runner: Arc<R>,
    file_queue: Arc<SharedChannel<FileTask>>,
    stop: Arc<AtomicBool>,
    table: String,
    workers_per_reactor: usize,
    map_limit: u64,
    tx: mpsc::Sender<Result<ReactorStats>>,
) {
    pool.dispatch(index, move || {
        let record_queue = Rc::new(Channel::<R::Record>::new(RECORD_QUEUE_CAPACITY));
        reactor::spawn(format!("pipeline-stage-{index}"), async move {
            let mut context = runner.create_context(&table);
            if let Err(e) = runner.operator_start(&mut context).await {
                let _ = tx.send(Err(e));
                return;
            }

            let mapper = reactor::spawn(
                format!("pipeline-mapper-{index}"),
                run_mapper(runner.clone(), record_queue.clone(), map_limit, context),
            );

            let mut workers = Vec::with_capacity(workers_per_reactor);
            for worker_index in 0..workers_per_reactor {
                workers.push(reactor::spawn(
                    format!("pipeline-worker-{index}-{worker_index}"),
                    run_worker(runner.clone(), file_queue.clone(), stop.clone(), record_queue.clone()),
                ));
            }

            let mut worker_stats = ReactorStats::default();
            for worker in workers {
                let stats = worker.join().await;
                worker_stats.files_processed += stats.files_processed;
                worker_stats.records_processed += stats.records_processed;
                worker_stats.parse_errors += stats.parse_errors;
            }

            record_queue.start_closing();
            let (mapper_stats, mut context) = mapper.join().await;
            let operator_end_result = runner.operator_end(&mut context).await;

            let mut total = worker_stats;
            total.records_mapped = mapper_stats.records_mapped;
            total.records_dropped = mapper_stats.records_dropped;
            total.parse_errors += mapper_stats.parse_errors;

            match operator_end_result {
                Ok(()) => {
                    let _ = tx.send(Ok(total));
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        });
    });
}

async fn run_worker<R: Runner>(
    runner: Arc<R>,
    file_queue: Arc<SharedChannel<FileTask>>,
    stop: Arc<AtomicBool>,
    record_queue: Rc<Channel<R::Record>>,
) -> ReactorStats {
    let mut stats = ReactorStats::default();
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let task = match file_queue.pop().await {
            Ok(task) => task,
            Err(_closed) => break,
        };
        match runner.process_file(&task.path, &task.format, &record_queue).await {
            Ok(processed) => {
                stats.files_processed += 1;
                stats.records_processed += processed;
            }
            Err(e) => {
                log::warn!("fiberun: pipeline worker failed on {}: {e}", task.path);
                varz::parse_errors().incr();
                stats.parse_errors += 1;
            }
        }
    }
    stats
}

/// Drains `record_queue` until it closes, invoking `runner.map` for each
/// record under `map_limit` and counting the rest as dropped. Owns the
/// reactor's [`Runner::Context`] for the run's duration and hands it back
/// once draining finishes, so the caller can still run `operator_end` on
/// it.
async fn run_mapper<R: Runner>(
    runner: Arc<R>,
    record_queue: Rc<Channel<R::Record>>,
    map_limit: u64,
    mut context: R::Context,
) -> (ReactorStats, R::Context) {
    let mut stats = ReactorStats::default();
    let mut since_yield = 0u64;
    loop {
        let record = match record_queue.pop().await {
            Ok(record) => record,
            Err(_closed) => break,
        };
        if map_limit > 0 && stats.records_mapped >= map_limit {
            stats.records_dropped += 1;
            varz::records_dropped().incr();
        } else {
            match runner.map(&mut context, record).await {
                Ok(()) => {
                    stats.records_mapped += 1;
                    varz::records_mapped().incr();
                }
                Err(e) => {
                    log::warn!("fiberun: pipeline map failed: {e}");
                    varz::parse_errors().incr();
                    stats.parse_errors += 1;
                }
            }
        }
        since_yield += 1;
        if since_yield >= MAPPER_YIELD_INTERVAL {
            since_yield = 0;
            fiber::yield_now().await;
        }
    }
    (stats, context)
}

fn block_on_reactor<T, F, Fut>(pool: &ReactorPool, index: usize, make_future: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<T>>();
    pool.dispatch(index, move || {
        let fut = make_future();
        reactor::spawn("pipeline-blocking-stage", async move {
            let result = fut.await;
            let _ = tx.send(result);
        });
    });
    rx.recv().map_err(|_| Error::Internal("reactor exited before pipeline stage completed"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_report_adds_reactor_stats() {
        let mut report = PipelineReport::default();
        report.add(ReactorStats {
            files_processed: 2,
            records_processed: 20,
            records_mapped: 18,
            records_dropped: 2,
            parse_errors: 1,
        });
        report.add(ReactorStats {
            files_processed: 1,
            records_processed: 5,
            records_mapped: 5,
            records_dropped: 0,
            parse_errors: 0,
        });
        assert_eq!(report.files_processed, 3);
        assert_eq!(report.records_processed, 25);
        assert_eq!(report.records_mapped, 23);
        assert_eq!(report.records_dropped, 2);
        assert_eq!(report.parse_errors, 1);
    }
}
