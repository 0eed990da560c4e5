use crate::config::WorkerPoolConfig;
use crate::error::WorkerError;
use crate::frame::Frame;
use crate::motion::process::{process_frame, ProcessConfig, ProcessedPixels};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How often the watchdog and idle workers re-check pool state
const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Job {
    frame: Frame,
    config: ProcessConfig,
    reply: oneshot::Sender<Result<ProcessedPixels, WorkerError>>,
}

/// Fixed pool of OS threads doing the per-frame decode/resize/normalize work.
///
/// The queue is bounded and submission never blocks: a full queue fails the
/// submission so the caller can drop the frame instead of stalling the I/O
/// path. A worker stuck past the task timeout is superseded by a replacement
/// thread under the same worker id.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    task_timeout: Duration,
    workers: Mutex<Vec<WorkerSlot>>,
    counters: PoolCounters,
    shutdown: AtomicBool,
}

struct WorkerSlot {
    id: usize,
    generation: u64,
    busy_since: Arc<Mutex<Option<Instant>>>,
    jobs_done: Arc<AtomicU64>,
    handle: Option<std::thread::JoinHandle<()>>,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    crashes: AtomicU64,
    respawns: AtomicU64,
    total_processing_us: AtomicU64,
}

/// Weakly-consistent pool counters
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolStatsSnapshot {
    pub workers: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub timed_out: u64,
    pub respawns: u64,
    pub avg_processing_ms: f64,
    pub per_worker_jobs: Vec<u64>,
}

impl WorkerPool {
    pub fn new(config: &WorkerPoolConfig) -> Self {
        let size = config.pool_size.unwrap_or_else(default_pool_size);
        let (job_tx, job_rx) = bounded(config.max_queue_size.max(1));

        let inner = Arc::new(PoolInner {
            job_tx,
            job_rx,
            task_timeout: Duration::from_millis(config.task_timeout_ms.max(1)),
            workers: Mutex::new(Vec::with_capacity(size)),
            counters: PoolCounters::default(),
            shutdown: AtomicBool::new(false),
        });

        {
            let mut workers = inner.workers.lock();
            for id in 0..size {
                let slot = spawn_worker(&inner, id, 0)
                    .expect("failed to spawn motion worker thread at startup");
                workers.push(slot);
            }
        }

        spawn_watchdog(&inner);

        info!("Motion worker pool started with {} workers", size);
        Self { inner }
    }

    /// Enqueue a frame without blocking; a full queue fails immediately
    pub fn submit(
        &self,
        frame: Frame,
        config: ProcessConfig,
    ) -> Result<oneshot::Receiver<Result<ProcessedPixels, WorkerError>>, WorkerError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(WorkerError::PoolShutdown);
        }

        let (reply, receiver) = oneshot::channel();
        match self.inner.job_tx.try_send(Job {
            frame,
            config,
            reply,
        }) {
            Ok(()) => {
                self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(receiver)
            }
            Err(TrySendError::Full(_)) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(WorkerError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(WorkerError::PoolShutdown),
        }
    }

    /// Submit and wait for the result, bounded by the task timeout.
    ///
    /// The timeout covers queue wait plus processing; a task that exceeds it
    /// fails with a timeout error and its worker is left to the watchdog.
    pub async fn process(
        &self,
        frame: Frame,
        config: ProcessConfig,
    ) -> Result<ProcessedPixels, WorkerError> {
        let receiver = self.submit(frame, config)?;
        match tokio::time::timeout(self.inner.task_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::PoolShutdown),
            Err(_) => {
                self.inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(WorkerError::Timeout {
                    timeout: self.inner.task_timeout,
                })
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    pub fn stats(&self) -> WorkerPoolStatsSnapshot {
        let completed = self.inner.counters.completed.load(Ordering::Relaxed);
        let total_us = self
            .inner
            .counters
            .total_processing_us
            .load(Ordering::Relaxed);
        let workers = self.inner.workers.lock();

        WorkerPoolStatsSnapshot {
            workers: workers.len(),
            queued: self.inner.job_tx.len(),
            submitted: self.inner.counters.submitted.load(Ordering::Relaxed),
            completed,
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            timed_out: self.inner.counters.timed_out.load(Ordering::Relaxed),
            respawns: self.inner.counters.respawns.load(Ordering::Relaxed),
            avg_processing_ms: if completed == 0 {
                0.0
            } else {
                total_us as f64 / completed as f64 / 1_000.0
            },
            per_worker_jobs: workers
                .iter()
                .map(|w| w.jobs_done.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Stop accepting work and join workers, detaching any still busy after
    /// the deadline
    pub fn shutdown(&self, deadline: Duration) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down motion worker pool");

        let handles: Vec<_> = {
            let mut workers = self.inner.workers.lock();
            workers.iter_mut().filter_map(|w| w.handle.take()).collect()
        };

        let started = Instant::now();
        for handle in handles {
            while !handle.is_finished() && started.elapsed() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Worker still busy at shutdown deadline, detaching");
            }
        }
    }
}

fn default_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.saturating_sub(1).max(1)
}

fn spawn_worker(
    inner: &Arc<PoolInner>,
    id: usize,
    generation: u64,
) -> Result<WorkerSlot, std::io::Error> {
    let busy_since = Arc::new(Mutex::new(None));
    let jobs_done = Arc::new(AtomicU64::new(0));

    let thread_inner = Arc::clone(inner);
    let thread_busy = Arc::clone(&busy_since);
    let thread_jobs = Arc::clone(&jobs_done);
    let handle = std::thread::Builder::new()
        .name(format!("motion-worker-{}", id))
        .spawn(move || worker_loop(thread_inner, id, generation, thread_busy, thread_jobs))?;

    Ok(WorkerSlot {
        id,
        generation,
        busy_since,
        jobs_done,
        handle: Some(handle),
    })
}

fn worker_loop(
    inner: Arc<PoolInner>,
    id: usize,
    my_generation: u64,
    busy_since: Arc<Mutex<Option<Instant>>>,
    jobs_done: Arc<AtomicU64>,
) {
    debug!("Motion worker {} (gen {}) started", id, my_generation);

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if superseded(&inner, id, my_generation) {
            debug!("Motion worker {} (gen {}) superseded, exiting", id, my_generation);
            break;
        }

        let job = match inner.job_rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        *busy_since.lock() = Some(Instant::now());
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            process_frame(job.frame.data(), &job.config)
        }));
        let elapsed = started.elapsed();
        *busy_since.lock() = None;

        match outcome {
            Ok(Ok(pixels)) => {
                inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                inner
                    .counters
                    .total_processing_us
                    .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
                jobs_done.fetch_add(1, Ordering::Relaxed);
                let _ = job.reply.send(Ok(pixels));
            }
            Ok(Err(e)) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                let _ = job.reply.send(Err(e));
            }
            Err(_) => {
                inner.counters.crashes.fetch_add(1, Ordering::Relaxed);
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Motion worker {} crashed while processing a frame", id);
                let _ = job.reply.send(Err(WorkerError::Crashed { worker_id: id }));
            }
        }
    }

    debug!("Motion worker {} (gen {}) stopped", id, my_generation);
}

fn superseded(inner: &Arc<PoolInner>, id: usize, my_generation: u64) -> bool {
    inner
        .workers
        .lock()
        .iter()
        .find(|w| w.id == id)
        .map(|w| w.generation != my_generation)
        .unwrap_or(true)
}

/// Watch for workers stuck past the task timeout and respawn them.
///
/// OS threads cannot be killed; the replacement takes over the worker id and
/// the stale thread exits at its next generation check.
fn spawn_watchdog(inner: &Arc<PoolInner>) {
    let watchdog_inner = Arc::clone(inner);
    std::thread::Builder::new()
        .name("motion-worker-watchdog".to_string())
        .spawn(move || loop {
            std::thread::sleep(POLL_INTERVAL);
            if watchdog_inner.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let mut stuck: Vec<usize> = Vec::new();
            {
                let workers = watchdog_inner.workers.lock();
                for worker in workers.iter() {
                    if let Some(since) = *worker.busy_since.lock() {
                        if since.elapsed() > watchdog_inner.task_timeout {
                            stuck.push(worker.id);
                        }
                    }
                }
            }

            for id in stuck {
                let mut workers = watchdog_inner.workers.lock();
                if let Some(pos) = workers.iter().position(|w| w.id == id) {
                    let generation = workers[pos].generation + 1;
                    warn!(
                        "Motion worker {} stuck past {:?}, respawning (gen {})",
                        id, watchdog_inner.task_timeout, generation
                    );
                    match spawn_worker(&watchdog_inner, id, generation) {
                        Ok(slot) => {
                            watchdog_inner
                                .counters
                                .respawns
                                .fetch_add(1, Ordering::Relaxed);
                            workers[pos] = slot;
                        }
                        Err(e) => {
                            // Keep the stale slot; the next tick retries
                            warn!("Respawn of motion worker {} failed: {}", id, e);
                        }
                    }
                }
            }
        })
        .expect("failed to spawn worker watchdog thread");
}
