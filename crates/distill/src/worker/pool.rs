use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::broadcast::JobStore;
use crate::error::WorkerError;
use crate::job::{Job, JobStatus};
use crate::pipeline::StageExecutor;
use crate::router::JobQueue;

/// Fixed set of OS threads that execute queued jobs.
///
/// Each worker owns a single-threaded tokio runtime; provider calls inside a
/// job are awaited on it.
pub struct WorkerPool {
    job_sender: Mutex<Option<Sender<String>>>,
    result_receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Worker pool lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl WorkerPool {
    pub fn new(executor: Arc<StageExecutor>, worker_count: usize) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::NoWorkers);
        }
        let (job_sender, job_receiver) = unbounded::<String>();
        let (result_sender, result_receiver) = bounded::<Job>(worker_count * 64);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let result_tx = result_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_executor = Arc::clone(&executor);

            let handle = thread::Builder::new()
                .name(format!("distill-worker-{}", worker_id))
                .spawn(move || {
                    run_worker(worker_id, job_rx, result_tx, shutdown_flag, worker_executor);
                })
                .map_err(|e| {
                    shutdown.store(true, Ordering::Release);
                    WorkerError::SpawnFailed(e.to_string())
                })?;
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            job_sender: Mutex::new(Some(job_sender)),
            result_receiver,
            workers: Mutex::new(workers),
            shutdown,
        })
    }

    /// Queues a job id for execution.
    pub fn submit(&self, job_id: impl Into<String>) -> Result<(), WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ChannelClosed);
        }
        match lock(&self.job_sender).as_ref() {
            Some(sender) => sender
                .send(job_id.into())
                .map_err(|_| WorkerError::ChannelClosed),
            None => Err(WorkerError::ChannelClosed),
        }
    }

    /// Queues every pending job in `store`. Used at startup so jobs accepted
    /// before a restart are not stranded.
    pub fn recover_pending(&self, store: &JobStore) -> Result<usize, WorkerError> {
        let pending = store.list_by_status(JobStatus::Pending);
        for job in &pending {
            self.submit(job.id.clone())?;
        }
        if !pending.is_empty() {
            info!("Re-queued {} pending jobs", pending.len());
        }
        Ok(pending.len())
    }

    /// Final snapshots of processed jobs. Best effort: snapshots are dropped
    /// when nobody drains the channel.
    pub fn try_recv_result(&self) -> Option<Job> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<Job> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Release);
    }

    /// Closes the queue and joins every worker.
    pub fn wait(&self) {
        lock(&self.job_sender).take();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl JobQueue for WorkerPool {
    fn enqueue(&self, job_id: &str) -> Result<(), WorkerError> {
        self.submit(job_id)
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<String>,
    result_sender: Sender<Job>,
    shutdown: Arc<AtomicBool>,
    executor: Arc<StageExecutor>,
) {
    debug!("Worker {} started", worker_id);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Worker {} could not build its runtime: {}", worker_id, e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::Acquire) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match job_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job_id) => {
                debug!("Worker {} processing job {}", worker_id, job_id);
                let Some(job) = runtime.block_on(executor.process_job(&job_id)) else {
                    continue;
                };
                match result_sender.try_send(job) {
                    Ok(()) => {}
                    Err(TrySendError::Full(job)) => {
                        debug!("Result channel full, dropping snapshot of {}", job.id);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("Worker {} result channel closed", worker_id);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
