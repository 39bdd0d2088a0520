//! Bounded submission queue and worker pool.
//!
//! Submission never blocks on the job itself: a job is accepted into a
//! bounded channel and a fixed set of workers picks jobs off it, one job
//! per worker at a time. The pool size therefore bounds how many tables
//! load concurrently and how many connections are in use.

use crate::error::SubmitError;
use crate::ingest::job::{IngestionContext, IngestionJob, JobHandle, JobStatus};
use crate::ingest::report::IngestionReport;
use crate::ingest::source::ByteStreamProvider;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub struct IngestionService {
    tx: mpsc::Sender<IngestionJob>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestionService {
    /// Spawn `workers` workers behind a queue holding up to `capacity` jobs.
    pub fn start(ctx: Arc<IngestionContext>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let rx = Arc::clone(&rx);
                tokio::spawn(worker_loop(worker_id, ctx, rx))
            })
            .collect::<Vec<_>>();

        log::info!(
            "ingestion service started with {} workers, queue capacity {}",
            workers.len(),
            capacity.max(1)
        );
        Self { tx, workers }
    }

    /// Accept a job without waiting. Fails when the queue is full.
    pub fn submit(
        &self,
        table: impl Into<String>,
        source: Box<dyn ByteStreamProvider>,
    ) -> Result<JobHandle, SubmitError> {
        let (job, handle) = IngestionJob::new(table, source);
        let table = job.table().to_string();

        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::QueueClosed,
        })?;

        log::info!("job {}: queued for {}", handle.id(), table);
        Ok(handle)
    }

    /// Accept a job, waiting for queue capacity if necessary.
    pub async fn enqueue(
        &self,
        table: impl Into<String>,
        source: Box<dyn ByteStreamProvider>,
    ) -> Result<JobHandle, SubmitError> {
        let (job, handle) = IngestionJob::new(table, source);
        let table = job.table().to_string();

        self.tx
            .send(job)
            .await
            .map_err(|_| SubmitError::QueueClosed)?;

        log::info!("job {}: queued for {}", handle.id(), table);
        Ok(handle)
    }

    /// Stop accepting jobs and wait for queued and running jobs to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                log::error!("worker exited abnormally: {}", e);
            }
        }
        log::info!("ingestion service stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<IngestionContext>,
    rx: Arc<Mutex<mpsc::Receiver<IngestionJob>>>,
) {
    log::debug!("worker {}: started", worker_id);

    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let id = job.id();
        let table = job.table().to_string();
        let status = job.status_sender();
        let started_at = Utc::now();
        log::debug!("worker {}: claimed job {}", worker_id, id);

        // Run in its own task so a panicking job cannot take the worker down.
        let job_ctx = Arc::clone(&ctx);
        let result = tokio::spawn(async move { job.run(&job_ctx).await }).await;

        if let Err(e) = result {
            let reason = format!("job panicked: {}", e);
            log::error!("worker {}: job {}: {}", worker_id, id, reason);
            ctx.sink
                .deliver(&IngestionReport::fatal(id, &table, &reason, started_at))
                .await;
            status.send_replace(JobStatus::Failed { reason });
        }
    }

    log::debug!("worker {}: queue closed, exiting", worker_id);
}
