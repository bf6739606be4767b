//! Fetch/decode worker pool
//!
//! Bounds the number of concurrent resolve operations across *all* chats to
//! protect shared CPU and bandwidth. Admission is a pool-wide FIFO queue with
//! a hard bound: beyond `max_pending` buffered jobs, `submit` fails fast with
//! `PoolSaturated` instead of growing unboundedly.
//!
//! Fairness falls out of the session discipline: each session has at most one
//! outstanding job at a time, so FIFO admission cannot be starved by a single
//! chat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::FetchConfig;
use crate::error::Error;
use crate::resolver::{ResolveError, SourceResolver};
use crate::track::{ChatId, ResolvedSource};

/// Failure kinds delivered through a fetch handle
#[derive(Error, Debug)]
pub enum FetchError {
    /// The resolver exceeded the configured per-job timeout
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The resolver reported a failure
    #[error(transparent)]
    Resolve(ResolveError),

    /// The job was cancelled before a worker started it
    #[error("fetch cancelled")]
    Canceled,

    /// The pool shut down before the job ran
    #[error("fetch pool closed")]
    PoolClosed,
}

/// Outcome of one fetch job, delivered exactly once
pub type FetchResult = std::result::Result<ResolvedSource, FetchError>;

/// Cooperative cancellation flag shared between a job and its handle
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A unit of resolve work queued for the pool
struct FetchJob {
    request_id: Uuid,
    chat: ChatId,
    query: String,
    cancel: CancelFlag,
    result_tx: oneshot::Sender<FetchResult>,
}

/// Caller-side handle for one accepted job
#[derive(Debug)]
pub struct FetchHandle {
    request_id: Uuid,
    cancel: CancelFlag,
    result_rx: oneshot::Receiver<FetchResult>,
}

impl FetchHandle {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Request cancellation. A job a worker has not started yet is skipped
    /// without side effects; a job already in progress is abandoned and its
    /// eventual result discarded by the caller.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clone of the cancel flag, for cancelling after the handle has been
    /// moved into a completion forwarder
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Wait for the job's single result delivery
    pub async fn recv(self) -> FetchResult {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::PoolClosed),
        }
    }
}

/// Bounded pool of resolve workers shared by all sessions
pub struct FetchPool {
    job_tx: mpsc::Sender<FetchJob>,
    timeout: Duration,
    closing: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl FetchPool {
    /// Spawn `max_workers` worker tasks sharing one FIFO admission queue
    pub fn new(resolver: Arc<dyn SourceResolver>, config: &FetchConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        let max_pending = config.max_pending.max(1);
        let timeout = config.timeout();

        let (job_tx, job_rx) = mpsc::channel(max_pending);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let closing = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(max_workers);
        for worker_id in 0..max_workers {
            let job_rx = Arc::clone(&job_rx);
            let resolver = Arc::clone(&resolver);
            let closing = Arc::clone(&closing);
            workers.push(tokio::spawn(Self::worker_loop(
                worker_id, job_rx, resolver, timeout, closing,
            )));
        }

        debug!(
            "fetch pool started with {} workers, {} pending slots",
            max_workers, max_pending
        );

        Self {
            job_tx,
            timeout,
            closing,
            workers,
        }
    }

    /// Stop accepting jobs and wind the workers down. Jobs still waiting in
    /// the admission queue are reported back as `Canceled` instead of run.
    pub async fn shutdown(self) {
        self.closing.store(true, Ordering::Release);
        drop(self.job_tx);
        for worker in self.workers {
            let _ = worker.await;
        }
        debug!("fetch pool shut down");
    }

    /// Submit a resolve job
    ///
    /// Accepted immediately while admission capacity remains; beyond the
    /// bound it fails fast with `PoolSaturated` (backpressure, not
    /// starvation).
    pub fn submit(
        &self,
        request_id: Uuid,
        chat: ChatId,
        query: &str,
    ) -> Result<FetchHandle, Error> {
        let cancel = CancelFlag::new();
        let (result_tx, result_rx) = oneshot::channel();

        let job = FetchJob {
            request_id,
            chat,
            query: query.to_owned(),
            cancel: cancel.clone(),
            result_tx,
        };

        self.job_tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::PoolSaturated,
            mpsc::error::TrySendError::Closed(_) => {
                Error::InvalidState("fetch pool has shut down".to_string())
            }
        })?;

        debug!(%chat, %request_id, "fetch job admitted");

        Ok(FetchHandle {
            request_id,
            cancel,
            result_rx,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    async fn worker_loop(
        worker_id: usize,
        job_rx: Arc<Mutex<mpsc::Receiver<FetchJob>>>,
        resolver: Arc<dyn SourceResolver>,
        timeout: Duration,
        closing: Arc<AtomicBool>,
    ) {
        debug!("fetch worker {} started", worker_id);

        loop {
            // Hold the lock only while waiting for the next job so other
            // workers can take over as soon as one is busy.
            let job = {
                let mut rx = job_rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { break };

            if job.cancel.is_canceled() || closing.load(Ordering::Acquire) {
                debug!(
                    chat = %job.chat,
                    request_id = %job.request_id,
                    "skipping cancelled job before start"
                );
                let _ = job.result_tx.send(Err(FetchError::Canceled));
                continue;
            }

            debug!(
                chat = %job.chat,
                request_id = %job.request_id,
                "worker {} resolving '{}'",
                worker_id,
                job.query
            );

            let result = match tokio::time::timeout(timeout, resolver.resolve(&job.query)).await {
                Err(_) => {
                    warn!(
                        chat = %job.chat,
                        request_id = %job.request_id,
                        "resolve timed out after {:?}",
                        timeout
                    );
                    Err(FetchError::Timeout(timeout))
                }
                Ok(Err(e)) => Err(FetchError::Resolve(e)),
                Ok(Ok(source)) => Ok(source),
            };

            // The receiver may have been dropped by a skip/stop; delivery is
            // best effort and the result is simply discarded then.
            let _ = job.result_tx.send(result);
        }

        debug!("fetch worker {} exiting", worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimResolver;

    fn small_pool(resolver: Arc<SimResolver>, workers: usize, pending: usize) -> FetchPool {
        let config = FetchConfig {
            max_workers: workers,
            max_pending: pending,
            timeout_secs: 30,
        };
        FetchPool::new(resolver, &config)
    }

    #[tokio::test]
    async fn resolves_and_delivers_once() {
        let resolver = Arc::new(SimResolver::new());
        let pool = small_pool(Arc::clone(&resolver), 2, 4);

        let handle = pool
            .submit(Uuid::new_v4(), ChatId(1), "some song")
            .unwrap();
        let source = handle.recv().await.unwrap();
        assert_eq!(source.handle, "sim://some song");
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn saturation_fails_fast_and_loses_nothing() {
        let resolver = Arc::new(SimResolver::new());
        resolver.pause_resolution();
        let pool = small_pool(Arc::clone(&resolver), 2, 3);

        // Let the workers pick up their jobs so the admission queue is
        // measured on top of in-flight work.
        let mut handles = Vec::new();
        for i in 0..2 {
            handles.push(pool.submit(Uuid::new_v4(), ChatId(i), "a").unwrap());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 2..5 {
            handles.push(pool.submit(Uuid::new_v4(), ChatId(i), "b").unwrap());
        }

        // workers (2) + pending (3) slots taken: the next submit must fail
        let err = pool.submit(Uuid::new_v4(), ChatId(99), "c").unwrap_err();
        assert!(matches!(err, Error::PoolSaturated));

        // Nothing silently dropped: every accepted job still completes.
        resolver.resume_resolution();
        for handle in handles {
            assert!(handle.recv().await.is_ok());
        }
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped_before_start() {
        let resolver = Arc::new(SimResolver::new());
        resolver.pause_resolution();
        let pool = small_pool(Arc::clone(&resolver), 1, 4);

        let busy = pool.submit(Uuid::new_v4(), ChatId(1), "busy").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = pool.submit(Uuid::new_v4(), ChatId(2), "queued").unwrap();
        queued.cancel();

        resolver.resume_resolution();
        assert!(busy.recv().await.is_ok());
        assert!(matches!(queued.recv().await, Err(FetchError::Canceled)));

        // The cancelled job never reached the resolver.
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_resolve_times_out() {
        let resolver = Arc::new(SimResolver::new());
        resolver.script("stuck", crate::sim::SimOutcome::Hang);
        let config = FetchConfig {
            max_workers: 1,
            max_pending: 2,
            timeout_secs: 5,
        };
        let pool = FetchPool::new(Arc::clone(&resolver) as Arc<dyn SourceResolver>, &config);

        let handle = pool.submit(Uuid::new_v4(), ChatId(1), "stuck").unwrap();
        match handle.recv().await {
            Err(FetchError::Timeout(t)) => assert_eq!(t, Duration::from_secs(5)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_jobs() {
        let resolver = Arc::new(SimResolver::new());
        resolver.pause_resolution();
        let pool = small_pool(Arc::clone(&resolver), 1, 4);

        let running = pool.submit(Uuid::new_v4(), ChatId(1), "running").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = pool.submit(Uuid::new_v4(), ChatId(2), "queued").unwrap();

        let shutdown = tokio::spawn(pool.shutdown());
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.resume_resolution();
        shutdown.await.unwrap();

        // The in-flight job finished; the queued one was cancelled, not run.
        assert!(running.recv().await.is_ok());
        assert!(matches!(queued.recv().await, Err(FetchError::Canceled)));
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn admission_is_fifo_across_chats() {
        let resolver = Arc::new(SimResolver::new());
        resolver.pause_resolution();
        let pool = small_pool(Arc::clone(&resolver), 1, 8);

        let first = pool.submit(Uuid::new_v4(), ChatId(1), "one").unwrap();
        let second = pool.submit(Uuid::new_v4(), ChatId(2), "two").unwrap();
        let third = pool.submit(Uuid::new_v4(), ChatId(3), "three").unwrap();
        resolver.resume_resolution();

        first.recv().await.unwrap();
        second.recv().await.unwrap();
        third.recv().await.unwrap();

        assert_eq!(resolver.resolved_queries(), vec!["one", "two", "three"]);
    }
}
