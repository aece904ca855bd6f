//! Bounded multi-priority job queue & worker pool (C5).
//!
//! A single `parking_lot::Mutex` guards the three priority lanes; workers block on a
//! `tokio::sync::Notify` rather than polling. Retries, backoff, and priority aging happen inside
//! the queue so the Operation Manager only ever sees a job's terminal outcome.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stages::StageError;
use crate::types::OperationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

/// §4.5 retry policy: exponential backoff with jitter, base 1s, factor 2, max 30s, max 3 attempts.
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        let capped = exp.min(self.max.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_secs_f64(jittered)
    }
}

/// Aging rule: any Low item waiting longer than this is promoted to Normal once (§5).
const AGING_THRESHOLD: Duration = Duration::from_secs(5 * 60);

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), StageError>> + Send>>;
pub type JobFactory = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { attempt: u32 },
    Failed { attempt: u32, error: String },
    Canceled { attempt: u32 },
}

struct QueuedJob {
    id: Uuid,
    operation_id: OperationId,
    stage_id: String,
    attempt: u32,
    priority: Priority,
    deadline: Option<Duration>,
    cancel: CancellationToken,
    enqueued_at: Instant,
    promoted: bool,
    factory: JobFactory,
    done: oneshot::Sender<JobOutcome>,
}

pub struct JobSubmission {
    pub operation_id: OperationId,
    pub stage_id: String,
    pub priority: Priority,
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
    pub factory: JobFactory,
}

#[derive(Debug, thiserror::Error)]
#[error("job queue is full")]
pub struct QueueFullError;

struct Lanes {
    high: VecDeque<QueuedJob>,
    normal: VecDeque<QueuedJob>,
    low: VecDeque<QueuedJob>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn push(&mut self, job: QueuedJob) {
        match job.priority {
            Priority::High => self.high.push_back(job),
            Priority::Normal => self.normal.push_back(job),
            Priority::Low => self.low.push_back(job),
        }
    }

    /// Promote aged Low jobs to Normal before popping, so aging is visible to the next pop.
    fn age(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.low.len() {
            let aged = !self.low[i].promoted && now.duration_since(self.low[i].enqueued_at) >= AGING_THRESHOLD;
            if aged {
                let mut job = self.low.remove(i).unwrap();
                job.promoted = true;
                job.priority = Priority::Normal;
                self.normal.push_back(job);
            } else {
                i += 1;
            }
        }
    }

    fn pop(&mut self) -> Option<QueuedJob> {
        self.age();
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

/// Per-operation fairness: the number of in-flight slots one operation may occupy concurrently,
/// preventing a large operation from starving others (§5 Fairness).
const PER_OPERATION_SLOT_BUDGET: usize = 2;

pub struct JobQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    capacity: usize,
    backoff: BackoffPolicy,
    workers: Semaphore,
    operation_slots: Mutex<std::collections::HashMap<OperationId, usize>>,
    shutdown: CancellationToken,
    submitted: AtomicUsize,
}

impl JobQueue {
    pub fn new(capacity: usize, worker_count: usize) -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
            }),
            notify: Notify::new(),
            capacity,
            backoff: BackoffPolicy::default(),
            workers: Semaphore::new(worker_count),
            operation_slots: Mutex::new(std::collections::HashMap::new()),
            shutdown: CancellationToken::new(),
            submitted: AtomicUsize::new(0),
        })
    }

    /// Default worker count: min(cpu count, configured cap), default cap 4 (§4.5).
    pub fn default_worker_count(cap: usize) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(cap)
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Enqueue a job. Returns `QueueFullError` (maps to 429/Conflict at the HTTP layer) if the
    /// queue is at capacity.
    pub fn submit(&self, submission: JobSubmission) -> Result<oneshot::Receiver<JobOutcome>, QueueFullError> {
        let (done, recv) = oneshot::channel();
        let mut lanes = self.lanes.lock();
        if lanes.len() >= self.capacity {
            return Err(QueueFullError);
        }
        lanes.push(QueuedJob {
            id: Uuid::new_v4(),
            operation_id: submission.operation_id,
            stage_id: submission.stage_id,
            attempt: 1,
            priority: submission.priority,
            deadline: submission.deadline,
            cancel: submission.cancel,
            enqueued_at: Instant::now(),
            promoted: false,
            factory: submission.factory,
            done,
        });
        drop(lanes);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(recv)
    }

    fn try_acquire_operation_slot(&self, operation_id: OperationId) -> bool {
        let mut slots = self.operation_slots.lock();
        let count = slots.entry(operation_id).or_insert(0);
        if *count >= PER_OPERATION_SLOT_BUDGET {
            false
        } else {
            *count += 1;
            true
        }
    }

    fn release_operation_slot(&self, operation_id: OperationId) {
        let mut slots = self.operation_slots.lock();
        if let Some(count) = slots.get_mut(&operation_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                slots.remove(&operation_id);
            }
        }
    }

    /// Spawn the worker pool. Each worker loops: wait for a job whose operation still has a free
    /// fairness slot, run it with its deadline and cancel token, then either resolve the waiter or
    /// requeue on a retryable error.
    pub fn spawn_workers(self: Arc<Self>, worker_count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count)
            .map(|_| {
                let queue = self.clone();
                tokio::spawn(async move { queue.worker_loop().await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let _permit = self.workers.acquire().await.expect("semaphore is never closed");

            let job = loop {
                let candidate = {
                    let mut lanes = self.lanes.lock();
                    lanes.age();
                    let mut deferred = Vec::new();
                    let mut found = None;
                    while let Some(job) = lanes.pop() {
                        if self.try_acquire_operation_slot(job.operation_id) {
                            found = Some(job);
                            break;
                        }
                        deferred.push(job);
                    }
                    for job in deferred {
                        lanes.push(job);
                    }
                    found
                };
                match candidate {
                    Some(job) => break job,
                    None => {
                        tokio::select! {
                            _ = self.notify.notified() => {}
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {} // wakes periodically for aging
                        }
                        if self.shutdown.is_cancelled() {
                            return;
                        }
                    }
                }
            };

            self.run_job(job).await;
        }
    }

    async fn run_job(&self, job: QueuedJob) {
        let QueuedJob {
            operation_id,
            stage_id,
            attempt,
            deadline,
            cancel,
            factory,
            done,
            ..
        } = job;

        let fut = factory();
        let result = match deadline {
            Some(d) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(StageError::Canceled),
                    r = tokio::time::timeout(d, fut) => r.unwrap_or(Err(StageError::Timeout)),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(StageError::Canceled),
                    r = fut => r,
                }
            }
        };

        self.release_operation_slot(operation_id);

        match result {
            Ok(()) => {
                let _ = done.send(JobOutcome::Succeeded { attempt });
            }
            Err(StageError::Canceled) => {
                let _ = done.send(JobOutcome::Canceled { attempt });
            }
            Err(e) if e.retryable() && attempt < self.backoff.max_attempts => {
                let delay = self.backoff.delay_for(attempt);
                tracing::warn!(%operation_id, stage_id, attempt, ?delay, error = %e, "retrying stage after transient error");
                tokio::time::sleep(delay).await;
                let mut lanes = self.lanes.lock();
                lanes.push(QueuedJob {
                    id: Uuid::new_v4(),
                    operation_id,
                    stage_id,
                    attempt: attempt + 1,
                    priority: Priority::High, // retries jump the queue so a flaky stage doesn't starve behind fresh work
                    deadline,
                    cancel,
                    enqueued_at: Instant::now(),
                    promoted: false,
                    factory,
                    done,
                });
                drop(lanes);
                self.notify.notify_one();
            }
            Err(e) => {
                let _ = done.send(JobOutcome::Failed { attempt, error: e.to_string() });
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn succeeding_factory(counter: Arc<AtomicU32>) -> JobFactory {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn failing_then_succeeding_factory(attempts: Arc<AtomicU32>) -> JobFactory {
        Arc::new(move || {
            let attempts = attempts.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(StageError::Network("transient".to_string()))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn job_runs_to_completion() {
        let queue = JobQueue::new(16, 2);
        let _workers = queue.clone().spawn_workers(2);
        let counter = Arc::new(AtomicU32::new(0));

        let recv = queue
            .submit(JobSubmission {
                operation_id: Uuid::new_v4(),
                stage_id: "scrape".to_string(),
                priority: Priority::Normal,
                deadline: None,
                cancel: CancellationToken::new(),
                factory: succeeding_factory(counter.clone()),
            })
            .unwrap();

        let outcome = recv.await.unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { attempt: 1 });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_error_is_retried_then_succeeds() {
        let queue = JobQueue::new(16, 2);
        let _workers = queue.clone().spawn_workers(2);
        let attempts = Arc::new(AtomicU32::new(0));

        let recv = queue
            .submit(JobSubmission {
                operation_id: Uuid::new_v4(),
                stage_id: "scrape".to_string(),
                priority: Priority::Normal,
                deadline: None,
                cancel: CancellationToken::new(),
                factory: failing_then_succeeding_factory(attempts.clone()),
            })
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), recv).await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { attempt: 2 });
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let queue = JobQueue::new(1, 0); // no workers draining it
        let counter = Arc::new(AtomicU32::new(0));
        let _first = queue
            .submit(JobSubmission {
                operation_id: Uuid::new_v4(),
                stage_id: "scrape".to_string(),
                priority: Priority::Normal,
                deadline: None,
                cancel: CancellationToken::new(),
                factory: succeeding_factory(counter.clone()),
            })
            .unwrap();

        let second = queue.submit(JobSubmission {
            operation_id: Uuid::new_v4(),
            stage_id: "scrape".to_string(),
            priority: Priority::Normal,
            deadline: None,
            cancel: CancellationToken::new(),
            factory: succeeding_factory(counter),
        });
        assert!(second.is_err());
    }
}
