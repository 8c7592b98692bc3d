//! Background job processor.
//!
//! Jobs are boxed async closures with a name, a priority, and a typed
//! retry policy. A fixed pool of workers drains a priority queue; retries
//! use exponential backoff with jitter
//! (see <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>):
//! `delay = min(base · multiplier^attempt, max_delay)` scaled by a random
//! factor in `[0.5, 1.0]`.
//!
//! Lifecycle: pending → running → (completed | failed | cancelled), with
//! failure returning to pending while retry budget remains. Cancellation
//! is cooperative: the job's closure receives a token and is expected to
//! observe it at suspension points. Finished jobs age out of the active
//! map into a bounded history ring.
//!
//! No ordering is guaranteed across jobs; per job,
//! `submitted_at ≤ started_at ≤ completed_at`.

use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::now_ts;

/// Cleanup pass cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Completed/failed jobs older than this move from the active map to
/// history.
const ACTIVE_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Retry behavior for one job class.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    retryable: Arc<dyn Fn(&Error) -> bool + Send + Sync>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_multiplier,
            retryable: Arc::new(Error::is_transient),
        }
    }

    /// 3 attempts, 1s base, 30s cap, 2× multiplier.
    pub fn default_policy() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }

    /// 5 attempts, 0.5s base, 60s cap, 2× multiplier.
    pub fn aggressive() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(60), 2.0)
    }

    /// 2 attempts, 5s base, 30s cap, 1.5× multiplier.
    pub fn conservative() -> Self {
        Self::new(2, Duration::from_secs(5), Duration::from_secs(30), 1.5)
    }

    /// Override which errors are retried.
    pub fn retry_if(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        (self.retryable)(error)
    }

    /// Jittered delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exact = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = exact.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }
}

pub type JobFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

pub struct JobSpec {
    pub name: String,
    pub priority: JobPriority,
    pub retry_policy: RetryPolicy,
    pub run: JobFn,
}

/// Observable job metadata.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub attempts: u32,
    pub error: Option<String>,
}

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
    spec: Option<JobSpec>,
}

struct QueuedJob {
    id: String,
    priority: JobPriority,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first, then earliest submission.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner {
    queue: Mutex<BinaryHeap<QueuedJob>>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    history: Mutex<VecDeque<JobRecord>>,
    history_capacity: usize,
    notify: Notify,
    shutdown: CancellationToken,
    seq: std::sync::atomic::AtomicU64,
}

#[derive(Clone)]
pub struct BackgroundProcessor {
    inner: Arc<Inner>,
    workers: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl BackgroundProcessor {
    /// Start the worker pool and the periodic cleanup task.
    pub fn start(worker_count: usize, history_capacity: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            jobs: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_capacity,
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            seq: std::sync::atomic::AtomicU64::new(0),
        });

        let mut workers = Vec::new();
        for worker_id in 0..worker_count.max(1) {
            let inner = Arc::clone(&inner);
            workers.push(tokio::spawn(async move {
                worker_loop(inner, worker_id).await;
            }));
        }

        let cleanup_inner = Arc::clone(&inner);
        workers.push(tokio::spawn(async move {
            cleanup_loop(cleanup_inner).await;
        }));

        Self {
            inner,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Queue a job; returns its id.
    pub async fn submit(&self, spec: JobSpec) -> String {
        let id = Uuid::new_v4().to_string();
        let record = JobRecord {
            id: id.clone(),
            name: spec.name.clone(),
            priority: spec.priority,
            status: JobStatus::Pending,
            submitted_at: now_ts(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            error: None,
        };
        let seq = self
            .inner
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let priority = spec.priority;

        {
            let mut jobs = self.inner.jobs.lock().await;
            jobs.insert(
                id.clone(),
                JobEntry {
                    record,
                    cancel: CancellationToken::new(),
                    spec: Some(spec),
                },
            );
        }
        {
            let mut queue = self.inner.queue.lock().await;
            queue.push(QueuedJob {
                id: id.clone(),
                priority,
                seq,
            });
        }
        self.inner.notify.notify_one();
        id
    }

    /// Current metadata for a job, from the active map or history.
    pub async fn status(&self, job_id: &str) -> Result<JobRecord> {
        if let Some(entry) = self.inner.jobs.lock().await.get(job_id) {
            return Ok(entry.record.clone());
        }
        self.inner
            .history
            .lock()
            .await
            .iter()
            .find(|r| r.id == job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job '{job_id}'")))
    }

    /// Cancel a pending or running job. Running jobs observe the token at
    /// their next suspension point.
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord> {
        let mut jobs = self.inner.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job '{job_id}'")))?;

        match entry.record.status {
            JobStatus::Pending => {
                entry.record.status = JobStatus::Cancelled;
                entry.record.completed_at = Some(now_ts());
                entry.cancel.cancel();
            }
            JobStatus::Running => {
                entry.cancel.cancel();
            }
            other => {
                return Err(Error::StateConflict {
                    expected: "pending or running".into(),
                    actual: format!("{other:?}").to_lowercase(),
                })
            }
        }
        Ok(entry.record.clone())
    }

    /// Jobs currently pending or running.
    pub async fn active_jobs(&self) -> Vec<JobRecord> {
        self.inner
            .jobs
            .lock()
            .await
            .values()
            .filter(|e| matches!(e.record.status, JobStatus::Pending | JobStatus::Running))
            .map(|e| e.record.clone())
            .collect()
    }

    /// Finished jobs, most recent first, bounded by the ring capacity.
    pub async fn history(&self) -> Vec<JobRecord> {
        self.inner.history.lock().await.iter().cloned().collect()
    }

    /// Block until the active map holds no pending or running jobs. Test
    /// and shutdown helper.
    pub async fn drain(&self) {
        loop {
            if self.active_jobs().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop workers; queued jobs are abandoned as cancelled.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }

        let next = { inner.queue.lock().await.pop() };
        let Some(queued) = next else {
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = inner.notify.notified() => continue,
            }
        };

        run_job(&inner, &queued.id, worker_id).await;
    }
}

async fn run_job(inner: &Arc<Inner>, job_id: &str, worker_id: usize) {
    // Claim the job; skip entries cancelled while queued.
    let (policy, run, cancel, name) = {
        let mut jobs = inner.jobs.lock().await;
        let Some(entry) = jobs.get_mut(job_id) else { return };
        if entry.record.status != JobStatus::Pending {
            return;
        }
        let Some(spec) = entry.spec.take() else { return };
        entry.record.status = JobStatus::Running;
        entry.record.started_at = Some(now_ts());
        (
            spec.retry_policy,
            spec.run,
            entry.cancel.clone(),
            spec.name,
        )
    };
    debug!(job = %name, worker = worker_id, "job started");

    let mut attempts = 0u32;
    let outcome = loop {
        attempts += 1;
        {
            let mut jobs = inner.jobs.lock().await;
            if let Some(entry) = jobs.get_mut(job_id) {
                entry.record.attempts = attempts;
            }
        }

        let result = (run)(cancel.clone()).await;
        match result {
            Ok(_) => break (JobStatus::Completed, None),
            Err(Error::Cancelled) => break (JobStatus::Cancelled, Some(Error::Cancelled.to_string())),
            Err(e) => {
                if cancel.is_cancelled() {
                    break (JobStatus::Cancelled, Some(e.to_string()));
                }
                if attempts >= policy.max_attempts || !policy.is_retryable(&e) {
                    warn!(job = %name, error = %e, attempts, "job failed");
                    break (JobStatus::Failed, Some(e.to_string()));
                }
                let delay = policy.delay(attempts - 1);
                debug!(job = %name, attempts, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break (JobStatus::Cancelled, None),
                    _ = inner.shutdown.cancelled() => break (JobStatus::Cancelled, None),
                }
            }
        }
    };

    let mut jobs = inner.jobs.lock().await;
    if let Some(entry) = jobs.get_mut(job_id) {
        entry.record.status = outcome.0;
        entry.record.error = outcome.1;
        entry.record.completed_at = Some(now_ts());
    }
}

async fn cleanup_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
        }

        let cutoff = now_ts() - ACTIVE_RETENTION.as_secs() as i64;
        let mut jobs = inner.jobs.lock().await;
        let finished: Vec<String> = jobs
            .iter()
            .filter(|(_, e)| {
                matches!(
                    e.record.status,
                    JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
                ) && e.record.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        if finished.is_empty() {
            continue;
        }

        let mut history = inner.history.lock().await;
        for id in finished {
            if let Some(entry) = jobs.remove(&id) {
                history.push_front(entry.record);
            }
        }
        while history.len() > inner.history_capacity {
            history.pop_back();
        }
    }
}
