use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{CompleteOutcome, FailOutcome, Job, JobPayload, JobState, OperatorAlert};
use crate::infrastructure::queue::rabbitmq::{RabbitMqService, TRANSCODE_QUEUE};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} is not leased by this worker")]
    LeaseLost(Uuid),
    #[error("job {0} is not in the failed state")]
    NotFailed(Uuid),
    #[error("content {content_id} already has open job {job_id}")]
    ContentBusy { content_id: Uuid, job_id: Uuid },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Durable job storage. Every method is one atomic operation on the backing
/// store; callers never read a job and then write it back.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts unless a job with the same id exists. Returns whether it did.
    /// A content has at most one `pending` or `active` job; inserting a
    /// second one fails with `ContentBusy`.
    async fn insert(&self, job: &Job) -> Result<bool, QueueError>;

    /// Claims the oldest pending job: marks it `active`, bumps `attempts` and
    /// sets the lease, all in one step.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: OffsetDateTime,
        lock_until: OffsetDateTime,
    ) -> Result<Option<Job>, QueueError>;

    async fn renew(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<(), QueueError>;

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: OffsetDateTime,
    ) -> Result<CompleteOutcome, QueueError>;

    /// Releases the lease after a failed attempt. The job goes back to
    /// `pending` unless `permanent` is set or its attempts are used up.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        permanent: bool,
        error: &str,
        now: OffsetDateTime,
    ) -> Result<Job, QueueError>;

    /// Hands back a lease without spending the attempt: the job returns to
    /// `pending` with the claim's attempt increment undone. Used when the
    /// worker was told to stop rather than when the work itself failed.
    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Job, QueueError>;

    /// Returns every `active` job whose lease expired before `now` to
    /// `pending`, or to `failed` when it has no attempts left.
    async fn reap_expired(&self, now: OffsetDateTime) -> Result<Vec<Job>, QueueError>;

    /// Fails every unfinished job of a content and drops its lease.
    async fn cancel_for_content(
        &self,
        content_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<Uuid>, QueueError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError>;

    /// The `pending` or `active` job of a content, if there is one.
    async fn open_for_content(&self, content_id: Uuid) -> Result<Option<Job>, QueueError>;

    async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, QueueError>;

    /// Operator reset of a `failed` job back to `pending` with attempts cleared.
    /// Refused with `ContentBusy` while another job of the content is open.
    async fn reset(&self, job_id: Uuid, now: OffsetDateTime) -> Result<Job, QueueError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    lease: Duration,
    max_attempts: u32,
    wake: Arc<Notify>,
    nudges: Option<RabbitMqService>,
    alerts: broadcast::Sender<OperatorAlert>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, lease: Duration, max_attempts: u32) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            store,
            lease,
            max_attempts: max_attempts.max(1),
            wake: Arc::new(Notify::new()),
            nudges: None,
            alerts,
        }
    }

    /// Also publish a wake-up nudge to RabbitMQ on every enqueue so workers in
    /// other processes pick the job up without waiting for their poll tick.
    pub fn with_nudges(mut self, rabbit: RabbitMqService) -> Self {
        self.nudges = Some(rabbit);
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<Job, QueueError> {
        self.enqueue_with_id(Uuid::new_v4(), payload).await
    }

    /// Enqueues under a caller-chosen id. Enqueueing the same id twice leaves
    /// the first job untouched and returns it, so a retried producer never
    /// creates a duplicate.
    pub async fn enqueue_with_id(&self, id: Uuid, payload: JobPayload) -> Result<Job, QueueError> {
        let mut job = Job::new(payload, self.max_attempts);
        job.id = id;

        if !self.store.insert(&job).await? {
            debug!("Job {} already enqueued", id);
            return self.get(id).await;
        }

        info!("📥 Enqueued {} job {} for content {}", job.payload.kind(), job.id, job.content_id());
        self.wake();

        if let Some(rabbit) = &self.nudges {
            if let Err(e) = rabbit.publish_json(TRANSCODE_QUEUE, &job.id).await {
                // The job is already durable; pollers will still find it.
                warn!("Failed to publish wake-up for job {}: {}", job.id, e);
            }
        }

        Ok(job)
    }

    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = OffsetDateTime::now_utc();
        let job = self.store.claim_next(worker_id, now, now + self.lease).await?;

        if let Some(job) = &job {
            debug!("Worker {} claimed job {} (attempt {}/{})", worker_id, job.id, job.attempts, job.max_attempts);
        }

        Ok(job)
    }

    pub async fn renew(&self, job_id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        let now = OffsetDateTime::now_utc();
        self.store.renew(job_id, worker_id, now + self.lease, now).await
    }

    pub async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<CompleteOutcome, QueueError> {
        let outcome = self
            .store
            .complete(job_id, worker_id, OffsetDateTime::now_utc())
            .await?;

        if outcome == CompleteOutcome::AlreadyCompleted {
            debug!("Job {} was already completed", job_id);
        }

        Ok(outcome)
    }

    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        permanent: bool,
        reason: &str,
    ) -> Result<FailOutcome, QueueError> {
        let job = self
            .store
            .fail(job_id, worker_id, permanent, reason, OffsetDateTime::now_utc())
            .await?;

        match job.state {
            JobState::Failed => {
                self.raise_alert(&job, reason);
                Ok(FailOutcome::Failed { attempts: job.attempts })
            }
            _ => {
                warn!("Job {} failed attempt {}/{}: {}", job.id, job.attempts, job.max_attempts, reason);
                self.wake();
                Ok(FailOutcome::Retrying { attempts: job.attempts })
            }
        }
    }

    /// Gives the job back untouched after a cancelled attempt. Never alerts.
    pub async fn release(&self, job_id: Uuid, worker_id: &str, reason: &str) -> Result<Job, QueueError> {
        let job = self
            .store
            .release(job_id, worker_id, reason, OffsetDateTime::now_utc())
            .await?;

        info!("Released job {} back to pending ({}/{} attempts used): {}", job.id, job.attempts, job.max_attempts, reason);
        self.wake();
        Ok(job)
    }

    /// One sweep of the lease reaper.
    pub async fn reap(&self) -> Result<ReapReport, QueueError> {
        let reaped = self.store.reap_expired(OffsetDateTime::now_utc()).await?;
        let mut report = ReapReport::default();

        for job in reaped {
            if job.state == JobState::Failed {
                self.raise_alert(&job, "lease expired with no attempts left");
                report.failed.push(job.id);
            } else {
                warn!("♻️ Reclaimed stalled job {} (attempt {}/{})", job.id, job.attempts, job.max_attempts);
                report.requeued.push(job.id);
            }
        }

        if !report.requeued.is_empty() {
            self.wake();
        }

        Ok(report)
    }

    pub async fn cancel_for_content(&self, content_id: Uuid) -> Result<Vec<Uuid>, QueueError> {
        let cancelled = self
            .store
            .cancel_for_content(content_id, "cancelled: content deleted", OffsetDateTime::now_utc())
            .await?;

        if !cancelled.is_empty() {
            info!("Cancelled {} job(s) for content {}", cancelled.len(), content_id);
        }

        Ok(cancelled)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job, QueueError> {
        self.store.get(job_id).await?.ok_or(QueueError::NotFound(job_id))
    }

    pub async fn open_for_content(&self, content_id: Uuid) -> Result<Option<Job>, QueueError> {
        self.store.open_for_content(content_id).await
    }

    pub async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, QueueError> {
        self.store.list(state, limit.clamp(1, 500)).await
    }

    pub async fn retry(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let job = self.store.reset(job_id, OffsetDateTime::now_utc()).await?;
        info!("Operator reset job {} to pending", job_id);
        self.wake();
        Ok(job)
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<OperatorAlert> {
        self.alerts.subscribe()
    }

    /// Wakes one idle worker.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Parks the caller until a wake-up arrives or `timeout` elapses.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
    }

    fn raise_alert(&self, job: &Job, reason: &str) {
        let alert = OperatorAlert {
            job_id: job.id,
            content_id: job.content_id(),
            attempts: job.attempts,
            reason: job.last_error.clone().unwrap_or_else(|| reason.to_string()),
        };

        error!(
            "🚨 Job {} for content {} failed permanently after {} attempt(s): {}",
            alert.job_id, alert.content_id, alert.attempts, alert.reason
        );

        // No subscribers is fine; the log line above is the fallback.
        let _ = self.alerts.send(alert);
    }
}
