use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{CompleteOutcome, Job, JobState};
use super::queue::{JobStore, QueueError};

/// Job store kept in process memory. A single mutex serialises every
/// operation, which gives the same atomicity as the row-locking SQL store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unlock(job: &mut Job, state: JobState, now: OffsetDateTime) {
    job.state = state;
    job.locked_by = None;
    job.lock_until = None;
    job.updated_at = now;
}

fn open_job(jobs: &HashMap<Uuid, Job>, content_id: Uuid) -> Option<&Job> {
    jobs.values()
        .find(|j| j.content_id() == content_id && !j.state.is_terminal())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        if let Some(open) = open_job(&jobs, job.content_id()) {
            return Err(QueueError::ContentBusy {
                content_id: job.content_id(),
                job_id: open.id,
            });
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: OffsetDateTime,
        lock_until: OffsetDateTime,
    ) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.jobs.lock().await;

        let next = jobs
            .values_mut()
            .filter(|j| j.state == JobState::Pending)
            .min_by_key(|j| (j.created_at, j.id));

        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.attempts += 1;
            job.locked_by = Some(worker_id.to_string());
            job.lock_until = Some(lock_until);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn renew(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;

        if !job.is_held_by(worker_id) {
            return Err(QueueError::LeaseLost(job_id));
        }

        job.lock_until = Some(lock_until);
        job.updated_at = now;
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: OffsetDateTime,
    ) -> Result<CompleteOutcome, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;

        if job.state == JobState::Completed {
            return Ok(CompleteOutcome::AlreadyCompleted);
        }
        if !job.is_held_by(worker_id) {
            return Err(QueueError::LeaseLost(job_id));
        }

        unlock(job, JobState::Completed, now);
        job.last_error = None;
        Ok(CompleteOutcome::Completed)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        permanent: bool,
        error: &str,
        now: OffsetDateTime,
    ) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;

        if !job.is_held_by(worker_id) {
            return Err(QueueError::LeaseLost(job_id));
        }

        let next = if permanent || job.attempts_exhausted() {
            JobState::Failed
        } else {
            JobState::Pending
        };
        unlock(job, next, now);
        job.last_error = Some(error.to_string());
        Ok(job.clone())
    }

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;

        if !job.is_held_by(worker_id) {
            return Err(QueueError::LeaseLost(job_id));
        }

        unlock(job, JobState::Pending, now);
        job.attempts = job.attempts.saturating_sub(1);
        job.last_error = Some(reason.to_string());
        Ok(job.clone())
    }

    async fn reap_expired(&self, now: OffsetDateTime) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let mut reaped = Vec::new();

        for job in jobs.values_mut() {
            let expired = job.state == JobState::Active && job.lock_until.is_some_and(|t| t < now);
            if !expired {
                continue;
            }

            let next = if job.attempts_exhausted() {
                JobState::Failed
            } else {
                JobState::Pending
            };
            unlock(job, next, now);
            job.last_error = Some("lease expired".to_string());
            reaped.push(job.clone());
        }

        Ok(reaped)
    }

    async fn cancel_for_content(
        &self,
        content_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<Uuid>, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let mut cancelled = Vec::new();

        for job in jobs.values_mut() {
            if job.content_id() == content_id && !job.state.is_terminal() {
                unlock(job, JobState::Failed, now);
                job.last_error = Some(reason.to_string());
                cancelled.push(job.id);
            }
        }

        Ok(cancelled)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn open_for_content(&self, content_id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(open_job(&*self.jobs.lock().await, content_id).cloned())
    }

    async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();

        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn reset(&self, job_id: Uuid, now: OffsetDateTime) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;

        if job.state != JobState::Failed {
            return Err(QueueError::NotFailed(job_id));
        }
        let content_id = job.content_id();
        if let Some(open) = open_job(&jobs, content_id) {
            return Err(QueueError::ContentBusy {
                content_id,
                job_id: open.id,
            });
        }

        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;

        unlock(job, JobState::Pending, now);
        job.attempts = 0;
        job.last_error = None;
        Ok(job.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::jobs::model::{EncodePayload, JobPayload};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn job(max_attempts: u32) -> Job {
        job_for(Uuid::new_v4(), max_attempts)
    }

    fn job_for(content_id: Uuid, max_attempts: u32) -> Job {
        Job::new(
            JobPayload::Encode(EncodePayload {
                content_id,
                source_path: "sources/a.src".into(),
                resolution_ladder: vec![],
            }),
            max_attempts,
        )
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryJobStore::new();
        store.insert(&job(3)).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let first = store.claim_next("w1", now, now + Duration::from_secs(60)).await.unwrap();
        let second = store.claim_next("w2", now, now + Duration::from_secs(60)).await.unwrap();

        let first = first.expect("first worker gets the job");
        assert_eq!(first.attempts, 1);
        assert_eq!(first.locked_by.as_deref(), Some("w1"));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn only_lease_holder_can_complete_and_completion_is_reentrant() {
        let store = MemoryJobStore::new();
        let j = job(3);
        store.insert(&j).await.unwrap();
        let now = OffsetDateTime::now_utc();
        store.claim_next("w1", now, now + Duration::from_secs(60)).await.unwrap();

        assert_matches!(store.complete(j.id, "w2", now).await, Err(QueueError::LeaseLost(_)));
        assert_eq!(store.complete(j.id, "w1", now).await.unwrap(), CompleteOutcome::Completed);
        assert_eq!(store.complete(j.id, "w1", now).await.unwrap(), CompleteOutcome::AlreadyCompleted);
        assert_eq!(store.complete(j.id, "w2", now).await.unwrap(), CompleteOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn reaper_requeues_expired_lease_and_fails_when_exhausted() {
        let store = MemoryJobStore::new();
        let j = job(2);
        store.insert(&j).await.unwrap();
        let now = OffsetDateTime::now_utc();

        store.claim_next("w1", now, now + Duration::from_secs(1)).await.unwrap();
        let later = now + Duration::from_secs(5);
        let reaped = store.reap_expired(later).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].state, JobState::Pending);

        // The stalled worker no longer holds the lease.
        assert_matches!(store.complete(j.id, "w1", later).await, Err(QueueError::LeaseLost(_)));

        store.claim_next("w2", later, later + Duration::from_secs(1)).await.unwrap();
        let reaped = store.reap_expired(later + Duration::from_secs(5)).await.unwrap();
        assert_eq!(reaped[0].state, JobState::Failed);
        assert_eq!(reaped[0].attempts, 2);
    }

    #[tokio::test]
    async fn reaper_leaves_live_leases_alone() {
        let store = MemoryJobStore::new();
        store.insert(&job(3)).await.unwrap();
        let now = OffsetDateTime::now_utc();
        store.claim_next("w1", now, now + Duration::from_secs(60)).await.unwrap();

        assert!(store.reap_expired(now + Duration::from_secs(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_only_applies_to_failed_jobs() {
        let store = MemoryJobStore::new();
        let j = job(1);
        store.insert(&j).await.unwrap();
        let now = OffsetDateTime::now_utc();

        assert_matches!(store.reset(j.id, now).await, Err(QueueError::NotFailed(_)));

        store.claim_next("w1", now, now + Duration::from_secs(60)).await.unwrap();
        let failed = store.fail(j.id, "w1", false, "boom", now).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);

        let reset = store.reset(j.id, now).await.unwrap();
        assert_eq!(reset.state, JobState::Pending);
        assert_eq!(reset.attempts, 0);
    }

    #[tokio::test]
    async fn released_job_gets_its_attempt_back() {
        let store = MemoryJobStore::new();
        let j = job(1);
        store.insert(&j).await.unwrap();
        let now = OffsetDateTime::now_utc();
        store.claim_next("w1", now, now + Duration::from_secs(60)).await.unwrap();

        assert_matches!(store.release(j.id, "w2", "shutdown", now).await, Err(QueueError::LeaseLost(_)));

        let released = store.release(j.id, "w1", "shutdown", now).await.unwrap();
        assert_eq!(released.state, JobState::Pending);
        assert_eq!(released.attempts, 0);
        assert!(released.locked_by.is_none());

        // The only attempt is still available.
        let again = store.claim_next("w2", now, now + Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn one_open_job_per_content() {
        let store = MemoryJobStore::new();
        let content_id = Uuid::new_v4();
        let first = job_for(content_id, 1);
        let second = job_for(content_id, 1);
        store.insert(&first).await.unwrap();

        assert_matches!(
            store.insert(&second).await,
            Err(QueueError::ContentBusy { job_id, .. }) if job_id == first.id
        );
        assert_eq!(store.open_for_content(content_id).await.unwrap().map(|j| j.id), Some(first.id));

        // Once the first one is done a new job is accepted, and the old one
        // cannot be reset while the new one is open.
        let now = OffsetDateTime::now_utc();
        store.claim_next("w1", now, now + Duration::from_secs(60)).await.unwrap();
        store.fail(first.id, "w1", true, "boom", now).await.unwrap();
        assert!(store.insert(&second).await.unwrap());
        assert_matches!(store.reset(first.id, now).await, Err(QueueError::ContentBusy { .. }));
    }
}
