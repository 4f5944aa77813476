use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Running {
    content_id: Uuid,
    token: CancellationToken,
}

/// Cancellation handles of encodes currently running in this process,
/// keyed by job. Deleting a content trips the tokens of its jobs so the
/// worker kills the encoder and lets go of the job instead of waiting out
/// the lease.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    running: Arc<Mutex<HashMap<Uuid, Running>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a new attempt of `job_id`, a child of `parent` so that
    /// shutdown cancels it as well.
    pub async fn register(&self, job_id: Uuid, content_id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.running.lock().await.insert(
            job_id,
            Running {
                content_id,
                token: token.clone(),
            },
        );
        token
    }

    pub async fn release(&self, job_id: Uuid) {
        self.running.lock().await.remove(&job_id);
    }

    /// Cancels every encode of `content_id` running here and returns how
    /// many there were.
    pub async fn cancel_content(&self, content_id: Uuid) -> usize {
        let mut running = self.running.lock().await;
        let jobs: Vec<Uuid> = running
            .iter()
            .filter(|(_, r)| r.content_id == content_id)
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in &jobs {
            if let Some(r) = running.remove(job_id) {
                r.token.cancel();
            }
        }
        jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_trips_registered_token_once() {
        let registry = CancellationRegistry::new();
        let root = CancellationToken::new();
        let (job, content) = (Uuid::new_v4(), Uuid::new_v4());

        let token = registry.register(job, content, &root).await;
        assert_eq!(registry.cancel_content(content).await, 1);
        assert!(token.is_cancelled());
        assert!(!root.is_cancelled());
        assert_eq!(registry.cancel_content(content).await, 0);
    }

    #[tokio::test]
    async fn releasing_one_job_keeps_the_other() {
        let registry = CancellationRegistry::new();
        let root = CancellationToken::new();
        let content = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        let _a = registry.register(first, content, &root).await;
        let b = registry.register(second, content, &root).await;
        registry.release(first).await;

        assert_eq!(registry.cancel_content(content).await, 1);
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_reaches_children() {
        let registry = CancellationRegistry::new();
        let root = CancellationToken::new();
        let token = registry.register(Uuid::new_v4(), Uuid::new_v4(), &root).await;

        root.cancel();
        assert!(token.is_cancelled());
    }
}
