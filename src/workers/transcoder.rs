use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::encoder::{EncodeError, EncodeRequest, Encoder, SegmentKey};
use crate::infrastructure::storage::object::ObjectStore;
use crate::modules::content::model::{
    attempt_key_prefix, attempt_prefix, key_ref, rendition_prefix, ContentStatus, ResolutionArtifact,
};
use crate::modules::content::repository::{ContentError, ContentStore};
use crate::modules::jobs::cancel::CancellationRegistry;
use crate::modules::jobs::model::{EncodePayload, FailOutcome, Job, JobPayload, LadderRung};
use crate::modules::jobs::queue::{JobQueue, QueueError};
use crate::modules::playback::gateway::key_url;

const MANIFEST_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_TYPE: &str = "video/mp2t";
const KEY_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
    /// The encode was cancelled or the lease went to someone else. The job
    /// is handed back without using up an attempt, or is no longer ours.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub public_base_url: String,
    pub segment_secs: u32,
    pub work_dir: PathBuf,
    pub poll_interval: Duration,
}

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct TranscodeContext {
    pub queue: JobQueue,
    pub contents: Arc<dyn ContentStore>,
    pub media: Arc<dyn ObjectStore>,
    pub keys: Arc<dyn ObjectStore>,
    pub encoder: Arc<dyn Encoder>,
    pub cancels: CancellationRegistry,
    pub settings: TranscodeSettings,
}

/// Why an attempt stopped short.
struct AttemptFailure {
    reason: String,
    permanent: bool,
    cancelled: bool,
    /// Renditions finished before the failure, in ladder order.
    produced: Vec<ResolutionArtifact>,
}

impl AttemptFailure {
    fn transient(reason: impl Into<String>, produced: Vec<ResolutionArtifact>) -> Self {
        Self {
            reason: reason.into(),
            permanent: false,
            cancelled: false,
            produced,
        }
    }

    fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            permanent: true,
            cancelled: false,
            produced: Vec::new(),
        }
    }

    fn cancelled(produced: Vec<ResolutionArtifact>) -> Self {
        Self {
            reason: "encode cancelled".into(),
            permanent: false,
            cancelled: true,
            produced,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum RenderError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("failed to store rendition: {0}")]
    Store(#[from] anyhow::Error),
}

pub struct TranscodeWorker {
    id: String,
    ctx: TranscodeContext,
}

/// Spawns `count` workers that run until `shutdown` fires.
pub fn spawn_pool(ctx: TranscodeContext, count: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|n| {
            let worker = TranscodeWorker::new(format!("transcoder-{}-{}", std::process::id(), n), ctx.clone());
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

impl TranscodeWorker {
    pub fn new(id: impl Into<String>, ctx: TranscodeContext) -> Self {
        Self { id: id.into(), ctx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("🎥 Transcoder worker {} started", self.id);
        let poll = self.ctx.settings.poll_interval;

        while !shutdown.is_cancelled() {
            match self.ctx.queue.dequeue(&self.id).await {
                Ok(Some(job)) => {
                    self.process(job, &shutdown).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.ctx.queue.wait_for_work(poll) => {}
                    }
                }
                Err(e) => {
                    error!("Worker {} failed to claim a job: {}", self.id, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }

        info!("🛑 Transcoder worker {} stopped", self.id);
    }

    /// Runs one claimed job to a settled state.
    pub async fn process(&self, job: Job, shutdown: &CancellationToken) -> ProcessOutcome {
        match &job.payload {
            JobPayload::Encode(payload) => self.process_encode(&job, payload, shutdown).await,
        }
    }

    async fn process_encode(
        &self,
        job: &Job,
        payload: &EncodePayload,
        shutdown: &CancellationToken,
    ) -> ProcessOutcome {
        let content_id = payload.content_id;
        info!(
            "📦 Worker {} processing job {} for content {} (attempt {}/{})",
            self.id, job.id, content_id, job.attempts, job.max_attempts
        );

        // Fresh per attempt, so nothing this attempt writes shares a name
        // with an earlier one.
        let rendition_id = Uuid::new_v4();
        let cancel = self.ctx.cancels.register(job.id, content_id, shutdown).await;
        let heartbeat = self.spawn_heartbeat(job.id, cancel.clone());

        let result = self.encode_all(payload, rendition_id, &cancel).await;

        heartbeat.abort();
        self.ctx.cancels.release(job.id).await;

        match result {
            Ok(()) => self.settle_success(job).await,
            Err(failure) => self.settle_failure(job, content_id, rendition_id, failure).await,
        }
    }

    /// Renews the lease every third of its length. Losing it trips `cancel`
    /// so the encode stops instead of racing whoever holds it now.
    fn spawn_heartbeat(&self, job_id: Uuid, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.ctx.queue.clone();
        let worker_id = self.id.clone();
        let every = (queue.lease_duration() / 3).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match queue.renew(job_id, &worker_id).await {
                    Ok(()) => debug!("Renewed lease on job {}", job_id),
                    Err(QueueError::LeaseLost(_)) | Err(QueueError::NotFound(_)) => {
                        warn!("Worker {} lost the lease on job {}, aborting encode", worker_id, job_id);
                        cancel.cancel();
                        return;
                    }
                    Err(e) => warn!("Lease renewal for job {} failed: {}", job_id, e),
                }
            }
        })
    }

    async fn encode_all(
        &self,
        payload: &EncodePayload,
        rendition_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), AttemptFailure> {
        let content_id = payload.content_id;

        if payload.resolution_ladder.is_empty() {
            return Err(AttemptFailure::permanent("job has an empty resolution ladder"));
        }

        let earlier: Vec<Uuid> = match self.ctx.contents.advance(content_id, ContentStatus::Processing).await {
            Ok(record) => record.resolutions.iter().map(|a| a.rendition_id).collect(),
            // A previous attempt published but died before completing the job.
            Err(ContentError::InvalidTransition { from: ContentStatus::Completed, .. }) => {
                info!("Content {} is already completed, settling job", content_id);
                return Ok(());
            }
            Err(ContentError::NotFound(_)) => {
                return Err(AttemptFailure::permanent(format!("content {} no longer exists", content_id)));
            }
            Err(e @ ContentError::InvalidTransition { .. }) => {
                return Err(AttemptFailure::permanent(e.to_string()));
            }
            Err(e) => return Err(AttemptFailure::transient(e.to_string(), Vec::new())),
        };

        let scratch = self
            .scratch_dir(content_id)
            .await
            .map_err(|e| AttemptFailure::transient(format!("failed to create work dir: {}", e), Vec::new()))?;

        let source = scratch.path().join("source");
        let bytes = self
            .ctx
            .media
            .download(&payload.source_path, &source)
            .await
            .map_err(|e| AttemptFailure::transient(format!("failed to fetch source: {}", e), Vec::new()))?;
        debug!("Fetched {} bytes of source for content {}", bytes, content_id);

        let mut produced = Vec::with_capacity(payload.resolution_ladder.len());

        for rung in &payload.resolution_ladder {
            if cancel.is_cancelled() {
                return Err(AttemptFailure::cancelled(produced));
            }

            match self.render(content_id, rendition_id, rung, &source, scratch.path(), cancel).await {
                Ok(artifact) => produced.push(artifact),
                Err(RenderError::Encode(EncodeError::Cancelled)) => return Err(AttemptFailure::cancelled(produced)),
                Err(e) => {
                    return Err(AttemptFailure::transient(
                        format!("{} encode failed: {}", rung.quality, e),
                        produced,
                    ));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(AttemptFailure::cancelled(produced));
        }

        match self.ctx.contents.publish_completed(content_id, &produced).await {
            Ok(record) => {
                info!("✅ Published {} rendition(s) for content {}", record.resolutions.len(), content_id);
                self.discard_superseded(content_id, &earlier, &record.resolutions).await;
                Ok(())
            }
            Err(ContentError::NotFound(_)) => Err(AttemptFailure::permanent(format!(
                "content {} was deleted during encode",
                content_id
            ))),
            Err(e) => Err(AttemptFailure::transient(format!("failed to publish: {}", e), produced)),
        }
    }

    async fn scratch_dir(&self, content_id: Uuid) -> std::io::Result<tempfile::TempDir> {
        let root = &self.ctx.settings.work_dir;
        tokio::fs::create_dir_all(root).await?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", content_id))
            .tempdir_in(root)
    }

    /// Encodes and uploads one rung under this attempt's prefix.
    async fn render(
        &self,
        content_id: Uuid,
        rendition_id: Uuid,
        rung: &LadderRung,
        source: &Path,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<ResolutionArtifact, RenderError> {
        let key = SegmentKey::generate();
        let request = EncodeRequest {
            source: source.to_path_buf(),
            rung: rung.clone(),
            out_dir: scratch.join(&rung.quality),
            key: key.clone(),
            key_uri: key_url(&self.ctx.settings.public_base_url, content_id, &rung.quality),
            segment_secs: self.ctx.settings.segment_secs,
        };

        let rendition = self.ctx.encoder.encode(&request, cancel).await?;

        let prefix = rendition_prefix(content_id, rendition_id, &rung.quality);
        let key_ref = key_ref(content_id, rendition_id, &rung.quality);
        let manifest_ref = format!("{}{}", prefix, super::encoder::MANIFEST_FILE);

        self.upload(&prefix, &key_ref, &manifest_ref, &key, &rendition.manifest, &rendition.segments, cancel)
            .await?;

        info!(
            "🔐 Rendition {} of content {} stored ({} segments)",
            rung.quality,
            content_id,
            rendition.segments.len()
        );

        Ok(ResolutionArtifact {
            quality: rung.quality.clone(),
            rendition_id,
            width: rung.width,
            height: rung.height,
            manifest_ref,
            key_ref,
            segment_count: rendition.segments.len() as u32,
        })
    }

    /// Stops before any write once `cancel` fires, so a deleted title does
    /// not get objects written back after its teardown.
    #[allow(clippy::too_many_arguments)]
    async fn upload(
        &self,
        prefix: &str,
        key_ref: &str,
        manifest_ref: &str,
        key: &SegmentKey,
        manifest: &Path,
        segments: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(), RenderError> {
        let check = || {
            if cancel.is_cancelled() {
                Err(RenderError::Encode(EncodeError::Cancelled))
            } else {
                Ok(())
            }
        };

        check()?;
        self.ctx
            .keys
            .put(key_ref, bytes::Bytes::copy_from_slice(&key.key), KEY_TYPE)
            .await?;

        for segment in segments {
            let name = segment
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("segment path {} has no file name", segment.display()))?;
            let object = format!("{}{}", prefix, name.to_string_lossy());
            check()?;
            self.ctx.media.put_file(&object, segment, SEGMENT_TYPE).await?;
        }

        // Manifest last, so it never points at segments that are not there.
        check()?;
        self.ctx.media.put_file(manifest_ref, manifest, MANIFEST_TYPE).await?;
        Ok(())
    }

    /// Deletes everything one attempt wrote. Best effort: leftovers are
    /// unreachable because no published artifact names them.
    async fn discard_attempt(&self, content_id: Uuid, rendition_id: Uuid) {
        if let Err(e) = self.ctx.media.delete_prefix(&attempt_prefix(content_id, rendition_id)).await {
            warn!("Failed to discard renditions of attempt {} for content {}: {}", rendition_id, content_id, e);
        }
        if let Err(e) = self.ctx.keys.delete_prefix(&attempt_key_prefix(content_id, rendition_id)).await {
            warn!("Failed to discard keys of attempt {} for content {}: {}", rendition_id, content_id, e);
        }
    }

    /// Drops the objects of earlier attempts that the just-published record
    /// no longer points at.
    async fn discard_superseded(&self, content_id: Uuid, earlier: &[Uuid], published: &[ResolutionArtifact]) {
        let mut stale: Vec<Uuid> = earlier
            .iter()
            .copied()
            .filter(|id| published.iter().all(|a| a.rendition_id != *id))
            .collect();
        stale.dedup();

        for rendition_id in stale {
            debug!("Discarding superseded attempt {} of content {}", rendition_id, content_id);
            self.discard_attempt(content_id, rendition_id).await;
        }
    }

    async fn settle_success(&self, job: &Job) -> ProcessOutcome {
        match self.ctx.queue.complete(job.id, &self.id).await {
            Ok(_) => {
                info!("✅ Job {} completed", job.id);
                ProcessOutcome::Success
            }
            Err(QueueError::LeaseLost(_)) => {
                // The content is published; whoever holds the job now will
                // see it completed and settle it.
                warn!("Job {} finished after its lease moved on", job.id);
                ProcessOutcome::Abandoned
            }
            Err(e) => {
                error!("Failed to complete job {}: {}", job.id, e);
                ProcessOutcome::TransientFailure
            }
        }
    }

    /// A stop requested from outside hands the job back with its attempt
    /// restored and never flags or alerts.
    async fn settle_cancelled(&self, job: &Job, content_id: Uuid, rendition_id: Uuid) -> ProcessOutcome {
        self.discard_attempt(content_id, rendition_id).await;

        match self.ctx.queue.release(job.id, &self.id, "encode cancelled").await {
            Ok(_) => {}
            Err(QueueError::LeaseLost(_)) | Err(QueueError::NotFound(_)) => {
                debug!("Cancelled job {} was already settled elsewhere", job.id);
            }
            // The lease runs out and the reaper hands the job back instead.
            Err(e) => error!("Failed to release cancelled job {}: {}", job.id, e),
        }
        ProcessOutcome::Abandoned
    }

    async fn settle_failure(
        &self,
        job: &Job,
        content_id: Uuid,
        rendition_id: Uuid,
        failure: AttemptFailure,
    ) -> ProcessOutcome {
        if failure.cancelled {
            return self.settle_cancelled(job, content_id, rendition_id).await;
        }

        let outcome = self
            .ctx
            .queue
            .fail(job.id, &self.id, failure.permanent, &failure.reason)
            .await;

        // Partial renditions of a job that gave up stay for the operator.
        if !matches!(outcome, Ok(FailOutcome::Failed { .. })) || failure.produced.is_empty() {
            self.discard_attempt(content_id, rendition_id).await;
        }

        match outcome {
            Ok(FailOutcome::Retrying { .. }) => ProcessOutcome::TransientFailure,
            Ok(FailOutcome::Failed { .. }) => {
                if let Err(e) = self
                    .ctx
                    .contents
                    .flag_for_operator(content_id, &failure.produced, &failure.reason)
                    .await
                {
                    match e {
                        ContentError::NotFound(_) => debug!("Content {} is gone, nothing to flag", content_id),
                        e => error!("Failed to flag content {} for an operator: {}", content_id, e),
                    }
                }
                ProcessOutcome::PermanentFailure
            }
            Err(QueueError::LeaseLost(_)) | Err(QueueError::NotFound(_)) => {
                debug!("Job {} was settled elsewhere: {}", job.id, failure.reason);
                ProcessOutcome::Abandoned
            }
            Err(e) => {
                error!("Failed to record failure of job {}: {}", job.id, e);
                ProcessOutcome::TransientFailure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::object::MemoryObjectStore;
    use crate::modules::content::memory::MemoryContentStore;
    use crate::modules::content::model::ContentRecord;
    use crate::modules::jobs::memory::MemoryJobStore;
    use crate::modules::jobs::model::JobState;
    use crate::workers::encoder::EncodedRendition;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes two fake segments and a manifest. Fails `quality` for its
    /// first `failures` calls.
    #[derive(Default)]
    struct FakeEncoder {
        flaky: Option<(String, usize)>,
        calls: AtomicUsize,
        block: bool,
        /// Trips the attempt's token right after producing output, as a
        /// teardown landing between encode and upload would.
        cancel_when_done: bool,
    }

    impl FakeEncoder {
        fn ok() -> Self {
            Self::default()
        }

        fn failing(quality: &str, failures: usize) -> Self {
            Self { flaky: Some((quality.into(), failures)), ..Self::default() }
        }

        fn blocking() -> Self {
            Self { block: true, ..Self::default() }
        }

        fn cancelled_when_done() -> Self {
            Self { cancel_when_done: true, ..Self::default() }
        }
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn encode(&self, req: &EncodeRequest, cancel: &CancellationToken) -> Result<EncodedRendition, EncodeError> {
            if self.block {
                cancel.cancelled().await;
                return Err(EncodeError::Cancelled);
            }

            if let Some((quality, failures)) = &self.flaky {
                if &req.rung.quality == quality && self.calls.fetch_add(1, Ordering::SeqCst) < *failures {
                    return Err(EncodeError::Engine { status: "exit 1".into(), stderr: "codec".into() });
                }
            }

            tokio::fs::create_dir_all(&req.out_dir).await?;
            let manifest = req.out_dir.join("index.m3u8");
            tokio::fs::write(&manifest, format!("#EXT-X-KEY:METHOD=AES-128,URI=\"{}\"\n", req.key_uri)).await?;
            let mut segments = Vec::new();
            for i in 0..2 {
                let path = req.out_dir.join(format!("segment_{:05}.ts", i));
                tokio::fs::write(&path, b"enc").await?;
                segments.push(path);
            }
            if self.cancel_when_done {
                cancel.cancel();
            }
            Ok(EncodedRendition { manifest, segments })
        }
    }

    struct Harness {
        queue: JobQueue,
        contents: Arc<MemoryContentStore>,
        media: MemoryObjectStore,
        keys: MemoryObjectStore,
        cancels: CancellationRegistry,
        _work: tempfile::TempDir,
        ctx: TranscodeContext,
    }

    fn ladder() -> Vec<LadderRung> {
        vec![
            LadderRung { quality: "1080p".into(), width: 1920, height: 1080 },
            LadderRung { quality: "720p".into(), width: 1280, height: 720 },
        ]
    }

    async fn harness(encoder: FakeEncoder, max_attempts: u32) -> Harness {
        let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), Duration::from_secs(60), max_attempts);
        let contents = Arc::new(MemoryContentStore::new());
        let media = MemoryObjectStore::new();
        let keys = MemoryObjectStore::new();
        let cancels = CancellationRegistry::new();
        let work = tempfile::tempdir().unwrap();

        let ctx = TranscodeContext {
            queue: queue.clone(),
            contents: contents.clone(),
            media: Arc::new(media.clone()),
            keys: Arc::new(keys.clone()),
            encoder: Arc::new(encoder),
            cancels: cancels.clone(),
            settings: TranscodeSettings {
                public_base_url: "https://stream.test".into(),
                segment_secs: 6,
                work_dir: work.path().to_path_buf(),
                poll_interval: Duration::from_millis(10),
            },
        };

        Harness { queue, contents, media, keys, cancels, _work: work, ctx }
    }

    async fn queued_content(h: &Harness) -> Uuid {
        let record = ContentRecord::new("Film");
        h.contents.create(&record).await.unwrap();
        h.contents.advance(record.id, ContentStatus::Queued).await.unwrap();
        h.media.put("sources/film.src", bytes::Bytes::from_static(b"raw"), "video/mp4").await.unwrap();
        h.queue
            .enqueue(JobPayload::Encode(EncodePayload {
                content_id: record.id,
                source_path: "sources/film.src".into(),
                resolution_ladder: ladder(),
            }))
            .await
            .unwrap();
        record.id
    }

    async fn claim(h: &Harness, worker: &TranscodeWorker) -> Job {
        h.queue.dequeue(worker.id()).await.unwrap().expect("a pending job")
    }

    #[tokio::test]
    async fn success_publishes_every_rung_and_completes() {
        let h = harness(FakeEncoder::ok(), 3).await;
        let cid = queued_content(&h).await;
        let worker = TranscodeWorker::new("w1", h.ctx.clone());

        let job = claim(&h, &worker).await;
        let outcome = worker.process(job.clone(), &CancellationToken::new()).await;
        assert_eq!(outcome, ProcessOutcome::Success);

        let record = h.contents.get(cid).await.unwrap().unwrap();
        assert_eq!(record.status, ContentStatus::Completed);
        let qualities: Vec<_> = record.resolutions.iter().map(|r| r.quality.as_str()).collect();
        assert_eq!(qualities, vec!["1080p", "720p"]);
        assert_eq!(record.resolutions[0].segment_count, 2);

        let rid = record.resolutions[0].rendition_id;
        assert_eq!(record.resolutions[1].rendition_id, rid);

        let manifest = h.media.get(&record.resolutions[1].manifest_ref).await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&manifest).contains("/api/v1/playback/keys/"));
        assert!(h.media.contains(&format!("hls/{}/{}/720p/segment_00001.ts", cid, rid)).await);

        let k1080 = h.keys.get(&key_ref(cid, rid, "1080p")).await.unwrap().unwrap();
        let k720 = h.keys.get(&key_ref(cid, rid, "720p")).await.unwrap().unwrap();
        assert_eq!(k1080.len(), 16);
        assert_ne!(k1080, k720);
        assert!(h.media.keys().await.iter().all(|k| !k.starts_with("keys/")));

        assert_eq!(h.queue.get(job.id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn rung_failure_is_retried_without_publishing() {
        let h = harness(FakeEncoder::failing("720p", 1), 3).await;
        let cid = queued_content(&h).await;
        let worker = TranscodeWorker::new("w1", h.ctx.clone());

        let job = claim(&h, &worker).await;
        assert_eq!(worker.process(job.clone(), &CancellationToken::new()).await, ProcessOutcome::TransientFailure);

        let record = h.contents.get(cid).await.unwrap().unwrap();
        assert_eq!(record.status, ContentStatus::Processing);
        assert!(record.resolutions.is_empty());
        assert_eq!(h.queue.get(job.id).await.unwrap().state, JobState::Pending);

        let job = claim(&h, &worker).await;
        assert_eq!(worker.process(job, &CancellationToken::new()).await, ProcessOutcome::Success);
        let record = h.contents.get(cid).await.unwrap().unwrap();
        assert_eq!(record.status, ContentStatus::Completed);

        // The failed attempt's 1080p output was thrown away.
        let live = attempt_prefix(cid, record.resolutions[0].rendition_id);
        let media = h.media.keys().await;
        assert!(media.iter().filter(|k| k.starts_with("hls/")).all(|k| k.starts_with(&live)));
        assert_eq!(h.keys.keys().await.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_job_flags_content_with_partial_renditions() {
        let h = harness(FakeEncoder::failing("720p", usize::MAX), 1).await;
        let cid = queued_content(&h).await;
        let worker = TranscodeWorker::new("w1", h.ctx.clone());
        let mut alerts = h.queue.subscribe_alerts();

        let job = claim(&h, &worker).await;
        assert_eq!(worker.process(job.clone(), &CancellationToken::new()).await, ProcessOutcome::PermanentFailure);

        let record = h.contents.get(cid).await.unwrap().unwrap();
        assert_eq!(record.status, ContentStatus::Processing);
        assert!(record.needs_attention);
        assert_eq!(record.resolutions.len(), 1);
        assert_eq!(record.resolutions[0].quality, "1080p");

        assert_eq!(h.queue.get(job.id).await.unwrap().state, JobState::Failed);
        assert_eq!(alerts.recv().await.unwrap().job_id, job.id);
    }

    #[tokio::test]
    async fn missing_content_fails_permanently() {
        let h = harness(FakeEncoder::ok(), 3).await;
        h.queue
            .enqueue(JobPayload::Encode(EncodePayload {
                content_id: Uuid::new_v4(),
                source_path: "sources/none.src".into(),
                resolution_ladder: ladder(),
            }))
            .await
            .unwrap();
        let worker = TranscodeWorker::new("w1", h.ctx.clone());

        let job = claim(&h, &worker).await;
        assert_eq!(worker.process(job.clone(), &CancellationToken::new()).await, ProcessOutcome::PermanentFailure);
        assert_eq!(h.queue.get(job.id).await.unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn already_published_content_just_settles_the_job() {
        let h = harness(FakeEncoder::ok(), 3).await;
        let cid = queued_content(&h).await;
        h.contents.advance(cid, ContentStatus::Processing).await.unwrap();
        h.contents.publish_completed(cid, &[]).await.unwrap();
        let worker = TranscodeWorker::new("w1", h.ctx.clone());

        let job = claim(&h, &worker).await;
        assert_eq!(worker.process(job.clone(), &CancellationToken::new()).await, ProcessOutcome::Success);
        assert_eq!(h.queue.get(job.id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn cancelling_the_content_stops_the_encode() {
        let h = harness(FakeEncoder::blocking(), 3).await;
        let cid = queued_content(&h).await;
        let worker = TranscodeWorker::new("w1", h.ctx.clone());
        let job = claim(&h, &worker).await;

        let cancels = h.cancels.clone();
        let queue = h.queue.clone();
        let canceller = tokio::spawn(async move {
            // Wait for the worker to register its token.
            while cancels.cancel_content(cid).await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            queue.cancel_for_content(cid).await.unwrap()
        });

        let outcome = worker.process(job.clone(), &CancellationToken::new()).await;
        let cancelled = canceller.await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Abandoned);
        assert_eq!(cancelled, vec![job.id]);
        assert_eq!(h.queue.get(job.id).await.unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn shutdown_hands_the_job_back_without_spending_an_attempt() {
        let h = harness(FakeEncoder::blocking(), 1).await;
        let cid = queued_content(&h).await;
        let worker = TranscodeWorker::new("w1", h.ctx.clone());
        let mut alerts = h.queue.subscribe_alerts();

        let job = claim(&h, &worker).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert_eq!(worker.process(job.clone(), &shutdown).await, ProcessOutcome::Abandoned);

        let after = h.queue.get(job.id).await.unwrap();
        assert_eq!(after.state, JobState::Pending);
        assert_eq!(after.attempts, 0);
        assert!(after.locked_by.is_none());

        let record = h.contents.get(cid).await.unwrap().unwrap();
        assert!(!record.needs_attention);
        assert!(record.resolutions.is_empty());
        assert_matches!(alerts.try_recv(), Err(tokio::sync::broadcast::error::TryRecvError::Empty));

        // The next worker still gets its one attempt.
        let other = TranscodeWorker::new("w2", h.ctx.clone());
        let again = claim(&h, &other).await;
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn cancel_after_encode_writes_nothing_to_storage() {
        let h = harness(FakeEncoder::cancelled_when_done(), 3).await;
        let cid = queued_content(&h).await;
        let worker = TranscodeWorker::new("w1", h.ctx.clone());

        let job = claim(&h, &worker).await;
        assert_eq!(worker.process(job.clone(), &CancellationToken::new()).await, ProcessOutcome::Abandoned);

        assert!(h.keys.keys().await.is_empty());
        assert!(h.media.keys().await.iter().all(|k| !k.starts_with(&format!("hls/{}/", cid))));
        assert_eq!(h.queue.get(job.id).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn run_drains_queue_and_stops_on_shutdown() {
        let h = harness(FakeEncoder::ok(), 3).await;
        let cid = queued_content(&h).await;
        let shutdown = CancellationToken::new();
        let handles = spawn_pool(h.ctx.clone(), 2, shutdown.clone());

        for _ in 0..200 {
            if h.contents.get(cid).await.unwrap().unwrap().status == ContentStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.contents.get(cid).await.unwrap().unwrap().status, ContentStatus::Completed);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
