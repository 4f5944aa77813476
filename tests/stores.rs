//! The Redis and Postgres adapters against live servers. Ignored by default;
//! run with `cargo test --test stores -- --ignored` with REDIS_URL and
//! DATABASE_URL pointing at disposable instances.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use securestream::infrastructure::redis::client::RedisService;
use securestream::modules::content::model::{ContentRecord, ContentStatus, ResolutionArtifact};
use securestream::modules::content::repository::{ContentError, ContentStore, PgContentStore};
use securestream::modules::jobs::model::{EncodePayload, Job, JobPayload, JobState};
use securestream::modules::jobs::queue::{JobStore, QueueError};
use securestream::modules::jobs::repository::PgJobStore;
use securestream::modules::playback::redis_registry::RedisDeviceRegistry;
use securestream::modules::playback::registry::DeviceRegistry;
use securestream::modules::upload::ledger::UploadLedger;
use securestream::modules::upload::model::{SessionInit, UploadState};
use securestream::modules::upload::redis_ledger::RedisUploadLedger;

async fn redis() -> RedisService {
    let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for store tests");
    RedisService::new(&url).await.expect("redis reachable")
}

/// A pool confined to a fresh schema with the migrations applied, so runs
/// never see each other's rows.
async fn postgres() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for store tests");
    let schema = format!("store_test_{}", Uuid::new_v4().simple());

    let admin = PgPool::connect(&url).await.expect("postgres reachable");
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin)
        .await
        .unwrap();
    admin.close().await;

    let options = PgConnectOptions::from_str(&url)
        .unwrap()
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await
        .unwrap();

    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn encode_job(content_id: Uuid, max_attempts: u32) -> Job {
    Job::new(
        JobPayload::Encode(EncodePayload {
            content_id,
            source_path: format!("sources/{}/x.src", content_id),
            resolution_ladder: vec![],
        }),
        max_attempts,
    )
}

#[tokio::test]
#[ignore = "needs REDIS_URL"]
async fn redis_ledger_hands_out_one_finalize_claim() {
    let ledger = Arc::new(RedisUploadLedger::new(redis().await));
    let upload_id = format!("it-{}", Uuid::new_v4().simple());
    let total = 8;

    let init = SessionInit {
        upload_id: upload_id.clone(),
        title: "Race".into(),
        content_id: Uuid::new_v4(),
        job_id: Uuid::new_v4(),
        total_chunks: total,
    };
    let now = OffsetDateTime::now_utc();

    // Concurrent first chunks all get the same session back.
    let mut opens = Vec::new();
    for _ in 0..4 {
        let ledger = ledger.clone();
        let mut init = init.clone();
        init.job_id = Uuid::new_v4();
        opens.push(tokio::spawn(async move { ledger.open(&init, now).await.unwrap() }));
    }
    let mut job_ids = HashSet::new();
    for open in opens {
        job_ids.insert(open.await.unwrap().job_id);
    }
    assert_eq!(job_ids.len(), 1);

    // Every index delivered twice, all at once.
    let mut marks = Vec::new();
    for index in (0..total).chain(0..total) {
        let ledger = ledger.clone();
        let upload_id = upload_id.clone();
        marks.push(tokio::spawn(async move {
            ledger.mark_received(&upload_id, index, now).await.unwrap()
        }));
    }

    let mut claims = 0;
    for mark in marks {
        if mark.await.unwrap().claimed_finalize {
            claims += 1;
        }
    }
    assert_eq!(claims, 1);

    let session = ledger.get(&upload_id).await.unwrap().unwrap();
    assert_eq!(session.state, UploadState::Finalizing);
    assert_eq!(session.chunks_received(), total);

    // Nobody else can take a live claim.
    assert!(!ledger
        .claim_finalize(&upload_id, now, now - time::Duration::minutes(10))
        .await
        .unwrap());

    ledger.remove(&upload_id).await.unwrap();
    assert!(ledger.get(&upload_id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "needs REDIS_URL"]
async fn redis_registry_holds_the_ceiling_under_racing_activations() {
    let registry = Arc::new(RedisDeviceRegistry::new(redis().await));
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();

    let mut handles = Vec::new();
    for i in 0..20 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.activate(account, &format!("tv-{}", i), 3, now).await.unwrap()
        }));
    }

    let mut granted = Vec::new();
    for (i, handle) in handles.into_iter().enumerate() {
        if handle.await.unwrap().granted {
            granted.push(format!("tv-{}", i));
        }
    }
    assert_eq!(granted.len(), 3);
    assert_eq!(registry.list(account).await.unwrap().len(), 3);

    // Re-activating a live device does not take a slot.
    let again = registry.activate(account, &granted[0], 3, now).await.unwrap();
    assert!(again.granted);
    assert_eq!(again.active_devices, 3);

    // A stopped device is forgotten entirely and frees its slot.
    registry.deactivate(account, &granted[0]).await.unwrap();
    let listed: Vec<_> = registry.list(account).await.unwrap().into_iter().map(|d| d.device_id).collect();
    assert_eq!(listed.len(), 2);
    assert!(!listed.contains(&granted[0]));
    assert!(registry.activate(account, "phone", 3, now).await.unwrap().granted);

    granted[0] = "phone".to_string();
    for device in &granted {
        registry.deactivate(account, device).await.unwrap();
    }
    assert!(registry.list(account).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "needs REDIS_URL"]
async fn redis_registry_sweep_forgets_idle_devices() {
    let registry = RedisDeviceRegistry::new(redis().await);
    let account = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();

    registry.activate(account, "old", 2, now - time::Duration::hours(2)).await.unwrap();
    registry.activate(account, "new", 2, now).await.unwrap();

    assert!(registry.sweep(now - time::Duration::hours(1)).await.unwrap() >= 1);
    assert!(!registry.is_active(account, "old").await.unwrap());
    assert!(!registry.touch(account, "old", now).await.unwrap());

    let listed: Vec<_> = registry.list(account).await.unwrap().into_iter().map(|d| d.device_id).collect();
    assert_eq!(listed, vec!["new".to_string()]);

    registry.deactivate(account, "new").await.unwrap();
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn pg_claims_are_exclusive() {
    let store = Arc::new(PgJobStore::new(postgres().await));
    let mut inserted = HashSet::new();
    for _ in 0..5 {
        let job = encode_job(Uuid::new_v4(), 3);
        assert!(store.insert(&job).await.unwrap());
        inserted.insert(job.id);
    }

    let now = OffsetDateTime::now_utc();
    let mut claimers = Vec::new();
    for n in 0..10 {
        let store = store.clone();
        claimers.push(tokio::spawn(async move {
            store
                .claim_next(&format!("w{}", n), now, now + Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for claimer in claimers {
        if let Some(job) = claimer.await.unwrap() {
            assert_eq!(job.state, JobState::Active);
            assert_eq!(job.attempts, 1);
            claimed.push(job.id);
        }
    }

    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 5, "every job claimed exactly once");
    assert_eq!(unique, inserted);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn pg_keeps_one_open_job_per_content_and_release_restores_the_attempt() {
    let store = PgJobStore::new(postgres().await);
    let content_id = Uuid::new_v4();
    let first = encode_job(content_id, 1);
    let second = encode_job(content_id, 1);

    assert!(store.insert(&first).await.unwrap());
    assert!(!store.insert(&first).await.unwrap(), "same id is a no-op");
    assert_matches!(
        store.insert(&second).await,
        Err(QueueError::ContentBusy { job_id, .. }) if job_id == first.id
    );

    let now = OffsetDateTime::now_utc();
    let claimed = store
        .claim_next("w1", now, now + Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts, 1);

    assert_matches!(
        store.release(first.id, "w2", "shutdown", now).await,
        Err(QueueError::LeaseLost(_))
    );
    let released = store.release(first.id, "w1", "shutdown", now).await.unwrap();
    assert_eq!(released.state, JobState::Pending);
    assert_eq!(released.attempts, 0);
    assert!(released.locked_by.is_none());

    store.claim_next("w1", now, now + Duration::from_secs(60)).await.unwrap().unwrap();
    let failed = store.fail(first.id, "w1", false, "boom", now).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);

    // The content is free again, and the failed job cannot come back while
    // the new one is open.
    assert!(store.insert(&second).await.unwrap());
    assert_matches!(store.reset(first.id, now).await, Err(QueueError::ContentBusy { .. }));
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn pg_publish_writes_renditions_and_status_together() {
    let store = PgContentStore::new(postgres().await);
    let record = ContentRecord::new("Ordet");
    store.create(&record).await.unwrap();
    assert_matches!(store.create(&record).await, Err(ContentError::AlreadyExists(_)));

    let rendition_id = Uuid::new_v4();
    let artifact = |quality: &str, height: u32| ResolutionArtifact {
        quality: quality.into(),
        rendition_id,
        width: height * 16 / 9,
        height,
        manifest_ref: format!("hls/{}/{}/{}/index.m3u8", record.id, rendition_id, quality),
        key_ref: format!("keys/{}/{}/{}.key", record.id, rendition_id, quality),
        segment_count: 3,
    };

    // Not processing yet: nothing is written.
    assert_matches!(
        store.publish_completed(record.id, &[artifact("1080p", 1080)]).await,
        Err(ContentError::InvalidTransition { from: ContentStatus::WaitingForVideo, .. })
    );
    assert!(store.get(record.id).await.unwrap().unwrap().resolutions.is_empty());

    store.advance(record.id, ContentStatus::Queued).await.unwrap();
    store.advance(record.id, ContentStatus::Processing).await.unwrap();

    let published = store
        .publish_completed(record.id, &[artifact("1080p", 1080), artifact("720p", 720)])
        .await
        .unwrap();
    assert_eq!(published.status, ContentStatus::Completed);

    let stored = store.get(record.id).await.unwrap().unwrap();
    let qualities: Vec<_> = stored.resolutions.iter().map(|r| r.quality.as_str()).collect();
    assert_eq!(qualities, vec!["1080p", "720p"]);
    assert!(stored.resolutions.iter().all(|r| r.rendition_id == rendition_id));

    assert_matches!(
        store.publish_completed(record.id, &[]).await,
        Err(ContentError::InvalidTransition { from: ContentStatus::Completed, .. })
    );
    assert_matches!(
        store.publish_completed(Uuid::new_v4(), &[]).await,
        Err(ContentError::NotFound(_))
    );
}
