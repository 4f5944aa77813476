//! Device sessions and key distribution on the in-memory adapters.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use uuid::Uuid;

use securestream::common::token::{JwtCodec, PLAYBACK_ROLE};
use securestream::infrastructure::storage::object::{MemoryObjectStore, ObjectStore};
use securestream::modules::content::memory::MemoryContentStore;
use securestream::modules::content::model::{
    key_ref, rendition_prefix, ContentRecord, ContentStatus, ResolutionArtifact,
};
use securestream::modules::content::repository::ContentStore;
use securestream::modules::playback::entitlement::FixedEntitlements;
use securestream::modules::playback::gateway::{GatewayError, KeyGateway};
use securestream::modules::playback::model::{DenialReason, Entitlement};
use securestream::modules::playback::registry::{DeviceRegistry, MemoryDeviceRegistry};
use securestream::modules::playback::service::PlaybackService;

const SECRET: &str = "playback-test-secret";

struct Playback {
    subscriber: Uuid,
    lapsed: Uuid,
    registry: Arc<MemoryDeviceRegistry>,
    contents: Arc<MemoryContentStore>,
    keys: MemoryObjectStore,
    sessions: PlaybackService,
    gateway: KeyGateway,
}

fn playback(ceiling: u32) -> Playback {
    let subscriber = Uuid::new_v4();
    let lapsed = Uuid::new_v4();
    let registry = Arc::new(MemoryDeviceRegistry::new());
    let contents = Arc::new(MemoryContentStore::new());
    let keys = MemoryObjectStore::new();

    let entitlements = Arc::new(
        FixedEntitlements::new()
            .with(subscriber, Entitlement { active: true, device_ceiling: ceiling })
            .with(lapsed, Entitlement { active: false, device_ceiling: ceiling }),
    );

    let sessions = PlaybackService::new(registry.clone(), entitlements.clone(), JwtCodec::new(SECRET), 3600);
    let gateway = KeyGateway::new(
        registry.clone(),
        entitlements,
        contents.clone(),
        Arc::new(keys.clone()),
        "https://stream.test/",
    );

    Playback { subscriber, lapsed, registry, contents, keys, sessions, gateway }
}

/// Encode that produced the fixture renditions.
const RENDITION: Uuid = Uuid::from_u128(0x5eed);

/// A completed title with a single 720p rendition and its key stored.
async fn published_title(p: &Playback) -> Uuid {
    let record = ContentRecord::new("Harbour Lights");
    let id = record.id;
    p.contents.create(&record).await.unwrap();
    p.contents.advance(id, ContentStatus::Queued).await.unwrap();
    p.contents.advance(id, ContentStatus::Processing).await.unwrap();
    p.contents
        .publish_completed(
            id,
            &[ResolutionArtifact {
                quality: "720p".into(),
                rendition_id: RENDITION,
                width: 1280,
                height: 720,
                manifest_ref: format!("{}index.m3u8", rendition_prefix(id, RENDITION, "720p")),
                key_ref: key_ref(id, RENDITION, "720p"),
                segment_count: 10,
            }],
        )
        .await
        .unwrap();
    p.keys
        .put(&key_ref(id, RENDITION, "720p"), Bytes::from_static(&[7u8; 16]), "application/octet-stream")
        .await
        .unwrap();
    id
}

fn denied(result: Result<impl std::fmt::Debug, GatewayError>) -> DenialReason {
    match result {
        Err(GatewayError::Denied(reason)) => reason,
        other => panic!("expected a denial, got {:?}", other),
    }
}

#[tokio::test]
async fn third_device_waits_for_a_free_slot() {
    let p = playback(2);
    let account = p.subscriber;

    let a = p.sessions.start_session(account, "device-a").await.unwrap();
    assert_eq!(a.active_devices, 1);
    let b = p.sessions.start_session(account, "device-b").await.unwrap();
    assert_eq!(b.active_devices, 2);

    assert_eq!(
        denied(p.sessions.start_session(account, "device-c").await),
        DenialReason::DeviceLimitExceeded
    );

    p.sessions.stop_session(account, "device-a").await.unwrap();
    let c = p.sessions.start_session(account, "device-c").await.unwrap();
    assert_eq!(c.active_devices, 2);

    let claims = JwtCodec::new(SECRET).verify(&c.token).unwrap();
    assert_eq!(claims.sub, account);
    assert_eq!(claims.device_id.as_deref(), Some("device-c"));
    assert_eq!(claims.role, PLAYBACK_ROLE);

    let active: Vec<_> = p
        .sessions
        .list_sessions(account)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.is_active)
        .map(|s| s.device_id)
        .collect();
    assert_eq!(active.len(), 2);
    assert!(!active.contains(&"device-a".to_string()));
}

#[tokio::test]
async fn racing_activations_never_exceed_the_ceiling() {
    let p = playback(2);
    let sessions = p.sessions.clone();

    let attempts: Vec<_> = (0..16)
        .map(|i| {
            let sessions = sessions.clone();
            let account = p.subscriber;
            tokio::spawn(async move { sessions.start_session(account, &format!("tv-{}", i)).await })
        })
        .collect();

    let mut granted = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => granted += 1,
            Err(e) => assert_matches!(e, GatewayError::Denied(DenialReason::DeviceLimitExceeded)),
        }
    }

    assert_eq!(granted, 2);
    let active = p.registry.list(p.subscriber).await.unwrap().iter().filter(|s| s.is_active).count();
    assert_eq!(active, 2);
}

#[tokio::test]
async fn lapsed_subscription_cannot_start_a_session() {
    let p = playback(2);
    assert_eq!(
        denied(p.sessions.start_session(p.lapsed, "phone").await),
        DenialReason::NotAuthorized
    );
    assert_eq!(
        denied(p.sessions.start_session(Uuid::new_v4(), "phone").await),
        DenialReason::NotAuthorized
    );
}

#[tokio::test]
async fn gateway_denies_with_specific_reasons() {
    let p = playback(2);
    let title = published_title(&p).await;

    // No session on this device yet.
    assert_eq!(
        denied(p.gateway.resolve_key(p.subscriber, "tablet", title, "720p").await),
        DenialReason::SessionNotActive
    );

    // Active device, but the subscription has lapsed since.
    p.registry
        .activate(p.lapsed, "tablet", 2, time::OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(
        denied(p.gateway.resolve_key(p.lapsed, "tablet", title, "720p").await),
        DenialReason::NotAuthorized
    );

    p.sessions.start_session(p.subscriber, "tablet").await.unwrap();
    assert_eq!(
        denied(p.gateway.resolve_key(p.subscriber, "tablet", title, "1080p").await),
        DenialReason::ResolutionNotFound
    );
    assert_matches!(
        p.gateway.resolve_key(p.subscriber, "tablet", Uuid::new_v4(), "720p").await,
        Err(GatewayError::ContentNotFound(_))
    );

    let grant = p.gateway.resolve_key(p.subscriber, "tablet", title, "720p").await.unwrap();
    assert_eq!(grant.key_ref, key_ref(title, RENDITION, "720p"));
    assert_eq!(grant.key_url, format!("https://stream.test/api/v1/playback/keys/{}/720p", title));

    let key = p.gateway.fetch_key(p.subscriber, "tablet", title, "720p").await.unwrap();
    assert_eq!(&key[..], &[7u8; 16]);

    p.sessions.stop_session(p.subscriber, "tablet").await.unwrap();
    assert_eq!(
        denied(p.gateway.fetch_key(p.subscriber, "tablet", title, "720p").await),
        DenialReason::SessionNotActive
    );
}

#[tokio::test]
async fn unfinished_titles_expose_no_keys() {
    let p = playback(2);
    let record = ContentRecord::new("Still Encoding");
    p.contents.create(&record).await.unwrap();
    p.contents.advance(record.id, ContentStatus::Queued).await.unwrap();
    p.contents.advance(record.id, ContentStatus::Processing).await.unwrap();
    p.contents
        .flag_for_operator(
            record.id,
            &[ResolutionArtifact {
                quality: "1080p".into(),
                rendition_id: RENDITION,
                width: 1920,
                height: 1080,
                manifest_ref: format!("{}index.m3u8", rendition_prefix(record.id, RENDITION, "1080p")),
                key_ref: key_ref(record.id, RENDITION, "1080p"),
                segment_count: 4,
            }],
            "720p failed",
        )
        .await
        .unwrap();

    p.sessions.start_session(p.subscriber, "tv").await.unwrap();
    assert_eq!(
        denied(p.gateway.resolve_key(p.subscriber, "tv", record.id, "1080p").await),
        DenialReason::ResolutionNotFound
    );
}

#[tokio::test]
async fn idle_sessions_are_swept_and_free_their_slot() {
    let p = playback(1);
    p.sessions.start_session(p.subscriber, "laptop").await.unwrap();
    assert_eq!(
        denied(p.sessions.start_session(p.subscriber, "phone").await),
        DenialReason::DeviceLimitExceeded
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(p.sessions.sweep_inactive(Duration::from_millis(5)).await.unwrap(), 1);

    assert!(!p.registry.is_active(p.subscriber, "laptop").await.unwrap());
    p.sessions.start_session(p.subscriber, "phone").await.unwrap();
}
