use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use securestream::common::token::JwtCodec;
use securestream::config::settings::AppConfig;
use securestream::infrastructure::db::pool::connect_to_db;
use securestream::infrastructure::queue::rabbitmq::RabbitMqService;
use securestream::infrastructure::redis::client::RedisService;
use securestream::infrastructure::storage::object::ObjectStore;
use securestream::infrastructure::storage::s3::StorageService;
use securestream::modules::content::repository::{ContentStore, PgContentStore};
use securestream::modules::content::service::ContentService;
use securestream::modules::jobs::cancel::CancellationRegistry;
use securestream::modules::jobs::queue::JobQueue;
use securestream::modules::jobs::repository::PgJobStore;
use securestream::modules::playback::entitlement::{EntitlementProvider, PgEntitlements};
use securestream::modules::playback::gateway::KeyGateway;
use securestream::modules::playback::redis_registry::RedisDeviceRegistry;
use securestream::modules::playback::registry::DeviceRegistry;
use securestream::modules::playback::service::PlaybackService;
use securestream::modules::upload::chunks::ChunkStore;
use securestream::modules::upload::redis_ledger::RedisUploadLedger;
use securestream::modules::upload::service::{UploadCoordinator, UploadLimits};
use securestream::state::{AppState, Services};
use securestream::workers::encoder::FfmpegEncoder;
use securestream::workers::maintenance;
use securestream::workers::transcoder::{self, TranscodeContext, TranscodeSettings};

const UPLOAD_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MAINTENANCE_TASKS: usize = 5;
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Starting server...");

    let config = AppConfig::new().context("Invalid configuration")?;

    let db = connect_to_db(&config.database_url, config.pipeline.transcode_workers + MAINTENANCE_TASKS)
        .await
        .context("Failed to connect to PostgreSQL")?;
    sqlx::migrate!("./migrations").run(&db).await.context("Failed to run migrations")?;

    let redis = RedisService::new(&config.redis_url).await.context("Failed to connect to Redis")?;
    let rabbit = RabbitMqService::new(&config.rabbitmq_url).await?;

    let storage = StorageService::new(
        &config.minio_url,
        &config.minio_bucket,
        &config.minio_access_key,
        &config.minio_secret_key,
    )
    .await;
    let media: Arc<dyn ObjectStore> = Arc::new(storage.clone());
    let keys: Arc<dyn ObjectStore> = Arc::new(storage.with_bucket(&config.minio_bucket_keys));

    let tokens = JwtCodec::new(&config.jwt_secret);
    let pipeline = &config.pipeline;

    let jobs = JobQueue::new(
        Arc::new(PgJobStore::new(db.clone())),
        pipeline.lease_duration(),
        pipeline.job_max_attempts,
    )
    .with_nudges(rabbit.clone());

    let contents: Arc<dyn ContentStore> = Arc::new(PgContentStore::new(db.clone()));
    let cancels = CancellationRegistry::new();

    let registry: Arc<dyn DeviceRegistry> = Arc::new(RedisDeviceRegistry::new(redis.clone()));
    let entitlements: Arc<dyn EntitlementProvider> = Arc::new(PgEntitlements::new(
        db.clone(),
        config.playback.default_device_ceiling,
    ));

    let services = Services {
        contents: ContentService::new(contents.clone(), jobs.clone(), cancels.clone(), media.clone(), keys.clone()),
        uploads: UploadCoordinator::new(
            Arc::new(RedisUploadLedger::new(redis.clone())),
            ChunkStore::new(media.clone()),
            contents.clone(),
            jobs.clone(),
            pipeline.resolution_ladder.clone(),
            UploadLimits {
                max_chunk_bytes: pipeline.max_chunk_bytes,
                max_total_chunks: pipeline.max_upload_chunks,
                ttl: pipeline.upload_ttl(),
            },
        ),
        jobs: jobs.clone(),
        playback: PlaybackService::new(
            registry.clone(),
            entitlements.clone(),
            tokens.clone(),
            config.playback.playback_token_ttl_secs,
        ),
        gateway: KeyGateway::new(registry, entitlements, contents.clone(), keys.clone(), &config.public_base_url),
    };

    let shutdown = CancellationToken::new();

    let mut workers = transcoder::spawn_pool(
        TranscodeContext {
            queue: jobs.clone(),
            contents,
            media,
            keys,
            encoder: Arc::new(FfmpegEncoder::new(&pipeline.ffmpeg_path)),
            cancels,
            settings: TranscodeSettings {
                public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
                segment_secs: pipeline.hls_segment_secs,
                work_dir: pipeline.work_dir.clone().into(),
                poll_interval: pipeline.poll_interval(),
            },
        },
        pipeline.transcode_workers,
        shutdown.clone(),
    );

    workers.push(tokio::spawn(maintenance::run_lease_reaper(
        jobs.clone(),
        pipeline.reaper_interval(),
        shutdown.clone(),
    )));
    workers.push(tokio::spawn(maintenance::run_session_sweep(
        services.playback.clone(),
        config.playback.inactivity_threshold(),
        config.playback.sweep_interval(),
        shutdown.clone(),
    )));
    workers.push(tokio::spawn(maintenance::run_upload_expiry(
        services.uploads.clone(),
        UPLOAD_SWEEP_INTERVAL,
        shutdown.clone(),
    )));
    workers.push(tokio::spawn(maintenance::run_nudge_consumer(
        rabbit.clone(),
        jobs.clone(),
        shutdown.clone(),
    )));
    workers.push(tokio::spawn(maintenance::run_alert_forwarder(
        rabbit,
        jobs,
        shutdown.clone(),
    )));

    let port = config.server_port;
    let state = AppState::new(config, db, redis, storage, tokens, services);
    let app = securestream::app::create_app(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server running on http://0.0.0.0:{}", port);
    info!("Swagger UI on http://0.0.0.0:{}/swagger-ui", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    info!("Waiting for background tasks to stop...");

    let drain = futures_util::future::join_all(workers);
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, drain).await.is_err() {
        error!("Background tasks did not stop within {:?}", WORKER_DRAIN_TIMEOUT);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM, tripping `shutdown` for the workers.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
