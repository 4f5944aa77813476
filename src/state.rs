use crate::common::token::JwtCodec;
use crate::config::settings::AppConfig;
use crate::infrastructure::db::pool::DbPool;
use crate::infrastructure::redis::client::RedisService;
use crate::infrastructure::storage::s3::StorageService;
use crate::modules::content::service::ContentService;
use crate::modules::jobs::queue::JobQueue;
use crate::modules::playback::gateway::KeyGateway;
use crate::modules::playback::service::PlaybackService;
use crate::modules::upload::service::UploadCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub redis: RedisService,
    /// Media bucket, used by the segment proxy.
    pub storage: StorageService,
    pub tokens: JwtCodec,
    pub contents: ContentService,
    pub uploads: UploadCoordinator,
    pub jobs: JobQueue,
    pub playback: PlaybackService,
    pub gateway: KeyGateway,
}

/// The domain services, built once in `main` and shared with the workers.
#[derive(Clone)]
pub struct Services {
    pub contents: ContentService,
    pub uploads: UploadCoordinator,
    pub jobs: JobQueue,
    pub playback: PlaybackService,
    pub gateway: KeyGateway,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: DbPool,
        redis: RedisService,
        storage: StorageService,
        tokens: JwtCodec,
        services: Services,
    ) -> Self {
        Self {
            config,
            db,
            redis,
            storage,
            tokens,
            contents: services.contents,
            uploads: services.uploads,
            jobs: services.jobs,
            playback: services.playback,
            gateway: services.gateway,
        }
    }
}
