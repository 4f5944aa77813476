use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    RedisUrl,
    RabbitMqUrl,
    MinioUrl,
    MinioBucket,
    MinioKeyBucket,
    MinioAccessKey,
    MinioSecretKey,
    JwtSecret,
    PublicBaseUrl,
    TranscodeWorkers,
    JobLeaseSecs,
    JobMaxAttempts,
    JobReaperIntervalSecs,
    JobPollIntervalSecs,
    DefaultDeviceCeiling,
    SessionInactivitySecs,
    SessionSweepIntervalSecs,
    UploadTtlSecs,
    MaxChunkBytes,
    MaxUploadChunks,
    ResolutionLadder,
    FfmpegPath,
    HlsSegmentSecs,
    WorkDir,
    PlaybackTokenTtlSecs,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RedisUrl => "REDIS_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::MinioUrl => "MINIO_ENDPOINT",
            EnvKey::MinioBucket => "MINIO_BUCKET_VIDEOS",
            EnvKey::MinioKeyBucket => "MINIO_BUCKET_KEYS",
            EnvKey::MinioAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::MinioSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::JwtSecret => "JWT_SECRET",
            EnvKey::PublicBaseUrl => "PUBLIC_BASE_URL",
            EnvKey::TranscodeWorkers => "TRANSCODE_WORKERS",
            EnvKey::JobLeaseSecs => "JOB_LEASE_SECS",
            EnvKey::JobMaxAttempts => "JOB_MAX_ATTEMPTS",
            EnvKey::JobReaperIntervalSecs => "JOB_REAPER_INTERVAL_SECS",
            EnvKey::JobPollIntervalSecs => "JOB_POLL_INTERVAL_SECS",
            EnvKey::DefaultDeviceCeiling => "DEFAULT_DEVICE_CEILING",
            EnvKey::SessionInactivitySecs => "SESSION_INACTIVITY_SECS",
            EnvKey::SessionSweepIntervalSecs => "SESSION_SWEEP_INTERVAL_SECS",
            EnvKey::UploadTtlSecs => "UPLOAD_TTL_SECS",
            EnvKey::MaxChunkBytes => "MAX_CHUNK_BYTES",
            EnvKey::MaxUploadChunks => "MAX_UPLOAD_CHUNKS",
            EnvKey::ResolutionLadder => "RESOLUTION_LADDER",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::HlsSegmentSecs => "HLS_SEGMENT_SECS",
            EnvKey::WorkDir => "WORK_DIR",
            EnvKey::PlaybackTokenTtlSecs => "PLAYBACK_TOKEN_TTL_SECS",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
