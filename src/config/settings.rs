use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config::env::{self, EnvKey};
use crate::modules::jobs::model::LadderRung;

const DEFAULT_LADDER: &str = "1080p:1920x1080,720p:1280x720,480p:854x480";

/// S3 caps a multipart upload at this many parts, and assembly composes one
/// part per chunk.
const DEFAULT_MAX_UPLOAD_CHUNKS: u32 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(#[from] std::env::VarError),
    #[error("invalid resolution ladder entry '{0}', expected label:WIDTHxHEIGHT")]
    InvalidLadder(String),
    #[error("resolution ladder must contain at least one entry")]
    EmptyLadder,
    #[error("resolution ladder lists quality '{0}' more than once")]
    DuplicateQuality(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub rabbitmq_url: String,
    pub minio_url: String,
    pub minio_bucket: String,
    pub minio_bucket_keys: String,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    pub jwt_secret: String,
    pub public_base_url: String,
    pub pipeline: PipelineConfig,
    pub playback: PlaybackConfig,
}

/// Knobs for the upload -> queue -> transcode path.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    pub transcode_workers: usize,
    pub job_lease_secs: u64,
    pub job_max_attempts: u32,
    pub job_reaper_interval_secs: u64,
    pub job_poll_interval_secs: u64,
    pub upload_ttl_secs: u64,
    pub max_chunk_bytes: usize,
    pub max_upload_chunks: u32,
    pub resolution_ladder: Vec<LadderRung>,
    pub ffmpeg_path: String,
    pub hls_segment_secs: u32,
    pub work_dir: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PlaybackConfig {
    pub default_device_ceiling: u32,
    pub session_inactivity_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub playback_token_ttl_secs: u64,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let ladder = env::get_or(EnvKey::ResolutionLadder, DEFAULT_LADDER);

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            database_url: env::get(EnvKey::DatabaseUrl)?,
            redis_url: env::get(EnvKey::RedisUrl)?,
            rabbitmq_url: env::get(EnvKey::RabbitMqUrl)?,
            minio_url: env::get(EnvKey::MinioUrl)?,
            minio_bucket: env::get(EnvKey::MinioBucket)?,
            minio_bucket_keys: env::get(EnvKey::MinioKeyBucket)?,
            minio_access_key: env::get(EnvKey::MinioAccessKey)?,
            minio_secret_key: env::get(EnvKey::MinioSecretKey)?,
            jwt_secret: env::get(EnvKey::JwtSecret)?,
            public_base_url: env::get_or(EnvKey::PublicBaseUrl, "http://localhost:3000"),
            pipeline: PipelineConfig {
                transcode_workers: env::get_parsed(EnvKey::TranscodeWorkers, 2),
                job_lease_secs: env::get_parsed(EnvKey::JobLeaseSecs, 120),
                job_max_attempts: env::get_parsed(EnvKey::JobMaxAttempts, 3),
                job_reaper_interval_secs: env::get_parsed(EnvKey::JobReaperIntervalSecs, 30),
                job_poll_interval_secs: env::get_parsed(EnvKey::JobPollIntervalSecs, 15),
                upload_ttl_secs: env::get_parsed(EnvKey::UploadTtlSecs, 24 * 60 * 60),
                max_chunk_bytes: env::get_parsed(EnvKey::MaxChunkBytes, 64 * 1024 * 1024),
                max_upload_chunks: env::get_parsed(EnvKey::MaxUploadChunks, DEFAULT_MAX_UPLOAD_CHUNKS)
                    .clamp(1, DEFAULT_MAX_UPLOAD_CHUNKS),
                resolution_ladder: parse_ladder(&ladder)?,
                ffmpeg_path: env::get_or(EnvKey::FfmpegPath, "ffmpeg"),
                hls_segment_secs: env::get_parsed(EnvKey::HlsSegmentSecs, 6),
                work_dir: env::get_or(EnvKey::WorkDir, "/tmp/securestream"),
            },
            playback: PlaybackConfig {
                default_device_ceiling: env::get_parsed(EnvKey::DefaultDeviceCeiling, 2),
                session_inactivity_secs: env::get_parsed(EnvKey::SessionInactivitySecs, 30 * 60),
                session_sweep_interval_secs: env::get_parsed(EnvKey::SessionSweepIntervalSecs, 60),
                playback_token_ttl_secs: env::get_parsed(EnvKey::PlaybackTokenTtlSecs, 4 * 60 * 60),
            },
        })
    }
}

impl PipelineConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.job_reaper_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval_secs)
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }
}

impl PlaybackConfig {
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.session_inactivity_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }
}

/// Parses `label:WIDTHxHEIGHT` entries separated by commas, keeping their order.
pub fn parse_ladder(raw: &str) -> Result<Vec<LadderRung>, ConfigError> {
    let mut rungs = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || ConfigError::InvalidLadder(entry.to_string());

        let (label, dims) = entry.split_once(':').ok_or_else(invalid)?;
        let (width, height) = dims.split_once('x').ok_or_else(invalid)?;
        let width: u32 = width.trim().parse().map_err(|_| invalid())?;
        let height: u32 = height.trim().parse().map_err(|_| invalid())?;

        let label = label.trim();
        if label.is_empty() || width == 0 || height == 0 {
            return Err(invalid());
        }
        // Each quality owns its storage path and key.
        if rungs.iter().any(|r: &LadderRung| r.quality == label) {
            return Err(ConfigError::DuplicateQuality(label.to_string()));
        }

        rungs.push(LadderRung {
            quality: label.to_string(),
            width,
            height,
        });
    }

    if rungs.is_empty() {
        return Err(ConfigError::EmptyLadder);
    }

    Ok(rungs)
}
