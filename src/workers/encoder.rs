use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::modules::jobs::model::LadderRung;

pub const MANIFEST_FILE: &str = "index.m3u8";
const SEGMENT_PATTERN: &str = "segment_%05d.ts";
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encode cancelled")]
    Cancelled,
    #[error("encoder exited with {status}: {stderr}")]
    Engine { status: String, stderr: String },
    #[error("encoder produced no segments for {0}")]
    NoOutput(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// AES-128 key and IV for one rendition. Generated fresh for every rung of
/// every encode, never derived from anything else.
#[derive(Clone)]
pub struct SegmentKey {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl SegmentKey {
    pub fn generate() -> Self {
        Self {
            key: rand::random(),
            iv: rand::random(),
        }
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }
}

impl std::fmt::Debug for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentKey").field("key", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub source: PathBuf,
    pub rung: LadderRung,
    /// Receives the manifest and segments and nothing else.
    pub out_dir: PathBuf,
    pub key: SegmentKey,
    /// Written into the manifest's `EXT-X-KEY` in place of the key itself.
    pub key_uri: String,
    pub segment_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRendition {
    pub manifest: PathBuf,
    /// In playback order.
    pub segments: Vec<PathBuf>,
}

/// Produces one encrypted HLS rendition. Must return promptly with
/// [`EncodeError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
    ) -> Result<EncodedRendition, EncodeError>;
}

pub struct FfmpegEncoder {
    binary: String,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn args(request: &EncodeRequest, key_info: &Path) -> Vec<String> {
        let rung = &request.rung;
        vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            request.source.display().to_string(),
            "-vf".into(),
            format!("scale={}:{}", rung.width, rung.height),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "fast".into(),
            "-c:a".into(),
            "aac".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            request.segment_secs.to_string(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_key_info_file".into(),
            key_info.display().to_string(),
            "-hls_segment_filename".into(),
            request.out_dir.join(SEGMENT_PATTERN).display().to_string(),
            request.out_dir.join(MANIFEST_FILE).display().to_string(),
        ]
    }
}

/// Key material sits next to the output directory, not inside it, so
/// nothing that gets uploaded with the rendition can contain it.
fn key_paths(out_dir: &Path) -> (PathBuf, PathBuf) {
    (out_dir.with_extension("key"), out_dir.with_extension("keyinfo"))
}

/// ffmpeg's key-info file: key URI, local key path, IV.
pub fn key_info_contents(key_uri: &str, key_file: &Path, iv_hex: &str) -> String {
    format!("{}\n{}\n{}\n", key_uri, key_file.display(), iv_hex)
}

/// Segment files in `dir`, ordered by name, which is also playback order.
pub async fn list_segments(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut segments = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "ts") {
            segments.push(path);
        }
    }

    segments.sort();
    Ok(segments)
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    let start = trimmed.len().saturating_sub(STDERR_TAIL);
    // Stay on a char boundary.
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
    ) -> Result<EncodedRendition, EncodeError> {
        tokio::fs::create_dir_all(&request.out_dir).await?;

        let (key_file, key_info) = key_paths(&request.out_dir);
        tokio::fs::write(&key_file, request.key.key).await?;
        tokio::fs::write(
            &key_info,
            key_info_contents(&request.key_uri, &key_file, &request.key.iv_hex()),
        )
        .await?;

        info!(
            "🎞️ Encoding {} ({}x{}) from {}",
            request.rung.quality,
            request.rung.width,
            request.rung.height,
            request.source.display()
        );

        let spawned = Command::new(&self.binary)
            .args(Self::args(request, &key_info))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        // Dropping the wait future on cancel drops the child, which kills it.
        let result = match spawned {
            Ok(child) => tokio::select! {
                output = child.wait_with_output() => Some(output),
                _ = cancel.cancelled() => None,
            },
            Err(e) => Some(Err(e)),
        };

        let _ = tokio::fs::remove_file(&key_file).await;
        let _ = tokio::fs::remove_file(&key_info).await;

        let output = match result {
            Some(output) => output?,
            None => {
                debug!("Killed encoder for {}", request.rung.quality);
                return Err(EncodeError::Cancelled);
            }
        };

        if !output.status.success() {
            return Err(EncodeError::Engine {
                status: output.status.to_string(),
                stderr: tail(&output.stderr),
            });
        }

        let segments = list_segments(&request.out_dir).await?;
        if segments.is_empty() {
            return Err(EncodeError::NoOutput(request.rung.quality.clone()));
        }

        Ok(EncodedRendition {
            manifest: request.out_dir.join(MANIFEST_FILE),
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(out_dir: PathBuf) -> EncodeRequest {
        EncodeRequest {
            source: PathBuf::from("/work/source"),
            rung: LadderRung {
                quality: "720p".into(),
                width: 1280,
                height: 720,
            },
            out_dir,
            key: SegmentKey::generate(),
            key_uri: "https://cdn.test/api/v1/playback/keys/c/720p".into(),
            segment_secs: 6,
        }
    }

    #[test]
    fn keys_are_fresh_per_call() {
        let a = SegmentKey::generate();
        let b = SegmentKey::generate();
        assert_ne!(a.key, b.key);
        assert_ne!(a.iv, b.iv);
        assert_eq!(a.iv_hex().len(), 32);
        assert!(!format!("{:?}", a).contains(&hex::encode(a.key)));
    }

    #[test]
    fn key_info_has_uri_path_and_iv() {
        let info = key_info_contents("https://k/1", Path::new("/w/720p.key"), "00ff");
        let lines: Vec<_> = info.lines().collect();
        assert_eq!(lines, vec!["https://k/1", "/w/720p.key", "00ff"]);
    }

    #[test]
    fn key_material_stays_outside_output_dir() {
        let out = PathBuf::from("/work/720p");
        let (key, info) = key_paths(&out);
        assert!(!key.starts_with(&out));
        assert!(!info.starts_with(&out));
    }

    #[test]
    fn args_encrypt_and_scale() {
        let req = request(PathBuf::from("/work/720p"));
        let args = FfmpegEncoder::args(&req, Path::new("/work/720p.keyinfo"));
        let joined = args.join(" ");

        assert!(joined.contains("-vf scale=1280:720"));
        assert!(joined.contains("-hls_time 6"));
        assert!(joined.contains("-hls_playlist_type vod"));
        assert!(joined.contains("-hls_key_info_file /work/720p.keyinfo"));
        assert!(joined.ends_with("/work/720p/index.m3u8"));
    }

    #[tokio::test]
    async fn segments_are_listed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["segment_00002.ts", "segment_00000.ts", "index.m3u8", "segment_00001.ts"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let segments = list_segments(dir.path()).await.unwrap();
        let names: Vec<_> = segments
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["segment_00000.ts", "segment_00001.ts", "segment_00002.ts"]);
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FfmpegEncoder::new("/nonexistent/ffmpeg-binary");
        let req = request(dir.path().join("720p"));

        let err = encoder.encode(&req, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EncodeError::Io(_)));
        assert!(!dir.path().join("720p.key").exists());
    }
}
