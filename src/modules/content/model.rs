use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Processing lifecycle of a title. Only moves forward, except for an
/// explicit operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    WaitingForVideo,
    Queued,
    Processing,
    Completed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::WaitingForVideo => "waiting_for_video",
            ContentStatus::Queued => "queued",
            ContentStatus::Processing => "processing",
            ContentStatus::Completed => "completed",
        }
    }

    /// States a record may be in for a move to `self` to be legal.
    /// `processing` is re-entrant so a retried job can claim it again.
    pub fn predecessors(&self) -> &'static [ContentStatus] {
        match self {
            ContentStatus::WaitingForVideo => &[],
            ContentStatus::Queued => &[ContentStatus::WaitingForVideo],
            ContentStatus::Processing => &[ContentStatus::Queued, ContentStatus::Processing],
            ContentStatus::Completed => &[ContentStatus::Processing],
        }
    }

    pub fn can_advance_to(&self, next: ContentStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_for_video" => Ok(ContentStatus::WaitingForVideo),
            "queued" => Ok(ContentStatus::Queued),
            "processing" => Ok(ContentStatus::Processing),
            "completed" => Ok(ContentStatus::Completed),
            other => Err(format!("unknown content status '{}'", other)),
        }
    }
}

/// One published rendition. The key itself lives elsewhere; `key_ref` only
/// names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResolutionArtifact {
    pub quality: String,
    /// Encode attempt that wrote the objects. Part of every storage path, so
    /// a re-encode never reuses a segment name.
    pub rendition_id: Uuid,
    pub width: u32,
    pub height: u32,
    pub manifest_ref: String,
    pub key_ref: String,
    pub segment_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContentRecord {
    pub id: Uuid,
    pub title: String,
    pub status: ContentStatus,
    /// Ordered as the resolution ladder that produced them.
    pub resolutions: Vec<ResolutionArtifact>,
    /// Set when processing failed permanently and someone has to look.
    pub needs_attention: bool,
    pub last_error: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ContentRecord {
    pub fn new(title: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            status: ContentStatus::WaitingForVideo,
            resolutions: Vec::new(),
            needs_attention: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn resolution(&self, quality: &str) -> Option<&ResolutionArtifact> {
        self.resolutions.iter().find(|r| r.quality == quality)
    }
}

/// Object-storage prefix of everything one encode attempt wrote for a content.
pub fn attempt_prefix(content_id: Uuid, rendition_id: Uuid) -> String {
    format!("hls/{}/{}/", content_id, rendition_id)
}

/// Object-storage prefix of one rendition's manifest and segments.
pub fn rendition_prefix(content_id: Uuid, rendition_id: Uuid, quality: &str) -> String {
    format!("{}{}/", attempt_prefix(content_id, rendition_id), quality)
}

/// Prefix of one attempt's keys in the key bucket.
pub fn attempt_key_prefix(content_id: Uuid, rendition_id: Uuid) -> String {
    format!("keys/{}/{}/", content_id, rendition_id)
}

/// Location of a rendition's key in the key bucket, which never holds
/// manifests or segments.
pub fn key_ref(content_id: Uuid, rendition_id: Uuid, quality: &str) -> String {
    format!("{}{}.key", attempt_key_prefix(content_id, rendition_id), quality)
}

/// Replaces artifacts with the same quality and appends new ones, so
/// re-running a rendition overwrites rather than duplicates it.
pub fn merge_artifacts(existing: &mut Vec<ResolutionArtifact>, incoming: &[ResolutionArtifact]) {
    for artifact in incoming {
        match existing.iter_mut().find(|a| a.quality == artifact.quality) {
            Some(slot) => *slot = artifact.clone(),
            None => existing.push(artifact.clone()),
        }
    }
}
