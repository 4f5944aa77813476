use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Still taking chunks, or waiting for a finalize retry.
    Receiving,
    /// Exactly one caller is assembling the source.
    Finalizing,
    /// Job created and fragments released. Kept until expiry so late
    /// redeliveries are recognised.
    Finalized,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Receiving => "receiving",
            UploadState::Finalizing => "finalizing",
            UploadState::Finalized => "finalized",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receiving" => Ok(UploadState::Receiving),
            "finalizing" => Ok(UploadState::Finalizing),
            "finalized" => Ok(UploadState::Finalized),
            other => Err(format!("unknown upload state '{}'", other)),
        }
    }
}

/// What the first chunk of an upload establishes. The content and job ids
/// are fixed here so that a finalize retried after a crash targets the same
/// record and job instead of creating new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInit {
    pub upload_id: String,
    pub title: String,
    pub content_id: Uuid,
    pub job_id: Uuid,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub title: String,
    pub content_id: Uuid,
    pub job_id: Uuid,
    pub total_chunks: u32,
    pub received: BTreeSet<u32>,
    pub state: UploadState,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub finalize_started_at: Option<OffsetDateTime>,
}

impl UploadSession {
    pub fn new(init: &SessionInit, now: OffsetDateTime) -> Self {
        Self {
            upload_id: init.upload_id.clone(),
            title: init.title.clone(),
            content_id: init.content_id,
            job_id: init.job_id,
            total_chunks: init.total_chunks,
            received: BTreeSet::new(),
            state: UploadState::Receiving,
            last_error: None,
            created_at: now,
            finalize_started_at: None,
        }
    }

    pub fn chunks_received(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_received() == self.total_chunks
    }

    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// Fragment keys in index order, which is the assembly order.
    pub fn fragment_keys(&self) -> Vec<String> {
        (0..self.total_chunks)
            .map(|i| fragment_key(&self.upload_id, i))
            .collect()
    }

    pub fn source_key(&self) -> String {
        format!("sources/{}/{}.src", self.content_id, self.upload_id)
    }
}

/// Result of recording one chunk in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMark {
    pub received: u32,
    pub total: u32,
    pub state: UploadState,
    /// True for the single caller that moved the session into `finalizing`.
    pub claimed_finalize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChunkReceipt {
    pub accepted: bool,
    pub chunks_received: u32,
    pub chunks_total: u32,
    pub state: UploadState,
    pub content_id: Uuid,
    /// Present once the upload has been turned into a job.
    pub job_id: Option<Uuid>,
}

pub fn fragment_prefix(upload_id: &str) -> String {
    format!("uploads/{}/", upload_id)
}

pub fn fragment_key(upload_id: &str, index: u32) -> String {
    format!("{}{:06}", fragment_prefix(upload_id), index)
}

/// Upload ids end up in object keys and Redis keys.
pub fn is_valid_upload_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
