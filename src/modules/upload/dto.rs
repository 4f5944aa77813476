use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use super::model::{UploadSession, UploadState};

/// Multipart body of a chunk upload. Only here for the API docs; the
/// handler reads the fields one by one.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct ChunkUploadForm {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Required on the first chunk unless `content_id` is given.
    pub content_title: Option<String>,
    pub content_id: Option<Uuid>,
    #[schema(value_type = String, format = Binary)]
    pub chunk: Vec<u8>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub content_id: Uuid,
    pub title: String,
    pub state: UploadState,
    pub chunks_received: u32,
    pub chunks_total: u32,
    pub missing_chunks: Vec<u32>,
    pub job_id: Option<Uuid>,
    pub last_error: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<UploadSession> for UploadStatusResponse {
    fn from(session: UploadSession) -> Self {
        Self {
            missing_chunks: session.missing(),
            chunks_received: session.chunks_received(),
            job_id: (session.state == UploadState::Finalized).then_some(session.job_id),
            upload_id: session.upload_id,
            content_id: session.content_id,
            title: session.title,
            state: session.state,
            chunks_total: session.total_chunks,
            last_error: session.last_error,
            created_at: session.created_at,
        }
    }
}
