use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::model::ContentRecord;
use super::service::Teardown;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateContentRequest {
    #[validate(length(min = 1, max = 255, message = "Title must be 1-255 characters"))]
    pub title: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TeardownResponse {
    pub content_id: Uuid,
    pub cancelled_jobs: Vec<Uuid>,
    pub removed_objects: usize,
}

impl TeardownResponse {
    pub fn new(content_id: Uuid, teardown: Teardown) -> Self {
        Self {
            content_id,
            cancelled_jobs: teardown.cancelled_jobs,
            removed_objects: teardown.removed_objects,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetResponse {
    pub content: ContentRecord,
    pub cancelled_jobs: Vec<Uuid>,
    pub removed_objects: usize,
}
