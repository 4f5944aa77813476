use utoipa::OpenApi;
use crate::modules::content::dto::*;
use crate::modules::content::model::*;
use crate::modules::jobs::model::*;
use crate::modules::playback::dto::*;
use crate::modules::playback::model::*;
use crate::modules::upload::dto::*;
use crate::modules::upload::model::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::content::handler::create_content,
        crate::modules::content::handler::list_contents,
        crate::modules::content::handler::get_content,
        crate::modules::content::handler::delete_content,
        crate::modules::content::handler::reset_content,
        crate::modules::content::stream_handler::stream_rendition,
        crate::modules::upload::handler::upload_chunk,
        crate::modules::upload::handler::upload_status,
        crate::modules::upload::handler::finalize_upload,
        crate::modules::jobs::handler::list_jobs,
        crate::modules::jobs::handler::get_job,
        crate::modules::jobs::handler::retry_job,
        crate::modules::playback::handler::start_session,
        crate::modules::playback::handler::list_sessions,
        crate::modules::playback::handler::stop_session,
        crate::modules::playback::handler::resolve_key,
        crate::modules::playback::handler::fetch_key,
    ),
    components(
        schemas(
            CreateContentRequest, TeardownResponse, ResetResponse,
            ContentRecord, ContentStatus, ResolutionArtifact,
            ChunkUploadForm, UploadStatusResponse, UploadState, ChunkReceipt,
            Job, JobState, JobPayload, EncodePayload, LadderRung, OperatorAlert,
            StartSessionRequest, SessionResponse, SessionListResponse, DenialResponse,
            DeviceSession, DenialReason, KeyGrant,
        )
    ),
    tags(
        (name = "Content", description = "Content records and segment delivery"),
        (name = "Upload", description = "Chunked video upload"),
        (name = "Jobs", description = "Encode job administration"),
        (name = "Playback", description = "Device sessions and key distribution")
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

use utoipa::Modify;
use utoipa::openapi::security::{SecurityScheme, HttpAuthScheme, HttpBuilder};

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
