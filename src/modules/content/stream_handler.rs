use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use crate::modules::content::model::{rendition_prefix, ContentStatus};
use crate::state::AppState;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Manifests and encrypted segments only. Keys are never served from here.
fn media_type(file: &str) -> Option<&'static str> {
    let valid_name = !file.starts_with('.')
        && file.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid_name {
        return None;
    }

    match file.rsplit_once('.')?.1 {
        "m3u8" => Some("application/vnd.apple.mpegurl"),
        "ts" => Some("video/mp2t"),
        _ => None,
    }
}

/// Stream a rendition's manifest or segment, with Range support
/// Proxies the object from S3/MinIO. Segments are encrypted, so this route
/// needs no session; the key fetch is what is guarded. Only the currently
/// published `rendition_id` resolves, which is what makes the long segment
/// cache lifetime safe across re-encodes.
#[utoipa::path(
    get,
    path = "/api/v1/stream/{content_id}/{rendition_id}/{quality}/{file}",
    params(
        ("content_id" = Uuid, Path, description = "Content ID"),
        ("rendition_id" = Uuid, Path, description = "Encode that produced the rendition"),
        ("quality" = String, Path, description = "Quality label"),
        ("file" = String, Path, description = "index.m3u8 or a segment name")
    ),
    responses(
        (status = 200, description = "Stream Content"),
        (status = 206, description = "Partial Content"),
        (status = 404, description = "Not Found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Playback"
)]
pub async fn stream_rendition(
    State(state): State<AppState>,
    Path((content_id, rendition_id, quality, file)): Path<(Uuid, Uuid, String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(content_type) = media_type(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // 1. Only published renditions are streamable
    let record = match state.contents.get(content_id).await {
        Ok(r) => r,
        Err(crate::modules::content::repository::ContentError::NotFound(_)) => {
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            tracing::error!("Database Error: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let published = record.status == ContentStatus::Completed
        && record.resolution(&quality).is_some_and(|a| a.rendition_id == rendition_id);
    if !published {
        return StatusCode::NOT_FOUND.into_response();
    }

    // 2. Forward the Range header as-is
    let range_header = headers.get(header::RANGE)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let key = format!("{}{}", rendition_prefix(content_id, rendition_id, &quality), file);

    let resp = match state.storage.get_object_stream(&key, range_header).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("S3 Error: {}", e);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    // 3. Build Response
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CACHE_CONTROL,
            if content_type == "video/mp2t" { "public, max-age=31536000, immutable" } else { "public, max-age=60" },
        );

    if let Some(cl) = resp.content_length() {
        builder = builder.header(header::CONTENT_LENGTH, cl);
    }

    if let Some(cr) = resp.content_range() {
        builder = builder.header(header::CONTENT_RANGE, cr).status(StatusCode::PARTIAL_CONTENT);
    } else {
        builder = builder.header(header::ACCEPT_RANGES, "bytes").status(StatusCode::OK);
    }

    if let Some(et) = resp.e_tag() {
        builder = builder.header(header::ETAG, et);
    }

    let stream = ReaderStream::new(resp.body.into_async_read());

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::media_type;

    #[test]
    fn only_manifests_and_segments_are_served() {
        assert_eq!(media_type("index.m3u8"), Some("application/vnd.apple.mpegurl"));
        assert_eq!(media_type("seg_00003.ts"), Some("video/mp2t"));
        assert_eq!(media_type("720p.key"), None);
        assert_eq!(media_type("..ts"), None);
        assert_eq!(media_type("a/b.ts"), None);
        assert_eq!(media_type("noext"), None);
    }
}
