//! HTTP handlers for image upload, fetch/resize, and listing.
//! Thin glue over `ImageService`; all image logic lives there.

use crate::{
    AppState,
    errors::AppError,
    middleware::auth::{self, Claims},
    models::image::{
        ImageSummary, ListImagesResponse, UploadImageRequest, UploadImageResponse,
    },
    services::image_service::ListImagesParams,
};
use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;

/// Derived variants and originals are immutable, so far-future caching is
/// safe (original behavior of the service).
const CACHE_CONTROL: &str = "public, max-age=2592000, stale-while-revalidate=1209600";

const DEFAULT_LIST_KEYS: usize = 100;

/// Resize parameters accepted by `GET /image/{project}/{key}`.
#[derive(Debug, Deserialize)]
pub struct ResizeQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Query params accepted by `GET /images`.
#[derive(Debug, Deserialize)]
pub struct ListImagesQuery {
    pub continuation_token: Option<String>,
    pub max_keys: Option<usize>,
}

/// `POST /image` — store a base64-encoded image.
///
/// The auth middleware has already verified the token; this handler enforces
/// the write allowlist before touching storage.
pub async fn upload_image(
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
    Json(req): Json<UploadImageRequest>,
) -> Result<Json<UploadImageResponse>, AppError> {
    if state.auth.is_some() {
        let Some(Extension(claims)) = claims else {
            return Err(AppError::new(StatusCode::UNAUTHORIZED, "Unauthorized"));
        };
        let allowlist = auth::load_allowlist(&state.config.allowlist_file).await?;
        auth::ensure_email_allowed(&claims, &allowlist)?;
    }

    let record = state.images.upload(&req.project, &req.key, &req.image).await?;

    Ok(Json(UploadImageResponse {
        url: state.images.public_url(&record.project, &record.key),
        width: record.width as u32,
        height: record.height as u32,
        size: record.size_bytes as u64,
    }))
}

/// `GET /image/{project}/{key}?width=&height=` — serve the original or a
/// lazily cached resized variant.
pub async fn get_image(
    State(state): State<AppState>,
    Path((project, key)): Path<(String, String)>,
    Query(q): Query<ResizeQuery>,
) -> Result<Response, AppError> {
    let fetched = state.images.fetch(&project, &key, q.width, q.height).await?;

    let mut response = Response::new(Body::from(fetched.bytes));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(fetched.format.mime()),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL),
    );
    Ok(response)
}

/// `GET /images` — page through stored originals.
pub async fn list_images(
    State(state): State<AppState>,
    Query(q): Query<ListImagesQuery>,
) -> Result<Json<ListImagesResponse>, AppError> {
    let after = q
        .continuation_token
        .as_deref()
        .map(decode_continuation_token)
        .transpose()?;

    let result = state
        .images
        .list(ListImagesParams {
            after,
            max_keys: q.max_keys.unwrap_or(DEFAULT_LIST_KEYS),
        })
        .await?;

    let images = result
        .records
        .into_iter()
        .map(|rec| ImageSummary {
            url: state.images.public_url(&rec.project, &rec.key),
            project: rec.project,
            key: rec.key,
            format: rec.format,
            width: rec.width as u32,
            height: rec.height as u32,
            size: rec.size_bytes as u64,
        })
        .collect();

    Ok(Json(ListImagesResponse {
        images,
        next_continuation_token: result
            .next
            .map(|(project, key)| encode_continuation_token(&project, &key)),
    }))
}

/// Opaque cursor: base64 of `project/key`. Keys cannot contain `/`, so the
/// first separator is unambiguous.
fn encode_continuation_token(project: &str, key: &str) -> String {
    general_purpose::STANDARD.encode(format!("{}/{}", project, key))
}

fn decode_continuation_token(token: &str) -> Result<(String, String), AppError> {
    let invalid = || AppError::new(StatusCode::BAD_REQUEST, "invalid continuation token");
    let decoded = general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(invalid)?;
    let (project, key) = decoded.split_once('/').ok_or_else(invalid)?;
    Ok((project.to_string(), key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_token_round_trips() {
        let token = encode_continuation_token("proj", "some-key");
        assert_eq!(
            decode_continuation_token(&token).unwrap(),
            ("proj".to_string(), "some-key".to_string())
        );
    }

    #[test]
    fn garbage_continuation_token_is_rejected() {
        assert!(decode_continuation_token("!!!not-base64!!!").is_err());
        // valid base64 but no separator
        let no_sep = general_purpose::STANDARD.encode("nosep");
        assert!(decode_continuation_token(&no_sep).is_err());
    }
}
