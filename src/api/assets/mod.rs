use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use crate::{
    error::{AppError, AppResult},
    server::AppState,
    store::{Blob, DEFAULT_CONTENT_TYPE, asset_key},
};

/// RFC 7231 IMF-fixdate, as used by `Last-Modified`.
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// GET /assets/{id}
pub async fn get_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let blob = state
        .blobs
        .get(&asset_key(&id))
        .await?
        .ok_or_else(|| AppError::NotFound("Object Not Found".to_string()))?;

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&blob.metadata.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", blob.metadata.etag)) {
        headers.insert(header::ETAG, etag);
    }
    if let Ok(modified) = HeaderValue::from_str(&http_date(blob.metadata.uploaded)) {
        headers.insert(header::LAST_MODIFIED, modified);
    }

    Ok((headers, blob.data).into_response())
}

/// POST /assets/{id}
pub async fn put_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<&'static str> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let size = body.len();

    state
        .blobs
        .put(&asset_key(&id), Blob::new(body.to_vec(), content_type))
        .await
        .map_err(|e| {
            tracing::warn!(asset_id = %id, error = %e, "Asset upload failed");
            AppError::from(e)
        })?;

    tracing::debug!(asset_id = %id, size, %content_type, "Stored asset");
    Ok("OK")
}
