use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use super::auth::{auth_middleware, token_handler};
use super::models::TagsListResponse;
use crate::error::{AppError, Result};
use crate::state::{RecordedRequest, RegistryState};

// Type alias for our application state
pub type AppState = Arc<RegistryState>;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// A route under `/v2/`. Repository names contain `/`, so paths are split by
/// hand instead of through the router.
#[derive(Debug, PartialEq, Eq)]
pub enum Endpoint<'a> {
    Version,
    Tags(&'a str),
    Manifest(&'a str, &'a str),
    Blob(&'a str, &'a str),
    Upload(&'a str, Option<&'a str>),
}

pub fn parse_path(path: &str) -> Option<Endpoint<'_>> {
    let rest = path.strip_prefix("/v2/")?;
    if rest.is_empty() {
        return Some(Endpoint::Version);
    }
    if let Some(name) = rest.strip_suffix("/tags/list") {
        return Some(Endpoint::Tags(name));
    }

    let endpoint = if let Some((name, uuid)) = split_at(rest, "/blobs/uploads/") {
        Endpoint::Upload(name, Some(uuid).filter(|u| !u.is_empty()))
    } else if let Some((name, reference)) = split_at(rest, "/manifests/") {
        Endpoint::Manifest(name, reference)
    } else if let Some((name, digest)) = split_at(rest, "/blobs/") {
        Endpoint::Blob(name, digest)
    } else {
        return None;
    };

    match &endpoint {
        Endpoint::Manifest(name, tail) | Endpoint::Blob(name, tail)
            if name.is_empty() || tail.is_empty() =>
        {
            None
        }
        Endpoint::Upload(name, _) if name.is_empty() => None,
        _ => Some(endpoint),
    }
}

fn split_at<'a>(path: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    path.rfind(marker).map(|i| (&path[..i], &path[i + marker.len()..]))
}

// Create the main router for the registry API
pub fn registry_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", any(dispatch))
        .route("/v2/{*path}", any(dispatch))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .route("/token", get(token_handler))
        .layer(middleware::from_fn_with_state(state.clone(), record_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn record_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let response = next.run(request).await;
    state.record(RecordedRequest {
        method,
        path,
        query,
        status: response.status().as_u16(),
    });
    response
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response> {
    let endpoint = parse_path(uri.path())
        .ok_or_else(|| AppError::BadRequest(format!("unknown route {}", uri.path())))?;

    match (method, endpoint) {
        (Method::GET, Endpoint::Version) => Ok(api_version_check()),
        (Method::GET, Endpoint::Tags(name)) => list_tags(&state, name),
        (Method::GET, Endpoint::Manifest(name, reference)) => {
            get_manifest(&state, name, reference, true)
        }
        (Method::HEAD, Endpoint::Manifest(name, reference)) => {
            get_manifest(&state, name, reference, false)
        }
        (Method::PUT, Endpoint::Manifest(name, reference)) => {
            put_manifest(&state, name, reference, &headers, body)
        }
        (Method::DELETE, Endpoint::Manifest(name, reference)) => {
            delete_manifest(&state, name, reference)
        }
        (Method::GET, Endpoint::Blob(name, digest)) => get_blob(&state, name, digest, true),
        (Method::HEAD, Endpoint::Blob(name, digest)) => get_blob(&state, name, digest, false),
        (Method::POST, Endpoint::Upload(name, None)) => start_upload(&state, name, &params),
        (Method::PATCH, Endpoint::Upload(name, Some(uuid))) => {
            upload_chunk(&state, name, uuid, &headers, body)
        }
        (Method::PUT, Endpoint::Upload(name, Some(uuid))) => {
            complete_upload(&state, name, uuid, &params, body)
        }
        (Method::DELETE, Endpoint::Upload(_, Some(uuid))) => cancel_upload(&state, uuid),
        (method, endpoint) => {
            warn!(%method, ?endpoint, "unsupported operation");
            Ok(StatusCode::METHOD_NOT_ALLOWED.into_response())
        }
    }
}

fn api_version_check() -> Response {
    (StatusCode::OK, [("Docker-Distribution-API-Version", "registry/2.0")]).into_response()
}

#[instrument(skip(state))]
fn list_tags(state: &AppState, name: &str) -> Result<Response> {
    let tags = state.storage.list_tags(name);
    info!("Found {} tags for repository: {}", tags.len(), name);
    Ok(Json(TagsListResponse {
        name: name.to_string(),
        tags,
    })
    .into_response())
}

#[instrument(skip(state))]
fn get_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    with_body: bool,
) -> Result<Response> {
    let stored = state
        .storage
        .get_manifest(name, reference)
        .ok_or_else(|| AppError::ManifestUnknown(format!("{}:{}", name, reference)))?;

    let headers = [
        (header::CONTENT_TYPE.as_str(), stored.media_type.clone()),
        (header::CONTENT_LENGTH.as_str(), stored.content.len().to_string()),
        (DOCKER_CONTENT_DIGEST, stored.digest.clone()),
    ];
    let body = if with_body { Body::from(stored.content) } else { Body::empty() };
    Ok((StatusCode::OK, headers, body).into_response())
}

#[instrument(skip(state, headers, body), fields(size = body.len()))]
fn put_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let digest = state.storage.put_manifest(name, reference, media_type, body)?;
    info!("Stored manifest: {}/{}, digest: {}", name, reference, digest);

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION.as_str(), format!("/v2/{}/manifests/{}", name, digest)),
            (DOCKER_CONTENT_DIGEST, digest),
        ],
    )
        .into_response())
}

#[instrument(skip(state))]
fn delete_manifest(state: &AppState, name: &str, reference: &str) -> Result<Response> {
    if !state.storage.delete_manifest(name, reference) {
        return Err(AppError::ManifestUnknown(format!("{}@{}", name, reference)));
    }
    Ok(StatusCode::ACCEPTED.into_response())
}

#[instrument(skip(state))]
fn get_blob(state: &AppState, name: &str, digest: &str, with_body: bool) -> Result<Response> {
    let content = state
        .storage
        .get_blob(name, digest)
        .ok_or_else(|| AppError::BlobUnknown(digest.to_string()))?;

    let headers = [
        (header::CONTENT_TYPE.as_str(), "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH.as_str(), content.len().to_string()),
        (DOCKER_CONTENT_DIGEST, digest.to_string()),
    ];
    let body = if with_body { Body::from(content) } else { Body::empty() };
    Ok((StatusCode::OK, headers, body).into_response())
}

#[instrument(skip(state, params))]
fn start_upload(
    state: &AppState,
    name: &str,
    params: &HashMap<String, String>,
) -> Result<Response> {
    if let (Some(digest), Some(from)) = (params.get("mount"), params.get("from")) {
        if state.storage.mount_blob(name, digest, from) {
            info!("Mounted {} from {} into {}", digest, from, name);
            return Ok((
                StatusCode::CREATED,
                [
                    (header::LOCATION.as_str(), format!("/v2/{}/blobs/{}", name, digest)),
                    (DOCKER_CONTENT_DIGEST, digest.clone()),
                ],
            )
                .into_response());
        }
    }

    let uuid = state.storage.start_upload(name);
    info!("Upload started: {}, uuid: {}", name, uuid);
    Ok(upload_accepted(name, &uuid, 0))
}

#[instrument(skip(state, headers, body), fields(size = body.len()))]
fn upload_chunk(
    state: &AppState,
    name: &str,
    uuid: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let start = match headers.get(header::CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        Some(range) => Some(parse_range_start(range)?),
        None => None,
    };
    let size = state.storage.append_upload(name, uuid, start, &body)?;
    Ok(upload_accepted(name, uuid, size))
}

#[instrument(skip(state, params, body), fields(size = body.len()))]
fn complete_upload(
    state: &AppState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response> {
    let digest = params
        .get("digest")
        .ok_or_else(|| AppError::BadRequest("Missing digest parameter".to_string()))?;

    if state.upload_fails(digest) {
        state.storage.cancel_upload(uuid);
        return Err(AppError::Internal(format!("injected failure for {}", digest)));
    }

    state.storage.complete_upload(name, uuid, digest, &body)?;
    info!("Completed upload: {}/{}, uuid: {}", name, digest, uuid);

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION.as_str(), format!("/v2/{}/blobs/{}", name, digest)),
            (DOCKER_CONTENT_DIGEST, digest.clone()),
        ],
    )
        .into_response())
}

fn cancel_upload(state: &AppState, uuid: &str) -> Result<Response> {
    if !state.storage.cancel_upload(uuid) {
        return Err(AppError::UploadUnknown(uuid.to_string()));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn upload_accepted(name: &str, uuid: &str, size: u64) -> Response {
    let range = format!("0-{}", size.saturating_sub(1));
    (
        StatusCode::ACCEPTED,
        [
            (header::LOCATION.as_str(), format!("/v2/{}/blobs/uploads/{}", name, uuid)),
            (header::RANGE.as_str(), range),
            ("Docker-Upload-UUID", uuid.to_string()),
        ],
    )
        .into_response()
}

fn parse_range_start(range: &str) -> Result<u64> {
    range
        .trim()
        .trim_start_matches("bytes ")
        .split('-')
        .next()
        .and_then(|start| start.parse().ok())
        .ok_or_else(|| AppError::RangeInvalid(range.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_nested_repository_names() {
        assert_eq!(parse_path("/v2/"), Some(Endpoint::Version));
        assert_eq!(
            parse_path("/v2/library/nginx/manifests/latest"),
            Some(Endpoint::Manifest("library/nginx", "latest"))
        );
        assert_eq!(
            parse_path("/v2/a/b/blobs/sha256:00"),
            Some(Endpoint::Blob("a/b", "sha256:00"))
        );
        assert_eq!(parse_path("/v2/a/blobs/uploads/"), Some(Endpoint::Upload("a", None)));
        assert_eq!(
            parse_path("/v2/a/blobs/uploads/123"),
            Some(Endpoint::Upload("a", Some("123")))
        );
        assert_eq!(parse_path("/v2/a/tags/list"), Some(Endpoint::Tags("a")));
        assert_eq!(parse_path("/v2//manifests/x"), None);
        assert_eq!(parse_path("/v3/"), None);
    }

    #[test]
    fn range_start_accepts_both_forms() {
        assert_eq!(parse_range_start("0-99").unwrap(), 0);
        assert_eq!(parse_range_start("bytes 100-199").unwrap(), 100);
        assert!(parse_range_start("x-1").is_err());
    }
}
