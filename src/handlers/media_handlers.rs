//! HTTP handlers for media operations.
//! Upload and download bodies are streamed; nothing is buffered here.

use super::AppState;
use crate::{
    errors::AppError,
    models::{FileObject, Media, MediaType, ProviderKind},
    providers::{ByteStream, signing::SignatureError},
    services::{ServiceError, UploadRequest},
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::{io, time::Duration};
use tracing::debug;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity taken from the `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing x-user-id header"))?;
        raw.to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(AuthenticatedUser)
            .ok_or_else(|| AppError::unauthorized("x-user-id must be a UUID"))
    }
}

/// Query params accepted by `POST /media`.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: String,
    pub provider: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignedUrlQuery {
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SignedFileQuery {
    pub expires: i64,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct SignedUrlResponse {
    pub media_id: Uuid,
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub object: FileObject,
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_provider(raw: Option<&str>) -> Result<Option<ProviderKind>, AppError> {
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<ProviderKind>())
        .transpose()
        .map_err(|err| AppError::bad_request(err.to_string()))
}

fn parse_media_type(raw: Option<&str>) -> Result<Option<MediaType>, AppError> {
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<MediaType>())
        .transpose()
        .map_err(AppError::bad_request)
}

/// POST `/media?name=&provider=&media_type=` with the raw file as body.
pub async fn upload_media(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let declared_size = header_str(&headers, header::CONTENT_LENGTH)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| AppError::bad_request("invalid content-length"))
        })
        .transpose()?;

    let request = UploadRequest {
        user_id,
        file_name: q.name,
        declared_size,
        content_type: header_str(&headers, header::CONTENT_TYPE).map(str::to_string),
        provider: parse_provider(q.provider.as_deref())?,
        media_type: parse_media_type(q.media_type.as_deref())?,
    };

    let stream: ByteStream = Box::pin(body.into_data_stream().map_err(io::Error::other));

    let media = state.media.upload_file(request, stream).await?;
    Ok((StatusCode::CREATED, Json(media)))
}

/// GET `/media`: live media of the caller, newest first.
pub async fn list_media(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<Vec<Media>>, AppError> {
    Ok(Json(state.media.list_media(user_id).await?))
}

/// GET `/media/{id}`
pub async fn get_media(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Media>, AppError> {
    Ok(Json(state.media.get_media(user_id, id).await?))
}

/// GET `/media/{id}/content` as a streaming response.
pub async fn download_media(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (media, stream, object) = state.media.download(user_id, id).await?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &object);
    if let Ok(value) = HeaderValue::from_str(&format!(
        "inline; filename=\"{}\"",
        media.file_name.replace(['"', '\\'], "_")
    )) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// GET `/media/{id}/signed-url?expires_in=` (seconds).
pub async fn signed_url(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Query(q): Query<SignedUrlQuery>,
) -> Result<Json<SignedUrlResponse>, AppError> {
    let expires_in = q
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(state.default_signed_url_expiry);

    let object = state.media.get_signed_url(user_id, id, expires_in).await?;
    let expires_at = Utc::now()
        + chrono::Duration::from_std(expires_in).map_err(|_| AppError::internal())?;

    Ok(Json(SignedUrlResponse {
        media_id: id,
        url: object.signed_url.clone().unwrap_or_default(),
        expires_at,
        object,
    }))
}

/// DELETE `/media/{id}`
pub async fn delete_media(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.media.delete_media(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/files/{*key}?expires=&signature=`
///
/// Serves local objects through links signed by the local provider.
pub async fn serve_signed_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedFileQuery>,
) -> Result<Response, AppError> {
    let signer = state
        .local_signer
        .as_ref()
        .ok_or_else(|| AppError::not_found("no local provider configured"))?;

    signer
        .verify(&key, q.expires, &q.signature, Utc::now().timestamp())
        .map_err(|err| {
            debug!(%key, "rejected signed link: {}", err);
            match err {
                SignatureError::Expired => AppError::forbidden("signed URL has expired"),
                SignatureError::Invalid => AppError::forbidden("invalid signature"),
            }
        })?;

    let provider = state.registry.get(ProviderKind::Local).await?;
    let (stream, object) = provider
        .download(&key)
        .await
        .map_err(ServiceError::from)?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, object: &FileObject) {
    if let Ok(value) = HeaderValue::from_str(&object.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size));
    if !object.etag.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&object.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
