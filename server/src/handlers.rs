#![allow(clippy::unused_async)]
use std::io;
use std::path::Path as FsPath;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use kernel::{ErrorBody, StoredAsset, UploadReceipt};
use tokio_util::io::StreamReader;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::domain::Storage;
use crate::reply::ErrorReply;
use crate::sqlite::{Mode, Sqlite};
use crate::uploader::UploadRequest;
use crate::{ApiDoc, AppState};

/// Uploads a single file into a container.
#[utoipa::path(
    post,
    path = "/api/assets/{owner_id}/{container_id}/{file_name}",
    tag = "assets",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "Asset stored on the critical disks", body = UploadReceipt),
        (status = 200, description = "Owner already has the same content", body = UploadReceipt),
        (status = 400, description = "Invalid input or unreadable body", body = ErrorBody),
        (status = 413, description = "Body exceeds the size ceiling"),
        (status = 500, description = "Storage or commit failure", body = ErrorBody)
    ),
    params(
        ("owner_id" = i64, Path, description = "Owner of the asset"),
        ("container_id" = i64, Path, description = "Container the asset belongs to"),
        ("file_name" = String, Path, description = "Original file name, used as an extension hint")
    ),
)]
pub async fn upload_asset(
    Path((owner_id, container_id, file_name)): Path<(i64, i64, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let request = UploadRequest {
        owner_id,
        container_id,
        file_name: Some(file_name),
        declared_extension: None,
        declared_mime: header_value(&headers, header::CONTENT_TYPE),
        declared_size: header_value(&headers, header::CONTENT_LENGTH).and_then(|v| v.parse().ok()),
    };
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));

    // a dropped connection must not cancel the transaction halfway
    let uploader = state.uploader.clone();
    let task = tokio::spawn(async move { uploader.upload(request, reader).await });

    match task.await {
        Ok(Ok(receipt)) => {
            let status = if receipt.deduplicated {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(receipt)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("upload into container {container_id} failed: {e}");
            ErrorReply::from(&e).into_response()
        }
        Err(e) => {
            tracing::error!("upload task failed: {e}");
            ErrorReply::internal(&e).into_response()
        }
    }
}

/// Gets stored asset metadata.
#[utoipa::path(
    get,
    path = "/api/assets/{id}",
    tag = "assets",
    responses(
        (status = 200, description = "Stored asset", body = StoredAsset),
        (status = 404, description = "Asset not found or not stored", body = ErrorBody),
        (status = 500, description = "Server error", body = ErrorBody)
    ),
    params(
        ("id" = Uuid, Path, description = "Asset id")
    ),
)]
pub async fn get_asset(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    let result = execute(&state.db, move |mut store| store.get_asset(id));
    match result {
        Ok(Some(asset)) => Json(asset).into_response(),
        Ok(None) => ErrorReply::not_found(format!("asset {id}")).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Gets all stored assets of a container.
#[utoipa::path(
    get,
    path = "/api/containers/{container_id}",
    tag = "containers",
    responses(
        (status = 200, description = "Stored assets in upload order", body = [StoredAsset]),
        (status = 404, description = "Container has no stored assets", body = ErrorBody),
        (status = 500, description = "Server error", body = ErrorBody)
    ),
    params(
        ("container_id" = i64, Path, description = "Container id")
    ),
)]
pub async fn get_container_assets(
    Path(container_id): Path<i64>,
    State(state): State<AppState>,
) -> Response {
    if let Some(assets) = state.cache.get(container_id) {
        tracing::debug!("container {container_id} listing served from cache");
        return Json(assets).into_response();
    }
    let generation = state.cache.generation(container_id);
    let result = execute(&state.db, move |mut store| {
        store.get_container_assets(container_id)
    });
    match result {
        Ok(assets) if assets.is_empty() => {
            ErrorReply::not_found(format!("container {container_id}")).into_response()
        }
        Ok(assets) => {
            state.cache.put(container_id, generation, assets.clone());
            Json(assets).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

fn execute<F, R>(db: &FsPath, action: F) -> Result<R, ErrorReply>
where
    F: FnOnce(Sqlite) -> Result<R, rusqlite::Error>,
{
    let start = Instant::now();
    let store = Sqlite::open(db, Mode::ReadOnly).map_err(|e| {
        tracing::error!("{e}");
        ErrorReply::internal(&e)
    })?;
    let result = action(store);
    tracing::info!("DB query time: {:?}", start.elapsed());
    result.map_err(|e| {
        tracing::error!("{e}");
        ErrorReply::internal(&e)
    })
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}
