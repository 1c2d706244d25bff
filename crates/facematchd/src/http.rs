//! HTTP endpoints for the face service using axum.
//!
//! Endpoints:
//! - GET  /                 - upload form
//! - POST /register/        - add a named reference image to the gallery
//! - POST /compare/         - compare faces against the gallery or a second image
//! - GET  /static/temp/:file - persisted uploads, crops and gallery copies
//! - GET  /gallery          - registered identities
//! - GET  /health           - health check

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use facematch_core::service::{CompareResponse, RegisterResponse};
use facematch_core::uploads::StorageError;
use facematch_core::{FaceService, ServiceError, UploadedFile};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FaceService>,
}

/// Build the axum router with all endpoints.
///
/// Temp files are served under the upload store's URL prefix, so the URLs
/// handed out in responses always resolve against this router.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let temp_route = format!("{}/:file", state.service.uploads().url_prefix());

    Router::new()
        .route("/", get(index))
        .route("/register/", post(register))
        .route("/compare/", post(compare))
        .route(&temp_route, get(temp_file))
        .route("/gallery", get(gallery))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Request helpers ─────────────────────────────────────────────────

/// Text fields and file parts of a multipart form, keyed by field name.
#[derive(Default)]
struct Form {
    text: HashMap<String, String>,
    files: HashMap<String, UploadedFile>,
}

async fn read_form(mut multipart: Multipart) -> Result<Form, ApiError> {
    let mut form = Form::default();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match field.file_name().map(str::to_owned) {
            Some(file_name) => {
                let bytes = field.bytes().await?;
                // Browsers send an empty part for an untouched file input.
                if file_name.is_empty() {
                    continue;
                }
                form.files.insert(
                    name,
                    UploadedFile {
                        file_name,
                        bytes: bytes.to_vec(),
                    },
                );
            }
            None => {
                let value = field.text().await?;
                form.text.insert(name, value);
            }
        }
    }

    Ok(form)
}

/// Run blocking service work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ServiceError::Worker(e.to_string()))?;
    Ok(result?)
}

// ── Handlers ────────────────────────────────────────────────────────

async fn compare(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<CompareResponse>, ApiError> {
    let mut form = read_form(multipart).await?;
    let mode = form.text.remove("mode").unwrap_or_default();
    let file1 = form.files.remove("file1");
    let file2 = form.files.remove("file2");

    let service = state.service.clone();
    let response = blocking(move || service.compare(mode.trim(), file1, file2)).await?;

    tracing::info!(
        mode = ?response.mode,
        faces = response.faces.len(),
        matched = response.faces.iter().filter(|f| f.matched).count(),
        "compare finished"
    );
    Ok(Json(response))
}

async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<RegisterResponse>, ApiError> {
    let mut form = read_form(multipart).await?;
    let name = form.text.remove("name").unwrap_or_default();
    let file = form.files.remove("file");

    let service = state.service.clone();
    let response = blocking(move || service.register(&name, file)).await?;

    tracing::info!(name = %response.name, "identity registered");
    Ok(Json(response))
}

async fn temp_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    let path = state
        .service
        .uploads()
        .resolve(&file)
        .ok_or(ApiError::NotFound)?;

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => return Err(ServiceError::Storage(StorageError::from(e)).into()),
    };

    // Stored files all carry .jpg; the bytes may be any accepted format.
    let mime = image::guess_format(&bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");

    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

#[derive(Serialize)]
struct GalleryItem {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    registered_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct GalleryResponse {
    count: usize,
    faces: Vec<GalleryItem>,
}

async fn gallery(State(state): State<AppState>) -> Result<Json<GalleryResponse>, ApiError> {
    let service = state.service.clone();
    let faces = blocking(move || {
        let entries = service.gallery().entries()?;
        Ok(entries
            .into_iter()
            .map(|entry| GalleryItem {
                registered_at: std::fs::metadata(&entry.path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from),
                name: entry.name,
            })
            .collect::<Vec<_>>())
    })
    .await?;

    Ok(Json(GalleryResponse {
        count: faces.len(),
        faces,
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>facematch</title></head>
<body style="font-family:sans-serif;max-width:40em;margin:2em auto">
<h1>facematch</h1>

<h2>Register a face</h2>
<form action="/register/" method="post" enctype="multipart/form-data">
  <p><label>Name <input type="text" name="name" required></label></p>
  <p><input type="file" name="file" accept="image/*" required></p>
  <p><button type="submit">Register</button></p>
</form>

<h2>Compare</h2>
<form action="/compare/" method="post" enctype="multipart/form-data">
  <p>
    <label><input type="radio" name="mode" value="db" checked> Against known faces</label>
    <label><input type="radio" name="mode" value="upload"> Against a second image</label>
  </p>
  <p><label>Image <input type="file" name="file1" accept="image/*" required></label></p>
  <p><label>Second image <input type="file" name="file2" accept="image/*"></label></p>
  <p><button type="submit">Compare</button></p>
</form>

<p><a href="/gallery">Known faces</a> &middot; <a href="/health">Health</a></p>
</body></html>"#;
