//! HTTP request handlers and shared application state.
//!
//! Each handler extracts path, query or body parameters and delegates to the
//! [`DocumentService`] components, returning an envelope or an [`ApiError`].

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::errors::ApiError;
use super::models::{
    data, DataEnvelope, DocumentMetadataView, HealthResponse, ListEnvelope, ListParams, VersionDeleted,
};
use crate::docs::registry::{Upload, VersionUpload};
use crate::docs::schema::{
    Document, DocumentMetadata, DocumentUpdate, IndexEntry, IndexKey, IndexSummary, Version, VersionUpdate,
};
use crate::docs::{DocumentService, SearchHit, SearchRequest};
use crate::error::{DeleteReport, DocError};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DocumentService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<DocumentService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Fields of a multipart upload.
#[derive(Debug, Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    filename: Option<String>,
    content: Vec<u8>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                form.filename = field.file_name().map(str::to_string);
                form.content = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?
                    .to_vec();
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read field '{name}': {e}")))?;
                form.fields.insert(name, value);
            }
        }
        Ok(form)
    }

    fn take(&mut self, key: &str) -> String {
        self.fields.remove(key).unwrap_or_default()
    }

    fn take_opt(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key).filter(|v| !v.trim().is_empty())
    }

    fn into_document(mut self) -> (DocumentMetadata, String, Vec<u8>) {
        let tags = self
            .take("tags")
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let meta = DocumentMetadata {
            name: self.take("name"),
            doc_type: self.take("type"),
            library: self.take("library"),
            description: self.take("description"),
            tags,
            category: self.take_opt("category"),
            filename: self.filename.take(),
        };
        let version = self.take("version");
        (meta, version, self.content)
    }

    fn into_version(mut self) -> (VersionUpload, Vec<u8>) {
        let upload = VersionUpload {
            version: self.take("version"),
            doc_type: self.take_opt("type"),
            category: self.take_opt("category"),
            description: self.take("description"),
            filename: self.filename.take(),
        };
        (upload, self.content)
    }
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        counts: state.service.counts(),
    })
}

/// `POST /api/v1/documents`: multipart upload that joins the document of the same library.
pub async fn upload_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<DataEnvelope<Upload>>)> {
    let (meta, version, content) = UploadForm::read(multipart).await?.into_document();
    let upload = state.service.registry.upload(meta, &version, content)?;
    Ok((StatusCode::CREATED, data(upload)))
}

/// `GET /api/v1/documents`
pub async fn list_documents(
    State(state): State<AppState>,
    Query(raw): Query<HashMap<String, String>>,
) -> ApiResult<Json<ListEnvelope<Document>>> {
    let params = ListParams::parse(raw, false)?;
    let request = state.service.paginator.request(params.page, params.size);
    let page = state.service.registry.list(&params.filters, request)?;
    Ok(Json(ListEnvelope::paged(page, &state.service.paginator)))
}

/// `GET /api/v1/documents/{id}`
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataEnvelope<Document>>> {
    Ok(data(state.service.registry.get(&id)?))
}

/// `PUT /api/v1/documents/{id}`
pub async fn update_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<DocumentUpdate>,
) -> ApiResult<Json<DataEnvelope<Document>>> {
    Ok(data(state.service.registry.update(&id, update)?))
}

/// `DELETE /api/v1/documents/{id}`, cascading to every version and index.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataEnvelope<DeleteReport>>> {
    Ok(data(state.service.registry.delete(&id).await?))
}

/// `POST /api/v1/documents/build-missing-indexes`
pub async fn build_missing_indexes(State(state): State<AppState>) -> (StatusCode, Json<DataEnvelope<Vec<IndexKey>>>) {
    (StatusCode::ACCEPTED, data(state.service.index.build_missing()))
}

/// `GET /api/v1/documents/{id}/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(raw): Query<HashMap<String, String>>,
) -> ApiResult<Json<ListEnvelope<Version>>> {
    let params = ListParams::parse(raw, false)?;
    let request = state.service.paginator.request(params.page, params.size);
    let page = state.service.versions().list(&id, &params.filters, request)?;
    Ok(Json(ListEnvelope::paged(page, &state.service.paginator)))
}

/// `POST /api/v1/documents/{id}/versions` with a multipart upload of a new version.
pub async fn add_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<DataEnvelope<Upload>>)> {
    let (upload, content) = UploadForm::read(multipart).await?.into_version();
    let upload = state.service.registry.add_version(&id, upload, content)?;
    Ok((StatusCode::CREATED, data(upload)))
}

/// `GET /api/v1/documents/{id}/versions/latest`
pub async fn latest_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataEnvelope<Version>>> {
    Ok(data(state.service.versions().latest(&id)?))
}

/// `GET /api/v1/documents/{id}/versions/{version}`
pub async fn get_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
) -> ApiResult<Json<DataEnvelope<Version>>> {
    Ok(data(state.service.versions().get(&id, &version)?))
}

/// `DELETE /api/v1/documents/{id}/versions/{version}`
pub async fn delete_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
) -> ApiResult<Json<DataEnvelope<VersionDeleted>>> {
    let deletion = state.service.versions().delete(&id, &version).await?;
    Ok(data(deletion.into()))
}

fn attachment(record: Version, bytes: Vec<u8>) -> Response {
    let filename = record
        .filename
        .unwrap_or_else(|| format!("{}-{}", record.document_id, record.version))
        .replace('"', "");
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        bytes,
    )
        .into_response()
}

/// `GET /api/v1/documents/{id}/versions/{version}/download`
pub async fn download_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (record, bytes) = state.service.versions().download(&id, &version).await?;
    Ok(attachment(record, bytes))
}

/// `GET /api/v1/documents/{id}/download`: bytes of the latest version.
pub async fn download_document(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let (record, bytes) = state.service.versions().download_latest(&id).await?;
    Ok(attachment(record, bytes))
}

/// `GET /api/v1/documents/{id}/metadata`
pub async fn document_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataEnvelope<DocumentMetadataView>>> {
    let document = state.service.registry.get(&id)?;
    let versions = state.service.versions().all(&id)?;
    Ok(data(DocumentMetadataView::new(&id, document.current_version, versions)))
}

/// `PUT /api/v1/documents/{id}/versions/{version}`: description and category only.
pub async fn update_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
    Json(update): Json<VersionUpdate>,
) -> ApiResult<Json<DataEnvelope<Version>>> {
    Ok(data(state.service.versions().update(&id, &version, update)?))
}

/// `POST /api/v1/search`
pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<ListEnvelope<SearchHit>>> {
    let page = state.service.search.search(&request)?;
    Ok(Json(ListEnvelope::paged(page, &state.service.paginator)))
}

/// `GET /api/v1/search?q=...`
pub async fn search_query(
    State(state): State<AppState>,
    Query(raw): Query<HashMap<String, String>>,
) -> ApiResult<Json<ListEnvelope<SearchHit>>> {
    let params = ListParams::parse(raw, true)?;
    let request = SearchRequest {
        query: params.query.unwrap_or_default(),
        filters: params.filters,
        page: params.page,
        size: params.size,
    };
    let page = state.service.search.search(&request)?;
    Ok(Json(ListEnvelope::paged(page, &state.service.paginator)))
}

/// `POST /api/v1/search/documents/{id}/versions/{version}/index`
///
/// Answers 202 with the `building` entry, or 202 `build_in_progress` when one is already running.
pub async fn build_index(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<DataEnvelope<IndexEntry>>)> {
    let entry = state.service.index.build_index(&id, &version)?;
    Ok((StatusCode::ACCEPTED, data(entry)))
}

/// `GET /api/v1/search/documents/{id}/versions/{version}/index`
pub async fn index_status(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
) -> Json<DataEnvelope<IndexEntry>> {
    data(state.service.index.get_status(&id, &version))
}

/// `DELETE /api/v1/search/documents/{id}/versions/{version}/index`
pub async fn delete_version_index(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
) -> ApiResult<Json<DataEnvelope<Vec<IndexKey>>>> {
    Ok(data(state.service.index.delete_index(&id, Some(&version))?))
}

/// `GET /api/v1/search/documents/{id}/index`
pub async fn index_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataEnvelope<IndexSummary>>> {
    Ok(data(state.service.index.index_summary(&id)?))
}

/// `DELETE /api/v1/search/documents/{id}/index`
pub async fn delete_document_indexes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataEnvelope<Vec<IndexKey>>>> {
    state.service.registry.get(&id)?;
    Ok(data(state.service.index.delete_index(&id, None)?))
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError(DocError::NotFound("route".to_string()))
}
