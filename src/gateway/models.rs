//! Request and response envelopes.

use serde::Serialize;
use std::collections::HashMap;

use super::errors::ApiError;
use crate::docs::lifecycle::VersionDeletion;
use crate::docs::pagination::Paginator;
use crate::docs::schema::{ContentMetadata, Version, VersionStatus};
use crate::docs::{Filters, PageResult, ServiceCounts};

/// `{ items, total, page, size, pages, links }`
#[derive(Debug, Serialize)]
pub struct ListEnvelope<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
    pub pages: usize,
    /// Page numbers to offer around the current page.
    pub links: Vec<usize>,
}

impl<T> ListEnvelope<T> {
    pub fn paged(result: PageResult<T>, paginator: &Paginator) -> Self {
        let pages = result.pages();
        let links = paginator.window(result.total, result.size, result.page);
        Self {
            items: result.items,
            total: result.total,
            page: result.page,
            size: result.size,
            pages,
            links,
        }
    }
}

/// `{ data }`
#[derive(Debug, Serialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

pub fn data<T>(data: T) -> axum::Json<DataEnvelope<T>> {
    axum::Json(DataEnvelope { data })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub counts: ServiceCounts,
}

#[derive(Debug, Serialize)]
pub struct VersionDeleted {
    pub document_id: String,
    pub version: String,
    pub document_removed: bool,
    pub current_version: Option<String>,
    pub orphaned_content: Option<String>,
}

impl From<VersionDeletion> for VersionDeleted {
    fn from(d: VersionDeletion) -> Self {
        Self {
            document_id: d.key.document_id,
            version: d.key.version,
            document_removed: d.document_removed,
            current_version: d.current_version,
            orphaned_content: d.orphaned_content.map(|r| r.to_string()),
        }
    }
}

/// Extracted metadata of every version of a document.
#[derive(Debug, Serialize)]
pub struct DocumentMetadataView {
    pub document_id: String,
    pub current_version: Option<String>,
    pub versions: Vec<VersionMetadataView>,
}

#[derive(Debug, Serialize)]
pub struct VersionMetadataView {
    pub version: String,
    pub status: VersionStatus,
    pub metadata: Option<ContentMetadata>,
}

impl DocumentMetadataView {
    pub fn new(document_id: &str, current_version: Option<String>, versions: Vec<Version>) -> Self {
        Self {
            document_id: document_id.to_string(),
            current_version,
            versions: versions
                .into_iter()
                .map(|v| VersionMetadataView {
                    version: v.version,
                    status: v.status,
                    metadata: v.metadata,
                })
                .collect(),
        }
    }
}

/// Query string split into paging parameters and filters.
#[derive(Debug, Default)]
pub struct ListParams {
    pub page: Option<i64>,
    pub size: Option<i64>,
    pub query: Option<String>,
    pub filters: Filters,
}

fn parse_number(key: &str, value: &str) -> Result<Option<i64>, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| ApiError::bad_request(format!("'{key}' must be an integer, got '{value}'")))
}

impl ListParams {
    /// `page` and `size` are paging; `q`/`query` is taken only when `with_query`; the rest are filters.
    pub fn parse(raw: HashMap<String, String>, with_query: bool) -> Result<Self, ApiError> {
        let mut params = Self::default();
        for (key, value) in raw {
            match key.as_str() {
                "page" => params.page = parse_number(&key, &value)?,
                "size" | "page_size" => params.size = parse_number(&key, &value)?,
                "q" | "query" if with_query => params.query = Some(value),
                _ => params.filters.insert(key, value),
            }
        }
        Ok(params)
    }
}
