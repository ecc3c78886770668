//! REST API layer built on axum.
//!
//! Document routes live under `/api/v1/documents`, search and index routes
//! under `/api/v1/search`. Requests carry an `x-request-id` and are bounded
//! by a body size limit and a timeout.
//!
//! Layers, outermost to innermost: timeout, body limit, request id.

pub mod errors;
pub mod handlers;
pub mod models;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tracing::Instrument;

use crate::config::ServerConfig;
use handlers::AppState;

async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    async move {
        let mut response = next.run(req).await;
        if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
            response
                .headers_mut()
                .insert(axum::http::HeaderName::from_static("x-request-id"), value);
        }
        tracing::debug!(status = response.status().as_u16(), "request finished");
        response
    }
    .instrument(span)
    .await
}

fn document_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::list_documents).post(handlers::upload_document))
        .route("/build-missing-indexes", post(handlers::build_missing_indexes))
        .route(
            "/{id}",
            get(handlers::get_document)
                .put(handlers::update_document)
                .delete(handlers::delete_document),
        )
        .route(
            "/{id}/versions",
            get(handlers::list_versions).post(handlers::add_version),
        )
        .route("/{id}/download", get(handlers::download_document))
        .route("/{id}/metadata", get(handlers::document_metadata))
        .route("/{id}/versions/latest", get(handlers::latest_version))
        .route(
            "/{id}/versions/{version}",
            get(handlers::get_version)
                .put(handlers::update_version)
                .delete(handlers::delete_version),
        )
        .route("/{id}/versions/{version}/download", get(handlers::download_version))
}

fn search_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::search_query).post(handlers::search))
        .route(
            "/documents/{id}/versions/{version}/index",
            get(handlers::index_status)
                .post(handlers::build_index)
                .delete(handlers::delete_version_index),
        )
        .route(
            "/documents/{id}/index",
            get(handlers::index_summary).delete(handlers::delete_document_indexes),
        )
}

/// Build the router with all routes and middleware.
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let api = Router::new()
        .nest("/documents", document_routes())
        .nest("/search", search_routes());

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(ServiceBuilder::new().layer(TimeoutLayer::new(server.request_timeout())))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: AppState, server: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", server.host, server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "lastdoc listening");

    axum::serve(listener, create_router(state, server))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;
    tracing::info!("server stopped");
    Ok(())
}
