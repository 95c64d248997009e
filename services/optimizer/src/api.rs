//! HTTP surface: health, readiness and the variant manifest.

use crate::catalog::VariantCatalog;
use crate::config::ApiConfig;
use crate::store::ObjectStore;
use crate::variant::{variant_key, OutputFormat};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Key probed by the readiness check
const READINESS_PROBE_KEY: &str = "processed/.ready";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<VariantCatalog>,
    pub processed_bucket: String,
    pub presigned_url_expiry: Duration,
}

/// Query parameters for the variant manifest
#[derive(Debug, Deserialize)]
pub struct ManifestQuery {
    /// Include presigned URLs for available variants
    #[serde(default)]
    pub include_urls: bool,
}

/// One catalog width/format combination for a source
#[derive(Debug, Serialize)]
pub struct VariantEntry {
    pub width: u32,
    pub format: OutputFormat,
    pub key: String,
    /// Whether the variant has been written yet
    pub available: bool,
    /// Presigned URL (if requested and available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_expires_at: Option<DateTime<Utc>>,
}

/// Variant manifest response
#[derive(Debug, Serialize)]
pub struct ManifestResponse {
    pub source_key: String,
    pub bucket: String,
    pub encoder_profile: String,
    pub available_count: usize,
    pub total_count: usize,
    pub variants: Vec<VariantEntry>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/variants/*source_key", get(get_manifest))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "optimizer-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state
        .store
        .exists(&state.processed_bucket, READINESS_PROBE_KEY)
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "storage": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "storage": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Report which catalog variants of a source exist so far
#[instrument(skip(state))]
async fn get_manifest(
    State(state): State<AppState>,
    Path(source_key): Path<String>,
    Query(params): Query<ManifestQuery>,
) -> Result<Json<ManifestResponse>, (StatusCode, Json<ErrorResponse>)> {
    let source_key = source_key.trim_start_matches('/').to_string();
    if source_key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Source key must not be empty".to_string(),
                code: "INVALID_KEY".to_string(),
            }),
        ));
    }

    let candidates: Vec<(u32, OutputFormat)> = state
        .catalog
        .widths()
        .iter()
        .flat_map(|width| {
            state
                .catalog
                .formats_for(*width)
                .into_iter()
                .map(move |format| (*width, format))
        })
        .collect();

    let include_urls = params.include_urls;
    let lookups = candidates.into_iter().map(|(width, format)| {
        let state = &state;
        let key = variant_key(&source_key, width, format);
        async move {
            let available = state.store.exists(&state.processed_bucket, &key).await?;
            let (url, url_expires_at) = if available && include_urls {
                presigned_url(state, &key).await
            } else {
                (None, None)
            };

            Ok::<_, crate::error::StoreError>(VariantEntry {
                width,
                format,
                key,
                available,
                url,
                url_expires_at,
            })
        }
    });

    let variants = join_all(lookups)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            error!(error = %e, "Failed to check variant availability");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to check variant availability".to_string(),
                    code: "STORAGE_ERROR".to_string(),
                }),
            )
        })?;

    Ok(Json(ManifestResponse {
        available_count: variants.iter().filter(|v| v.available).count(),
        total_count: variants.len(),
        source_key,
        bucket: state.processed_bucket.clone(),
        encoder_profile: state.catalog.encoder_profile().to_string(),
        variants,
    }))
}

/// Presigned URL for a variant; failures are logged and reported as absent
async fn presigned_url(state: &AppState, key: &str) -> (Option<String>, Option<DateTime<Utc>>) {
    match state
        .store
        .presign_get(&state.processed_bucket, key, state.presigned_url_expiry)
        .await
    {
        Ok(Some(url)) => {
            let expires_at = chrono::Duration::from_std(state.presigned_url_expiry)
                .ok()
                .map(|expiry| Utc::now() + expiry);
            (Some(url), expires_at)
        }
        Ok(None) => (None, None),
        Err(e) => {
            error!(error = %e, key = %key, "Failed to generate presigned URL");
            (None, None)
        }
    }
}

/// Start the variant manifest API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting variant manifest API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
