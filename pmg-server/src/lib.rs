//! pmg-server library
//!
//! HTTP service that accepts MIDI uploads, extends them with a continuation
//! model and serves the resulting MIDI files.

pub mod api;
pub mod error;
pub mod generator;
pub mod session;
pub mod workflow;

pub use crate::error::{ApiError, ApiResult};

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use pmg_common::config::{GenerationConfig, RootFolderInitializer};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::generator::Continuation;
use crate::session::SessionStore;

/// Resolved settings the handlers need
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Uploads are written here while being parsed, then deleted
    pub upload_dir: PathBuf,
    /// Generated MIDI files
    pub output_dir: PathBuf,
    /// Session persistence file; `None` keeps the session in memory only
    pub session_path: Option<PathBuf>,
    pub max_upload_bytes: usize,
    pub generation: GenerationConfig,
}

impl ServerConfig {
    /// Lay out folders under the root folder
    pub fn from_root(
        root: &RootFolderInitializer,
        max_upload_bytes: usize,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            upload_dir: root.upload_dir(),
            output_dir: root.output_dir(),
            session_path: Some(root.session_path()),
            max_upload_bytes,
            generation,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Current sequence (last upload or last generated result)
    pub session: SessionStore,
    /// Model used to extend uploaded sequences
    pub continuation: Arc<dyn Continuation>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(config: ServerConfig, continuation: Arc<dyn Continuation>) -> Self {
        Self {
            config: Arc::new(config),
            session: SessionStore::new(),
            continuation,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember an error for `/health`
    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    let body_limit = state.config.max_upload_bytes;

    Router::new()
        // UI routes (HTML page + script)
        .merge(api::ui_routes())
        .merge(api::health_routes())
        .route("/build_info", get(api::get_build_info))
        // API routes
        .route("/api/upload", post(api::upload_midi))
        .route("/api/generate", post(api::generate))
        .route("/api/files/:name", get(api::download_file))
        .route(
            "/api/sequence",
            get(api::get_sequence).delete(api::clear_sequence),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
