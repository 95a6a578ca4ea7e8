//! Session sequence inspection

use axum::{extract::State, Json};
use pmg_common::NoteSequence;
use serde_json::{json, Value};
use tracing::info;

use crate::session::SessionStore;
use crate::{ApiError, ApiResult, AppState};

/// GET /api/sequence
pub async fn get_sequence(State(state): State<AppState>) -> ApiResult<Json<NoteSequence>> {
    state
        .session
        .current()
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No sequence uploaded or generated yet".to_string()))
}

/// DELETE /api/sequence
///
/// The next generate call falls back to the default sequence.
pub async fn clear_sequence(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let _writer = state.session.lock_writer().await;
    let cleared = state.session.clear().await;
    if let Some(path) = &state.config.session_path {
        SessionStore::forget(path).await?;
    }
    info!("Session cleared (had sequence: {})", cleared);
    Ok(Json(json!({ "cleared": cleared })))
}
