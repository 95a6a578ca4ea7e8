//! Generation endpoint

use axum::{extract::State, Json};
use serde::Serialize;

use crate::workflow::{self, GenerationKind};
use crate::{ApiResult, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub message: String,
    /// Location of the written file on the server
    pub file_path: String,
    /// Where the client can download the file
    pub download_url: String,
    pub kind: GenerationKind,
    pub note_count: usize,
    pub generated_notes: usize,
    pub total_time: f64,
}

/// POST /api/generate
///
/// Any request body is ignored; the session sequence is the input.
pub async fn generate(State(state): State<AppState>) -> ApiResult<Json<GenerateResponse>> {
    let outcome = match workflow::run(&state).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.record_error(e.to_string()).await;
            return Err(e);
        }
    };

    Ok(Json(GenerateResponse {
        message: "File generated".to_string(),
        file_path: outcome.path.display().to_string(),
        download_url: format!("/api/files/{}", outcome.file_name),
        kind: outcome.kind,
        note_count: outcome.note_count,
        generated_notes: outcome.generated_notes,
        total_time: outcome.total_time,
    }))
}
