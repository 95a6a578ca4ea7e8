//! MIDI upload endpoint
//!
//! The upload is written to the upload folder under a random name, validated and
//! parsed into the session sequence, and always deleted afterwards.

use std::path::Path;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pmg_common::midi::{midi_to_sequence, validate_midi};
use pmg_common::NoteSequence;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{ApiError, AppState};

/// Multipart field carrying the MIDI file
const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    /// Client-side file name of the upload
    pub file_path: String,
    pub note_count: usize,
    pub total_time: f64,
}

/// POST /api/upload
pub async fn upload_midi(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload.mid").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {}", e)))?;
        upload = Some((file_name, bytes.to_vec()));
        break;
    }

    let (file_name, bytes) = upload.ok_or_else(|| {
        ApiError::BadRequest(format!("No file uploaded (expected field '{}')", FILE_FIELD))
    })?;

    let temp_path = state.config.upload_dir.join(Uuid::new_v4().to_string());
    tokio::fs::write(&temp_path, &bytes).await?;
    info!(
        "Received upload '{}' ({} bytes) at {}",
        file_name,
        bytes.len(),
        temp_path.display()
    );

    let parsed = parse_upload(&temp_path).await;

    if let Err(e) = tokio::fs::remove_file(&temp_path).await {
        warn!("Failed to delete upload {}: {}", temp_path.display(), e);
    }

    match parsed {
        Ok(sequence) => {
            let response = UploadResponse {
                message: "File uploaded and parsed".to_string(),
                file_path: file_name,
                note_count: sequence.notes.len(),
                total_time: sequence.total_time,
            };
            let _writer = state.session.lock_writer().await;
            state.session.replace(sequence).await;
            if let Some(session_path) = &state.config.session_path {
                if let Err(e) = state.session.persist(session_path).await {
                    warn!("Failed to export sequence: {}", e);
                }
            }
            Ok(Json(response).into_response())
        }
        Err(e) => {
            error!("Error parsing MIDI file '{}': {}", file_name, e);
            state.record_error(format!("upload parse failed: {}", e)).await;
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to parse the file" })),
            )
                .into_response())
        }
    }
}

async fn parse_upload(path: &Path) -> pmg_common::Result<NoteSequence> {
    let data = tokio::fs::read(path).await?;
    let summary = validate_midi(&data)?;
    info!(
        "MIDI file valid: format {}, {} tracks",
        summary.format, summary.track_count
    );
    midi_to_sequence(&data)
}
