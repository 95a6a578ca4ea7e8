//! Generation workflow
//!
//! Without a session sequence a fixed two-note default is written out. With one,
//! a marker note is appended, the sequence is quantized and handed to the
//! continuation model, and the predicted notes are placed after it. Model
//! failures are logged and the sequence is written without generated notes.

use std::path::{Path, PathBuf};

use chrono::Utc;
use pmg_common::midi::sequence_to_midi;
use pmg_common::note_sequence::checked_step;
use pmg_common::{Error, Note, NoteSequence, QuantizationInfo, Tempo};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{ApiResult, AppState};

/// Tempo of the default sequence
pub const DEFAULT_QPM: f64 = 103.33343666677001;

/// Appended before continuing an uploaded sequence
const MARKER_PITCH: u8 = 60;
const MARKER_VELOCITY: u8 = 121;
const MARKER_INSTRUMENT: u32 = 8;
const MARKER_SECONDS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    /// No session sequence: the default sequence was written
    Default,
    /// The session sequence was extended
    Extended,
}

impl GenerationKind {
    fn file_suffix(self) -> &'static str {
        match self {
            GenerationKind::Default => "new",
            GenerationKind::Extended => "extended",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub kind: GenerationKind,
    pub file_name: String,
    pub path: PathBuf,
    pub note_count: usize,
    /// Notes contributed by the continuation model
    pub generated_notes: usize,
    pub total_time: f64,
}

/// Two sustained notes at 103.3 qpm on a one-step-per-quarter grid
pub fn default_sequence() -> NoteSequence {
    let mut sequence = NoteSequence::new();
    sequence.total_quantized_steps = Some(1);
    sequence.quantization_info = Some(QuantizationInfo { steps_per_quarter: 1 });
    sequence.tempos = vec![Tempo {
        time: 0.0,
        qpm: DEFAULT_QPM,
    }];
    sequence.push_note(Note::new(60, 100, 0.0, 5.0).with_instrument(9));
    sequence.push_note(Note::new(62, 100, 0.0, 5.0).with_instrument(5));
    sequence
}

/// Append the marker note at the current end of the sequence
pub fn append_marker_note(sequence: &mut NoteSequence) {
    let start = sequence.total_time;
    sequence.push_note(
        Note::new(MARKER_PITCH, MARKER_VELOCITY, start, start + MARKER_SECONDS)
            .with_instrument(MARKER_INSTRUMENT),
    );
}

/// Run one generate request against the session
pub async fn run(state: &AppState) -> ApiResult<GenerationOutcome> {
    // Concurrent requests extend each other's results instead of the same seed
    let _writer = state.session.lock_writer().await;

    let (kind, sequence, generated_notes) = match state.session.current().await {
        None => {
            info!("No uploaded sequence found, using default sequence");
            (GenerationKind::Default, default_sequence(), 0)
        }
        Some(mut sequence) => {
            append_marker_note(&mut sequence);
            let generated = match continue_sequence(state, &sequence).await {
                Ok(notes) => notes,
                Err(e) => {
                    error!("Error generating sequence: {}", e);
                    state.record_error(format!("generation failed: {}", e)).await;
                    Vec::new()
                }
            };
            let count = generated.len();
            sequence.extend_notes(generated);
            (GenerationKind::Extended, sequence, count)
        }
    };

    let output_dir = &state.config.output_dir;
    let file_name = unique_file_name(output_dir, kind);
    let path = output_dir.join(&file_name);

    let bytes = sequence_to_midi(&sequence)?;
    tokio::fs::write(&path, bytes).await.map_err(|e| {
        error!("Error saving MIDI file {}: {}", path.display(), e);
        e
    })?;
    info!("MIDI file saved: {}", path.display());

    let outcome = GenerationOutcome {
        kind,
        file_name,
        path,
        note_count: sequence.notes.len(),
        generated_notes,
        total_time: sequence.total_time,
    };

    // The written result becomes the seed for the next request
    state.session.replace(sequence).await;
    if let Some(session_path) = &state.config.session_path {
        if let Err(e) = state.session.persist(session_path).await {
            warn!("Failed to export sequence: {}", e);
        }
    }

    Ok(outcome)
}

/// Quantize, run the model on a blocking worker, and place its notes after the seed
async fn continue_sequence(state: &AppState, sequence: &NoteSequence) -> pmg_common::Result<Vec<Note>> {
    let settings = state.config.generation.clone();
    let seed = sequence.quantize(settings.steps_per_quarter)?;
    let offset = seed.total_quantized_steps.unwrap_or(0);

    let model = state.continuation.clone();
    info!(
        "Continuing {} notes with {} ({} steps, temperature {})",
        seed.notes.len(),
        model.name(),
        settings.steps,
        settings.temperature
    );

    let continuation = tokio::task::spawn_blocking(move || {
        model.continue_sequence(&seed, settings.steps, settings.temperature)
    })
    .await
    .map_err(|e| Error::Internal(format!("continuation task failed: {}", e)))??;

    let mut notes = Vec::with_capacity(continuation.notes.len());
    for note in &continuation.notes {
        let (start, end) = match (note.quantized_start_step, note.quantized_end_step) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(Error::Internal(
                    "continuation returned an unquantized note".to_string(),
                ))
            }
        };
        let mut placed = note.clone();
        placed.start_time = continuation.steps_to_seconds(checked_step(offset, start)?)?;
        placed.end_time = continuation.steps_to_seconds(checked_step(offset, end)?)?;
        placed.quantized_start_step = None;
        placed.quantized_end_step = None;
        notes.push(placed);
    }

    info!("Generated {} notes", notes.len());
    Ok(notes)
}

/// `<unix millis>_<suffix>.mid`, with a counter if that name is taken
fn unique_file_name(dir: &Path, kind: GenerationKind) -> String {
    let stamp = Utc::now().timestamp_millis();
    let mut name = format!("{}_{}.mid", stamp, kind.file_suffix());
    let mut counter = 1;
    while dir.join(&name).exists() {
        name = format!("{}_{}-{}.mid", stamp, kind.file_suffix(), counter);
        counter += 1;
    }
    name
}
