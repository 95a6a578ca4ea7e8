//! Note sequence model
//!
//! A note sequence is a list of notes (pitch, velocity, start/end time, instrument)
//! plus tempo and quantization metadata. Times are in seconds; quantized sequences
//! additionally carry step indices at a fixed number of steps per quarter note.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tempo assumed when a sequence carries no tempo event (quarter notes per minute)
pub const DEFAULT_QPM: f64 = 120.0;

/// Resolution used when writing MIDI for sequences that were not parsed from a file
pub const DEFAULT_TICKS_PER_QUARTER: u16 = 220;

/// Upper bound on quantized step indices (about 36 hours at 4 steps per quarter, 120 qpm)
pub const MAX_QUANTIZED_STEPS: u32 = 1 << 20;

/// A single note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// MIDI pitch (0-127)
    pub pitch: u8,
    /// MIDI velocity (0-127)
    pub velocity: u8,
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
    /// Instrument index (track index for parsed files)
    #[serde(default)]
    pub instrument: u32,
    /// General MIDI program
    #[serde(default)]
    pub program: u8,
    #[serde(default)]
    pub is_drum: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantized_start_step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantized_end_step: Option<u32>,
}

impl Note {
    /// Create a non-drum note on instrument 0, program 0
    pub fn new(pitch: u8, velocity: u8, start_time: f64, end_time: f64) -> Self {
        Self {
            pitch,
            velocity,
            start_time,
            end_time,
            instrument: 0,
            program: 0,
            is_drum: false,
            quantized_start_step: None,
            quantized_end_step: None,
        }
    }

    /// Builder-style instrument override
    pub fn with_instrument(mut self, instrument: u32) -> Self {
        self.instrument = instrument;
        self
    }
}

/// Tempo change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tempo {
    /// Time in seconds
    pub time: f64,
    /// Quarter notes per minute
    pub qpm: f64,
}

/// Time signature change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSignature {
    pub time: f64,
    pub numerator: u8,
    pub denominator: u8,
}

/// Quantization grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantizationInfo {
    pub steps_per_quarter: u32,
}

/// A sequence of notes with tempo and quantization metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSequence {
    pub ticks_per_quarter: u16,
    #[serde(default)]
    pub tempos: Vec<Tempo>,
    #[serde(default)]
    pub time_signatures: Vec<TimeSignature>,
    #[serde(default)]
    pub notes: Vec<Note>,
    /// End time of the last note, in seconds
    #[serde(default)]
    pub total_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization_info: Option<QuantizationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_quantized_steps: Option<u32>,
}

impl Default for NoteSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteSequence {
    /// Create an empty, unquantized sequence
    pub fn new() -> Self {
        Self {
            ticks_per_quarter: DEFAULT_TICKS_PER_QUARTER,
            tempos: Vec::new(),
            time_signatures: Vec::new(),
            notes: Vec::new(),
            total_time: 0.0,
            quantization_info: None,
            total_quantized_steps: None,
        }
    }

    /// Append a note, extending `total_time` to cover it
    pub fn push_note(&mut self, note: Note) {
        if note.end_time > self.total_time {
            self.total_time = note.end_time;
        }
        self.notes.push(note);
    }

    pub fn extend_notes<I: IntoIterator<Item = Note>>(&mut self, notes: I) {
        for note in notes {
            self.push_note(note);
        }
    }

    /// Reset `total_time` to the latest note end (0 when empty)
    pub fn recompute_total_time(&mut self) {
        self.total_time = self
            .notes
            .iter()
            .map(|n| n.end_time)
            .fold(0.0, f64::max);
    }

    /// Tempo of the sequence (first tempo event, or 120 qpm)
    pub fn qpm(&self) -> f64 {
        self.tempos.first().map(|t| t.qpm).unwrap_or(DEFAULT_QPM)
    }

    pub fn is_quantized(&self) -> bool {
        self.quantization_info.is_some()
    }

    /// Steps per second of a quantized sequence
    pub fn steps_per_second(&self) -> Result<f64> {
        let info = self.quantization_info.ok_or_else(|| {
            Error::Quantization("sequence is not quantized".to_string())
        })?;
        Ok(steps_per_second(info.steps_per_quarter, self.qpm()))
    }

    /// Convert a step index on this sequence's grid to seconds
    pub fn steps_to_seconds(&self, step: u32) -> Result<f64> {
        Ok(step as f64 / self.steps_per_second()?)
    }

    /// Return a copy of this sequence quantized to `steps_per_quarter`
    ///
    /// Only single-tempo sequences can be quantized. Notes that would collapse
    /// to zero length are stretched to one step. Fails if any step index would
    /// exceed [`MAX_QUANTIZED_STEPS`].
    pub fn quantize(&self, steps_per_quarter: u32) -> Result<NoteSequence> {
        if steps_per_quarter == 0 {
            return Err(Error::Quantization(
                "steps_per_quarter must be positive".to_string(),
            ));
        }

        let qpm = self.qpm();
        if let Some(change) = self
            .tempos
            .iter()
            .find(|t| (t.qpm - qpm).abs() > f64::EPSILON)
        {
            return Err(Error::Quantization(format!(
                "multiple tempos not supported ({} qpm at {:.3}s after {} qpm)",
                change.qpm, change.time, qpm
            )));
        }
        if !(qpm.is_finite() && qpm > 0.0) {
            return Err(Error::Quantization(format!("invalid tempo: {} qpm", qpm)));
        }

        let sps = steps_per_second(steps_per_quarter, qpm);
        let mut quantized = self.clone();
        let mut max_end_step = 0u32;

        for note in quantized.notes.iter_mut() {
            if note.start_time < 0.0 || note.end_time < 0.0 {
                return Err(Error::Quantization(format!(
                    "note at pitch {} has negative time",
                    note.pitch
                )));
            }
            let start = to_step(note.start_time, sps)?;
            let mut end = to_step(note.end_time, sps)?;
            if end <= start {
                end = checked_step(start, 1)?;
            }
            note.quantized_start_step = Some(start);
            note.quantized_end_step = Some(end);
            max_end_step = max_end_step.max(end);
        }

        quantized.quantization_info = Some(QuantizationInfo { steps_per_quarter });
        quantized.total_quantized_steps = Some(to_step(self.total_time, sps)?.max(max_end_step));
        Ok(quantized)
    }

    /// Shift every quantized note by `steps`
    ///
    /// Leaves the sequence untouched and fails if a shifted step would exceed
    /// [`MAX_QUANTIZED_STEPS`].
    pub fn offset_steps(&mut self, steps: u32) -> Result<()> {
        let shift = |step: Option<u32>| step.map(|s| checked_step(s, steps)).transpose();

        let mut shifted = Vec::with_capacity(self.notes.len());
        for note in &self.notes {
            shifted.push((shift(note.quantized_start_step)?, shift(note.quantized_end_step)?));
        }
        let total = shift(self.total_quantized_steps)?;

        for (note, (start, end)) in self.notes.iter_mut().zip(shifted) {
            note.quantized_start_step = start;
            note.quantized_end_step = end;
        }
        self.total_quantized_steps = total;
        Ok(())
    }

    /// Serialize to the JSON shape used for session persistence
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<NoteSequence> {
        Ok(serde_json::from_str(json)?)
    }
}

fn steps_per_second(steps_per_quarter: u32, qpm: f64) -> f64 {
    steps_per_quarter as f64 * qpm / 60.0
}

fn to_step(seconds: f64, steps_per_second: f64) -> Result<u32> {
    let step = (seconds * steps_per_second).round().max(0.0);
    if !step.is_finite() || step > MAX_QUANTIZED_STEPS as f64 {
        return Err(Error::Quantization(format!(
            "{:.3}s is beyond the {} step limit",
            seconds, MAX_QUANTIZED_STEPS
        )));
    }
    Ok(step as u32)
}

/// `step + by`, bounded by [`MAX_QUANTIZED_STEPS`]
pub fn checked_step(step: u32, by: u32) -> Result<u32> {
    step.checked_add(by)
        .filter(|s| *s <= MAX_QUANTIZED_STEPS)
        .ok_or_else(|| {
            Error::Quantization(format!(
                "step {} + {} exceeds the {} step limit",
                step, by, MAX_QUANTIZED_STEPS
            ))
        })
}
