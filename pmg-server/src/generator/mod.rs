//! Sequence continuation
//!
//! A [`Continuation`] extends a quantized note sequence with predicted notes.
//! Models work on a monophonic melody encoding: one event per quantization step,
//! either a pitch onset, [`NOTE_OFF`], or [`NO_EVENT`] (hold the previous state).

pub mod markov;

pub use markov::MarkovMelodyModel;

use pmg_common::note_sequence::MAX_QUANTIZED_STEPS;
use pmg_common::{Error, Note, NoteSequence, QuantizationInfo, Result, Tempo};

/// Step event: silence from this step on
pub const NOTE_OFF: i16 = -1;
/// Step event: keep sounding (or keep silent)
pub const NO_EVENT: i16 = -2;

/// Lowest pitch a melody event can carry (inclusive)
pub const MIN_PITCH: u8 = 48;
/// Highest pitch a melody event can carry (exclusive)
pub const MAX_PITCH: u8 = 84;

/// Velocity of notes decoded from melody events
pub const DEFAULT_VELOCITY: u8 = 100;

/// A model that extends a quantized note sequence
pub trait Continuation: Send + Sync {
    /// Human-readable model name for logs
    fn name(&self) -> &str;

    /// Generate `steps` steps following `seed`
    ///
    /// `seed` must be quantized. The result holds only the new notes, on the
    /// seed's grid, with steps counted from 0 (the step right after the seed).
    fn continue_sequence(
        &self,
        seed: &NoteSequence,
        steps: u32,
        temperature: f64,
    ) -> Result<NoteSequence>;
}

/// Monophonic melody, one event per step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Melody {
    events: Vec<i16>,
}

impl Melody {
    pub fn from_events(events: Vec<i16>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[i16] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Last onset pitch, if any
    pub fn last_pitch(&self) -> Option<u8> {
        self.events
            .iter()
            .rev()
            .find(|e| **e >= 0)
            .map(|e| *e as u8)
    }

    /// Extract the top line of a quantized sequence
    ///
    /// Drums are ignored, pitches are folded by octaves into
    /// `[MIN_PITCH, MAX_PITCH)`, and when several notes start on one step the
    /// highest wins.
    pub fn from_quantized(sequence: &NoteSequence) -> Result<Melody> {
        if !sequence.is_quantized() {
            return Err(Error::InvalidInput(
                "melody extraction needs a quantized sequence".to_string(),
            ));
        }

        let total_steps = sequence.total_quantized_steps.unwrap_or(0);
        if total_steps > MAX_QUANTIZED_STEPS {
            return Err(Error::InvalidInput(format!(
                "sequence spans {} steps, limit is {}",
                total_steps, MAX_QUANTIZED_STEPS
            )));
        }
        let total_steps = total_steps as usize;
        let mut events = vec![NO_EVENT; total_steps];

        let spans: Vec<(usize, usize, i16)> = sequence
            .notes
            .iter()
            .filter(|n| !n.is_drum)
            .filter_map(|n| match (n.quantized_start_step, n.quantized_end_step) {
                (Some(start), Some(end)) => {
                    Some((start as usize, end as usize, fold_pitch(n.pitch) as i16))
                }
                _ => None,
            })
            .filter(|(start, _, _)| *start < total_steps)
            .collect();

        for &(start, _, pitch) in &spans {
            if events[start] < pitch {
                events[start] = pitch;
            }
        }

        // Only the note that won its onset step may end the melody line
        for &(start, end, pitch) in &spans {
            if events[start] != pitch || end >= total_steps {
                continue;
            }
            let interrupted = events[start + 1..end].iter().any(|e| *e != NO_EVENT);
            if !interrupted && events[end] == NO_EVENT {
                events[end] = NOTE_OFF;
            }
        }

        Ok(Melody { events })
    }

    /// Decode into a quantized sequence on the given grid
    pub fn to_sequence(&self, steps_per_quarter: u32, tempos: &[Tempo]) -> NoteSequence {
        let mut sequence = NoteSequence::new();
        sequence.tempos = tempos.to_vec();
        sequence.quantization_info = Some(QuantizationInfo { steps_per_quarter });
        sequence.total_quantized_steps = Some(self.events.len() as u32);

        let qpm = sequence.qpm();
        let steps_per_second = steps_per_quarter.max(1) as f64 * qpm / 60.0;
        let mut sounding: Option<(u8, usize)> = None;

        let close = |sequence: &mut NoteSequence, note: Option<(u8, usize)>, end: usize| {
            if let Some((pitch, start)) = note {
                let mut decoded = Note::new(
                    pitch,
                    DEFAULT_VELOCITY,
                    start as f64 / steps_per_second,
                    end as f64 / steps_per_second,
                );
                decoded.quantized_start_step = Some(start as u32);
                decoded.quantized_end_step = Some(end as u32);
                sequence.push_note(decoded);
            }
        };

        for (step, event) in self.events.iter().enumerate() {
            match *event {
                NO_EVENT => {}
                NOTE_OFF => close(&mut sequence, sounding.take(), step),
                pitch => {
                    close(&mut sequence, sounding.take(), step);
                    sounding = Some((pitch as u8, step));
                }
            }
        }
        close(&mut sequence, sounding.take(), self.events.len());

        sequence
    }
}

/// Shift a pitch by octaves into the melody range
pub fn fold_pitch(pitch: u8) -> u8 {
    let mut pitch = pitch;
    while pitch < MIN_PITCH {
        pitch += 12;
    }
    while pitch >= MAX_PITCH {
        pitch -= 12;
    }
    pitch
}
