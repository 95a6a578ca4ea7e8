//! First-order Markov melody model
//!
//! Learns event-to-event transitions from the seed melody itself, mixed with a
//! prior that prefers holding notes and small melodic intervals. The prior keeps
//! short or empty seeds from producing noise.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use pmg_common::{Error, NoteSequence, Result};

use super::{Continuation, Melody, MAX_PITCH, MIN_PITCH, NOTE_OFF, NO_EVENT};

/// NO_EVENT, NOTE_OFF, then one token per pitch in range
const VOCAB_SIZE: usize = 2 + (MAX_PITCH - MIN_PITCH) as usize;

/// Weight of one observed transition relative to the prior
const COUNT_WEIGHT: f64 = 4.0;

/// Pitch the prior centres on when the seed has no notes (middle C)
const FALLBACK_PITCH: u8 = 60;

#[derive(Debug, Clone, Default)]
pub struct MarkovMelodyModel {
    seed: Option<u64>,
}

impl MarkovMelodyModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed RNG seed: identical input gives identical output
    pub fn with_seed(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

impl Continuation for MarkovMelodyModel {
    fn name(&self) -> &str {
        "markov-melody"
    }

    fn continue_sequence(
        &self,
        seed: &NoteSequence,
        steps: u32,
        temperature: f64,
    ) -> Result<NoteSequence> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(Error::InvalidInput(format!(
                "temperature must be positive, got {}",
                temperature
            )));
        }
        let steps_per_quarter = seed
            .quantization_info
            .map(|q| q.steps_per_quarter)
            .ok_or_else(|| Error::InvalidInput("seed sequence is not quantized".to_string()))?;

        let melody = Melody::from_quantized(seed)?;
        let table = TransitionTable::train(melody.events());
        let mut rng = self.rng();

        let mut previous = melody.events().last().copied().unwrap_or(NO_EVENT);
        let mut anchor = melody.last_pitch().unwrap_or(FALLBACK_PITCH);
        let mut events = Vec::with_capacity(steps as usize);

        for _ in 0..steps {
            let weights = table.weights(previous, anchor, temperature);
            let dist = WeightedIndex::new(&weights)
                .map_err(|e| Error::Internal(format!("invalid sampling weights: {}", e)))?;
            let event = token_event(dist.sample(&mut rng));
            if event >= 0 {
                anchor = event as u8;
            }
            events.push(event);
            previous = event;
        }

        debug!(
            "Sampled {} steps from {} seed steps ({} observed transitions)",
            steps,
            melody.len(),
            table.observed
        );

        let mut continuation = Melody::from_events(events).to_sequence(steps_per_quarter, &seed.tempos);
        continuation.ticks_per_quarter = seed.ticks_per_quarter;
        Ok(continuation)
    }
}

struct TransitionTable {
    counts: Vec<[f64; VOCAB_SIZE]>,
    observed: usize,
}

impl TransitionTable {
    fn train(events: &[i16]) -> Self {
        let mut counts = vec![[0.0; VOCAB_SIZE]; VOCAB_SIZE];
        let mut observed = 0;
        for pair in events.windows(2) {
            counts[token_index(pair[0])][token_index(pair[1])] += 1.0;
            observed += 1;
        }
        Self { counts, observed }
    }

    /// Sampling weights for the next token, sharpened or flattened by temperature
    fn weights(&self, previous: i16, anchor: u8, temperature: f64) -> Vec<f64> {
        let row = &self.counts[token_index(previous)];
        let raw: Vec<f64> = (0..VOCAB_SIZE)
            .map(|token| row[token] * COUNT_WEIGHT + prior(previous, token_event(token), anchor))
            .collect();
        let max = raw.iter().copied().fold(f64::MIN_POSITIVE, f64::max);

        // softmax(ln(weight) / temperature), normalised so low temperatures cannot overflow
        raw.into_iter()
            .map(|weight| (weight / max).powf(1.0 / temperature))
            .collect()
    }
}

fn prior(previous: i16, next: i16, anchor: u8) -> f64 {
    match next {
        NO_EVENT => 2.0,
        NOTE_OFF if previous == NOTE_OFF => 0.05,
        NOTE_OFF => 0.5,
        pitch => {
            let interval = (pitch - anchor as i16).unsigned_abs() as f64;
            // Repeating the same pitch is less musical than a step
            let repeat_penalty = if interval == 0.0 { 0.5 } else { 1.0 };
            1.5 * (-interval / 3.0).exp() * repeat_penalty + 1e-3
        }
    }
}

fn token_index(event: i16) -> usize {
    match event {
        NO_EVENT => 0,
        NOTE_OFF => 1,
        pitch => 2 + (pitch.clamp(MIN_PITCH as i16, MAX_PITCH as i16 - 1) - MIN_PITCH as i16) as usize,
    }
}

fn token_event(index: usize) -> i16 {
    match index {
        0 => NO_EVENT,
        1 => NOTE_OFF,
        i => MIN_PITCH as i16 + (i - 2) as i16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmg_common::{Note, Tempo};

    fn seed_sequence() -> NoteSequence {
        let mut seq = NoteSequence::new();
        seq.tempos.push(Tempo { time: 0.0, qpm: 120.0 });
        for (i, pitch) in [60u8, 62, 64, 65, 67, 65, 64, 62].iter().enumerate() {
            let start = i as f64 * 0.25;
            seq.push_note(Note::new(*pitch, 100, start, start + 0.25));
        }
        seq.quantize(4).unwrap()
    }

    #[test]
    fn test_token_mapping_is_bijective() {
        for index in 0..VOCAB_SIZE {
            assert_eq!(token_index(token_event(index)), index);
        }
        assert_eq!(token_event(2), MIN_PITCH as i16);
        assert_eq!(token_event(VOCAB_SIZE - 1), MAX_PITCH as i16 - 1);
    }

    #[test]
    fn test_continuation_shape() {
        let seed = seed_sequence();
        let model = MarkovMelodyModel::with_seed(42);
        let continuation = model.continue_sequence(&seed, 20, 1.1).unwrap();

        assert_eq!(continuation.total_quantized_steps, Some(20));
        assert_eq!(continuation.quantization_info, seed.quantization_info);
        assert_eq!(continuation.tempos, seed.tempos);
        for note in &continuation.notes {
            assert!(note.pitch >= MIN_PITCH && note.pitch < MAX_PITCH);
            let start = note.quantized_start_step.unwrap();
            let end = note.quantized_end_step.unwrap();
            assert!(start < end && end <= 20);
        }
    }

    #[test]
    fn test_seeded_model_is_deterministic() {
        let seed = seed_sequence();
        let a = MarkovMelodyModel::with_seed(7).continue_sequence(&seed, 32, 1.0).unwrap();
        let b = MarkovMelodyModel::with_seed(7).continue_sequence(&seed, 32, 1.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_seed_still_generates() {
        let mut empty = NoteSequence::new();
        empty.quantization_info = Some(pmg_common::QuantizationInfo { steps_per_quarter: 4 });
        empty.total_quantized_steps = Some(0);

        let continuation = MarkovMelodyModel::with_seed(1)
            .continue_sequence(&empty, 64, 1.0)
            .unwrap();
        assert_eq!(continuation.total_quantized_steps, Some(64));
    }

    #[test]
    fn test_rejects_unquantized_seed_and_bad_temperature() {
        let model = MarkovMelodyModel::with_seed(0);
        let mut unquantized = NoteSequence::new();
        unquantized.push_note(Note::new(60, 100, 0.0, 1.0));
        assert!(model.continue_sequence(&unquantized, 4, 1.0).is_err());
        assert!(model.continue_sequence(&seed_sequence(), 4, 0.0).is_err());
    }

    #[test]
    fn test_observed_transitions_dominate_at_low_temperature() {
        // Seed alternates 60 and 67 every step
        let mut seq = NoteSequence::new();
        for i in 0..16 {
            let pitch = if i % 2 == 0 { 60 } else { 67 };
            let start = i as f64 * 0.125;
            seq.push_note(Note::new(pitch, 100, start, start + 0.125));
        }
        let seed = seq.quantize(4).unwrap();

        let continuation = MarkovMelodyModel::with_seed(3)
            .continue_sequence(&seed, 8, 0.05)
            .unwrap();
        let pitches: Vec<u8> = continuation.notes.iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![60, 67, 60, 67, 60, 67, 60, 67]);
    }
}
