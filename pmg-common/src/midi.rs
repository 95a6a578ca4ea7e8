//! MIDI File I/O
//!
//! Converts between Standard MIDI Files and [`NoteSequence`] using the `midly` crate.
//! Metrical files are timed through a tempo map built from every track's tempo
//! events; timecode files use a fixed tick rate.

use std::collections::{BTreeMap, HashMap, VecDeque};

use midly::num::{u15, u24, u28, u4, u7};
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
};
use serde::Serialize;
use tracing::debug;

use crate::note_sequence::{
    Note, NoteSequence, Tempo, TimeSignature, DEFAULT_QPM, DEFAULT_TICKS_PER_QUARTER,
};
use crate::{Error, Result};

/// Microseconds per quarter note assumed before the first tempo event (120 qpm)
const DEFAULT_US_PER_QUARTER: u32 = 500_000;

/// General MIDI percussion channel (0-based)
const DRUM_CHANNEL: u8 = 9;

const MAX_U15: u16 = 0x7FFF;
const MAX_U24: u32 = 0xFF_FFFF;
const MAX_U28: u64 = 0x0FFF_FFFF;

/// Header-level facts about a MIDI file
#[derive(Debug, Clone, Serialize)]
pub struct MidiSummary {
    /// "single", "parallel" or "sequential"
    pub format: String,
    pub track_count: usize,
    /// Ticks per quarter note, `None` for timecode-based files
    pub ticks_per_quarter: Option<u16>,
}

/// Check that `data` is a well-formed Standard MIDI File
pub fn validate_midi(data: &[u8]) -> Result<MidiSummary> {
    let smf = Smf::parse(data)?;
    let summary = MidiSummary {
        format: match smf.header.format {
            Format::SingleTrack => "single",
            Format::Parallel => "parallel",
            Format::Sequential => "sequential",
        }
        .to_string(),
        track_count: smf.tracks.len(),
        ticks_per_quarter: match smf.header.timing {
            Timing::Metrical(tpq) => Some(tpq.as_int()),
            Timing::Timecode(_, _) => None,
        },
    };
    debug!(?summary, "Validated MIDI file");
    Ok(summary)
}

/// Parse a Standard MIDI File into a note sequence
pub fn midi_to_sequence(data: &[u8]) -> Result<NoteSequence> {
    let smf = Smf::parse(data)?;

    let mut raw_notes = Vec::new();
    let mut tempo_events = Vec::new();
    let mut signature_events = Vec::new();

    for (track_index, track) in smf.tracks.iter().enumerate() {
        collect_track(
            track,
            track_index as u32,
            &mut raw_notes,
            &mut tempo_events,
            &mut signature_events,
        );
    }

    let (time_base, ticks_per_quarter) = match smf.header.timing {
        Timing::Metrical(tpq) => {
            let tpq = tpq.as_int().max(1);
            (TimeBase::Metrical(TempoMap::from_ticks(tpq, tempo_events)), tpq)
        }
        Timing::Timecode(fps, subframes) => {
            let ticks_per_second = fps.as_f32() as f64 * subframes.max(1) as f64;
            (TimeBase::Timecode(ticks_per_second), DEFAULT_TICKS_PER_QUARTER)
        }
    };

    let mut sequence = NoteSequence::new();
    sequence.ticks_per_quarter = ticks_per_quarter;

    // The implied 120 qpm lead-in is kept once any tempo event appears after tick 0
    if let TimeBase::Metrical(map) = &time_base {
        let has_tempo_events = map.segments.iter().any(|s| s.explicit);
        sequence.tempos = map
            .segments
            .iter()
            .filter(|_| has_tempo_events)
            .map(|s| Tempo {
                time: s.seconds,
                qpm: 60_000_000.0 / s.us_per_quarter as f64,
            })
            .collect();
    }

    signature_events.sort_by_key(|(tick, _, _)| *tick);
    sequence.time_signatures = signature_events
        .into_iter()
        .map(|(tick, numerator, power)| TimeSignature {
            time: time_base.seconds(tick),
            numerator,
            denominator: 1u8.checked_shl(power as u32).unwrap_or(0),
        })
        .collect();

    sequence.notes = raw_notes
        .into_iter()
        .map(|raw| Note {
            pitch: raw.pitch,
            velocity: raw.velocity,
            start_time: time_base.seconds(raw.start_tick),
            end_time: time_base.seconds(raw.end_tick),
            instrument: raw.track,
            program: raw.program,
            is_drum: raw.channel == DRUM_CHANNEL,
            quantized_start_step: None,
            quantized_end_step: None,
        })
        .collect();
    sequence.notes.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then(a.pitch.cmp(&b.pitch))
    });
    sequence.recompute_total_time();

    debug!(
        "Parsed MIDI file: {} tracks, {} notes, {:.2}s",
        smf.tracks.len(),
        sequence.notes.len(),
        sequence.total_time
    );

    Ok(sequence)
}

/// Render a note sequence as a format 1 Standard MIDI File
pub fn sequence_to_midi(sequence: &NoteSequence) -> Result<Vec<u8>> {
    for note in &sequence.notes {
        if !note.start_time.is_finite() || !note.end_time.is_finite() {
            return Err(Error::Midi(format!(
                "note at pitch {} has a non-finite time",
                note.pitch
            )));
        }
        if note.end_time < note.start_time || note.start_time < 0.0 {
            return Err(Error::Midi(format!(
                "note at pitch {} has invalid span {:.3}s..{:.3}s",
                note.pitch, note.start_time, note.end_time
            )));
        }
    }

    let ticks_per_quarter = match sequence.ticks_per_quarter {
        0 => DEFAULT_TICKS_PER_QUARTER,
        tpq => tpq.min(MAX_U15),
    };

    let mut tempos = sequence.tempos.clone();
    if tempos.is_empty() {
        tempos.push(Tempo { time: 0.0, qpm: DEFAULT_QPM });
    }
    let map = TempoMap::from_seconds(ticks_per_quarter, &tempos);

    let mut tracks: Vec<Track<'static>> = Vec::new();
    tracks.push(conductor_track(&map, &sequence.time_signatures));

    let mut groups: BTreeMap<(bool, u32, u8), Vec<&Note>> = BTreeMap::new();
    for note in &sequence.notes {
        groups
            .entry((note.is_drum, note.instrument, note.program))
            .or_default()
            .push(note);
    }

    let mut next_channel = 0u8;
    for ((is_drum, _instrument, program), notes) in groups {
        let channel = if is_drum {
            DRUM_CHANNEL
        } else {
            if next_channel % 16 == DRUM_CHANNEL {
                next_channel = next_channel.wrapping_add(1);
            }
            let channel = next_channel % 16;
            next_channel = next_channel.wrapping_add(1);
            channel
        };
        tracks.push(note_track(&map, channel, program, is_drum, &notes));
    }

    let smf = Smf {
        header: Header::new(
            Format::Parallel,
            Timing::Metrical(u15::new(ticks_per_quarter)),
        ),
        tracks,
    };

    let mut out = Vec::new();
    smf.write_std(&mut out)
        .map_err(|e| Error::Midi(format!("Failed to write MIDI: {}", e)))?;
    Ok(out)
}

/// A note as read from a track, still in ticks
struct RawNote {
    track: u32,
    channel: u8,
    pitch: u8,
    velocity: u8,
    program: u8,
    start_tick: u64,
    end_tick: u64,
}

fn collect_track(
    track: &Track,
    track_index: u32,
    notes: &mut Vec<RawNote>,
    tempos: &mut Vec<(u64, u32)>,
    signatures: &mut Vec<(u64, u8, u8)>,
) {
    let mut tick = 0u64;
    let mut programs = [0u8; 16];
    // (channel, pitch) -> open notes as (start tick, velocity, program), oldest first
    let mut open: HashMap<(u8, u8), VecDeque<(u64, u8, u8)>> = HashMap::new();

    for event in track.iter() {
        tick += event.delta.as_int() as u64;

        match &event.kind {
            TrackEventKind::Midi { channel, message } => {
                let channel = channel.as_int();
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        open.entry((channel, key.as_int())).or_default().push_back((
                            tick,
                            vel.as_int(),
                            programs[channel as usize],
                        ));
                    }
                    // NoteOn with velocity 0 is a NoteOff
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        let pitch = key.as_int();
                        if let Some((start_tick, velocity, program)) = open
                            .get_mut(&(channel, pitch))
                            .and_then(|queue| queue.pop_front())
                        {
                            notes.push(RawNote {
                                track: track_index,
                                channel,
                                pitch,
                                velocity,
                                program,
                                start_tick,
                                end_tick: tick,
                            });
                        }
                    }
                    MidiMessage::ProgramChange { program } => {
                        programs[channel as usize] = program.as_int();
                    }
                    _ => {}
                }
            }
            TrackEventKind::Meta(MetaMessage::Tempo(us_per_quarter)) => {
                tempos.push((tick, us_per_quarter.as_int()));
            }
            TrackEventKind::Meta(MetaMessage::TimeSignature(numerator, power, _, _)) => {
                signatures.push((tick, *numerator, *power));
            }
            _ => {}
        }
    }

    // Close dangling notes at the end of the track
    for ((channel, pitch), queue) in open {
        for (start_tick, velocity, program) in queue {
            notes.push(RawNote {
                track: track_index,
                channel,
                pitch,
                velocity,
                program,
                start_tick,
                end_tick: tick,
            });
        }
    }
}

fn conductor_track(map: &TempoMap, signatures: &[TimeSignature]) -> Track<'static> {
    let mut events: Vec<(u64, u8, TrackEventKind<'static>)> = Vec::new();

    for segment in &map.segments {
        events.push((
            segment.tick,
            0,
            TrackEventKind::Meta(MetaMessage::Tempo(u24::new(
                segment.us_per_quarter.min(MAX_U24),
            ))),
        ));
    }

    for signature in signatures {
        let power = signature.denominator.max(1).ilog2() as u8;
        events.push((
            map.ticks(signature.time),
            1,
            TrackEventKind::Meta(MetaMessage::TimeSignature(
                signature.numerator,
                power,
                24, // MIDI clocks per metronome click
                8,  // 32nd notes per quarter note
            )),
        ));
    }

    finish_track(events)
}

fn note_track(
    map: &TempoMap,
    channel: u8,
    program: u8,
    is_drum: bool,
    notes: &[&Note],
) -> Track<'static> {
    let channel = u4::new(channel);
    let mut events: Vec<(u64, u8, TrackEventKind<'static>)> = Vec::new();

    if !is_drum {
        events.push((
            0,
            0,
            TrackEventKind::Midi {
                channel,
                message: MidiMessage::ProgramChange {
                    program: u7::new(program.min(127)),
                },
            },
        ));
    }

    for note in notes {
        let key = u7::new(note.pitch.min(127));
        let start = map.ticks(note.start_time);
        let end = map.ticks(note.end_time).max(start);

        // Offs sort before ons on the same tick so repeated pitches re-strike
        events.push((
            start,
            2,
            TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn {
                    key,
                    vel: u7::new(note.velocity.clamp(1, 127)),
                },
            },
        ));
        events.push((
            end,
            1,
            TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOff {
                    key,
                    vel: u7::new(0),
                },
            },
        ));
    }

    finish_track(events)
}

/// Sort absolute-time events and convert them to delta times
fn finish_track(mut events: Vec<(u64, u8, TrackEventKind<'static>)>) -> Track<'static> {
    events.sort_by_key(|(tick, order, _)| (*tick, *order));

    let mut track = Vec::with_capacity(events.len() + 1);
    let mut previous = 0u64;
    for (tick, _, kind) in events {
        let delta = (tick - previous).min(MAX_U28) as u32;
        track.push(TrackEvent {
            delta: u28::new(delta),
            kind,
        });
        previous = tick;
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    track
}

enum TimeBase {
    Metrical(TempoMap),
    /// Ticks per second
    Timecode(f64),
}

impl TimeBase {
    fn seconds(&self, tick: u64) -> f64 {
        match self {
            TimeBase::Metrical(map) => map.seconds(tick),
            TimeBase::Timecode(ticks_per_second) => tick as f64 / ticks_per_second,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    tick: u64,
    seconds: f64,
    us_per_quarter: u32,
    /// False for the implied 120 qpm segment before the first tempo event
    explicit: bool,
}

/// Piecewise-linear mapping between ticks and seconds
#[derive(Debug, Clone)]
struct TempoMap {
    ticks_per_quarter: f64,
    segments: Vec<TempoSegment>,
}

impl TempoMap {
    /// Build from tempo events as (tick, microseconds per quarter)
    fn from_ticks(ticks_per_quarter: u16, mut changes: Vec<(u64, u32)>) -> Self {
        changes.sort_by_key(|(tick, _)| *tick);
        let mut map = TempoMap {
            ticks_per_quarter: ticks_per_quarter as f64,
            segments: vec![TempoSegment {
                tick: 0,
                seconds: 0.0,
                us_per_quarter: DEFAULT_US_PER_QUARTER,
                explicit: false,
            }],
        };
        for (tick, us_per_quarter) in changes {
            let seconds = map.seconds(tick);
            map.push(TempoSegment {
                tick,
                seconds,
                us_per_quarter: us_per_quarter.max(1),
                explicit: true,
            });
        }
        map
    }

    /// Build from tempos in seconds
    fn from_seconds(ticks_per_quarter: u16, tempos: &[Tempo]) -> Self {
        let mut tempos = tempos.to_vec();
        tempos.sort_by(|a, b| a.time.total_cmp(&b.time));

        let mut map = TempoMap {
            ticks_per_quarter: ticks_per_quarter as f64,
            segments: vec![TempoSegment {
                tick: 0,
                seconds: 0.0,
                us_per_quarter: DEFAULT_US_PER_QUARTER,
                explicit: false,
            }],
        };
        for tempo in tempos {
            if !(tempo.qpm.is_finite() && tempo.qpm > 0.0) {
                continue;
            }
            let time = tempo.time.max(0.0);
            let tick = map.ticks(time);
            map.push(TempoSegment {
                tick,
                seconds: time,
                us_per_quarter: (60_000_000.0 / tempo.qpm).round().max(1.0) as u32,
                explicit: true,
            });
        }
        map
    }

    fn push(&mut self, segment: TempoSegment) {
        match self.segments.last_mut() {
            // A later event on the same tick replaces the earlier one
            Some(last) if last.tick == segment.tick => *last = segment,
            _ => self.segments.push(segment),
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        let index = self.segments.partition_point(|s| s.tick <= tick).saturating_sub(1);
        let segment = &self.segments[index];
        segment.seconds
            + (tick - segment.tick) as f64 * segment.us_per_quarter as f64
                / 1_000_000.0
                / self.ticks_per_quarter
    }

    fn ticks(&self, seconds: f64) -> u64 {
        let index = self
            .segments
            .partition_point(|s| s.seconds <= seconds)
            .saturating_sub(1);
        let segment = &self.segments[index];
        let elapsed = (seconds - segment.seconds).max(0.0);
        segment.tick
            + (elapsed * 1_000_000.0 * self.ticks_per_quarter / segment.us_per_quarter as f64)
                .round() as u64
    }
}
