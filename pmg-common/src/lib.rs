//! # PMG Common Library
//!
//! Shared code for the PMG services including:
//! - Note sequence model and quantization
//! - Standard MIDI File parsing and writing
//! - Configuration loading and root folder resolution
//! - Common error types

pub mod config;
pub mod error;
pub mod midi;
pub mod note_sequence;

pub use error::{Error, Result};
pub use note_sequence::{Note, NoteSequence, QuantizationInfo, Tempo, TimeSignature};
