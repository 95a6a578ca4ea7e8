//! Session sequence storage
//!
//! The service keeps a single "current" sequence: the last upload, or the last
//! generated result. Each generate call extends it. The sequence is mirrored to a
//! JSON file so a restart can pick up where it left off.
//!
//! Anything that computes a new sequence from the current one holds the writer
//! lock from the read until the replacement is persisted.

use std::path::Path;
use std::sync::Arc;

use pmg_common::{NoteSequence, Result};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    current: Arc<RwLock<Option<NoteSequence>>>,
    writer: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize read-modify-write cycles; readers are not blocked
    pub async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub async fn current(&self) -> Option<NoteSequence> {
        self.current.read().await.clone()
    }

    pub async fn replace(&self, sequence: NoteSequence) {
        *self.current.write().await = Some(sequence);
    }

    /// Drop the current sequence; returns whether one was present
    pub async fn clear(&self) -> bool {
        self.current.write().await.take().is_some()
    }

    /// Write the current sequence as JSON (no-op when empty)
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let json = match self.current.read().await.as_ref() {
            Some(sequence) => sequence.to_json()?,
            None => return Ok(()),
        };
        tokio::fs::write(path, json).await?;
        info!("Session sequence written to {}", path.display());
        Ok(())
    }

    /// Load a previously persisted sequence; failures are logged, not fatal
    pub async fn restore(&self, path: &Path) -> Option<NoteSequence> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read session {}: {}", path.display(), e);
                return None;
            }
        };

        match NoteSequence::from_json(&json) {
            Ok(sequence) => {
                info!(
                    "Restored session sequence ({} notes) from {}",
                    sequence.notes.len(),
                    path.display()
                );
                self.replace(sequence.clone()).await;
                Some(sequence)
            }
            Err(e) => {
                warn!("Error importing session {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Remove the persisted file if present
    pub async fn forget(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
