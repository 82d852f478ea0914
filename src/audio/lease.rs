//! Audio Mode Leases
//!
//! Prozessweiter Koordinator für den exklusiven Audio-Modus. Wird mit
//! allen anderen Audio-Verbrauchern der App geteilt (z.B. Text-to-Speech).
//! Es kann immer nur ein Lease gleichzeitig gehalten werden; ein zweiter
//! Versuch wird abgelehnt statt den bestehenden Halter zu verdrängen.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Audio session is busy ({mode:?} held by {owner})")]
    Busy { owner: String, mode: AudioMode },

    #[error("Failed to activate audio mode: {0}")]
    Activation(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Audio-Modus der Plattform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// Bidirektionales Streaming (Anrufe)
    Streaming,
    /// Reine Wiedergabe (z.B. Sprachausgabe)
    Playback,
}

/// Plattform-Schnittstelle zum Aktivieren des Audio-Modus
pub trait AudioSessionPlatform: Send + Sync {
    fn activate(&self, mode: AudioMode) -> Result<(), String>;
    fn deactivate(&self, mode: AudioMode);
}

/// Plattform ohne eigene Audio-Session (Desktop, Tests)
#[derive(Debug, Default)]
pub struct NoopAudioSession;

impl AudioSessionPlatform for NoopAudioSession {
    fn activate(&self, _mode: AudioMode) -> Result<(), String> {
        Ok(())
    }

    fn deactivate(&self, _mode: AudioMode) {}
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    lease_id: String,
    mode: AudioMode,
    owner: String,
}

struct CoordinatorInner {
    current: Mutex<Option<LeaseRecord>>,
    platform: Arc<dyn AudioSessionPlatform>,
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Prozessweiter Audio-Modus Koordinator (eine Instanz pro Prozess, per `clone` teilen)
#[derive(Clone)]
pub struct AudioModeCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl AudioModeCoordinator {
    pub fn new(platform: Arc<dyn AudioSessionPlatform>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                current: Mutex::new(None),
                platform,
            }),
        }
    }

    /// Versucht einen Lease zu bekommen. Schlägt fehl, wenn bereits einer gehalten wird.
    pub fn try_acquire(&self, mode: AudioMode, owner: &str) -> Result<AudioLease, LeaseError> {
        let mut current = self.inner.current.lock();
        if let Some(held) = current.as_ref() {
            return Err(LeaseError::Busy {
                owner: held.owner.clone(),
                mode: held.mode,
            });
        }

        self.inner
            .platform
            .activate(mode)
            .map_err(LeaseError::Activation)?;

        let record = LeaseRecord {
            lease_id: Uuid::new_v4().to_string(),
            mode,
            owner: owner.to_string(),
        };
        tracing::debug!(lease_id = %record.lease_id, owner, ?mode, "Audio lease acquired");
        *current = Some(record.clone());

        Ok(AudioLease {
            lease_id: record.lease_id,
            mode,
            owner: record.owner,
            coordinator: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    /// Aktueller Halter (Owner, Modus)
    pub fn holder(&self) -> Option<(String, AudioMode)> {
        self.inner
            .current
            .lock()
            .as_ref()
            .map(|r| (r.owner.clone(), r.mode))
    }

    pub fn is_held(&self) -> bool {
        self.inner.current.lock().is_some()
    }
}

impl Default for AudioModeCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(NoopAudioSession))
    }
}

impl std::fmt::Debug for AudioModeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioModeCoordinator")
            .field("holder", &self.holder())
            .finish()
    }
}

// ============================================================================
// LEASE
// ============================================================================

/// Exklusiver Besitz des Audio-Modus. Wird bei `release()` oder Drop genau einmal freigegeben.
pub struct AudioLease {
    lease_id: String,
    mode: AudioMode,
    owner: String,
    coordinator: Arc<CoordinatorInner>,
    released: AtomicBool,
}

impl AudioLease {
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn mode(&self) -> AudioMode {
        self.mode
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Gibt den Lease frei. Liefert `true` nur beim ersten Aufruf.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        let mut current = self.coordinator.current.lock();
        if current
            .as_ref()
            .is_some_and(|r| r.lease_id == self.lease_id)
        {
            *current = None;
            self.coordinator.platform.deactivate(self.mode);
            tracing::debug!(lease_id = %self.lease_id, owner = %self.owner, "Audio lease released");
        }
        true
    }
}

impl Drop for AudioLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AudioLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioLease")
            .field("lease_id", &self.lease_id)
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .field("released", &self.is_released())
            .finish()
    }
}
