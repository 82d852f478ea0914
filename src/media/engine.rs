//! Media Engine Schnittstelle
//!
//! Die eigentliche Media-Übertragung (Rooms, Tracks, Transport) liegt in
//! einem externen Dienst. Wir konsumieren nur die hier definierten
//! Operationen und reagieren auf seine Events.

use crate::model::CallType;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Media session already released")]
    SessionReleased,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events der Media Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Lokaler Teilnehmer ist dem Room beigetreten
    Joined { room_reference: String },
    /// Lokaler Teilnehmer hat den Room verlassen
    Left { room_reference: String },
    ParticipantJoined {
        room_reference: String,
        participant_id: String,
    },
    ParticipantLeft {
        room_reference: String,
        participant_id: String,
    },
    TrackStarted {
        room_reference: String,
        participant_id: String,
    },
    TrackStopped {
        room_reference: String,
        participant_id: String,
    },
    Error {
        room_reference: Option<String>,
        message: String,
    },
}

impl MediaEvent {
    /// Room auf den sich das Event bezieht (falls bekannt)
    pub fn room_reference(&self) -> Option<&str> {
        match self {
            MediaEvent::Joined { room_reference }
            | MediaEvent::Left { room_reference }
            | MediaEvent::ParticipantJoined { room_reference, .. }
            | MediaEvent::ParticipantLeft { room_reference, .. }
            | MediaEvent::TrackStarted { room_reference, .. }
            | MediaEvent::TrackStopped { room_reference, .. } => Some(room_reference),
            MediaEvent::Error { room_reference, .. } => room_reference.as_deref(),
        }
    }
}

// ============================================================================
// ENGINE TRAIT
// ============================================================================

/// Externe Media-Routing Engine (z.B. gehosteter WebRTC-Dienst)
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Mikrofon (und bei Video die Kamera) anfordern
    async fn ensure_permissions(&self, call_type: CallType) -> Result<(), MediaError>;

    /// Legt einen Room an und liefert dessen Referenz
    async fn create_room(&self, call_id: &str, call_type: CallType) -> Result<String, MediaError>;

    async fn issue_token(&self, room_reference: &str, user_id: &str) -> Result<String, MediaError>;

    async fn join(
        &self,
        room_reference: &str,
        token: &str,
        call_type: CallType,
    ) -> Result<(), MediaError>;

    async fn leave(&self, room_reference: &str) -> Result<(), MediaError>;

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}
