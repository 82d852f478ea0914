//! Call State
//!
//! Lokaler Zustand eines Anrufs auf diesem Gerät. Unabhängig vom
//! gemeinsamen `CallStatus` des Datensatzes: `Idle -> Connecting ->
//! {Ringing | Connected} -> {Ended | Failed}`. `Ended` und `Failed`
//! sind endgültig.

use crate::audio::AudioOutput;
use crate::model::{CallStatus, CallType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// CALL STATE
// ============================================================================

/// Grund für ein reguläres Ende
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Lokal aufgelegt
    LocalHangup,
    /// Lokal abgelehnt
    Declined,
    /// Niemand hat innerhalb des Ring-Timeouts angenommen (Anrufer)
    NoAnswer,
    /// Eingehender Anruf ist abgelaufen (Angerufener)
    Missed,
    RemoteEnded,
    RemoteRejected,
    RemoteMissed,
    /// Gegenseite hat den Room verlassen
    PeerLeft,
    /// Dienst wurde heruntergefahren
    Teardown,
}

impl EndReason {
    pub fn from_remote(status: CallStatus) -> Self {
        match status {
            CallStatus::Rejected => EndReason::RemoteRejected,
            CallStatus::Missed => EndReason::RemoteMissed,
            _ => EndReason::RemoteEnded,
        }
    }

    /// Anzeigetext (leer bedeutet: still beenden)
    pub fn message(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "Call ended",
            EndReason::Declined => "Call declined",
            EndReason::NoAnswer => "No answer",
            EndReason::Missed => "Missed call",
            EndReason::RemoteEnded => "Call ended",
            EndReason::RemoteRejected => "Call declined",
            EndReason::RemoteMissed => "Missed call",
            EndReason::PeerLeft => "Call ended",
            EndReason::Teardown => "",
        }
    }
}

/// Art eines Fehlschlags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PermissionDenied,
    NetworkFailure,
    ResourceConflict,
}

/// Lokaler Anrufzustand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Connecting,
    Ringing,
    Connected,
    Ended { reason: EndReason },
    Failed { kind: FailureKind, reason: String },
}

impl CallState {
    /// Rang für idempotente Event-Anwendung
    pub fn rank(&self) -> u8 {
        match self {
            CallState::Idle => 0,
            CallState::Connecting => 1,
            CallState::Ringing => 2,
            CallState::Connected => 3,
            CallState::Ended { .. } | CallState::Failed { .. } => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended { .. } | CallState::Failed { .. })
    }

    /// Ob `self -> next` erlaubt ist.
    ///
    /// Terminal ist endgültig, jeder andere Zustand darf terminal werden.
    /// `Ringing -> Connecting` ist der einzige Rückschritt (Annehmen).
    pub fn can_advance_to(&self, next: &CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (CallState::Idle, CallState::Connecting)
                | (CallState::Idle, CallState::Ringing)
                | (CallState::Connecting, CallState::Ringing)
                | (CallState::Connecting, CallState::Connected)
                | (CallState::Ringing, CallState::Connecting)
                | (CallState::Ringing, CallState::Connected)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Ended { .. } => "ended",
            CallState::Failed { .. } => "failed",
        }
    }

    /// Begründung für die Anzeige
    pub fn reason(&self) -> Option<String> {
        match self {
            CallState::Ended { reason } if !reason.message().is_empty() => {
                Some(reason.message().to_string())
            }
            CallState::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }
}

// ============================================================================
// SNAPSHOT & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Beobachtbarer Zustand des aktuellen (oder letzten) Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub peer_id: String,
    pub peer_name: String,
    pub direction: Direction,
    pub call_type: CallType,
    pub state: CallState,
    pub reason: Option<String>,
    pub audio_output: AudioOutput,
    pub muted: bool,
    pub camera_enabled: bool,
    /// Nicht-blockierender Hinweis (z.B. "appears offline")
    pub advisory: Option<String>,
    pub connected_for: Option<Duration>,
}

/// Events die vom Orchestrator ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallSnapshot),
    /// Eingehender Anruf soll angezeigt werden
    Incoming(CallSnapshot),
    Advisory { call_id: String, message: String },
    Error { call_id: String, message: String },
}
