//! Call Session Record
//!
//! Der gemeinsam genutzte Datensatz eines Anrufs zwischen zwei Benutzern.
//! Wird vom Anrufer angelegt und danach von beiden Seiten gelesen und
//! beendet. Status-Übergänge sind monoton: ein terminaler Status wird
//! nie wieder verlassen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown call status: {0}")]
    UnknownStatus(String),

    #[error("Unknown call type: {0}")]
    UnknownCallType(String),
}

// ============================================================================
// CALL TYPE
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[serde(alias = "audio")]
    Voice,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" | "audio" => Ok(CallType::Voice),
            "video" => Ok(CallType::Video),
            other => Err(ParseError::UnknownCallType(other.to_string())),
        }
    }
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Status des gemeinsamen Datensatzes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
    Rejected,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
            CallStatus::Missed => "missed",
        }
    }

    /// `ended`, `rejected` und `missed` sind endgültig
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed
        )
    }

    /// Rang für den Monotonie-Vergleich (alle terminalen Werte teilen sich den höchsten Rang)
    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::Ringing => 0,
            CallStatus::Connected => 1,
            CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed => 2,
        }
    }

    /// Prüft ob der Übergang `self -> next` erlaubt ist.
    ///
    /// Ein terminaler Status erlaubt keinen weiteren Übergang, auch nicht
    /// zu einem anderen terminalen Wert (der erste Schreiber gewinnt).
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(CallStatus::Ringing),
            "connected" => Ok(CallStatus::Connected),
            "ended" => Ok(CallStatus::Ended),
            "rejected" => Ok(CallStatus::Rejected),
            "missed" => Ok(CallStatus::Missed),
            other => Err(ParseError::UnknownStatus(other.to_string())),
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anruf zwischen zwei Benutzern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
    pub caller_name: String,
    pub room_reference: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Neuer ausgehender Anruf im Status `ringing`
    pub fn outgoing(
        call_id: String,
        caller_id: String,
        callee_id: String,
        call_type: CallType,
        caller_name: String,
        room_reference: Option<String>,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            callee_id,
            call_type,
            status: CallStatus::Ringing,
            caller_name,
            room_reference,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Gibt die ID der Gegenseite aus Sicht von `user_id` zurück
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}
