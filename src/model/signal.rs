//! Call Signals
//!
//! Kleine Signalisierungs-Nachrichten pro Anruf. Werden nur als
//! Ausweichpfad genutzt, um die `room_reference` zu liefern, falls der
//! eigentliche Session-Datensatz noch nicht sichtbar ist.

use super::session::CallType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Art des Signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
        }
    }
}

/// Nutzdaten eines Signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub room_reference: Option<String>,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub caller_name: String,
}

/// Eine Signalisierungs-Nachricht
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    pub signal_id: String,
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub signal_type: SignalType,
    pub payload: SignalPayload,
    pub created_at: DateTime<Utc>,
}

impl CallSignal {
    /// Erstellt ein `offer`-Signal für einen neuen Anruf
    pub fn offer(
        call_id: &str,
        from_user_id: &str,
        to_user_id: &str,
        payload: SignalPayload,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            signal_type: SignalType::Offer,
            payload,
            created_at: Utc::now(),
        }
    }
}
