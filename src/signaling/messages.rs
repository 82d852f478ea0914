//! Wake Payloads
//!
//! Nutzdaten der Wake-Push Nachrichten. Das Format entspricht dem, was
//! der Push-Dienst als `data`-Objekt zustellt.

use crate::model::{CallSession, CallType};
use serde::{Deserialize, Serialize};

/// Push-Nutzdaten für den Wake-Pfad
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WakePayload {
    /// Neuer Anruf (minimale Identität der CallSession)
    IncomingCall {
        call_id: String,
        caller_id: String,
        caller_name: String,
        call_type: CallType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_reference: Option<String>,
    },

    /// Anrufer hat beendet, bevor angenommen wurde
    CallEnded { call_id: String },
}

impl WakePayload {
    pub fn incoming(session: &CallSession) -> Self {
        WakePayload::IncomingCall {
            call_id: session.call_id.clone(),
            caller_id: session.caller_id.clone(),
            caller_name: session.caller_name.clone(),
            call_type: session.call_type,
            room_reference: session.room_reference.clone(),
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            WakePayload::IncomingCall { call_id, .. } | WakePayload::CallEnded { call_id } => {
                call_id
            }
        }
    }

    /// Parst das `data`-Objekt einer Push-Nachricht
    pub fn from_data(data: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_incoming_call_wire_format() {
        let session = CallSession::outgoing(
            "c1".to_string(),
            "alice".to_string(),
            "bob".to_string(),
            CallType::Voice,
            "Alice".to_string(),
            Some("room-c1".to_string()),
        );

        let json = serde_json::to_value(WakePayload::incoming(&session)).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "incoming_call",
                "call_id": "c1",
                "caller_id": "alice",
                "caller_name": "Alice",
                "call_type": "voice",
                "room_reference": "room-c1",
            })
        );
    }

    #[test]
    fn test_parse_push_data() {
        let data = json!({
            "type": "incoming_call",
            "call_id": "c2",
            "caller_id": "alice",
            "caller_name": "Alice",
            "call_type": "audio",
        });
        let payload = WakePayload::from_data(&data).unwrap();
        assert_eq!(payload.call_id(), "c2");
        assert!(matches!(
            payload,
            WakePayload::IncomingCall {
                call_type: CallType::Voice,
                room_reference: None,
                ..
            }
        ));

        let ended = WakePayload::from_data(&json!({"type": "call_ended", "call_id": "c2"})).unwrap();
        assert_eq!(ended, WakePayload::CallEnded { call_id: "c2".to_string() });

        assert!(WakePayload::from_data(&json!({"type": "chat_message"})).is_err());
    }
}
