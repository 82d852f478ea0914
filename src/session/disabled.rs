//! No-op Orchestrator für Builds/Konfigurationen ohne Anruffunktion

use super::api::{CallError, CallOrchestrator, IncomingDisposition};
use super::state::{CallEvent, CallSnapshot};
use crate::model::{CallSession, CallStatus, CallType};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Gleiche API wie `CallManager`, jede Aktion wird abgelehnt
pub struct DisabledCalls {
    event_tx: broadcast::Sender<CallEvent>,
}

impl DisabledCalls {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1);
        Self { event_tx }
    }
}

impl Default for DisabledCalls {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallOrchestrator for DisabledCalls {
    async fn start_outgoing(
        &self,
        _peer_id: &str,
        _call_type: CallType,
    ) -> Result<CallSnapshot, CallError> {
        Err(CallError::Disabled)
    }

    async fn receive_incoming(&self, session: CallSession) -> IncomingDisposition {
        tracing::debug!(call_id = %session.call_id, "Calling disabled, ignoring incoming call");
        IncomingDisposition::Disabled
    }

    async fn answer(&self) -> Result<CallSnapshot, CallError> {
        Err(CallError::Disabled)
    }

    async fn reject(&self) -> Result<(), CallError> {
        Err(CallError::Disabled)
    }

    async fn hangup(&self) -> Result<(), CallError> {
        Ok(())
    }

    async fn on_remote_terminated(&self, _call_id: &str, _status: CallStatus) {}

    async fn on_room_resolved(&self, _call_id: &str, _room_reference: &str) {}

    fn set_speaker(&self, _enabled: bool) -> Result<(), CallError> {
        Err(CallError::Disabled)
    }

    async fn set_muted(&self, _muted: bool) -> Result<(), CallError> {
        Err(CallError::Disabled)
    }

    async fn set_camera_enabled(&self, _enabled: bool) -> Result<(), CallError> {
        Err(CallError::Disabled)
    }

    fn snapshot(&self) -> Option<CallSnapshot> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn shutdown(&self) {}
}
