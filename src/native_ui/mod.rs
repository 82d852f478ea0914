//! Native Call UI Bridge
//!
//! Optionale Anbindung an eine Anruf-Oberfläche des Betriebssystems.
//! Alle Aufrufe sind best effort: die App-eigene Anzeige funktioniert
//! auch ohne Bridge vollständig.

use crate::model::CallType;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Native call UI unavailable")]
    Unavailable,

    #[error("Native call UI error: {0}")]
    Platform(String),
}

/// OS-Anruf-Oberfläche
pub trait CallUiBridge: Send + Sync {
    fn report_incoming(
        &self,
        call_id: &str,
        caller_name: &str,
        call_type: CallType,
    ) -> Result<(), BridgeError>;

    fn report_connected(&self, call_id: &str) -> Result<(), BridgeError>;

    fn end_call(&self, call_id: &str) -> Result<(), BridgeError>;
}

/// Plattform ohne native Anruf-Oberfläche
#[derive(Debug, Default)]
pub struct NoopCallUi;

impl CallUiBridge for NoopCallUi {
    fn report_incoming(
        &self,
        _call_id: &str,
        _caller_name: &str,
        _call_type: CallType,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    fn report_connected(&self, _call_id: &str) -> Result<(), BridgeError> {
        Ok(())
    }

    fn end_call(&self, _call_id: &str) -> Result<(), BridgeError> {
        Ok(())
    }
}
