//! Öffentliche Anruf-API
//!
//! `CallOrchestrator` ist die einzige Schnittstelle für Aufrufer.
//! `build_orchestrator` liefert je nach Feature-Flag die echte
//! Implementierung oder eine No-op Variante mit identischer API.

use super::disabled::DisabledCalls;
use super::manager::{CallManager, CallTimings};
use super::state::{CallEvent, CallSnapshot};
use crate::audio::{AudioModeCoordinator, AudioRoutePlatform};
use crate::config::CallConfig;
use crate::media::MediaEngine;
use crate::model::{CallSession, CallStatus, CallType};
use crate::native_ui::CallUiBridge;
use crate::notify::{Alerter, PushService};
use crate::store::{CallStore, PresenceSource};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler der öffentlichen API. Der Anrufzustand enthält zusätzlich den Grund.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Invalid call state: {0}")]
    InvalidState(&'static str),

    #[error("Call has already ended")]
    CallEnded,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Calling is disabled")]
    Disabled,

    #[error("Invalid peer: {0}")]
    InvalidPeer(String),
}

/// Was mit einem eingehenden Anruf passiert ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDisposition {
    /// Anruf wird angezeigt
    Surfaced,
    /// Gleicher Anruf ist bereits bekannt
    Duplicate,
    /// Anruf wurde lokal bereits beendet
    AlreadyFinished,
    /// Maßgeblicher Datensatz klingelt nicht mehr
    Stale(CallStatus),
    /// Es läuft bereits ein anderer Anruf
    Busy,
    NotForUs,
    /// Datensatz konnte nicht gelesen werden
    Unverified,
    Disabled,
}

// ============================================================================
// ORCHESTRATOR TRAIT
// ============================================================================

#[async_trait]
pub trait CallOrchestrator: Send + Sync {
    /// Ausgehender Anruf. Liefert den Zustand nach `ringing`.
    async fn start_outgoing(
        &self,
        peer_id: &str,
        call_type: CallType,
    ) -> Result<CallSnapshot, CallError>;

    /// Eingehender Anruf aus Stream oder Wake-Pfad
    async fn receive_incoming(&self, session: CallSession) -> IncomingDisposition;

    /// Nimmt den klingelnden Anruf an. `connected` folgt über die Media Engine.
    async fn answer(&self) -> Result<CallSnapshot, CallError>;

    async fn reject(&self) -> Result<(), CallError>;

    /// Idempotent: ohne laufenden Anruf ein No-op
    async fn hangup(&self) -> Result<(), CallError>;

    async fn on_remote_terminated(&self, call_id: &str, status: CallStatus);

    async fn on_room_resolved(&self, call_id: &str, room_reference: &str);

    fn set_speaker(&self, enabled: bool) -> Result<(), CallError>;

    async fn set_muted(&self, muted: bool) -> Result<(), CallError>;

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError>;

    /// Aktueller (oder letzter) Anruf
    fn snapshot(&self) -> Option<CallSnapshot>;

    fn subscribe(&self) -> broadcast::Receiver<CallEvent>;

    fn is_enabled(&self) -> bool;

    /// Beendet einen laufenden Anruf und alle Hintergrund-Tasks
    async fn shutdown(&self);
}

// ============================================================================
// FACTORY
// ============================================================================

/// Externe Abhängigkeiten des Orchestrators
#[derive(Clone)]
pub struct CallDeps {
    pub user_id: String,
    pub display_name: String,
    pub store: Arc<dyn CallStore>,
    pub presence: Arc<dyn PresenceSource>,
    pub media: Arc<dyn MediaEngine>,
    pub push: Arc<dyn PushService>,
    pub audio_route: Arc<dyn AudioRoutePlatform>,
    /// Prozessweit geteilt mit anderen Audio-Verbrauchern
    pub audio_modes: AudioModeCoordinator,
    pub alerter: Arc<dyn Alerter>,
    pub ui_bridge: Arc<dyn CallUiBridge>,
}

/// Echte Implementierung oder No-op, je nach `config.enabled`
pub fn build_orchestrator(config: &CallConfig, deps: CallDeps) -> Arc<dyn CallOrchestrator> {
    if !config.enabled {
        tracing::info!("Calling disabled by configuration");
        return Arc::new(DisabledCalls::new());
    }

    Arc::new(CallManager::new(CallTimings::from(config), deps))
}
