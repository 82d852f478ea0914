//! Wake Dispatcher
//!
//! Versendet die kurzlebige Wake-Push beim ausgehenden Anruf und prüft
//! Antworten auf Benachrichtigungen gegen den maßgeblichen Datensatz,
//! bevor irgendetwas passiert.

use crate::model::{CallSession, CallStatus};
use crate::signaling::WakePayload;
use crate::store::CallStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Push delivery failed: {0}")]
    Delivery(String),

    #[error("Push service unavailable")]
    Unavailable,
}

// ============================================================================
// COLLABORATORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPriority {
    High,
    Normal,
}

/// Ausgehende Push-Nachricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub to_user_id: String,
    pub payload: WakePayload,
    pub ttl: Duration,
    pub priority: PushPriority,
}

/// Externer Push-Dienst
#[async_trait]
pub trait PushService: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), PushError>;
}

/// Lokaler Klingelton / Vibration
pub trait Alerter: Send + Sync {
    fn start_alert(&self, call_id: &str);
    fn cancel_alert(&self, call_id: &str);
}

#[derive(Debug, Default)]
pub struct NoopAlerter;

impl Alerter for NoopAlerter {
    fn start_alert(&self, _call_id: &str) {}
    fn cancel_alert(&self, _call_id: &str) {}
}

// ============================================================================
// NOTIFICATION RESPONSES
// ============================================================================

/// Aktion aus einer Benachrichtigung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    Answer,
    Decline,
}

impl NotificationAction {
    /// `ANSWER`, `DECLINE`; alles andere (einfaches Antippen) zählt als Annehmen
    pub fn from_action_id(action_id: Option<&str>) -> Self {
        match action_id {
            Some("DECLINE") => NotificationAction::Decline,
            _ => NotificationAction::Answer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationResponse {
    pub call_id: String,
    pub action: NotificationAction,
}

impl NotificationResponse {
    /// Parst Aktion und `data`-Objekt. `None` wenn es keine Anruf-Benachrichtigung ist.
    pub fn parse(action_id: Option<&str>, data: &serde_json::Value) -> Option<Self> {
        let call_id = match WakePayload::from_data(data) {
            Ok(WakePayload::IncomingCall { call_id, .. }) => call_id,
            Ok(WakePayload::CallEnded { .. }) => return None,
            Err(_) => data.get("call_id")?.as_str()?.to_string(),
        };

        Some(Self {
            call_id,
            action: NotificationAction::from_action_id(action_id),
        })
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Wake-Push Versand und Validierung von Benachrichtigungs-Antworten
pub struct WakeDispatcher {
    push: Arc<dyn PushService>,
    alerter: Arc<dyn Alerter>,
    ttl: Duration,
}

impl WakeDispatcher {
    pub fn new(push: Arc<dyn PushService>, alerter: Arc<dyn Alerter>, ttl: Duration) -> Self {
        Self { push, alerter, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wake-Push für einen neuen Anruf. Best effort: Fehler werden nur geloggt.
    pub async fn dispatch_incoming(&self, session: &CallSession) -> bool {
        let message = PushMessage {
            to_user_id: session.callee_id.clone(),
            payload: WakePayload::incoming(session),
            ttl: self.ttl,
            priority: PushPriority::High,
        };
        self.send(message).await
    }

    /// Nachricht an den Angerufenen, dass der Anruf nicht mehr klingelt
    pub async fn dispatch_ended(&self, to_user_id: &str, call_id: &str) -> bool {
        let message = PushMessage {
            to_user_id: to_user_id.to_string(),
            payload: WakePayload::CallEnded {
                call_id: call_id.to_string(),
            },
            ttl: self.ttl,
            priority: PushPriority::High,
        };
        self.send(message).await
    }

    async fn send(&self, message: PushMessage) -> bool {
        match self.push.send(&message).await {
            Ok(()) => {
                tracing::debug!(
                    call_id = %message.payload.call_id(),
                    to = %message.to_user_id,
                    "Wake push dispatched"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    call_id = %message.payload.call_id(),
                    to = %message.to_user_id,
                    "Wake push failed: {}",
                    e
                );
                false
            }
        }
    }

    /// Liefert den Datensatz nur, wenn er noch klingelt. Sonst wird der Alarm beendet.
    pub async fn validate_response(
        &self,
        store: &dyn CallStore,
        response: &NotificationResponse,
    ) -> Option<CallSession> {
        let call_id = response.call_id.as_str();
        match store.fetch_session(call_id).await {
            Ok(Some(session)) if session.status == CallStatus::Ringing => Some(session),
            Ok(Some(session)) => {
                tracing::info!(call_id, status = %session.status, "Ignoring response for stale call");
                self.cancel_alert(call_id);
                None
            }
            Ok(None) => {
                tracing::info!(call_id, "Ignoring response for unknown call");
                self.cancel_alert(call_id);
                None
            }
            Err(e) => {
                tracing::warn!(call_id, "Failed to validate notification response: {}", e);
                None
            }
        }
    }

    pub fn start_alert(&self, call_id: &str) {
        self.alerter.start_alert(call_id);
    }

    pub fn cancel_alert(&self, call_id: &str) {
        self.alerter.cancel_alert(call_id);
    }
}

impl std::fmt::Debug for WakeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeDispatcher")
            .field("ttl", &self.ttl)
            .finish()
    }
}
