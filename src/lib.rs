//! Call Core - Anruf-Orchestrierung für Peer-to-Peer Sprach- und Videoanrufe
//!
//! Zwei Geräte teilen sich einen Datenspeicher (`store`). Die Media-
//! Übertragung selbst liegt in einem externen Dienst (`media`). Dieses
//! Crate hält den Anrufzustand pro Gerät konsistent:
//! - Zustellung eingehender Anrufe über Change-Stream und Wake-Push
//! - Exklusive Audio-Session und Earpiece-Routing
//! - Ring-Timeout, Beendigung durch die Gegenseite, Aufräumen
//!
//! Einstieg ist `CallService::start` bzw. `build_orchestrator`.

pub mod audio;
pub mod config;
pub mod media;
pub mod model;
pub mod native_ui;
pub mod notify;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod store;


#[cfg(test)]
mod testing;

pub use config::CallConfig;
pub use session::{
    build_orchestrator, CallDeps, CallError, CallEvent, CallOrchestrator, CallSnapshot, CallState,
    IncomingDisposition,
};

use anyhow::{Context, Result};
use notify::{NotificationAction, NotificationResponse, WakeDispatcher};
use parking_lot::Mutex;
use presence::PresenceTracker;
use signaling::{SignalingChannel, SignalingEvent, WakeOutcome, WakePayload};
use std::sync::Arc;
use store::{CallStore, SqliteCallStore};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing_subscriber::EnvFilter;

// ============================================================================
// CALL SERVICE
// ============================================================================

/// Verdrahtet Signaling Channel, Presence-Heartbeat und Orchestrator
pub struct CallService {
    user_id: String,
    store: Arc<dyn CallStore>,
    calls: Arc<dyn CallOrchestrator>,
    channel: SignalingChannel,
    dispatcher: WakeDispatcher,
    background: CancellationToken,
    /// Bricht `background` ab, wenn der Service verworfen wird
    _background_guard: DropGuard,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl CallService {
    /// Initialisiert das Logging (`RUST_LOG` hat Vorrang vor dem Default)
    pub fn init_logging() {
        let mut filter = EnvFilter::from_default_env();
        if let Ok(directive) = "callcore=debug".parse() {
            filter = filter.add_directive(directive);
        }

        // Host-App hat eventuell schon einen Subscriber gesetzt
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Öffnet die SQLite-Datenbank am konfigurierten Pfad
    pub fn open_store(config: &CallConfig) -> Result<Arc<SqliteCallStore>> {
        let path = config.database_path()?;
        let store = SqliteCallStore::open(&path)
            .with_context(|| format!("Failed to open call database {:?}", path))?;
        Ok(Arc::new(store))
    }

    /// Startet das Subsystem. Muss innerhalb einer Tokio-Runtime laufen.
    pub fn start(config: CallConfig, deps: CallDeps) -> Result<Self> {
        anyhow::ensure!(!deps.user_id.trim().is_empty(), "User id must not be empty");
        config.validate()?;

        tracing::info!(user_id = %deps.user_id, enabled = config.enabled, "Starting call service");

        let calls = build_orchestrator(&config, deps.clone());
        let channel = SignalingChannel::new(
            deps.user_id.clone(),
            Arc::clone(&deps.store),
            config.room_retry_attempts,
            config.room_retry_delay(),
        );
        let dispatcher = WakeDispatcher::new(
            Arc::clone(&deps.push),
            Arc::clone(&deps.alerter),
            config.ring_timeout(),
        );
        let background = CancellationToken::new();
        let mut heartbeat = None;

        if calls.is_enabled() {
            // Event Handler vor dem Stream starten
            let mut event_rx = channel.subscribe();
            let handler_calls = Arc::clone(&calls);
            let token = background.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = event_rx.recv() => match event {
                            Ok(event) => handle_signaling_event(event, handler_calls.as_ref()).await,
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "Signaling events lagged");
                            }
                            Err(RecvError::Closed) => break,
                        },
                        _ = token.cancelled() => break,
                    }
                }
                tracing::debug!("Signaling event handler stopped");
            });

            channel.start();

            let presence = PresenceTracker::new(
                Arc::clone(&deps.presence),
                config.presence_online_window(),
            );
            heartbeat = Some(presence.start_heartbeat(deps.user_id.clone(), config.heartbeat_interval()));
        }

        Ok(Self {
            user_id: deps.user_id,
            store: deps.store,
            calls,
            channel,
            dispatcher,
            _background_guard: background.clone().drop_guard(),
            background,
            heartbeat: Mutex::new(heartbeat),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn calls(&self) -> Arc<dyn CallOrchestrator> {
        Arc::clone(&self.calls)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    /// Nutzdaten eines Wake-Push (App aus dem Hintergrund gestartet)
    pub async fn handle_wake(&self, data: &serde_json::Value) -> Result<WakeOutcome> {
        if !self.calls.is_enabled() {
            tracing::debug!("Calling disabled, ignoring wake payload");
            return Ok(WakeOutcome::Unknown);
        }

        let payload = WakePayload::from_data(data).context("Invalid wake payload")?;
        Ok(self.channel.handle_wake(payload).await)
    }

    /// Antwort auf eine Anruf-Benachrichtigung (Annehmen/Ablehnen/Tippen).
    ///
    /// Handelt nur, wenn der Datensatz noch klingelt. Liefert den
    /// Snapshot nach dem Annehmen.
    pub async fn handle_notification_response(
        &self,
        action_id: Option<&str>,
        data: &serde_json::Value,
    ) -> Result<Option<CallSnapshot>, CallError> {
        if !self.calls.is_enabled() {
            return Err(CallError::Disabled);
        }
        let Some(response) = NotificationResponse::parse(action_id, data) else {
            tracing::debug!("Notification response without call payload");
            return Ok(None);
        };
        let Some(session) = self
            .dispatcher
            .validate_response(self.store.as_ref(), &response)
            .await
        else {
            return Ok(None);
        };

        match self.calls.receive_incoming(session).await {
            IncomingDisposition::Surfaced | IncomingDisposition::Duplicate => {}
            other => {
                tracing::info!(call_id = %response.call_id, disposition = ?other, "Notification response for call that cannot be shown");
                return Ok(None);
            }
        }

        match response.action {
            NotificationAction::Answer => self.calls.answer().await.map(Some),
            NotificationAction::Decline => self.calls.reject().await.map(|_| None),
        }
    }

    /// Beendet laufende Anrufe und alle Hintergrund-Tasks
    pub async fn shutdown(&self) {
        self.channel.stop();
        self.background.cancel();
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        self.calls.shutdown().await;
        tracing::info!(user_id = %self.user_id, "Call service stopped");
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("user_id", &self.user_id)
            .field("enabled", &self.calls.is_enabled())
            .field("channel", &self.channel)
            .finish()
    }
}

/// Verarbeitet Signaling Events
async fn handle_signaling_event(event: SignalingEvent, calls: &dyn CallOrchestrator) {
    match event {
        SignalingEvent::IncomingCall(session) => {
            let call_id = session.call_id.clone();
            let disposition = calls.receive_incoming(session).await;
            tracing::debug!(call_id = %call_id, ?disposition, "Incoming call handled");
        }
        SignalingEvent::RemoteTerminated { call_id, status } => {
            calls.on_remote_terminated(&call_id, status).await;
        }
        SignalingEvent::RoomResolved {
            call_id,
            room_reference,
        } => {
            calls.on_room_resolved(&call_id, &room_reference).await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
