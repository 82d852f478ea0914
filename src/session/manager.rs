//! Call Manager
//!
//! Zustandsmaschine für genau einen Anruf pro Gerät. Alle Übergänge
//! laufen über `transition`/`finish` und sind rang-geprüft: ein Event,
//! das einen terminalen Zustand verlassen würde, wird verworfen.
//!
//! Jede asynchrone Fortsetzung prüft vor dem Anwenden ihres Ergebnisses,
//! ob die `call_id` noch der aktive, nicht-terminale Anruf ist.

use super::api::{CallDeps, CallError, CallOrchestrator, IncomingDisposition};
use super::state::{CallEvent, CallSnapshot, CallState, Direction, EndReason, FailureKind};
use crate::audio::{AudioOutput, AudioRouteCoordinator, LeaseError};
use crate::config::CallConfig;
use crate::media::{MediaEngine, MediaError, MediaEvent, MediaSession, MediaSessionManager};
use crate::model::{CallSession, CallSignal, CallStatus, CallType, SignalPayload};
use crate::native_ui::CallUiBridge;
use crate::notify::WakeDispatcher;
use crate::presence::PresenceTracker;
use crate::store::{CallStore, ChangeFilter, ChangeSubscription, StatusWrite, StoreChange, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const PERMISSION_MESSAGE: &str =
    "Microphone or camera access was denied. Enable it in the system settings and try again.";
const NETWORK_MESSAGE: &str = "Could not connect the call. Check your connection and try again.";
const ROOM_MESSAGE: &str = "The call could not be joined. Please try again.";
const BUSY_MESSAGE: &str = "A call with this contact is already in progress.";
const AUDIO_MESSAGE: &str = "Audio is unavailable right now.";

// ============================================================================
// TIMINGS
// ============================================================================

/// Zeitparameter des Call Managers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTimings {
    pub ring_timeout: Duration,
    pub incoming_expiry: Duration,
    pub route_enforce_interval: Duration,
    pub presence_online_window: Duration,
    pub finished_call_memory: usize,
}

impl From<&CallConfig> for CallTimings {
    fn from(config: &CallConfig) -> Self {
        Self {
            ring_timeout: config.ring_timeout(),
            incoming_expiry: config.incoming_expiry(),
            route_enforce_interval: config.route_enforce_interval(),
            presence_online_window: config.presence_online_window(),
            finished_call_memory: config.finished_call_memory,
        }
    }
}

impl Default for CallTimings {
    fn default() -> Self {
        Self::from(&CallConfig::default())
    }
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

struct ActiveCall {
    call_id: String,
    peer_id: String,
    peer_name: String,
    direction: Direction,
    call_type: CallType,
    room_reference: Option<String>,
    state: CallState,
    /// Gemeinsamer Datensatz wurde geschrieben
    persisted: bool,
    media: Option<Arc<MediaSession>>,
    /// Change-Stream Watcher und Media-Event Pumpe
    cancel: CancellationToken,
    /// Kind von `cancel`
    ring_timer: Option<CancellationToken>,
    muted: bool,
    camera_enabled: bool,
    advisory: Option<String>,
    connected_at: Option<Instant>,
    ended_at: Option<Instant>,
}

impl ActiveCall {
    fn new(
        call_id: String,
        peer_id: String,
        peer_name: String,
        direction: Direction,
        call_type: CallType,
        room_reference: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            call_id,
            peer_id,
            peer_name,
            direction,
            call_type,
            room_reference,
            state: CallState::Idle,
            persisted: direction == Direction::Incoming,
            media: None,
            cancel,
            ring_timer: None,
            muted: false,
            camera_enabled: call_type == CallType::Video,
            advisory: None,
            connected_at: None,
            ended_at: None,
        }
    }

    fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Zuletzt beendete `call_id`s (FIFO)
struct FinishedCalls {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl FinishedCalls {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, call_id: &str) -> bool {
        self.ids.contains(call_id)
    }

    fn insert(&mut self, call_id: &str) {
        if !self.ids.insert(call_id.to_string()) {
            return;
        }
        self.order.push_back(call_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Bedingung für `finish`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishGuard {
    Any,
    /// Nur solange nicht verbunden (Ring-Timeout)
    Unanswered,
    /// Nur solange es klingelt (eingehender Anruf läuft ab)
    StillRinging,
    /// Nur im verbundenen Zustand
    WhileConnected,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    RingTimeout,
    IncomingExpiry,
}

struct Inner {
    user_id: String,
    display_name: String,
    timings: CallTimings,
    store: Arc<dyn CallStore>,
    presence: PresenceTracker,
    media: Arc<dyn MediaEngine>,
    media_sessions: MediaSessionManager,
    audio_route: AudioRouteCoordinator,
    dispatcher: WakeDispatcher,
    ui_bridge: Arc<dyn CallUiBridge>,
    /// Wurzel aller Anruf-Tokens; `shutdown` bricht alles ab
    root: CancellationToken,
    slot: Mutex<Option<ActiveCall>>,
    finished: Mutex<FinishedCalls>,
    event_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CALL MANAGER
// ============================================================================

/// Live-Implementierung von `CallOrchestrator`
pub struct CallManager {
    inner: Arc<Inner>,
}

impl CallManager {
    pub fn new(timings: CallTimings, deps: CallDeps) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        let inner = Inner {
            presence: PresenceTracker::new(deps.presence, timings.presence_online_window),
            media_sessions: MediaSessionManager::new(Arc::clone(&deps.media), deps.audio_modes),
            audio_route: AudioRouteCoordinator::new(deps.audio_route, timings.route_enforce_interval),
            dispatcher: WakeDispatcher::new(deps.push, deps.alerter, timings.ring_timeout),
            finished: Mutex::new(FinishedCalls::new(timings.finished_call_memory)),
            user_id: deps.user_id,
            display_name: deps.display_name,
            store: deps.store,
            media: deps.media,
            ui_bridge: deps.ui_bridge,
            root: CancellationToken::new(),
            slot: Mutex::new(None),
            event_tx,
            timings,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("user_id", &self.inner.user_id)
            .field("snapshot", &self.inner.snapshot())
            .finish()
    }
}

#[async_trait]
impl CallOrchestrator for CallManager {
    async fn start_outgoing(
        &self,
        peer_id: &str,
        call_type: CallType,
    ) -> Result<CallSnapshot, CallError> {
        self.inner.start_outgoing(peer_id, call_type).await
    }

    async fn receive_incoming(&self, session: CallSession) -> IncomingDisposition {
        self.inner.receive_incoming(session).await
    }

    async fn answer(&self) -> Result<CallSnapshot, CallError> {
        self.inner.answer().await
    }

    async fn reject(&self) -> Result<(), CallError> {
        self.inner.reject().await
    }

    async fn hangup(&self) -> Result<(), CallError> {
        self.inner.hangup().await
    }

    async fn on_remote_terminated(&self, call_id: &str, status: CallStatus) {
        self.inner.on_remote_terminated(call_id, status).await
    }

    async fn on_room_resolved(&self, call_id: &str, room_reference: &str) {
        self.inner.on_room_resolved(call_id, room_reference)
    }

    fn set_speaker(&self, enabled: bool) -> Result<(), CallError> {
        self.inner.set_speaker(enabled)
    }

    async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.inner.set_muted(muted).await
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.inner.set_camera_enabled(enabled).await
    }

    fn snapshot(&self) -> Option<CallSnapshot> {
        self.inner.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

// ============================================================================
// PUBLIC OPERATIONS
// ============================================================================

impl Inner {
    async fn start_outgoing(
        self: &Arc<Self>,
        peer_id: &str,
        call_type: CallType,
    ) -> Result<CallSnapshot, CallError> {
        let peer_id = peer_id.trim();
        if peer_id.is_empty() || peer_id == self.user_id {
            return Err(CallError::InvalidPeer(peer_id.to_string()));
        }
        if self.live_call_id().is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let call_id = Uuid::new_v4().to_string();
        let media = match self.media_sessions.begin(&call_id) {
            Ok(media) => media,
            Err(LeaseError::Busy { owner, .. }) => {
                tracing::info!(owner = %owner, "Audio session busy, refusing outgoing call");
                return Err(CallError::AlreadyInCall);
            }
            Err(LeaseError::Activation(detail)) => {
                tracing::warn!("Audio session activation failed: {}", detail);
                return Err(CallError::PermissionDenied(detail));
            }
        };

        let installed = {
            let mut slot = self.slot.lock();
            if slot.as_ref().is_some_and(ActiveCall::is_live) {
                false
            } else {
                let mut call = ActiveCall::new(
                    call_id.clone(),
                    peer_id.to_string(),
                    peer_id.to_string(),
                    Direction::Outgoing,
                    call_type,
                    None,
                    self.root.child_token(),
                );
                call.media = Some(Arc::clone(&media));
                *slot = Some(call);
                self.audio_route.prepare_call();
                self.audio_route.begin_call();
                true
            }
        };
        if !installed {
            media.release().await;
            return Err(CallError::AlreadyInCall);
        }

        tracing::info!(call_id = %call_id, peer_id, %call_type, "Starting outgoing call");
        self.transition(&call_id, CallState::Connecting);

        // Presence blockiert nie, sie liefert höchstens einen Hinweis
        let presence = self.presence.refresh(peer_id).await;
        let peer_name = self.resolve_name(peer_id).await;
        let advisory = (!presence.is_online).then(|| format!("{peer_name} appears offline"));
        {
            let mut slot = self.slot.lock();
            if let Some(call) = Self::live_mut(&mut slot, &call_id) {
                call.peer_name = peer_name;
                call.advisory = advisory.clone();
            }
        }
        if let Some(message) = advisory {
            self.emit(CallEvent::Advisory {
                call_id: call_id.clone(),
                message,
            });
        }
        self.ensure_live(&call_id)?;

        if let Err(e) = self.media.ensure_permissions(call_type).await {
            return Err(self.fail(&call_id, e).await);
        }
        self.ensure_live(&call_id)?;

        // Verwaister aktiver Datensatz für dieses Paar (z.B. nach Absturz)
        match self.store.active_session_between(&self.user_id, peer_id).await {
            Ok(Some(orphan)) => {
                tracing::info!(orphan_call_id = %orphan.call_id, "Closing orphaned active call session");
                self.write_terminal(&orphan.call_id, CallStatus::Ended).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to check for active call sessions: {}", e),
        }

        let room = match self.media.create_room(&call_id, call_type).await {
            Ok(room) => room,
            Err(e) => return Err(self.fail(&call_id, e).await),
        };
        self.set_room(&call_id, &room);
        self.ensure_live(&call_id)?;

        let session = CallSession::outgoing(
            call_id.clone(),
            self.user_id.clone(),
            peer_id.to_string(),
            call_type,
            self.display_name.clone(),
            Some(room.clone()),
        );
        let watch = self.store.subscribe(ChangeFilter::Call(call_id.clone()));
        match self.store.insert_session(&session).await {
            Ok(()) => {}
            Err(StoreError::ActiveSessionExists { .. }) => {
                return Err(self
                    .fail_with(
                        &call_id,
                        FailureKind::ResourceConflict,
                        BUSY_MESSAGE,
                        CallError::AlreadyInCall,
                    )
                    .await);
            }
            Err(e) => {
                return Err(self
                    .fail_with(
                        &call_id,
                        FailureKind::NetworkFailure,
                        NETWORK_MESSAGE,
                        CallError::NetworkFailure(e.to_string()),
                    )
                    .await);
            }
        }

        if !self.mark_persisted(&call_id) {
            // Während des Schreibens aufgelegt: Datensatz nachträglich beenden
            self.write_terminal(&call_id, CallStatus::Ended).await;
            return Err(CallError::CallEnded);
        }

        let offer = CallSignal::offer(
            &call_id,
            &self.user_id,
            peer_id,
            SignalPayload {
                room_reference: Some(room.clone()),
                call_type,
                caller_name: self.display_name.clone(),
            },
        );
        if let Err(e) = self.store.insert_signal(&offer).await {
            tracing::warn!(call_id = %call_id, "Failed to insert offer signal: {}", e);
        }

        self.spawn_call_watch(&call_id, watch);
        self.spawn_media_pump(&call_id);
        self.arm_timer(&call_id, self.timings.ring_timeout, TimerKind::RingTimeout);

        self.dispatcher.dispatch_incoming(&session).await;
        self.ensure_live(&call_id)?;

        if let Err(e) = media.join(&room, &self.user_id, call_type).await {
            return Err(self.fail(&call_id, e).await);
        }
        self.ensure_live(&call_id)?;

        self.transition(&call_id, CallState::Ringing);
        self.snapshot_for(&call_id).ok_or(CallError::CallEnded)
    }

    async fn receive_incoming(self: &Arc<Self>, session: CallSession) -> IncomingDisposition {
        if session.callee_id != self.user_id {
            return IncomingDisposition::NotForUs;
        }
        let call_id = session.call_id.clone();

        if self.finished.lock().contains(&call_id) {
            tracing::debug!(call_id = %call_id, "Incoming call already finished locally");
            return IncomingDisposition::AlreadyFinished;
        }
        if self
            .slot
            .lock()
            .as_ref()
            .is_some_and(|c| c.call_id == call_id)
        {
            return IncomingDisposition::Duplicate;
        }

        // Vor dem Lesen abonnieren, damit eine Beendigung dazwischen nicht verloren geht
        let watch = self.store.subscribe(ChangeFilter::Call(call_id.clone()));
        let authoritative = match self.store.fetch_session(&call_id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                tracing::debug!(call_id = %call_id, "Incoming call not visible yet");
                return IncomingDisposition::Unverified;
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, "Failed to verify incoming call: {}", e);
                return IncomingDisposition::Unverified;
            }
        };

        if authoritative.status != CallStatus::Ringing {
            tracing::info!(call_id = %call_id, status = %authoritative.status, "Dropping stale incoming call");
            if authoritative.status.is_terminal() {
                self.remember_finished(&call_id);
            }
            self.dispatcher.cancel_alert(&call_id);
            return IncomingDisposition::Stale(authoritative.status);
        }

        let peer_name = [&session.caller_name, &authoritative.caller_name]
            .into_iter()
            .find(|name| !name.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| authoritative.caller_id.clone());
        let room = session
            .room_reference
            .clone()
            .or_else(|| authoritative.room_reference.clone());

        let installed = {
            let mut slot = self.slot.lock();
            if self.finished.lock().contains(&call_id) {
                Err(IncomingDisposition::AlreadyFinished)
            } else if let Some(current) = slot.as_ref().filter(|c| c.is_live() || c.call_id == call_id) {
                if current.call_id == call_id {
                    Err(IncomingDisposition::Duplicate)
                } else {
                    Err(IncomingDisposition::Busy)
                }
            } else {
                *slot = Some(ActiveCall::new(
                    call_id.clone(),
                    authoritative.caller_id.clone(),
                    peer_name.clone(),
                    Direction::Incoming,
                    authoritative.call_type,
                    room,
                    self.root.child_token(),
                ));
                // Soll-Zustand zurücksetzen, durchgesetzt wird erst ab `answer`
                self.audio_route.prepare_call();
                Ok(())
            }
        };
        if let Err(disposition) = installed {
            if disposition == IncomingDisposition::Busy {
                tracing::info!(call_id = %call_id, "Ignoring incoming call while busy");
            }
            return disposition;
        }

        self.spawn_call_watch(&call_id, watch);
        self.arm_timer(&call_id, self.timings.incoming_expiry, TimerKind::IncomingExpiry);
        if !self.transition(&call_id, CallState::Ringing) {
            return IncomingDisposition::AlreadyFinished;
        }

        self.dispatcher.start_alert(&call_id);
        if let Err(e) = self
            .ui_bridge
            .report_incoming(&call_id, &peer_name, authoritative.call_type)
        {
            tracing::warn!(call_id = %call_id, "Native call UI unavailable: {}", e);
        }

        if let Some(snapshot) = self.snapshot_for(&call_id) {
            self.emit(CallEvent::Incoming(snapshot));
        }
        tracing::info!(call_id = %call_id, caller_id = %authoritative.caller_id, "Incoming call surfaced");
        IncomingDisposition::Surfaced
    }

    async fn answer(self: &Arc<Self>) -> Result<CallSnapshot, CallError> {
        let (call_id, call_type, room) = {
            let slot = self.slot.lock();
            let call = slot
                .as_ref()
                .filter(|c| c.is_live())
                .ok_or(CallError::NoActiveCall)?;
            if call.direction != Direction::Incoming || call.state != CallState::Ringing {
                return Err(CallError::InvalidState("answer requires a ringing incoming call"));
            }
            (call.call_id.clone(), call.call_type, call.room_reference.clone())
        };

        let media = match self.media_sessions.begin(&call_id) {
            Ok(media) => media,
            Err(LeaseError::Busy { owner, .. }) => {
                tracing::info!(call_id = %call_id, owner = %owner, "Audio session busy, cannot answer");
                return Err(CallError::AlreadyInCall);
            }
            Err(LeaseError::Activation(detail)) => {
                return Err(self
                    .fail_with(
                        &call_id,
                        FailureKind::PermissionDenied,
                        AUDIO_MESSAGE,
                        CallError::PermissionDenied(detail),
                    )
                    .await);
            }
        };

        let attached = {
            let mut slot = self.slot.lock();
            match Self::live_mut(&mut slot, &call_id).filter(|c| c.state == CallState::Ringing) {
                Some(call) => {
                    call.media = Some(Arc::clone(&media));
                    if let Some(timer) = call.ring_timer.take() {
                        timer.cancel();
                    }
                    self.audio_route.begin_call();
                    true
                }
                None => false,
            }
        };
        if !attached {
            media.release().await;
            return Err(CallError::CallEnded);
        }

        tracing::info!(call_id = %call_id, "Answering call");
        self.dispatcher.cancel_alert(&call_id);
        self.transition(&call_id, CallState::Connecting);

        if let Err(e) = self.media.ensure_permissions(call_type).await {
            return Err(self.fail(&call_id, e).await);
        }
        self.ensure_live(&call_id)?;

        let room = match room {
            Some(room) => Some(room),
            None => self.lookup_room(&call_id).await,
        };
        let Some(room) = room else {
            return Err(self
                .fail_with(
                    &call_id,
                    FailureKind::NetworkFailure,
                    ROOM_MESSAGE,
                    CallError::NetworkFailure("room reference unavailable".to_string()),
                )
                .await);
        };
        self.set_room(&call_id, &room);
        self.ensure_live(&call_id)?;

        self.spawn_media_pump(&call_id);
        if let Err(e) = media.join(&room, &self.user_id, call_type).await {
            return Err(self.fail(&call_id, e).await);
        }
        self.ensure_live(&call_id)?;

        self.snapshot_for(&call_id).ok_or(CallError::CallEnded)
    }

    async fn reject(self: &Arc<Self>) -> Result<(), CallError> {
        let call_id = {
            let slot = self.slot.lock();
            let call = slot
                .as_ref()
                .filter(|c| c.is_live())
                .ok_or(CallError::NoActiveCall)?;
            if call.direction != Direction::Incoming || call.state != CallState::Ringing {
                return Err(CallError::InvalidState("reject requires a ringing incoming call"));
            }
            call.call_id.clone()
        };

        self.finish(
            &call_id,
            CallState::Ended {
                reason: EndReason::Declined,
            },
            Some(CallStatus::Rejected),
            FinishGuard::StillRinging,
        )
        .await;
        Ok(())
    }

    async fn hangup(self: &Arc<Self>) -> Result<(), CallError> {
        let target = {
            let slot = self.slot.lock();
            slot.as_ref()
                .filter(|c| c.is_live())
                .map(|c| (c.call_id.clone(), c.direction, c.state.clone()))
        };
        let Some((call_id, direction, state)) = target else {
            tracing::debug!("Hangup without live call ignored");
            return Ok(());
        };

        // Auflegen eines klingelnden eingehenden Anrufs ist ein Ablehnen
        let (reason, status) = if direction == Direction::Incoming && state == CallState::Ringing {
            (EndReason::Declined, CallStatus::Rejected)
        } else {
            (EndReason::LocalHangup, CallStatus::Ended)
        };

        self.finish(&call_id, CallState::Ended { reason }, Some(status), FinishGuard::Any)
            .await;
        Ok(())
    }

    async fn on_remote_terminated(self: &Arc<Self>, call_id: &str, status: CallStatus) {
        if !status.is_terminal() {
            return;
        }

        let live = {
            let slot = self.slot.lock();
            let live = slot
                .as_ref()
                .is_some_and(|c| c.call_id == call_id && c.is_live());
            if !live {
                self.finished.lock().insert(call_id);
            }
            live
        };

        if live {
            tracing::info!(call_id, %status, "Call terminated by peer");
            self.finish(
                call_id,
                CallState::Ended {
                    reason: EndReason::from_remote(status),
                },
                None,
                FinishGuard::Any,
            )
            .await;
        } else {
            tracing::debug!(call_id, %status, "Remote termination for inactive call remembered");
            self.dispatcher.cancel_alert(call_id);
        }
    }

    fn on_room_resolved(&self, call_id: &str, room_reference: &str) {
        let mut slot = self.slot.lock();
        let Some(call) = Self::live_mut(&mut slot, call_id) else {
            return;
        };
        if call.room_reference.as_deref() == Some(room_reference) {
            return;
        }
        let joined = call.media.as_ref().and_then(|m| m.joined_room()).is_some();
        if joined {
            tracing::warn!(call_id, room = room_reference, "Room changed after join, keeping current room");
            return;
        }
        tracing::debug!(call_id, room = room_reference, "Room reference resolved");
        call.room_reference = Some(room_reference.to_string());
    }

    fn set_speaker(&self, enabled: bool) -> Result<(), CallError> {
        let call_id = self.live_call_id().ok_or(CallError::NoActiveCall)?;
        let output = if enabled {
            AudioOutput::Speaker
        } else {
            AudioOutput::Earpiece
        };
        self.audio_route.set_output(output);
        tracing::debug!(call_id = %call_id, ?output, "Audio output changed");
        self.emit_state(&call_id);
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let call_id = self.live_call_id().ok_or(CallError::NoActiveCall)?;
        self.media
            .set_microphone_enabled(!muted)
            .await
            .map_err(|e| CallError::NetworkFailure(e.to_string()))?;

        {
            let mut slot = self.slot.lock();
            match Self::live_mut(&mut slot, &call_id) {
                Some(call) => call.muted = muted,
                None => return Err(CallError::CallEnded),
            }
        }
        self.emit_state(&call_id);
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let (call_id, call_type) = {
            let slot = self.slot.lock();
            let call = slot
                .as_ref()
                .filter(|c| c.is_live())
                .ok_or(CallError::NoActiveCall)?;
            (call.call_id.clone(), call.call_type)
        };
        if call_type != CallType::Video {
            return Err(CallError::InvalidState("camera requires a video call"));
        }

        self.media
            .set_camera_enabled(enabled)
            .await
            .map_err(|e| CallError::NetworkFailure(e.to_string()))?;

        {
            let mut slot = self.slot.lock();
            match Self::live_mut(&mut slot, &call_id) {
                Some(call) => call.camera_enabled = enabled,
                None => return Err(CallError::CallEnded),
            }
        }
        self.emit_state(&call_id);
        Ok(())
    }

    fn snapshot(&self) -> Option<CallSnapshot> {
        let slot = self.slot.lock();
        slot.as_ref().map(|call| self.snapshot_of(call))
    }

    async fn shutdown(self: &Arc<Self>) {
        if let Some(call_id) = self.live_call_id() {
            self.finish(
                &call_id,
                CallState::Ended {
                    reason: EndReason::Teardown,
                },
                Some(CallStatus::Ended),
                FinishGuard::Any,
            )
            .await;
        }
        self.audio_route.end_call();
        self.root.cancel();
        tracing::info!("Call manager shut down");
    }
}

// ============================================================================
// TRANSITIONS
// ============================================================================

impl Inner {
    /// Nicht-terminaler Übergang. Liefert `false` wenn verworfen.
    fn transition(&self, call_id: &str, next: CallState) -> bool {
        debug_assert!(!next.is_terminal());

        let snapshot = {
            let mut slot = self.slot.lock();
            let Some(call) = slot.as_mut().filter(|c| c.call_id == call_id) else {
                return false;
            };
            if !call.state.can_advance_to(&next) {
                tracing::debug!(
                    call_id,
                    from = call.state.name(),
                    to = next.name(),
                    "Ignoring out-of-order transition"
                );
                return false;
            }

            if next == CallState::Connected {
                call.connected_at = Some(Instant::now());
                if let Some(timer) = call.ring_timer.take() {
                    timer.cancel();
                }
            }
            call.state = next;
            self.snapshot_of(call)
        };

        tracing::info!(call_id, state = snapshot.state.name(), "Call state changed");
        self.audio_route.on_call_transition();
        self.emit(CallEvent::StateChanged(snapshot));
        true
    }

    /// Terminaler Übergang mit vollständigem Aufräumen.
    ///
    /// Der erste Aufrufer gewinnt; alle weiteren sind No-ops. Der
    /// gemeinsame Datensatz wird nur geschrieben, wenn `store_status`
    /// gesetzt ist und der Datensatz existiert.
    async fn finish(
        self: &Arc<Self>,
        call_id: &str,
        terminal: CallState,
        store_status: Option<CallStatus>,
        guard: FinishGuard,
    ) -> bool {
        debug_assert!(terminal.is_terminal());

        let (snapshot, media, persisted, notify_peer) = {
            let mut slot = self.slot.lock();
            let Some(call) = Self::live_mut(&mut slot, call_id) else {
                return false;
            };
            let allowed = match guard {
                FinishGuard::Any => true,
                FinishGuard::Unanswered => call.state != CallState::Connected,
                FinishGuard::StillRinging => call.state == CallState::Ringing,
                FinishGuard::WhileConnected => call.state == CallState::Connected,
            };
            if !allowed {
                return false;
            }

            call.state = terminal;
            call.ended_at = Some(Instant::now());
            call.cancel.cancel();
            if let Some(timer) = call.ring_timer.take() {
                timer.cancel();
            }
            self.audio_route.end_call();

            let notify_peer = call.direction == Direction::Outgoing
                && call.connected_at.is_none()
                && call.persisted
                && store_status.is_some();
            (
                self.snapshot_of(call),
                call.media.take(),
                call.persisted,
                notify_peer.then(|| call.peer_id.clone()),
            )
        };

        tracing::info!(
            call_id,
            state = snapshot.state.name(),
            reason = ?snapshot.reason,
            "Call finished"
        );

        self.remember_finished(call_id);
        self.dispatcher.cancel_alert(call_id);

        if let Some(media) = media {
            media.release().await;
        }

        if persisted {
            if let Some(status) = store_status {
                self.write_terminal(call_id, status).await;
            }
        }

        if let Some(peer_id) = notify_peer {
            self.dispatcher.dispatch_ended(&peer_id, call_id).await;
        }

        if let Err(e) = self.ui_bridge.end_call(call_id) {
            tracing::warn!(call_id, "Native call UI unavailable: {}", e);
        }

        self.emit(CallEvent::StateChanged(snapshot));
        true
    }

    /// Bildet einen Media-Fehler auf `failed` ab
    async fn fail(self: &Arc<Self>, call_id: &str, error: MediaError) -> CallError {
        match error {
            MediaError::SessionReleased => CallError::CallEnded,
            MediaError::PermissionDenied(detail) => {
                self.fail_with(
                    call_id,
                    FailureKind::PermissionDenied,
                    PERMISSION_MESSAGE,
                    CallError::PermissionDenied(detail),
                )
                .await
            }
            MediaError::Network(detail) | MediaError::Engine(detail) => {
                self.fail_with(
                    call_id,
                    FailureKind::NetworkFailure,
                    NETWORK_MESSAGE,
                    CallError::NetworkFailure(detail),
                )
                .await
            }
        }
    }

    async fn fail_with(
        self: &Arc<Self>,
        call_id: &str,
        kind: FailureKind,
        message: &str,
        error: CallError,
    ) -> CallError {
        let failed = self
            .finish(
                call_id,
                CallState::Failed {
                    kind,
                    reason: message.to_string(),
                },
                Some(CallStatus::Ended),
                FinishGuard::Any,
            )
            .await;
        if !failed {
            return CallError::CallEnded;
        }

        tracing::error!(call_id, ?kind, "Call failed: {}", error);
        self.emit(CallEvent::Error {
            call_id: call_id.to_string(),
            message: message.to_string(),
        });
        error
    }

    async fn write_terminal(&self, call_id: &str, status: CallStatus) {
        match self.store.update_status(call_id, status).await {
            Ok(StatusWrite::Applied(_)) => {
                tracing::debug!(call_id, %status, "Shared call record updated");
            }
            Ok(StatusWrite::Unchanged(_)) => {}
            Ok(StatusWrite::Rejected(current)) => {
                tracing::debug!(call_id, current = %current.status, "Shared call record already terminal");
            }
            Err(e) => tracing::warn!(call_id, %status, "Failed to update call record: {}", e),
        }
    }

    async fn on_timer(self: &Arc<Self>, call_id: &str, kind: TimerKind) {
        match kind {
            TimerKind::RingTimeout => {
                let fired = self
                    .finish(
                        call_id,
                        CallState::Ended {
                            reason: EndReason::NoAnswer,
                        },
                        Some(CallStatus::Missed),
                        FinishGuard::Unanswered,
                    )
                    .await;
                if fired {
                    tracing::info!(call_id, "Ring timeout, no answer");
                    self.emit(CallEvent::Advisory {
                        call_id: call_id.to_string(),
                        message: EndReason::NoAnswer.message().to_string(),
                    });
                }
            }
            TimerKind::IncomingExpiry => {
                let fired = self
                    .finish(
                        call_id,
                        CallState::Ended {
                            reason: EndReason::Missed,
                        },
                        Some(CallStatus::Missed),
                        FinishGuard::StillRinging,
                    )
                    .await;
                if fired {
                    tracing::info!(call_id, "Incoming call expired");
                }
            }
        }
    }

    // ========================================================================
    // MEDIA EVENTS
    // ========================================================================

    async fn handle_media_event(self: &Arc<Self>, call_id: &str, event: MediaEvent) {
        let room = {
            let slot = self.slot.lock();
            match slot.as_ref().filter(|c| c.call_id == call_id) {
                Some(call) => call.room_reference.clone(),
                None => return,
            }
        };
        if let (Some(event_room), Some(room)) = (event.room_reference(), room.as_deref()) {
            if event_room != room {
                return;
            }
        }

        match event {
            MediaEvent::ParticipantJoined { participant_id, .. } if participant_id != self.user_id => {
                self.on_peer_joined(call_id).await;
            }
            MediaEvent::ParticipantLeft { participant_id, .. } if participant_id != self.user_id => {
                let ended = self
                    .finish(
                        call_id,
                        CallState::Ended {
                            reason: EndReason::PeerLeft,
                        },
                        Some(CallStatus::Ended),
                        FinishGuard::WhileConnected,
                    )
                    .await;
                if ended {
                    tracing::info!(call_id, participant_id = %participant_id, "Peer left the room");
                }
            }
            MediaEvent::Error { message, .. } => {
                self.fail(call_id, MediaError::Engine(message)).await;
            }
            other => tracing::debug!(call_id, event = ?other, "Media event"),
        }
    }

    async fn on_peer_joined(self: &Arc<Self>, call_id: &str) {
        if !self.transition(call_id, CallState::Connected) {
            return;
        }

        self.dispatcher.cancel_alert(call_id);
        if let Err(e) = self.ui_bridge.report_connected(call_id) {
            tracing::warn!(call_id, "Native call UI unavailable: {}", e);
        }

        match self.store.update_status(call_id, CallStatus::Connected).await {
            Ok(StatusWrite::Rejected(current)) if current.status.is_terminal() => {
                tracing::info!(call_id, status = %current.status, "Shared record already terminal, ending call");
                self.finish(
                    call_id,
                    CallState::Ended {
                        reason: EndReason::from_remote(current.status),
                    },
                    None,
                    FinishGuard::Any,
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(call_id, "Failed to mark call connected: {}", e),
        }
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    /// Startet einen Task mit dem Token des Anrufs (nur solange er lebt)
    fn spawn_in_call<F, Fut>(&self, call_id: &str, f: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slot = self.slot.lock();
        match slot.as_ref().filter(|c| c.call_id == call_id && c.is_live()) {
            Some(call) => {
                tokio::spawn(f(call.cancel.clone()));
                true
            }
            None => false,
        }
    }

    /// Beobachtet den gemeinsamen Datensatz auf Beendigung durch die Gegenseite
    fn spawn_call_watch(self: &Arc<Self>, call_id: &str, mut watch: ChangeSubscription) {
        let inner = Arc::clone(self);
        let id = call_id.to_string();
        self.spawn_in_call(call_id, move |token| async move {
            loop {
                tokio::select! {
                    change = watch.next() => match change {
                        Some(StoreChange::SessionInserted(session))
                        | Some(StoreChange::SessionUpdated(session)) => {
                            if session.status.is_terminal() {
                                inner.on_remote_terminated(&id, session.status).await;
                            }
                        }
                        Some(StoreChange::SignalInserted(_)) => {}
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    fn spawn_media_pump(self: &Arc<Self>, call_id: &str) {
        let mut events = self.media.subscribe();
        let inner = Arc::clone(self);
        let id = call_id.to_string();
        self.spawn_in_call(call_id, move |token| async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => inner.handle_media_event(&id, event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(call_id = %id, skipped, "Media events lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    fn arm_timer(self: &Arc<Self>, call_id: &str, after: Duration, kind: TimerKind) {
        let mut slot = self.slot.lock();
        let Some(call) = Self::live_mut(&mut slot, call_id) else {
            return;
        };
        let token = call.cancel.child_token();
        if let Some(previous) = call.ring_timer.replace(token.clone()) {
            previous.cancel();
        }

        let inner = Arc::clone(self);
        let id = call_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {}
                _ = token.cancelled() => return,
            }
            inner.on_timer(&id, kind).await;
        });
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn live_mut<'a>(slot: &'a mut Option<ActiveCall>, call_id: &str) -> Option<&'a mut ActiveCall> {
        slot.as_mut().filter(|c| c.call_id == call_id && c.is_live())
    }

    fn live_call_id(&self) -> Option<String> {
        self.slot
            .lock()
            .as_ref()
            .filter(|c| c.is_live())
            .map(|c| c.call_id.clone())
    }

    fn ensure_live(&self, call_id: &str) -> Result<(), CallError> {
        let live = self
            .slot
            .lock()
            .as_ref()
            .is_some_and(|c| c.call_id == call_id && c.is_live());
        if live {
            Ok(())
        } else {
            Err(CallError::CallEnded)
        }
    }

    fn mark_persisted(&self, call_id: &str) -> bool {
        let mut slot = self.slot.lock();
        match Self::live_mut(&mut slot, call_id) {
            Some(call) => {
                call.persisted = true;
                true
            }
            None => false,
        }
    }

    fn set_room(&self, call_id: &str, room: &str) {
        let mut slot = self.slot.lock();
        if let Some(call) = Self::live_mut(&mut slot, call_id) {
            call.room_reference = Some(room.to_string());
        }
    }

    /// Room aus Datensatz oder Signal nachladen
    async fn lookup_room(&self, call_id: &str) -> Option<String> {
        if let Ok(Some(session)) = self.store.fetch_session(call_id).await {
            if session.room_reference.is_some() {
                return session.room_reference;
            }
        }
        match self.store.latest_room_signal(call_id).await {
            Ok(signal) => signal.and_then(|s| s.payload.room_reference),
            Err(e) => {
                tracing::warn!(call_id, "Failed to read call signals: {}", e);
                None
            }
        }
    }

    async fn resolve_name(&self, user_id: &str) -> String {
        match self.store.display_name(user_id).await {
            Ok(Some(name)) if !name.trim().is_empty() => name,
            Ok(_) => user_id.to_string(),
            Err(e) => {
                tracing::debug!(user_id, "Display name lookup failed: {}", e);
                user_id.to_string()
            }
        }
    }

    fn remember_finished(&self, call_id: &str) {
        self.finished.lock().insert(call_id);
    }

    fn snapshot_of(&self, call: &ActiveCall) -> CallSnapshot {
        let connected_for = call.connected_at.map(|at| match call.ended_at {
            Some(end) => end.saturating_duration_since(at),
            None => at.elapsed(),
        });

        CallSnapshot {
            call_id: call.call_id.clone(),
            peer_id: call.peer_id.clone(),
            peer_name: call.peer_name.clone(),
            direction: call.direction,
            call_type: call.call_type,
            state: call.state.clone(),
            reason: call.state.reason(),
            audio_output: self.audio_route.desired_output(),
            muted: call.muted,
            camera_enabled: call.camera_enabled,
            advisory: call.advisory.clone(),
            connected_for,
        }
    }

    fn snapshot_for(&self, call_id: &str) -> Option<CallSnapshot> {
        let slot = self.slot.lock();
        slot.as_ref()
            .filter(|c| c.call_id == call_id)
            .map(|call| self.snapshot_of(call))
    }

    fn emit_state(&self, call_id: &str) {
        if let Some(snapshot) = self.snapshot_for(call_id) {
            self.emit(CallEvent::StateChanged(snapshot));
        }
    }

    fn emit(&self, event: CallEvent) {
        // Keine Subscriber ist kein Fehler
        let _ = self.event_tx.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
