//! Test-Doubles für Plattform und externe Dienste

use crate::audio::{AudioModeCoordinator, AudioOutput, AudioRoutePlatform, RouteError};
use crate::media::{MediaEngine, MediaError, MediaEvent};
use crate::model::CallType;
use crate::native_ui::{BridgeError, CallUiBridge};
use crate::notify::{Alerter, PushError, PushMessage, PushService};
use crate::session::{CallDeps, CallManager, CallOrchestrator, CallTimings, IncomingDisposition};
use crate::signaling::{SignalingChannel, SignalingEvent, WakeOutcome, WakePayload};
use crate::store::SqliteCallStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

// ============================================================================
// MEDIA ENGINE
// ============================================================================

/// Protokolliert jeden Aufruf als `"<op>:<arg>"`
pub(crate) struct FakeMediaEngine {
    calls: Mutex<Vec<String>>,
    deny_permissions: AtomicBool,
    fail_create: AtomicBool,
    fail_join: AtomicBool,
    join_gate: Mutex<Option<Arc<Notify>>>,
    events: broadcast::Sender<MediaEvent>,
}

impl Default for FakeMediaEngine {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            calls: Mutex::new(Vec::new()),
            deny_permissions: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_join: AtomicBool::new(false),
            join_gate: Mutex::new(None),
            events,
        }
    }
}

impl FakeMediaEngine {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == entry).count()
    }

    pub(crate) fn deny_permissions(&self) {
        self.deny_permissions.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_join(&self) {
        self.fail_join.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset_failures(&self) {
        self.deny_permissions.store(false, Ordering::SeqCst);
        self.fail_create.store(false, Ordering::SeqCst);
        self.fail_join.store(false, Ordering::SeqCst);
    }

    /// Jeder folgende `join` wartet auf ein `notify_one`
    pub(crate) fn gate_joins(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.join_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn peer_joined(&self, room_reference: &str, participant_id: &str) {
        self.emit(MediaEvent::ParticipantJoined {
            room_reference: room_reference.to_string(),
            participant_id: participant_id.to_string(),
        });
    }

    pub(crate) fn peer_left(&self, room_reference: &str, participant_id: &str) {
        self.emit(MediaEvent::ParticipantLeft {
            room_reference: room_reference.to_string(),
            participant_id: participant_id.to_string(),
        });
    }

    fn log(&self, entry: String) {
        self.calls.lock().push(entry);
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn ensure_permissions(&self, call_type: CallType) -> Result<(), MediaError> {
        self.log(format!("permissions:{call_type}"));
        if self.deny_permissions.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone".to_string()));
        }
        Ok(())
    }

    async fn create_room(&self, call_id: &str, _call_type: CallType) -> Result<String, MediaError> {
        self.log(format!("create_room:{call_id}"));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MediaError::Network("room service unreachable".to_string()));
        }
        Ok(format!("room-{call_id}"))
    }

    async fn issue_token(&self, room_reference: &str, user_id: &str) -> Result<String, MediaError> {
        self.log(format!("token:{room_reference}:{user_id}"));
        Ok(format!("token-{user_id}"))
    }

    async fn join(
        &self,
        room_reference: &str,
        _token: &str,
        _call_type: CallType,
    ) -> Result<(), MediaError> {
        self.log(format!("join:{room_reference}"));
        let gate = self.join_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(MediaError::Network("join failed".to_string()));
        }
        self.emit(MediaEvent::Joined {
            room_reference: room_reference.to_string(),
        });
        Ok(())
    }

    async fn leave(&self, room_reference: &str) -> Result<(), MediaError> {
        self.log(format!("leave:{room_reference}"));
        self.emit(MediaEvent::Left {
            room_reference: room_reference.to_string(),
        });
        Ok(())
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.log(format!("mic:{enabled}"));
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.log(format!("camera:{enabled}"));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// PUSH / ALERT / AUDIO / NATIVE UI
// ============================================================================

#[derive(Default)]
pub(crate) struct FakePushService {
    sent: Mutex<Vec<PushMessage>>,
    failing: AtomicBool,
}

impl FakePushService {
    pub(crate) fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().clone()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PushService for FakePushService {
    async fn send(&self, message: &PushMessage) -> Result<(), PushError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PushError::Unavailable);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingAlerter {
    started: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    active: Mutex<HashSet<String>>,
}

impl RecordingAlerter {
    pub(crate) fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub(crate) fn is_alerting(&self, call_id: &str) -> bool {
        self.active.lock().contains(call_id)
    }
}

impl Alerter for RecordingAlerter {
    fn start_alert(&self, call_id: &str) {
        self.started.lock().push(call_id.to_string());
        self.active.lock().insert(call_id.to_string());
    }

    fn cancel_alert(&self, call_id: &str) {
        self.cancelled.lock().push(call_id.to_string());
        self.active.lock().remove(call_id);
    }
}

/// Plattform-Route, die eigenmächtige Umschaltungen simulieren kann
#[derive(Default)]
pub(crate) struct FakeAudioRoute {
    current: Mutex<Option<AudioOutput>>,
    applied: AtomicUsize,
}

impl FakeAudioRoute {
    pub(crate) fn current(&self) -> Option<AudioOutput> {
        *self.current.lock()
    }

    /// Umschalten ohne Zutun des Coordinators
    pub(crate) fn force(&self, output: AudioOutput) {
        *self.current.lock() = Some(output);
    }

    pub(crate) fn applied_count(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

impl AudioRoutePlatform for FakeAudioRoute {
    fn apply_output(&self, output: AudioOutput) -> Result<(), RouteError> {
        *self.current.lock() = Some(output);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingUiBridge {
    events: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl RecordingUiBridge {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub(crate) fn set_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    fn record(&self, entry: String) -> Result<(), BridgeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BridgeError::Unavailable);
        }
        self.events.lock().push(entry);
        Ok(())
    }
}

impl CallUiBridge for RecordingUiBridge {
    fn report_incoming(
        &self,
        call_id: &str,
        caller_name: &str,
        _call_type: CallType,
    ) -> Result<(), BridgeError> {
        self.record(format!("incoming:{call_id}:{caller_name}"))
    }

    fn report_connected(&self, call_id: &str) -> Result<(), BridgeError> {
        self.record(format!("connected:{call_id}"))
    }

    fn end_call(&self, call_id: &str) -> Result<(), BridgeError> {
        self.record(format!("end:{call_id}"))
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Ein Gerät mit eigenem Call Manager, gemeinsamer Datenbank
pub(crate) struct Side {
    pub user_id: String,
    pub manager: Arc<CallManager>,
    pub channel: SignalingChannel,
    pub media: Arc<FakeMediaEngine>,
    pub push: Arc<FakePushService>,
    pub route: Arc<FakeAudioRoute>,
    pub alerter: Arc<RecordingAlerter>,
    pub ui: Arc<RecordingUiBridge>,
    pub audio_modes: AudioModeCoordinator,
    deps: CallDeps,
}

impl Side {
    pub(crate) fn new(store: &Arc<SqliteCallStore>, user_id: &str) -> Self {
        Self::with_timings(store, user_id, CallTimings::default())
    }

    pub(crate) fn with_timings(
        store: &Arc<SqliteCallStore>,
        user_id: &str,
        timings: CallTimings,
    ) -> Self {
        let side = SideParts::default();
        let deps = CallDeps {
            user_id: user_id.to_string(),
            display_name: display_name(user_id),
            store: store.clone(),
            presence: store.clone(),
            media: side.media.clone(),
            push: side.push.clone(),
            audio_route: side.route.clone(),
            audio_modes: side.audio_modes.clone(),
            alerter: side.alerter.clone(),
            ui_bridge: side.ui.clone(),
        };

        Self {
            user_id: user_id.to_string(),
            manager: Arc::new(CallManager::new(timings, deps.clone())),
            channel: SignalingChannel::new(
                user_id.to_string(),
                store.clone(),
                3,
                Duration::from_millis(500),
            ),
            media: side.media,
            push: side.push,
            route: side.route,
            alerter: side.alerter,
            ui: side.ui,
            audio_modes: side.audio_modes,
            deps,
        }
    }

    /// Abhängigkeiten dieses Geräts (für die Factory)
    pub(crate) fn deps(&self) -> CallDeps {
        self.deps.clone()
    }

    /// Wake-Payload über den Signaling Channel an den Manager geben
    pub(crate) async fn wake(&self, payload: WakePayload) -> (WakeOutcome, Option<IncomingDisposition>) {
        let mut events = self.channel.subscribe();
        let outcome = self.channel.handle_wake(payload).await;

        let mut disposition = None;
        while let Ok(event) = events.try_recv() {
            match event {
                SignalingEvent::IncomingCall(session) => {
                    disposition = Some(self.manager.receive_incoming(session).await);
                }
                SignalingEvent::RemoteTerminated { call_id, status } => {
                    self.manager.on_remote_terminated(&call_id, status).await;
                }
                SignalingEvent::RoomResolved {
                    call_id,
                    room_reference,
                } => {
                    self.manager.on_room_resolved(&call_id, &room_reference).await;
                }
            }
        }
        (outcome, disposition)
    }

    pub(crate) fn room(&self) -> String {
        self.manager
            .snapshot()
            .map(|s| format!("room-{}", s.call_id))
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct SideParts {
    media: Arc<FakeMediaEngine>,
    push: Arc<FakePushService>,
    route: Arc<FakeAudioRoute>,
    alerter: Arc<RecordingAlerter>,
    ui: Arc<RecordingUiBridge>,
    audio_modes: AudioModeCoordinator,
}

/// "alice" -> "Alice"
fn display_name(user_id: &str) -> String {
    let mut chars = user_id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Lässt gespawnte Tasks laufen (pausierte Zeit springt automatisch)
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
