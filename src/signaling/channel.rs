//! Signaling Channel
//!
//! Liefert eingehende Anrufe und Beendigungen über zwei unabhängige Pfade:
//! - Vordergrund: Change-Stream auf alle Zeilen, bei denen wir angerufen werden
//! - Wake-Pfad: Push-Nutzdaten (App im Hintergrund oder beendet)
//!
//! Beide Pfade laufen über ein gemeinsames Ledger pro `call_id`. Ein Anruf
//! wird höchstens einmal zugestellt und nie, wenn der maßgebliche
//! Datensatz bereits terminal ist. `CallSignal`-Zeilen dienen nur als
//! Ausweichpfad für die `room_reference`.

use super::messages::WakePayload;
use crate::model::{CallSession, CallSignal, CallStatus};
use crate::store::{CallStore, ChangeFilter, StoreChange};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Maximale Anzahl gemerkter `call_id`s im Ledger
const LEDGER_CAPACITY: usize = 256;

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom SignalingChannel ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Klingelnder Anruf, maßgeblich geprüft und mit aufgelöstem Namen
    IncomingCall(CallSession),

    /// Gegenseite hat den Datensatz terminal gesetzt
    RemoteTerminated { call_id: String, status: CallStatus },

    /// `room_reference` kam nach der Zustellung über ein Signal
    RoomResolved {
        call_id: String,
        room_reference: String,
    },
}

/// Ergebnis einer Zustellung über den Wake-Pfad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Anruf wurde zugestellt
    Delivered,
    /// Anruf ist bereits zugestellt (oder in Zustellung)
    Duplicate,
    /// Maßgeblicher Datensatz ist terminal, verworfen
    Stale(CallStatus),
    /// Datensatz (noch) nicht sichtbar oder nicht für uns
    Unknown,
    /// Beendigung angewendet
    Terminated,
}

// ============================================================================
// LEDGER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nur aus Signalen/Push bekannt
    Placeholder,
    /// Ein Pfad löst gerade auf
    Resolving,
    Delivered,
    Terminal(CallStatus),
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    phase: Phase,
    room_reference: Option<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: HashMap<String, LedgerEntry>,
    order: VecDeque<String>,
}

impl Ledger {
    fn entry(&mut self, call_id: &str) -> &mut LedgerEntry {
        if !self.entries.contains_key(call_id) {
            self.order.push_back(call_id.to_string());
            while self.order.len() > LEDGER_CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries
            .entry(call_id.to_string())
            .or_insert(LedgerEntry {
                phase: Phase::Placeholder,
                room_reference: None,
            })
    }

    fn phase(&self, call_id: &str) -> Option<Phase> {
        self.entries.get(call_id).map(|e| e.phase)
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

struct ChannelInner {
    user_id: String,
    store: Arc<dyn CallStore>,
    ledger: Mutex<Ledger>,
    retry_attempts: u32,
    retry_delay: Duration,
    event_tx: broadcast::Sender<SignalingEvent>,
    foreground: Mutex<Option<CancellationToken>>,
}

/// Signaling Channel für den lokalen Benutzer
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    pub fn new(
        user_id: String,
        store: Arc<dyn CallStore>,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(ChannelInner {
                user_id,
                store,
                ledger: Mutex::new(Ledger::default()),
                retry_attempts,
                retry_delay,
                event_tx,
                foreground: Mutex::new(None),
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.foreground.lock().is_some()
    }

    /// Startet die Vordergrund-Subscription (idempotent)
    pub fn start(&self) {
        let mut foreground = self.inner.foreground.lock();
        if foreground.is_some() {
            return;
        }

        // Vor dem Spawn abonnieren, damit keine Änderung verloren geht
        let mut changes = self
            .inner
            .store
            .subscribe(ChangeFilter::Callee(self.inner.user_id.clone()));

        let token = CancellationToken::new();
        let channel = self.clone();
        let stream_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.next() => match change {
                        Some(change) => channel.handle_change(change, &stream_token),
                        None => {
                            tracing::warn!("Change stream closed");
                            break;
                        }
                    },
                    _ = stream_token.cancelled() => break,
                }
            }
            tracing::debug!("Signaling foreground stream stopped");
        });

        *foreground = Some(token);
        tracing::info!(user_id = %self.inner.user_id, "Signaling foreground stream started");
    }

    pub fn stop(&self) {
        if let Some(token) = self.inner.foreground.lock().take() {
            token.cancel();
        }
    }

    // ========================================================================
    // FOREGROUND STREAM
    // ========================================================================

    /// Zustellungen laufen unter einem Kind-Token des Vordergrund-Streams
    fn handle_change(&self, change: StoreChange, foreground: &CancellationToken) {
        match change {
            StoreChange::SessionInserted(session) => {
                if session.status.is_terminal() {
                    self.apply_termination(&session.call_id, session.status);
                } else if session.status == CallStatus::Ringing {
                    if let Some(room) = session.room_reference.as_deref() {
                        self.remember_room(&session.call_id, room);
                    }
                    let channel = self.clone();
                    let token = foreground.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            outcome = channel.deliver(&session.call_id) => {
                                tracing::debug!(call_id = %session.call_id, ?outcome, "Stream delivery finished");
                            }
                            _ = token.cancelled() => {
                                channel.release_claim(&session.call_id);
                                tracing::debug!(call_id = %session.call_id, "Stream delivery cancelled");
                            }
                        }
                    });
                }
            }
            StoreChange::SessionUpdated(session) => {
                if session.status.is_terminal() {
                    self.apply_termination(&session.call_id, session.status);
                }
            }
            StoreChange::SignalInserted(signal) => self.merge_signal(&signal),
        }
    }

    /// Übernimmt die `room_reference` eines Signals in das Ledger
    fn merge_signal(&self, signal: &CallSignal) {
        if signal.to_user_id != self.inner.user_id {
            return;
        }
        let Some(room) = signal.payload.room_reference.as_deref() else {
            return;
        };

        let delivered = {
            let mut ledger = self.inner.ledger.lock();
            let entry = ledger.entry(&signal.call_id);
            if matches!(entry.phase, Phase::Terminal(_)) {
                return;
            }
            if entry.room_reference.as_deref() == Some(room) {
                return;
            }
            if let Some(previous) = &entry.room_reference {
                tracing::debug!(call_id = %signal.call_id, previous = %previous, room, "Room reference changed");
            }
            entry.room_reference = Some(room.to_string());
            entry.phase == Phase::Delivered
        };

        if delivered {
            let _ = self.inner.event_tx.send(SignalingEvent::RoomResolved {
                call_id: signal.call_id.clone(),
                room_reference: room.to_string(),
            });
        }
    }

    fn remember_room(&self, call_id: &str, room: &str) {
        let mut ledger = self.inner.ledger.lock();
        let entry = ledger.entry(call_id);
        if entry.room_reference.is_none() {
            entry.room_reference = Some(room.to_string());
        }
    }

    fn apply_termination(&self, call_id: &str, status: CallStatus) {
        {
            let mut ledger = self.inner.ledger.lock();
            let entry = ledger.entry(call_id);
            if matches!(entry.phase, Phase::Terminal(_)) {
                return;
            }
            entry.phase = Phase::Terminal(status);
        }

        tracing::debug!(call_id, %status, "Remote termination observed");
        let _ = self.inner.event_tx.send(SignalingEvent::RemoteTerminated {
            call_id: call_id.to_string(),
            status,
        });
    }

    // ========================================================================
    // WAKE PATH
    // ========================================================================

    /// Verarbeitet die Nutzdaten eines Wake-Push
    pub async fn handle_wake(&self, payload: WakePayload) -> WakeOutcome {
        match payload {
            WakePayload::IncomingCall {
                call_id,
                room_reference,
                ..
            } => {
                if let Some(room) = room_reference.as_deref() {
                    self.remember_room(&call_id, room);
                }
                self.deliver(&call_id).await
            }
            WakePayload::CallEnded { call_id } => {
                let status = match self.inner.store.fetch_session(&call_id).await {
                    Ok(Some(session)) if session.status.is_terminal() => session.status,
                    Ok(Some(session)) => {
                        tracing::warn!(
                            call_id = %call_id,
                            stored = %session.status,
                            "Call ended push disagrees with stored status, treating as ended"
                        );
                        CallStatus::Ended
                    }
                    Ok(None) => CallStatus::Ended,
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, "Failed to fetch ended call: {}", e);
                        CallStatus::Ended
                    }
                };
                self.apply_termination(&call_id, status);
                WakeOutcome::Terminated
            }
        }
    }

    /// Ob dieser Anruf bereits zugestellt wurde (oder gerade wird)
    pub fn is_known(&self, call_id: &str) -> bool {
        matches!(
            self.inner.ledger.lock().phase(call_id),
            Some(Phase::Resolving | Phase::Delivered)
        )
    }

    // ========================================================================
    // DELIVERY
    // ========================================================================

    /// Gemeinsamer Zustellpfad beider Kanäle
    async fn deliver(&self, call_id: &str) -> WakeOutcome {
        // Zustellung beanspruchen
        {
            let mut ledger = self.inner.ledger.lock();
            let entry = ledger.entry(call_id);
            match entry.phase {
                Phase::Resolving | Phase::Delivered => return WakeOutcome::Duplicate,
                Phase::Terminal(status) => {
                    tracing::info!(call_id, %status, "Dropping stale incoming call");
                    return WakeOutcome::Stale(status);
                }
                Phase::Placeholder => entry.phase = Phase::Resolving,
            }
        }

        // Maßgeblichen Status neu lesen
        let mut session = match self.inner.store.fetch_session(call_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!(call_id, "Call session not visible yet");
                self.release_claim(call_id);
                return WakeOutcome::Unknown;
            }
            Err(e) => {
                tracing::warn!(call_id, "Failed to fetch call session: {}", e);
                self.release_claim(call_id);
                return WakeOutcome::Unknown;
            }
        };

        if session.callee_id != self.inner.user_id {
            self.release_claim(call_id);
            return WakeOutcome::Unknown;
        }

        if session.status.is_terminal() {
            tracing::info!(call_id, status = %session.status, "Dropping stale incoming call");
            self.apply_termination(call_id, session.status);
            return WakeOutcome::Stale(session.status);
        }

        session.room_reference = self.resolve_room(&session).await;
        session.caller_name = self.resolve_caller_name(&session).await;

        {
            let mut ledger = self.inner.ledger.lock();
            let entry = ledger.entry(call_id);
            if let Phase::Terminal(status) = entry.phase {
                tracing::info!(call_id, %status, "Call terminated during delivery, dropping");
                return WakeOutcome::Stale(status);
            }
            entry.phase = Phase::Delivered;
            if session.room_reference.is_some() {
                entry.room_reference = session.room_reference.clone();
            }
        }

        tracing::info!(call_id, caller_id = %session.caller_id, "Incoming call delivered");
        let _ = self
            .inner
            .event_tx
            .send(SignalingEvent::IncomingCall(session));
        WakeOutcome::Delivered
    }

    fn release_claim(&self, call_id: &str) {
        let mut ledger = self.inner.ledger.lock();
        let entry = ledger.entry(call_id);
        if entry.phase == Phase::Resolving {
            entry.phase = Phase::Placeholder;
        }
    }

    /// Füllt eine fehlende `room_reference` mit begrenzten Wiederholungen
    async fn resolve_room(&self, session: &CallSession) -> Option<String> {
        if session.room_reference.is_some() {
            return session.room_reference.clone();
        }

        let call_id = session.call_id.as_str();
        for attempt in 0..=self.inner.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.inner.retry_delay).await;
            }

            let from_ledger = self
                .inner
                .ledger
                .lock()
                .entries
                .get(call_id)
                .and_then(|e| e.room_reference.clone());
            if from_ledger.is_some() {
                return from_ledger;
            }

            match self.inner.store.latest_room_signal(call_id).await {
                Ok(Some(signal)) => return signal.payload.room_reference,
                Ok(None) => {}
                Err(e) => tracing::warn!(call_id, "Failed to read call signals: {}", e),
            }

            if let Ok(Some(fresh)) = self.inner.store.fetch_session(call_id).await {
                if fresh.room_reference.is_some() {
                    return fresh.room_reference;
                }
            }

            tracing::debug!(call_id, attempt, "Room reference not available yet");
        }

        tracing::warn!(call_id, "Delivering incoming call without room reference");
        None
    }

    /// Profilname, dann `caller_name` des Datensatzes, dann die ID
    async fn resolve_caller_name(&self, session: &CallSession) -> String {
        match self.inner.store.display_name(&session.caller_id).await {
            Ok(Some(name)) if !name.trim().is_empty() => return name,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(caller_id = %session.caller_id, "Failed to resolve display name: {}", e)
            }
        }

        if !session.caller_name.trim().is_empty() {
            session.caller_name.clone()
        } else {
            session.caller_id.clone()
        }
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("user_id", &self.inner.user_id)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
