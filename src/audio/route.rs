//! Audio Route Coordinator
//!
//! Plattform und Media-Engine schalten beim Start von Ringback oder
//! Media-Stream gerne eigenmächtig auf den Lautsprecher. Deshalb halten
//! wir einen expliziten Soll-Zustand und setzen ihn bei jedem
//! Zustandswechsel sowie periodisch erneut durch, solange Earpiece
//! gewünscht ist.
//!
//! TODO: durch ein echtes Route-Lock ersetzen, sobald die Zielplattform
//! eines anbietet; dann entfällt die periodische Durchsetzung.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Audio route unavailable: {0}")]
    Unavailable(String),
}

/// Ausgabegerät
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioOutput {
    Earpiece,
    Speaker,
}

/// Lokaler Routing-Zustand eines Anrufs (nicht persistiert)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRouteState {
    pub desired_output: AudioOutput,
    pub enforced: bool,
}

impl Default for AudioRouteState {
    fn default() -> Self {
        Self {
            desired_output: AudioOutput::Earpiece,
            enforced: false,
        }
    }
}

/// Plattform-Schnittstelle zum Umschalten der Audio-Ausgabe
pub trait AudioRoutePlatform: Send + Sync {
    fn apply_output(&self, output: AudioOutput) -> Result<(), RouteError>;
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Soll-Zustand, Anruf-Flag und Enforcement-Task unter einem Lock.
/// `enforcer` ist nur gesetzt, solange `call_active` gilt.
#[derive(Default)]
struct RouteSession {
    state: AudioRouteState,
    call_active: bool,
    enforcer: Option<CancellationToken>,
}

struct RouteInner {
    platform: Arc<dyn AudioRoutePlatform>,
    interval: Duration,
    session: Mutex<RouteSession>,
}

/// Koordiniert Earpiece/Lautsprecher für die Dauer eines Anrufs
#[derive(Clone)]
pub struct AudioRouteCoordinator {
    inner: Arc<RouteInner>,
}

impl AudioRouteCoordinator {
    pub fn new(platform: Arc<dyn AudioRoutePlatform>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(RouteInner {
                platform,
                interval,
                session: Mutex::new(RouteSession::default()),
            }),
        }
    }

    pub fn state(&self) -> AudioRouteState {
        self.inner.session.lock().state
    }

    pub fn desired_output(&self) -> AudioOutput {
        self.inner.session.lock().state.desired_output
    }

    /// Setzt den Soll-Zustand für einen neuen Anruf zurück (Earpiece),
    /// ohne schon etwas durchzusetzen
    pub fn prepare_call(&self) {
        let mut session = self.inner.session.lock();
        RouteInner::stop_enforcement(&mut session);
        session.state = AudioRouteState::default();
        session.call_active = false;
    }

    /// Ab hier wird der Soll-Zustand durchgesetzt. Eine vorherige Wahl
    /// des Benutzers bleibt erhalten.
    pub fn begin_call(&self) {
        self.inner.session.lock().call_active = true;
    }

    /// Bei `connecting`, `ringing` und `connected` aufrufen
    pub fn on_call_transition(&self) {
        let mut session = self.inner.session.lock();
        if !session.call_active {
            return;
        }
        let desired = session.state.desired_output;
        self.inner.assert_output(desired);
        if desired == AudioOutput::Earpiece {
            self.inner.start_enforcement(&mut session);
        }
    }

    /// Vom Benutzer ausgelöstes Umschalten
    pub fn set_output(&self, output: AudioOutput) {
        let mut session = self.inner.session.lock();
        self.inner.assert_output(output);
        session.state.desired_output = output;

        match output {
            AudioOutput::Speaker => RouteInner::stop_enforcement(&mut session),
            AudioOutput::Earpiece => {
                if session.call_active {
                    self.inner.start_enforcement(&mut session);
                }
            }
        }
    }

    /// Anruf ist terminal: Enforcement stoppen
    pub fn end_call(&self) {
        let mut session = self.inner.session.lock();
        session.call_active = false;
        RouteInner::stop_enforcement(&mut session);
    }

    pub fn is_enforcing(&self) -> bool {
        self.inner.session.lock().state.enforced
    }
}

impl RouteInner {
    fn assert_output(&self, output: AudioOutput) {
        if let Err(e) = self.platform.apply_output(output) {
            tracing::warn!(?output, "Failed to apply audio route: {}", e);
        }
    }

    fn start_enforcement(self: &Arc<Self>, session: &mut RouteSession) {
        if session.enforcer.is_some() || !session.call_active {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let period = inner.interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = loop_token.cancelled() => break,
                }
                let session = inner.session.lock();
                if loop_token.is_cancelled() || session.state.desired_output != AudioOutput::Earpiece {
                    break;
                }
                inner.assert_output(AudioOutput::Earpiece);
            }
        });

        session.enforcer = Some(token);
        session.state.enforced = true;
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "Earpiece enforcement started");
    }

    fn stop_enforcement(session: &mut RouteSession) {
        if let Some(token) = session.enforcer.take() {
            token.cancel();
            tracing::debug!("Earpiece enforcement stopped");
        }
        session.state.enforced = false;
    }
}

impl std::fmt::Debug for AudioRouteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRouteCoordinator")
            .field("state", &self.state())
            .field("interval", &self.inner.interval)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
