//! Session Module - Anruf-Orchestrierung
//!
//! - `state`: lokaler Anrufzustand, Snapshot und Events
//! - `api`: `CallOrchestrator` Trait, Fehler und Factory
//! - `manager`: Live-Implementierung
//! - `disabled`: No-op Implementierung

mod api;
mod disabled;
mod manager;
mod state;

#[cfg(test)]
mod scenarios;

pub use api::{build_orchestrator, CallDeps, CallError, CallOrchestrator, IncomingDisposition};
pub use disabled::DisabledCalls;
pub use manager::{CallManager, CallTimings};
pub use state::{CallEvent, CallSnapshot, CallState, Direction, EndReason, FailureKind};
