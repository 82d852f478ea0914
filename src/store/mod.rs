//! Store Module - Relationale Ablage mit Change-Stream
//!
//! Dieses Modul definiert die Schnittstelle zum gemeinsamen Datenspeicher:
//! - Punkt-Lese/Schreibzugriffe auf `call_id`
//! - Change-Stream gefiltert auf Angerufenen oder einzelnen Anruf
//! - Last-Seen Tabelle für Presence
//!
//! `SqliteCallStore` ist die lokale Referenz-Implementierung.

mod sqlite;

pub use sqlite::SqliteCallStore;

use crate::model::{CallSession, CallSignal, CallStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call session not found: {0}")]
    SessionNotFound(String),

    #[error("Call session already exists: {0}")]
    DuplicateSession(String),

    #[error("An active call already exists from {caller_id} to {callee_id}")]
    ActiveSessionExists { caller_id: String, callee_id: String },

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

// ============================================================================
// WRITE RESULTS
// ============================================================================

/// Ergebnis eines Status-Updates
#[derive(Debug, Clone, PartialEq)]
pub enum StatusWrite {
    /// Übergang wurde geschrieben
    Applied(CallSession),
    /// Datensatz hatte den Status bereits
    Unchanged(CallSession),
    /// Übergang verletzt die Monotonie (z.B. Datensatz ist bereits terminal)
    Rejected(CallSession),
}

impl StatusWrite {
    pub fn session(&self) -> &CallSession {
        match self {
            StatusWrite::Applied(s) | StatusWrite::Unchanged(s) | StatusWrite::Rejected(s) => s,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, StatusWrite::Applied(_))
    }
}

// ============================================================================
// CHANGE STREAM
// ============================================================================

/// Änderungen die über den Change-Stream ausgeliefert werden
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    SessionInserted(CallSession),
    SessionUpdated(CallSession),
    SignalInserted(CallSignal),
}

impl StoreChange {
    pub fn call_id(&self) -> &str {
        match self {
            StoreChange::SessionInserted(s) | StoreChange::SessionUpdated(s) => &s.call_id,
            StoreChange::SignalInserted(s) => &s.call_id,
        }
    }
}

/// Filter für eine Change-Stream Subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Alle Zeilen, bei denen der Benutzer angerufen wird
    Callee(String),
    /// Alle Zeilen eines einzelnen Anrufs
    Call(String),
}

impl ChangeFilter {
    pub fn matches(&self, change: &StoreChange) -> bool {
        match (self, change) {
            (ChangeFilter::Callee(user), StoreChange::SessionInserted(s))
            | (ChangeFilter::Callee(user), StoreChange::SessionUpdated(s)) => s.callee_id == *user,
            (ChangeFilter::Callee(user), StoreChange::SignalInserted(s)) => s.to_user_id == *user,
            (ChangeFilter::Call(call_id), change) => change.call_id() == call_id,
        }
    }
}

/// Gefilterte Subscription auf den Change-Stream
pub struct ChangeSubscription {
    rx: broadcast::Receiver<StoreChange>,
    filter: ChangeFilter,
}

impl ChangeSubscription {
    pub fn new(rx: broadcast::Receiver<StoreChange>, filter: ChangeFilter) -> Self {
        Self { rx, filter }
    }

    /// Wartet auf die nächste passende Änderung. `None` wenn der Stream geschlossen ist.
    pub async fn next(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(filter = ?self.filter, skipped, "Change stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// STORE TRAITS
// ============================================================================

/// Gemeinsamer Datenspeicher für Anrufe
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert_session(&self, session: &CallSession) -> Result<(), StoreError>;

    async fn fetch_session(&self, call_id: &str) -> Result<Option<CallSession>, StoreError>;

    /// Aktiver Anruf (`ringing`/`connected`) für das geordnete Paar
    async fn active_session_between(
        &self,
        caller_id: &str,
        callee_id: &str,
    ) -> Result<Option<CallSession>, StoreError>;

    /// Setzt den Status monoton. `ended_at` wird nur beim ersten terminalen Schreiben gesetzt.
    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<StatusWrite, StoreError>;

    async fn insert_signal(&self, signal: &CallSignal) -> Result<(), StoreError>;

    /// Letztes Signal eines Anrufs, das eine `room_reference` trägt
    async fn latest_room_signal(&self, call_id: &str) -> Result<Option<CallSignal>, StoreError>;

    async fn display_name(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    fn subscribe(&self, filter: ChangeFilter) -> ChangeSubscription;
}

/// Quelle für Last-Seen Informationen
#[async_trait]
pub trait PresenceSource: Send + Sync {
    async fn record_heartbeat(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}
