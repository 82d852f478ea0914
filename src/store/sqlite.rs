//! SQLite Call Store
//!
//! SQLite-Datenbank für Anrufe, Signale, Profile und Last-Seen.
//! Jede erfolgreiche Schreiboperation wird zusätzlich über einen
//! `broadcast`-Kanal als Change-Stream ausgeliefert.

use super::{
    CallStore, ChangeFilter, ChangeSubscription, PresenceSource, StatusWrite, StoreChange,
    StoreError,
};
use crate::model::{CallSession, CallSignal, CallStatus, SignalPayload, SignalType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::broadcast;

/// Kapazität des Change-Streams
const CHANGE_CHANNEL_CAPACITY: usize = 256;

const SESSION_COLUMNS: &str = "call_id, caller_id, callee_id, call_type, status, caller_name, \
                               room_reference, started_at, ended_at";

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für Anrufe (Thread-safe durch Mutex)
pub struct SqliteCallStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteCallStore {
    /// Öffnet oder erstellt die Datenbank
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call database at {:?}", db_path);

        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// In-Memory Datenbank (Tests und flüchtige Sitzungen)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            conn: Mutex::new(conn),
            changes,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS call_sessions (
                call_id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                callee_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL,
                caller_name TEXT NOT NULL,
                room_reference TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT
            );

            -- Höchstens ein aktiver Anruf pro geordnetem Paar
            CREATE UNIQUE INDEX IF NOT EXISTS idx_call_sessions_active_pair
                ON call_sessions(caller_id, callee_id)
                WHERE status IN ('ringing', 'connected');

            CREATE INDEX IF NOT EXISTS idx_call_sessions_callee ON call_sessions(callee_id);

            CREATE TABLE IF NOT EXISTS call_signals (
                signal_id TEXT PRIMARY KEY,
                call_id TEXT NOT NULL,
                from_user_id TEXT NOT NULL,
                to_user_id TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_call_signals_call_id ON call_signals(call_id);

            CREATE TABLE IF NOT EXISTS presence (
                user_id TEXT PRIMARY KEY,
                last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        Ok(())
    }

    /// Legt ein Profil an oder aktualisiert den Anzeigenamen
    pub fn upsert_profile(&self, user_id: &str, display_name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO profiles (user_id, display_name)
            VALUES (?1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                updated_at = datetime('now')
            "#,
            params![user_id, display_name],
        )?;
        Ok(())
    }

    fn publish(&self, change: StoreChange) {
        // Keine Subscriber ist kein Fehler
        let _ = self.changes.send(change);
    }

    // ========================================================================
    // SYNCHRONE OPERATIONEN
    // ========================================================================

    fn insert_session_sync(&self, session: &CallSession) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO call_sessions ({SESSION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    session.call_id,
                    session.caller_id,
                    session.callee_id,
                    session.call_type.as_str(),
                    session.status.as_str(),
                    session.caller_name,
                    session.room_reference,
                    session.started_at,
                    session.ended_at,
                ],
            )
            .map_err(|e| map_insert_error(e, session))?;
        }

        self.publish(StoreChange::SessionInserted(session.clone()));
        Ok(())
    }

    fn fetch_session_inner(
        conn: &Connection,
        call_id: &str,
    ) -> Result<Option<CallSession>, StoreError> {
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM call_sessions WHERE call_id = ?1"),
                params![call_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn update_status_sync(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<StatusWrite, StoreError> {
        let updated = {
            let conn = self.conn.lock();
            let current = Self::fetch_session_inner(&conn, call_id)?
                .ok_or_else(|| StoreError::SessionNotFound(call_id.to_string()))?;

            if current.status == status {
                return Ok(StatusWrite::Unchanged(current));
            }
            if !current.status.can_transition_to(status) {
                return Ok(StatusWrite::Rejected(current));
            }

            let ended_at = status.is_terminal().then(Utc::now);
            conn.execute(
                r#"
                UPDATE call_sessions
                SET status = ?2, ended_at = COALESCE(ended_at, ?3)
                WHERE call_id = ?1
                "#,
                params![call_id, status.as_str(), ended_at],
            )?;

            Self::fetch_session_inner(&conn, call_id)?
                .ok_or_else(|| StoreError::SessionNotFound(call_id.to_string()))?
        };

        self.publish(StoreChange::SessionUpdated(updated.clone()));
        Ok(StatusWrite::Applied(updated))
    }

    fn insert_signal_sync(&self, signal: &CallSignal) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&signal.payload)
            .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
        {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                INSERT INTO call_signals
                    (signal_id, call_id, from_user_id, to_user_id, signal_type, payload, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    signal.signal_id,
                    signal.call_id,
                    signal.from_user_id,
                    signal.to_user_id,
                    signal.signal_type.as_str(),
                    payload,
                    signal.created_at,
                ],
            )?;
        }

        self.publish(StoreChange::SignalInserted(signal.clone()));
        Ok(())
    }
}

// ============================================================================
// TRAIT IMPLEMENTATIONS
// ============================================================================

#[async_trait]
impl CallStore for SqliteCallStore {
    async fn insert_session(&self, session: &CallSession) -> Result<(), StoreError> {
        self.insert_session_sync(session)
    }

    async fn fetch_session(&self, call_id: &str) -> Result<Option<CallSession>, StoreError> {
        let conn = self.conn.lock();
        Self::fetch_session_inner(&conn, call_id)
    }

    async fn active_session_between(
        &self,
        caller_id: &str,
        callee_id: &str,
    ) -> Result<Option<CallSession>, StoreError> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM call_sessions \
                     WHERE caller_id = ?1 AND callee_id = ?2 \
                     AND status IN ('ringing', 'connected')"
                ),
                params![caller_id, callee_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<StatusWrite, StoreError> {
        self.update_status_sync(call_id, status)
    }

    async fn insert_signal(&self, signal: &CallSignal) -> Result<(), StoreError> {
        self.insert_signal_sync(signal)
    }

    async fn latest_room_signal(&self, call_id: &str) -> Result<Option<CallSignal>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT signal_id, call_id, from_user_id, to_user_id, signal_type, payload, created_at
            FROM call_signals
            WHERE call_id = ?1
            ORDER BY created_at DESC
            "#,
        )?;

        let signals = stmt
            .query_map(params![call_id], signal_from_row)?
            .collect::<rusqlite::Result<Vec<CallSignal>>>()?;

        Ok(signals
            .into_iter()
            .find(|s| s.payload.room_reference.is_some()))
    }

    async fn display_name(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let name = conn
            .query_row(
                "SELECT display_name FROM profiles WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(name)
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeSubscription {
        ChangeSubscription::new(self.changes.subscribe(), filter)
    }
}

#[async_trait]
impl PresenceSource for SqliteCallStore {
    async fn record_heartbeat(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO presence (user_id, last_seen)
            VALUES (?1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
            params![user_id, at],
        )?;
        Ok(())
    }

    async fn last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock();
        let last_seen = conn
            .query_row(
                "SELECT last_seen FROM presence WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, DateTime<Utc>>(0),
            )
            .optional()?;
        Ok(last_seen)
    }
}

impl std::fmt::Debug for SqliteCallStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCallStore")
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<CallSession> {
    Ok(CallSession {
        call_id: row.get(0)?,
        caller_id: row.get(1)?,
        callee_id: row.get(2)?,
        call_type: parse_column(row, 3)?,
        status: parse_column(row, 4)?,
        caller_name: row.get(5)?,
        room_reference: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<CallSignal> {
    let signal_type = match row.get::<_, String>(4)?.as_str() {
        "offer" => SignalType::Offer,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                4,
                Type::Text,
                format!("unknown signal type: {other}").into(),
            ))
        }
    };
    let payload_json: String = row.get(5)?;
    let payload: SignalPayload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(CallSignal {
        signal_id: row.get(0)?,
        call_id: row.get(1)?,
        from_user_id: row.get(2)?,
        to_user_id: row.get(3)?,
        signal_type,
        payload,
        created_at: row.get(6)?,
    })
}

fn map_insert_error(err: rusqlite::Error, session: &CallSession) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, message) if e.code == ErrorCode::ConstraintViolation => {
            if message
                .as_deref()
                .is_some_and(|m| m.contains("call_sessions.call_id"))
            {
                StoreError::DuplicateSession(session.call_id.clone())
            } else {
                StoreError::ActiveSessionExists {
                    caller_id: session.caller_id.clone(),
                    callee_id: session.callee_id.clone(),
                }
            }
        }
        _ => StoreError::Sqlite(err),
    }
}

// ============================================================================
// TESTS
// ============================================================================
