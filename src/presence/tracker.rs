//! Presence Tracker
//!
//! Liest die Last-Seen Tabelle bei Bedarf und schreibt periodisch den
//! eigenen Heartbeat.

use crate::store::PresenceSource;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Zwischengespeicherter Presence-Stand eines Benutzers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_online: bool,
}

/// Presence Tracker
pub struct PresenceTracker {
    source: Arc<dyn PresenceSource>,
    records: RwLock<HashMap<String, PresenceRecord>>,
    online_window: ChronoDuration,
}

impl PresenceTracker {
    pub fn new(source: Arc<dyn PresenceSource>, online_window: Duration) -> Self {
        Self {
            source,
            records: RwLock::new(HashMap::new()),
            online_window: ChronoDuration::from_std(online_window)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
        }
    }

    /// Liest den aktuellen Stand für `peer_id` neu ein.
    ///
    /// Fehler werden nur geloggt; das Ergebnis ist dann der zuletzt
    /// bekannte Stand (oder "unbekannt/offline").
    pub async fn refresh(&self, peer_id: &str) -> PresenceRecord {
        match self.source.last_seen(peer_id).await {
            Ok(last_seen) => {
                let record = PresenceRecord {
                    user_id: peer_id.to_string(),
                    is_online: last_seen
                        .map(|seen| Utc::now() - seen <= self.online_window)
                        .unwrap_or(false),
                    last_seen,
                };
                self.records
                    .write()
                    .insert(peer_id.to_string(), record.clone());
                record
            }
            Err(e) => {
                tracing::warn!(peer_id, "Presence refresh failed: {}", e);
                self.records
                    .read()
                    .get(peer_id)
                    .cloned()
                    .unwrap_or_else(|| PresenceRecord {
                        user_id: peer_id.to_string(),
                        last_seen: None,
                        is_online: false,
                    })
            }
        }
    }

    /// Letzter bekannter Online-Status (ohne Netzwerkzugriff)
    pub fn is_online(&self, peer_id: &str) -> bool {
        self.records
            .read()
            .get(peer_id)
            .map(|r| r.is_online)
            .unwrap_or(false)
    }

    /// Menschenlesbarer Last-Seen Text
    pub fn last_seen_text(&self, peer_id: &str) -> String {
        let record = self.records.read().get(peer_id).cloned();
        match record {
            Some(PresenceRecord {
                is_online: true, ..
            }) => "online".to_string(),
            Some(PresenceRecord {
                last_seen: Some(seen),
                ..
            }) => format_last_seen(Utc::now() - seen),
            _ => "never seen".to_string(),
        }
    }

    /// Startet den Heartbeat-Task für den lokalen Benutzer
    pub fn start_heartbeat(&self, user_id: String, interval: Duration) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = source.record_heartbeat(&user_id, Utc::now()).await {
                    tracing::warn!(user_id = %user_id, "Failed to record heartbeat: {}", e);
                }
            }
        })
    }
}

fn format_last_seen(elapsed: ChronoDuration) -> String {
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        return "last seen just now".to_string();
    }
    if minutes < 60 {
        return plural("last seen", minutes, "minute");
    }
    let hours = elapsed.num_hours();
    if hours < 24 {
        return plural("last seen", hours, "hour");
    }
    plural("last seen", elapsed.num_days(), "day")
}

fn plural(prefix: &str, n: i64, unit: &str) -> String {
    if n == 1 {
        format!("{prefix} 1 {unit} ago")
    } else {
        format!("{prefix} {n} {unit}s ago")
    }
}
