//! Media Session Lifecycle
//!
//! Eine `MediaSession` bündelt den exklusiven Audio-Lease und die
//! Room-Mitgliedschaft eines Anrufs. Beides wird über `release()` genau
//! einmal freigegeben, egal über welchen Pfad der Anruf endet.

use super::engine::{MediaEngine, MediaError};
use crate::audio::{AudioLease, AudioMode, AudioModeCoordinator, LeaseError};
use crate::model::CallType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Erstellt Media Sessions für Anrufe
#[derive(Clone)]
pub struct MediaSessionManager {
    engine: Arc<dyn MediaEngine>,
    coordinator: AudioModeCoordinator,
}

impl MediaSessionManager {
    pub fn new(engine: Arc<dyn MediaEngine>, coordinator: AudioModeCoordinator) -> Self {
        Self {
            engine,
            coordinator,
        }
    }

    /// Fordert den Streaming-Lease an. Schlägt fehl, solange ein anderer Halter existiert.
    pub fn begin(&self, call_id: &str) -> Result<Arc<MediaSession>, LeaseError> {
        let lease = self
            .coordinator
            .try_acquire(AudioMode::Streaming, &format!("call:{call_id}"))?;

        Ok(Arc::new(MediaSession {
            call_id: call_id.to_string(),
            engine: Arc::clone(&self.engine),
            lease,
            room: Mutex::new(None),
            released: AtomicBool::new(false),
        }))
    }

    pub fn coordinator(&self) -> &AudioModeCoordinator {
        &self.coordinator
    }
}

/// Lease und Room-Mitgliedschaft eines Anrufs
pub struct MediaSession {
    call_id: String,
    engine: Arc<dyn MediaEngine>,
    lease: AudioLease,
    room: Mutex<Option<String>>,
    released: AtomicBool,
}

impl MediaSession {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn lease_id(&self) -> &str {
        self.lease.lease_id()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Room dem aktuell beigetreten ist
    pub fn joined_room(&self) -> Option<String> {
        self.room.lock().clone()
    }

    /// Token holen und dem Room beitreten.
    ///
    /// Wurde die Session währenddessen freigegeben, wird der Room sofort
    /// wieder verlassen und `SessionReleased` geliefert.
    pub async fn join(
        &self,
        room_reference: &str,
        user_id: &str,
        call_type: CallType,
    ) -> Result<(), MediaError> {
        if self.is_released() {
            return Err(MediaError::SessionReleased);
        }

        let token = self.engine.issue_token(room_reference, user_id).await?;
        self.engine.join(room_reference, &token, call_type).await?;

        let stale = {
            let mut room = self.room.lock();
            if self.is_released() {
                true
            } else {
                *room = Some(room_reference.to_string());
                false
            }
        };

        if stale {
            tracing::debug!(call_id = %self.call_id, "Join finished after release, leaving room");
            self.leave_best_effort(room_reference).await;
            return Err(MediaError::SessionReleased);
        }

        tracing::info!(call_id = %self.call_id, room = %room_reference, "Joined media room");
        Ok(())
    }

    /// Gibt Lease und Room frei. Liefert `true` nur beim ersten Aufruf.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.lease.release();
        let room = self.room.lock().take();
        if let Some(room) = room {
            self.leave_best_effort(&room).await;
        }

        tracing::debug!(call_id = %self.call_id, "Media session released");
        true
    }

    async fn leave_best_effort(&self, room_reference: &str) {
        if let Err(e) = self.engine.leave(room_reference).await {
            tracing::warn!(call_id = %self.call_id, room = %room_reference, "Failed to leave room: {}", e);
        }
    }
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("call_id", &self.call_id)
            .field("lease_id", &self.lease.lease_id())
            .field("room", &self.joined_room())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMediaEngine;
    use std::time::Duration;

    fn manager() -> (MediaSessionManager, Arc<FakeMediaEngine>) {
        let engine = Arc::new(FakeMediaEngine::default());
        (
            MediaSessionManager::new(engine.clone(), AudioModeCoordinator::default()),
            engine,
        )
    }

    #[tokio::test]
    async fn test_second_call_is_denied_while_lease_held() {
        let (manager, _engine) = manager();
        let first = manager.begin("c1").unwrap();

        assert!(matches!(manager.begin("c2"), Err(LeaseError::Busy { .. })));

        first.release().await;
        assert!(manager.begin("c2").is_ok());
    }

    #[tokio::test]
    async fn test_release_leaves_room_exactly_once() {
        let (manager, engine) = manager();
        let session = manager.begin("c1").unwrap();
        session.join("room-c1", "alice", CallType::Voice).await.unwrap();
        assert_eq!(session.joined_room().as_deref(), Some("room-c1"));

        assert!(session.release().await);
        assert!(!session.release().await);

        assert_eq!(engine.count("leave:room-c1"), 1);
        assert!(!manager.coordinator().is_held());
    }

    #[tokio::test]
    async fn test_join_after_release_is_refused() {
        let (manager, engine) = manager();
        let session = manager.begin("c1").unwrap();
        session.release().await;

        let err = session.join("room-c1", "alice", CallType::Voice).await.unwrap_err();
        assert_eq!(err, MediaError::SessionReleased);
        assert_eq!(engine.count("join:room-c1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_during_join_leaves_room() {
        let (manager, engine) = manager();
        let gate = engine.gate_joins();
        let session = manager.begin("c1").unwrap();

        let joining = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.join("room-c1", "alice", CallType::Voice).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.release().await;
        gate.notify_one();

        let result = joining.await.unwrap();
        assert_eq!(result, Err(MediaError::SessionReleased));
        assert_eq!(engine.count("leave:room-c1"), 1);
        assert!(session.joined_room().is_none());
    }
}
