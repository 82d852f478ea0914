//! Media Module - Anbindung an die externe Media Engine
//!
//! Dieses Modul verwaltet:
//! - Die Schnittstelle zur Media-Routing Engine (Rooms, Tokens, Events)
//! - Den Lebenszyklus einer Media Session (Lease + Room) pro Anruf

mod engine;
mod session;

pub use engine::{MediaEngine, MediaError, MediaEvent};
pub use session::{MediaSession, MediaSessionManager};
