//! Audio Module - Routing und exklusive Audio-Session
//!
//! Dieses Modul verwaltet:
//! - Earpiece/Lautsprecher Routing gegen Plattform-Autoswitching
//! - Prozessweite Leases für den Streaming-Audio-Modus

mod lease;
mod route;

pub use lease::{
    AudioLease, AudioMode, AudioModeCoordinator, AudioSessionPlatform, LeaseError,
    NoopAudioSession,
};
pub use route::{
    AudioOutput, AudioRouteCoordinator, AudioRoutePlatform, AudioRouteState, RouteError,
};
