//! Signaling Module - Zustellung eingehender Anrufe
//!
//! Dieses Modul verwaltet die beiden Zustellpfade für Anruf-Ereignisse:
//! - Change-Stream Subscription (App im Vordergrund)
//! - Wake-Push Nutzdaten (App im Hintergrund oder beendet)
//! - Signale als Ausweichpfad für die `room_reference`
//!

mod channel;
mod messages;

pub use channel::{SignalingChannel, SignalingEvent, WakeOutcome};
pub use messages::WakePayload;
