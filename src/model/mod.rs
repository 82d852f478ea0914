//! Model Module - Gemeinsame Datensätze
//!
//! - `CallSession`: ein Anruf vom Start bis zum Ende
//! - `CallSignal`: Signalisierungs-Nachricht als Ausweichpfad

mod session;
mod signal;

pub use session::{CallSession, CallStatus, CallType, ParseError};
pub use signal::{CallSignal, SignalPayload, SignalType};
