//! Notify Module - Wake-Push und Benachrichtigungs-Antworten

mod dispatcher;

pub use dispatcher::{
    Alerter, NoopAlerter, NotificationAction, NotificationResponse, PushError, PushMessage,
    PushPriority, PushService, WakeDispatcher,
};
