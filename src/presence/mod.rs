//! Presence Module - Online/Last-Seen Status
//!
//! Rein beratend: Presence blockiert nie einen Anruf. Ein offline
//! wirkender Gegenüber bekommt trotzdem den Anruf plus Wake-Push,
//! der Anrufer sieht nur einen Hinweis.

mod tracker;

pub use tracker::{PresenceRecord, PresenceTracker};
