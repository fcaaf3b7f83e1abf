//! The sync engine: per-connection state machine (§4.3), provider/local
//! merge rules (§4.3.5), and the inbound webhook receiver (§4.4).

pub mod engine;
pub mod merge;
pub mod webhook;

pub use engine::{resolve_background_kind, BackgroundSyncKind, SyncEngine};
pub use webhook::{CalendarPushHeaders, GmailPushPayload, OutlookChangeNotification, WebhookReceiver};
