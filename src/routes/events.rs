//! Realtime SSE stream (§4.9 transport). Thin relay: `RealtimeEmitter::subscribe`
//! owns ordering/buffering, this handler only forwards to the wire.

use std::sync::Arc;
use std::time::Duration;

use rocket::response::stream::{Event, EventStream};
use rocket::{Shutdown, State};

use crate::models::AuthenticatedUser;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

#[get("/events")]
pub fn stream(user: AuthenticatedUser, state: &State<Arc<AppState>>, mut shutdown: Shutdown) -> EventStream![Event + '_] {
    let mut rx = state.realtime.subscribe(user.user_id);
    EventStream! {
        yield Event::data("connected").event("connected");
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            let payload = serde_json::to_string(&event).unwrap_or_default();
                            yield Event::data(payload).event(event_name(&event));
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Event::comment("heartbeat");
                }
                _ = &mut shutdown => break,
            }
        }
    }
}

fn event_name(event: &crate::models::RealtimeEvent) -> &'static str {
    use crate::models::RealtimeEventType::*;
    match event.event_type {
        SyncStarted => "sync.started",
        SyncFirstBatch => "sync.first_batch",
        SyncProgress => "sync.progress",
        SyncCompleted => "sync.completed",
        SyncError => "sync.error",
        EmailNew => "email.new",
        EmailUpdated => "email.updated",
        EmailDeleted => "email.deleted",
        EmailClassified => "email.classified",
        CalendarUpdated => "calendar.updated",
    }
}
