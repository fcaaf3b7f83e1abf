//! Webhook ingestion (§4.4). No `AuthenticatedUser` guard — providers can't
//! present a bearer token — and every handler returns 2xx regardless of
//! internal outcome so a provider never multiplies retries on top of ours.

use std::sync::Arc;

use base64::Engine;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::State;
use serde::Deserialize;

use crate::state::AppState;
use crate::sync::{CalendarPushHeaders, GmailPushPayload, OutlookChangeNotification};

#[derive(Debug, Deserialize)]
pub struct PubSubEnvelope {
    pub message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
pub struct PubSubMessage {
    pub data: String,
}

#[derive(Debug, Deserialize)]
struct GmailPushData {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: serde_json::Value,
}

#[post("/webhooks/gmail", data = "<envelope>")]
pub async fn gmail(state: &State<Arc<AppState>>, envelope: Json<PubSubEnvelope>) -> Status {
    let decoded = match base64::engine::general_purpose::STANDARD.decode(&envelope.message.data) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("gmail webhook: invalid base64 payload: {e}");
            return Status::Ok;
        }
    };
    let parsed: Result<GmailPushData, _> = serde_json::from_slice(&decoded);
    match parsed {
        Ok(data) => {
            let history_id = match data.history_id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            state
                .webhook
                .handle_gmail_push(GmailPushPayload {
                    email_address: data.email_address,
                    history_id,
                })
                .await;
        }
        Err(e) => log::warn!("gmail webhook: malformed push data: {e}"),
    }
    Status::Ok
}

#[derive(Debug, Deserialize)]
pub struct OutlookNotificationEnvelope {
    pub value: Vec<OutlookNotificationItem>,
}

#[derive(Debug, Deserialize)]
pub struct OutlookNotificationItem {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "resourceData")]
    pub resource_data: Option<OutlookResourceData>,
    #[serde(rename = "clientState")]
    pub client_state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutlookResourceData {
    pub id: Option<String>,
}

#[allow(non_snake_case)]
#[get("/webhooks/outlook?<validationToken>")]
pub fn outlook_validate(validationToken: Option<String>) -> (Status, String) {
    match validationToken {
        Some(token) => (Status::Ok, token),
        None => (Status::Ok, String::new()),
    }
}

#[post("/webhooks/outlook", data = "<body>")]
pub async fn outlook(state: &State<Arc<AppState>>, body: Json<OutlookNotificationEnvelope>) -> Status {
    for item in &body.value {
        state
            .webhook
            .handle_outlook_notification(OutlookChangeNotification {
                subscription_id: item.subscription_id.clone(),
                resource_data_id: item.resource_data.as_ref().and_then(|r| r.id.clone()),
            })
            .await;
    }
    Status::Ok
}

#[post("/webhooks/google-calendar")]
pub async fn google_calendar(
    state: &State<Arc<AppState>>,
    channel_id: GoogChannelId,
    resource_id: GoogResourceId,
    resource_state: GoogResourceState,
) -> Status {
    if resource_state.0 == "sync" {
        log::debug!("google calendar watch handshake for channel {}", channel_id.0);
        return Status::Ok;
    }
    state
        .webhook
        .handle_calendar_push(CalendarPushHeaders {
            channel_id: channel_id.0,
            resource_state: resource_state.0,
        })
        .await;
    let _ = resource_id;
    Status::Ok
}

#[derive(Debug, Deserialize)]
pub struct OutlookCalendarNotificationEnvelope {
    pub value: Vec<OutlookNotificationItem>,
}

const OUTLOOK_CALENDAR_CLIENT_STATE: &str = "calendar-watch";

#[post("/webhooks/outlook-calendar", data = "<body>")]
pub async fn outlook_calendar(state: &State<Arc<AppState>>, body: Json<OutlookCalendarNotificationEnvelope>) -> Status {
    for item in &body.value {
        if item.client_state.as_deref() != Some(OUTLOOK_CALENDAR_CLIENT_STATE) {
            continue;
        }
        state
            .webhook
            .handle_outlook_notification(OutlookChangeNotification {
                subscription_id: item.subscription_id.clone(),
                resource_data_id: item.resource_data.as_ref().and_then(|r| r.id.clone()),
            })
            .await;
    }
    Status::Ok
}

macro_rules! goog_header_guard {
    ($name:ident, $header:literal) => {
        pub struct $name(pub String);

        #[rocket::async_trait]
        impl<'r> rocket::request::FromRequest<'r> for $name {
            type Error = ();

            async fn from_request(req: &'r rocket::Request<'_>) -> rocket::request::Outcome<Self, Self::Error> {
                match req.headers().get_one($header) {
                    Some(v) => rocket::request::Outcome::Success($name(v.to_string())),
                    None => rocket::request::Outcome::Success($name(String::new())),
                }
            }
        }
    };
}

goog_header_guard!(GoogChannelId, "X-Goog-Channel-ID");
goog_header_guard!(GoogResourceId, "X-Goog-Resource-ID");
goog_header_guard!(GoogResourceState, "X-Goog-Resource-State");
