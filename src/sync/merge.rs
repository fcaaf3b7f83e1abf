//! Provider → local field mapping (§4.3.5). Isolated from the engine so the
//! merge rule — which fields a provider upsert may overwrite, which it must
//! preserve — reads as one small, reviewable function.

use crate::models::{ProviderMessageFields, ProviderMessageSummary};
use crate::provider::ProviderMessage;

pub fn provider_message_to_fields(msg: ProviderMessage) -> ProviderMessageFields {
    ProviderMessageFields {
        external_id: msg.external_id,
        thread_id: msg.thread_id,
        from_address: msg.from_address,
        to_addresses: msg.to_addresses,
        cc_addresses: msg.cc_addresses,
        bcc_addresses: Vec::new(),
        subject: msg.subject,
        snippet: msg.snippet,
        folder: msg.folder,
        labels: msg.labels,
        is_read: msg.is_read,
        is_starred: msg.is_starred,
        has_attachment: msg.has_attachment,
        received_at: msg.received_at,
    }
}

/// Same mapping, from the metadata-only summary a Save Job carries (no
/// `bcc_addresses`: providers don't surface bcc in list responses).
pub fn provider_summary_to_fields(msg: &ProviderMessageSummary) -> ProviderMessageFields {
    ProviderMessageFields {
        external_id: msg.external_id.clone(),
        thread_id: msg.thread_id.clone(),
        from_address: msg.from_address.clone(),
        to_addresses: msg.to_addresses.clone(),
        cc_addresses: msg.cc_addresses.clone(),
        bcc_addresses: Vec::new(),
        subject: msg.subject.clone(),
        snippet: msg.snippet.clone(),
        folder: msg.folder,
        labels: msg.labels.clone(),
        is_read: msg.is_read,
        is_starred: msg.is_starred,
        has_attachment: msg.has_attachment,
        received_at: msg.received_at,
    }
}
