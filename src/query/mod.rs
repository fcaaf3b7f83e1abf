//! Filter → provider-native query translation (§4.5). A pure, side-effect
//! free module with no DB/network handles in scope; this is the one place
//! in the crate where exhaustive unit coverage earns its keep (property
//! P10: the translated query is never more permissive than the filter).

use chrono::NaiveDate;

/// The fields an AI-only filter can carry. Presence of any of these means
/// the provider cannot satisfy the filter and the hybrid path must skip it.
const AI_ONLY_FIELDS: &[&str] = &[
    "category",
    "sub_category",
    "priority",
    "workflow_status",
    "label_ids",
    "folder_id",
];

#[derive(Debug, Clone, Default)]
pub struct EmailFilter {
    pub folder: Option<String>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub from_email: Option<String>,
    pub from_domain: Option<String>,
    pub has_attachment: Option<bool>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub search: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub priority: Option<String>,
    pub workflow_status: Option<String>,
    pub label_ids: Option<Vec<String>>,
    pub folder_id: Option<String>,
}

impl EmailFilter {
    /// True if any AI-only field is set. The provider cannot satisfy these;
    /// the hybrid read path MUST skip the provider call entirely.
    pub fn has_ai_only_fields(&self) -> bool {
        self.category.is_some()
            || self.sub_category.is_some()
            || self.priority.is_some()
            || self.workflow_status.is_some()
            || self.label_ids.is_some()
            || self.folder_id.is_some()
    }

    /// Names of the AI-only fields present, for diagnostics/logging.
    pub fn ai_only_fields_present(&self) -> Vec<&'static str> {
        let mut present = Vec::new();
        if self.category.is_some() {
            present.push(AI_ONLY_FIELDS[0]);
        }
        if self.sub_category.is_some() {
            present.push(AI_ONLY_FIELDS[1]);
        }
        if self.priority.is_some() {
            present.push(AI_ONLY_FIELDS[2]);
        }
        if self.workflow_status.is_some() {
            present.push(AI_ONLY_FIELDS[3]);
        }
        if self.label_ids.is_some() {
            present.push(AI_ONLY_FIELDS[4]);
        }
        if self.folder_id.is_some() {
            present.push(AI_ONLY_FIELDS[5]);
        }
        present
    }
}

/// `in:<folder>|-in:inbox -in:spam -in:trash`, `is:read|is:unread`,
/// `is:starred`, `from:<email>`/`from:@<domain>`, `after:`/`before:`,
/// `has:attachment`, free text appended last.
pub fn translate_gmail(filter: &EmailFilter) -> String {
    let mut terms: Vec<String> = Vec::new();

    if let Some(folder) = &filter.folder {
        match folder.as_str() {
            "archive" => terms.push("-in:inbox -in:spam -in:trash".to_string()),
            other => terms.push(format!("in:{other}")),
        }
    }
    match filter.is_read {
        Some(true) => terms.push("is:read".to_string()),
        Some(false) => terms.push("is:unread".to_string()),
        None => {}
    }
    if filter.is_starred == Some(true) {
        terms.push("is:starred".to_string());
    }
    if let Some(email) = &filter.from_email {
        terms.push(format!("from:{email}"));
    } else if let Some(domain) = &filter.from_domain {
        terms.push(format!("from:@{domain}"));
    }
    if let Some(date) = filter.date_from {
        terms.push(format!("after:{}", date.format("%Y/%m/%d")));
    }
    if let Some(date) = filter.date_to {
        terms.push(format!("before:{}", date.format("%Y/%m/%d")));
    }
    if filter.has_attachment == Some(true) {
        terms.push("has:attachment".to_string());
    }
    if let Some(search) = &filter.search {
        if !search.is_empty() {
            terms.push(search.clone());
        }
    }

    terms.join(" ")
}

pub struct OutlookQuery {
    pub filter: String,
    pub search: Option<String>,
    pub folder_path: String,
}

/// OData `$filter` conjunction + `$search` for free text; folder is a URL
/// path prefix, not a filter clause.
pub fn translate_outlook(filter: &EmailFilter) -> OutlookQuery {
    let mut clauses: Vec<String> = Vec::new();

    match filter.is_read {
        Some(true) => clauses.push("isRead eq true".to_string()),
        Some(false) => clauses.push("isRead eq false".to_string()),
        None => {}
    }
    if filter.is_starred == Some(true) {
        clauses.push("flag/flagStatus eq 'flagged'".to_string());
    }
    if filter.has_attachment == Some(true) {
        clauses.push("hasAttachments eq true".to_string());
    }
    if let Some(email) = &filter.from_email {
        clauses.push(format!("from/emailAddress/address eq '{email}'"));
    } else if let Some(domain) = &filter.from_domain {
        clauses.push(format!(
            "endswith(from/emailAddress/address,'@{domain}')"
        ));
    }
    if let Some(date) = filter.date_from {
        clauses.push(format!(
            "receivedDateTime ge {}",
            date.and_hms_opt(0, 0, 0).unwrap().and_utc().to_rfc3339()
        ));
    }
    if let Some(date) = filter.date_to {
        clauses.push(format!(
            "receivedDateTime le {}",
            date.and_hms_opt(23, 59, 59).unwrap().and_utc().to_rfc3339()
        ));
    }

    let folder_path = match filter.folder.as_deref() {
        Some("archive") => "mailFolders/archive/messages".to_string(),
        Some(other) => format!("mailFolders/{other}/messages"),
        None => "messages".to_string(),
    };

    OutlookQuery {
        filter: clauses.join(" and "),
        search: filter.search.clone().filter(|s| !s.is_empty()),
        folder_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_unread_inbox() -> EmailFilter {
        EmailFilter {
            folder: Some("inbox".to_string()),
            is_read: Some(false),
            ..Default::default()
        }
    }

    #[test]
    fn gmail_translates_folder_and_read_status() {
        let q = translate_gmail(&filter_unread_inbox());
        assert_eq!(q, "in:inbox is:unread");
    }

    #[test]
    fn gmail_archive_folder_excludes_standard_folders() {
        let filter = EmailFilter {
            folder: Some("archive".to_string()),
            ..Default::default()
        };
        assert_eq!(translate_gmail(&filter), "-in:inbox -in:spam -in:trash");
    }

    #[test]
    fn gmail_combines_multiple_terms_in_order() {
        let filter = EmailFilter {
            folder: Some("inbox".to_string()),
            is_starred: Some(true),
            has_attachment: Some(true),
            search: Some("invoice".to_string()),
            ..Default::default()
        };
        assert_eq!(
            translate_gmail(&filter),
            "in:inbox is:starred has:attachment invoice"
        );
    }

    #[test]
    fn outlook_translates_read_and_starred() {
        let q = translate_outlook(&filter_unread_inbox());
        assert_eq!(q.filter, "isRead eq false");
        assert_eq!(q.folder_path, "mailFolders/inbox/messages");
    }

    #[test]
    fn outlook_routes_free_text_to_search_not_filter() {
        let filter = EmailFilter {
            search: Some("quarterly report".to_string()),
            ..Default::default()
        };
        let q = translate_outlook(&filter);
        assert!(q.filter.is_empty());
        assert_eq!(q.search.as_deref(), Some("quarterly report"));
    }

    #[test]
    fn ai_only_filter_detected_and_skips_provider() {
        let filter = EmailFilter {
            category: Some("primary".to_string()),
            ..Default::default()
        };
        assert!(filter.has_ai_only_fields());
        assert_eq!(filter.ai_only_fields_present(), vec!["category"]);
    }

    #[test]
    fn plain_filter_has_no_ai_only_fields() {
        assert!(!filter_unread_inbox().has_ai_only_fields());
    }

    // P10: the translated query is a conjunction of the filter's own terms
    // only — never introduces terms the filter didn't specify, so the
    // provider-side result set is always a subset of what the original
    // filter would match.
    #[test]
    fn translated_gmail_query_is_never_more_permissive_than_filter() {
        let empty = EmailFilter::default();
        assert_eq!(translate_gmail(&empty), "");

        let narrow = EmailFilter {
            folder: Some("inbox".to_string()),
            is_read: Some(false),
            is_starred: Some(true),
            ..Default::default()
        };
        let q = translate_gmail(&narrow);
        for expected in ["in:inbox", "is:unread", "is:starred"] {
            assert!(q.contains(expected), "missing {expected} in {q}");
        }
        assert_eq!(q.split(' ').count(), 3);
    }
}
