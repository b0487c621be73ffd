//! Turns raw provider messages into canonical email rows.
//!
//! The policy lives here in one place: messages without a stable identity
//! are never persisted, BCC'd mail is never persisted, and a message already
//! stored for the account is left alone no matter which folder or provider
//! fetch surfaced it again.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{Account, Email};
use crate::db::{Database, DbError};
use crate::fetchers::RawMessage;

const SNIPPET_MAX_CHARS: usize = 240;
const PLACEHOLDER_SUBJECT: &str = "(no subject)";
const PLACEHOLDER_BODY: &str = "(no content)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No provider message id, sender, or timestamp; the row could never be
    /// deduplicated or ordered.
    MissingIdentity,
    /// The account holder was BCC'd; storing it would leak the BCC.
    BccRecipient,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored(Email),
    Skipped(SkipReason),
}

pub fn ingest_message(
    db: &Database,
    account: &Account,
    raw: &RawMessage,
) -> Result<IngestOutcome, DbError> {
    let (Some(provider_message_id), Some(sender), Some(received_at)) = (
        raw.provider_message_id.as_deref(),
        raw.sender.as_deref(),
        raw.received_at,
    ) else {
        return Ok(IngestOutcome::Skipped(SkipReason::MissingIdentity));
    };

    if raw.has_bcc {
        return Ok(IngestOutcome::Skipped(SkipReason::BccRecipient));
    }

    if db.email_exists(&account.account_id, provider_message_id)? {
        return Ok(IngestOutcome::Skipped(SkipReason::Duplicate));
    }

    let body = raw
        .body_html
        .as_deref()
        .or(raw.body_text.as_deref())
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(PLACEHOLDER_BODY)
        .to_string();

    let email = Email {
        id: Uuid::new_v4().to_string(),
        account_id: account.account_id.clone(),
        provider_message_id: provider_message_id.to_string(),
        subject: raw
            .subject
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(PLACEHOLDER_SUBJECT)
            .to_string(),
        sender: sender.to_string(),
        recipients: raw.recipients.clone(),
        cc: raw.cc.clone(),
        snippet: derive_snippet(raw.body_html.as_deref(), raw.body_text.as_deref()),
        body,
        received_at: format_received(received_at),
        references_list: if raw.references.is_empty() {
            None
        } else {
            Some(raw.references.join(" "))
        },
        in_reply_to: raw.in_reply_to.clone(),
        is_read: raw.is_read,
        folder: raw.folder.clone(),
        seq: 0, // assigned by the insert
    };

    db.insert_email(&email)?;
    Ok(IngestOutcome::Stored(email))
}

fn format_received(received_at: DateTime<Utc>) -> String {
    received_at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Short plain-text preview. HTML bodies are rendered down first; html2text
/// can panic on pathological markup, so that path is fenced.
fn derive_snippet(body_html: Option<&str>, body_text: Option<&str>) -> Option<String> {
    let text = match (body_html, body_text) {
        (Some(html), _) => std::panic::catch_unwind(|| {
            html2text::from_read(html.as_bytes(), 120)
                .lines()
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .ok()?,
        (None, Some(text)) => text.to_string(),
        (None, None) => return None,
    };

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }

    Some(collapsed.chars().take(SNIPPET_MAX_CHARS).collect())
}
