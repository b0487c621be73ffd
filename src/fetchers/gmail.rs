//! Gmail REST fetcher. Labels stand in for folders; system categories and
//! chat labels are not presented as syncable folders.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::credentials::Secret;
use crate::db::models::Account;

use super::http::RestClient;
use super::{FetchError, MailFetcher, RawAttachment, RawMessage};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_PAGE_SIZE: usize = 100;

/// Labels that are not mail folders in any meaningful sense.
const EXCLUDED_LABELS: &[&str] = &[
    "CHAT",
    "CATEGORY_PERSONAL",
    "CATEGORY_SOCIAL",
    "CATEGORY_PROMOTIONS",
    "CATEGORY_UPDATES",
    "CATEGORY_FORUMS",
];

pub struct GmailFetcher {
    rest: RestClient,
    token: String,
    address: String,
    base: String,
    /// lowercased label name -> label id, filled on first use
    labels: HashMap<String, String>,
    /// message id -> attachment descriptors seen during fetch_since
    pending_attachments: HashMap<String, Vec<AttachmentRef>>,
}

#[derive(Debug, Clone)]
struct AttachmentRef {
    attachment_id: String,
    filename: String,
    mime_type: String,
}

impl GmailFetcher {
    pub fn new(account: &Account, secret: Secret) -> Result<Self, FetchError> {
        let token = match secret {
            Secret::OAuthAccess(token) => token,
            Secret::Password(_) => {
                return Err(FetchError::Connection(
                    "gmail accounts require an oauth access token".to_string(),
                ))
            }
        };

        let base = std::env::var("ESYNC_GMAIL_API_BASE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GMAIL_API_BASE.to_string());

        Ok(Self {
            rest: RestClient::new()?,
            token,
            address: account.address.clone(),
            base,
            labels: HashMap::new(),
            pending_attachments: HashMap::new(),
        })
    }

    async fn ensure_labels(&mut self) -> Result<(), FetchError> {
        if !self.labels.is_empty() {
            return Ok(());
        }

        let url = format!("{}/users/me/labels", self.base);
        let page: GmailLabelList = self.rest.get_json(&self.token, &url).await?;
        for label in page.labels {
            self.labels.insert(label.name.to_lowercase(), label.id);
        }
        Ok(())
    }

    async fn label_id(&mut self, folder: &str) -> Result<String, FetchError> {
        self.ensure_labels().await?;
        self.labels
            .get(&folder.to_lowercase())
            .cloned()
            .ok_or_else(|| FetchError::Protocol(format!("unknown gmail label '{folder}'")))
    }

    async fn get_message(&self, message_id: &str) -> Result<GmailMessage, FetchError> {
        let url = format!(
            "{}/users/me/messages/{message_id}?format=full",
            self.base
        );
        self.rest.get_json(&self.token, &url).await
    }

    fn map_message(&mut self, message: &GmailMessage, folder: &str) -> RawMessage {
        let label_ids = message.label_ids.as_deref().unwrap_or_default();
        let (body_text, body_html) = extract_body_parts(&message.payload);

        let mut refs = Vec::new();
        collect_attachment_refs(&message.payload, &mut refs);
        let has_attachments = !refs.is_empty();
        if has_attachments {
            self.pending_attachments.insert(message.id.clone(), refs);
        }

        RawMessage {
            provider_message_id: Some(message.id.clone()),
            folder: folder.to_string(),
            subject: extract_header(&message.payload, "Subject"),
            sender: extract_header(&message.payload, "From").map(|v| v.trim().to_string()),
            recipients: parse_address_list(extract_header(&message.payload, "To").as_deref()),
            cc: parse_address_list(extract_header(&message.payload, "Cc").as_deref()),
            has_bcc: extract_header(&message.payload, "Bcc").is_some(),
            body_text,
            body_html,
            received_at: message
                .internal_date
                .as_deref()
                .and_then(|millis| millis.parse::<i64>().ok())
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            references: extract_header(&message.payload, "References")
                .map(|raw| {
                    raw.split_whitespace()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            in_reply_to: extract_header(&message.payload, "In-Reply-To")
                .map(|v| v.trim().to_string()),
            is_read: !label_ids.iter().any(|l| l == "UNREAD"),
            has_attachments,
            inline_attachments: None,
        }
    }
}

#[async_trait(?Send)]
impl MailFetcher for GmailFetcher {
    fn provider_name(&self) -> &str {
        "gmail"
    }

    async fn list_folders(&mut self) -> Result<Vec<String>, FetchError> {
        let url = format!("{}/users/me/labels", self.base);
        let page: GmailLabelList = self.rest.get_json(&self.token, &url).await?;

        self.labels.clear();
        let mut folders = Vec::new();
        for label in page.labels {
            self.labels.insert(label.name.to_lowercase(), label.id.clone());
            let excluded = EXCLUDED_LABELS.iter().any(|e| e.eq_ignore_ascii_case(&label.id));
            if !excluded {
                folders.push(label.name);
            }
        }
        folders.sort();
        Ok(folders)
    }

    async fn fetch_since(
        &mut self,
        folder: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, FetchError> {
        let label_id = self.label_id(folder).await?;

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/users/me/messages?maxResults={DEFAULT_PAGE_SIZE}&labelIds={label_id}",
                self.base
            );
            if let Some(since) = watermark {
                // after: is second-granular and exclusive; back up one second
                // so a message landing in the watermark's own second is still
                // listed. The duplicate check absorbs the re-fetched row.
                url.push_str(&format!("&q=after:{}", since.timestamp().saturating_sub(1)));
            }
            if let Some(pt) = &page_token {
                url.push_str(&format!("&pageToken={pt}"));
            }

            let page: GmailMessageList = self.rest.get_json(&self.token, &url).await?;
            if let Some(stubs) = page.messages {
                ids.extend(stubs.into_iter().map(|stub| stub.id));
            }
            match page.next_page_token {
                Some(pt) => page_token = Some(pt),
                None => break,
            }
        }

        debug!(
            account = %self.address,
            folder, count = ids.len(), "listed gmail message ids"
        );

        // messages.list returns newest first. Ingest oldest first so an
        // interrupted run leaves a watermark below everything unfetched.
        ids.reverse();

        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            // One bad message must not sink the folder; only transport-level
            // failures abort.
            let message = match self.get_message(id).await {
                Ok(message) => message,
                Err(FetchError::Protocol(reason)) => {
                    warn!(
                        account = %self.address,
                        folder, id = %id, "skipping gmail message: {reason}"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            messages.push(self.map_message(&message, folder));
        }
        Ok(messages)
    }

    async fn fetch_attachments(
        &mut self,
        message: &RawMessage,
    ) -> Result<Vec<RawAttachment>, FetchError> {
        let Some(message_id) = message.provider_message_id.as_deref() else {
            return Ok(vec![]);
        };
        let Some(refs) = self.pending_attachments.get(message_id).cloned() else {
            return Ok(vec![]);
        };

        let mut attachments = Vec::with_capacity(refs.len());
        for r in refs {
            let url = format!(
                "{}/users/me/messages/{message_id}/attachments/{}",
                self.base, r.attachment_id
            );
            let body: GmailAttachmentBody = self.rest.get_json(&self.token, &url).await?;
            let content = URL_SAFE_NO_PAD.decode(body.data.unwrap_or_default()).map_err(|e| {
                FetchError::Protocol(format!("base64url decode gmail attachment: {e}"))
            })?;
            attachments.push(RawAttachment {
                filename: r.filename,
                mime_type: r.mime_type,
                content,
            });
        }
        Ok(attachments)
    }

    async fn move_message(
        &mut self,
        message_id: &str,
        from_folder: &str,
        to_folder: &str,
    ) -> Result<(), FetchError> {
        let from_id = self.label_id(from_folder).await?;
        let to_id = self.label_id(to_folder).await?;

        let url = format!("{}/users/me/messages/{message_id}/modify", self.base);
        let payload = serde_json::json!({
            "addLabelIds": [to_id],
            "removeLabelIds": [from_id],
        });
        self.rest.post_json(&self.token, &url, &payload).await
    }

    async fn delete_message(
        &mut self,
        message_id: &str,
        _folder: &str,
    ) -> Result<(), FetchError> {
        let url = format!("{}/users/me/messages/{message_id}/trash", self.base);
        self.rest
            .post_json(&self.token, &url, &serde_json::json!({}))
            .await
    }
}

fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn parse_address_list(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    let mut addresses = Vec::new();
    // Split on commas, minding commas inside quoted display names.
    let mut in_quotes = false;
    let mut current = String::new();

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if let Some(addr) = extract_email_from_entry(current.trim()) {
                    addresses.push(addr);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if let Some(addr) = extract_email_from_entry(current.trim()) {
        addresses.push(addr);
    }

    addresses
}

fn extract_email_from_entry(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }

    if let Some(start) = entry.rfind('<') {
        if let Some(end) = entry.rfind('>') {
            let addr = entry[start + 1..end].trim();
            if !addr.is_empty() {
                return Some(addr.to_string());
            }
        }
    }

    if entry.contains('@') {
        return Some(entry.to_string());
    }

    None
}

fn extract_body_parts(payload: &GmailPayload) -> (Option<String>, Option<String>) {
    let mut text_body = None;
    let mut html_body = None;
    collect_body_parts(payload, &mut text_body, &mut html_body);
    (text_body, html_body)
}

fn collect_body_parts(
    payload: &GmailPayload,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    if let Some(body) = &payload.body {
        if let Some(data) = &body.data {
            if !data.is_empty() {
                if let Ok(decoded) = decode_body_data(data) {
                    if mime_type == "text/plain" && text_body.is_none() {
                        *text_body = Some(decoded);
                    } else if mime_type == "text/html" && html_body.is_none() {
                        *html_body = Some(decoded);
                    }
                }
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_body_parts(part, text_body, html_body);
        }
    }
}

fn decode_body_data(data: &str) -> Result<String, FetchError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| FetchError::Protocol(format!("base64url decode gmail body: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| FetchError::Protocol(format!("utf8 decode gmail body: {e}")))
}

fn collect_attachment_refs(payload: &GmailPayload, out: &mut Vec<AttachmentRef>) {
    if let (Some(filename), Some(body)) = (&payload.filename, &payload.body) {
        if !filename.is_empty() {
            if let Some(attachment_id) = &body.attachment_id {
                out.push(AttachmentRef {
                    attachment_id: attachment_id.clone(),
                    filename: filename.clone(),
                    mime_type: payload
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                });
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_attachment_refs(part, out);
        }
    }
}

#[derive(Debug, Deserialize)]
struct GmailLabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
    payload: GmailPayload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
    #[serde(rename = "attachmentId")]
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailAttachmentBody {
    data: Option<String>,
}
