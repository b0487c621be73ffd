//! Outlook fetcher over the Microsoft Graph mail endpoints.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::credentials::Secret;
use crate::db::models::Account;

use super::http::RestClient;
use super::{FetchError, MailFetcher, RawAttachment, RawMessage};

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_PAGE_SIZE: usize = 50;

const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,from,toRecipients,ccRecipients,bccRecipients,receivedDateTime,",
    "body,isRead,hasAttachments,internetMessageId"
);

/// Exchange bookkeeping folders that never hold user mail.
const EXCLUDED_FOLDER_NAMES: &[&str] = &[
    "sync issues",
    "conflicts",
    "local failures",
    "server failures",
];

fn is_excluded_folder(display_name: &str) -> bool {
    let lower = display_name.trim().to_lowercase();
    EXCLUDED_FOLDER_NAMES
        .iter()
        .any(|&excluded| lower == excluded)
}

pub struct OutlookFetcher {
    rest: RestClient,
    token: String,
    address: String,
    base: String,
    /// lowercased display name -> graph folder id
    folders: HashMap<String, String>,
    /// our provider_message_id -> graph resource id, for attachment and
    /// move/delete calls
    resource_ids: HashMap<String, String>,
}

impl OutlookFetcher {
    pub fn new(account: &Account, secret: Secret) -> Result<Self, FetchError> {
        let token = match secret {
            Secret::OAuthAccess(token) => token,
            Secret::Password(_) => {
                return Err(FetchError::Connection(
                    "outlook accounts require an oauth access token".to_string(),
                ))
            }
        };

        let base = std::env::var("ESYNC_GRAPH_API_BASE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GRAPH_API_BASE.to_string());

        Ok(Self {
            rest: RestClient::new()?,
            token,
            address: account.address.clone(),
            base,
            folders: HashMap::new(),
            resource_ids: HashMap::new(),
        })
    }

    async fn discover_folders(&mut self) -> Result<Vec<String>, FetchError> {
        self.folders.clear();
        let mut names = Vec::new();
        let mut url = format!(
            "{}/users/{}/mailFolders?includeHiddenFolders=true&$top=100",
            self.base, self.address
        );

        loop {
            let page: GraphMailFolderPage = self.rest.get_json(&self.token, &url).await?;
            for folder in page.value {
                if is_excluded_folder(&folder.display_name) {
                    continue;
                }
                self.folders
                    .insert(folder.display_name.to_lowercase(), folder.id);
                names.push(folder.display_name);
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn folder_id(&mut self, folder: &str) -> Result<String, FetchError> {
        if self.folders.is_empty() {
            self.discover_folders().await?;
        }
        self.folders
            .get(&folder.to_lowercase())
            .cloned()
            .ok_or_else(|| FetchError::Protocol(format!("unknown outlook folder '{folder}'")))
    }

    /// The graph resource id cache only covers messages seen by this
    /// session; fall back to a lookup keyed by the stable internetMessageId.
    async fn resolve_resource_id(&mut self, message_id: &str) -> Result<String, FetchError> {
        if let Some(resource) = self.resource_ids.get(message_id) {
            return Ok(resource.clone());
        }
        let url = format!(
            "{}/users/{}/messages?$filter=internetMessageId eq '{}'&$select=id&$top=1",
            self.base,
            self.address,
            message_id.replace('\'', "''")
        );
        let page: GraphMessagesPage = self.rest.get_json(&self.token, &url).await?;
        let resource = page
            .value
            .into_iter()
            .find_map(|message| message.id)
            .ok_or_else(|| FetchError::Protocol(format!("unknown message '{message_id}'")))?;
        self.resource_ids
            .insert(message_id.to_string(), resource.clone());
        Ok(resource)
    }

    fn resource_id(&self, message: &RawMessage) -> Option<String> {
        message
            .provider_message_id
            .as_deref()
            .and_then(|id| self.resource_ids.get(id).cloned())
    }

    fn map_message(&mut self, message: GraphMessage, folder: &str) -> RawMessage {
        // internetMessageId is stable across folder moves; the graph resource
        // id is not, so it only serves as the call handle.
        let provider_message_id = message.internet_message_id.clone().or(message.id.clone());
        if let (Some(pmid), Some(resource)) = (&provider_message_id, &message.id) {
            self.resource_ids.insert(pmid.clone(), resource.clone());
        }

        let (body_text, body_html) = match &message.body {
            Some(body) => {
                let content = body.content.clone().filter(|c| !c.trim().is_empty());
                match body.content_type.as_deref() {
                    Some(ct) if ct.eq_ignore_ascii_case("html") => (None, content),
                    _ => (content, None),
                }
            }
            None => (None, None),
        };

        RawMessage {
            provider_message_id,
            folder: folder.to_string(),
            subject: message.subject,
            sender: message.from.as_ref().and_then(GraphRecipient::display),
            recipients: collect_addresses(message.to_recipients.as_deref()),
            cc: collect_addresses(message.cc_recipients.as_deref()),
            has_bcc: message
                .bcc_recipients
                .as_deref()
                .is_some_and(|r| !r.is_empty()),
            body_text,
            body_html,
            received_at: message
                .received_date_time
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            // Graph does not expose References/In-Reply-To on the list
            // endpoint; threading fields stay empty for outlook messages.
            references: Vec::new(),
            in_reply_to: None,
            is_read: message.is_read.unwrap_or(false),
            has_attachments: message.has_attachments.unwrap_or(false),
            inline_attachments: None,
        }
    }
}

#[async_trait(?Send)]
impl MailFetcher for OutlookFetcher {
    fn provider_name(&self) -> &str {
        "outlook"
    }

    async fn list_folders(&mut self) -> Result<Vec<String>, FetchError> {
        self.discover_folders().await
    }

    async fn fetch_since(
        &mut self,
        folder: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, FetchError> {
        let folder_id = self.folder_id(folder).await?;

        let mut url = format!(
            "{}/users/{}/mailFolders/{folder_id}/messages?$top={DEFAULT_PAGE_SIZE}&$select={MESSAGE_SELECT_FIELDS}&$orderby=receivedDateTime",
            self.base, self.address
        );
        if let Some(since) = watermark {
            // ge, not gt: a second message landing in the watermark's second
            // must still be listed. The duplicate check absorbs the
            // re-fetched boundary row.
            url.push_str(&format!(
                "&$filter=receivedDateTime ge {}",
                since.format("%Y-%m-%dT%H:%M:%SZ")
            ));
        }

        let mut messages = Vec::new();
        loop {
            let page: GraphMessagesPage = self.rest.get_json(&self.token, &url).await?;
            for message in page.value {
                messages.push(self.map_message(message, folder));
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(
            account = %self.address,
            folder, count = messages.len(), "fetched outlook messages"
        );
        Ok(messages)
    }

    async fn fetch_attachments(
        &mut self,
        message: &RawMessage,
    ) -> Result<Vec<RawAttachment>, FetchError> {
        let Some(resource_id) = self.resource_id(message) else {
            return Ok(vec![]);
        };

        let url = format!(
            "{}/users/{}/messages/{resource_id}/attachments",
            self.base, self.address
        );
        let page: GraphAttachmentPage = self.rest.get_json(&self.token, &url).await?;

        let mut attachments = Vec::new();
        for attachment in page.value {
            // Only fileAttachment carries contentBytes; reference and item
            // attachments have no downloadable body here.
            let Some(content_bytes) = attachment.content_bytes else {
                continue;
            };
            let content = STANDARD.decode(&content_bytes).map_err(|e| {
                FetchError::Protocol(format!("base64 decode outlook attachment: {e}"))
            })?;
            attachments.push(RawAttachment {
                filename: attachment
                    .name
                    .unwrap_or_else(|| "attachment".to_string()),
                mime_type: attachment
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                content,
            });
        }
        Ok(attachments)
    }

    async fn move_message(
        &mut self,
        message_id: &str,
        _from_folder: &str,
        to_folder: &str,
    ) -> Result<(), FetchError> {
        let destination_id = self.folder_id(to_folder).await?;
        let resource_id = self.resolve_resource_id(message_id).await?;

        let url = format!(
            "{}/users/{}/messages/{resource_id}/move",
            self.base, self.address
        );
        let payload = serde_json::json!({ "destinationId": destination_id });
        self.rest.post_json(&self.token, &url, &payload).await
    }

    async fn delete_message(
        &mut self,
        message_id: &str,
        _folder: &str,
    ) -> Result<(), FetchError> {
        let resource_id = self.resolve_resource_id(message_id).await?;

        let url = format!(
            "{}/users/{}/messages/{resource_id}",
            self.base, self.address
        );
        self.rest.delete(&self.token, &url).await
    }
}

fn collect_addresses(recipients: Option<&[GraphRecipient]>) -> Vec<String> {
    recipients
        .unwrap_or_default()
        .iter()
        .filter_map(GraphRecipient::address)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct GraphMailFolderPage {
    value: Vec<GraphMailFolder>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMailFolder {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct GraphMessagesPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients")]
    to_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "ccRecipients")]
    cc_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "bccRecipients")]
    bcc_recipients: Option<Vec<GraphRecipient>>,
    body: Option<GraphBody>,
    #[serde(rename = "isRead")]
    is_read: Option<bool>,
    #[serde(rename = "hasAttachments")]
    has_attachments: Option<bool>,
    #[serde(rename = "internetMessageId")]
    internet_message_id: Option<String>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    fn address(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// "Display Name <address>" when both are present, otherwise whichever
    /// exists.
    fn display(&self) -> Option<String> {
        let email = self.email_address.as_ref()?;
        let name = email
            .name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let address = email
            .address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match (name, address) {
            (Some(name), Some(address)) => Some(format!("{name} <{address}>")),
            (None, Some(address)) => Some(address.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphAttachmentPage {
    value: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
struct GraphAttachment {
    name: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "contentBytes")]
    content_bytes: Option<String>,
}
