use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Imap,
    Gmail,
    Outlook,
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Imap => write!(f, "imap"),
            Self::Gmail => write!(f, "gmail"),
            Self::Outlook => write!(f, "outlook"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imap" => Ok(Self::Imap),
            "gmail" => Ok(Self::Gmail),
            "outlook" | "graph" => Ok(Self::Outlook),
            other => Err(format!("invalid provider kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    OAuth,
}

impl Display for AuthKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password => write!(f, "password"),
            Self::OAuth => write!(f, "oauth"),
        }
    }
}

impl FromStr for AuthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "password" | "basic" => Ok(Self::Password),
            "oauth" | "oauth2" => Ok(Self::OAuth),
            other => Err(format!("invalid auth kind: {other}")),
        }
    }
}

/// Capability descriptor for a mailbox provider. Never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provider {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub encryption: Option<String>,
    pub token_url: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub account_id: String,
    pub user_id: String,
    pub provider_id: String,
    pub address: String,
    pub display_name: Option<String>,
    pub auth: AuthKind,
    /// Encrypted credential envelope (JSON); decrypted only by the resolver.
    pub credential: Option<String>,
    pub enabled: bool,
    pub created_at: String,
}

/// A folder explicitly associated with an account for syncing. Folders the
/// provider reports but that were never associated are skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Folder {
    pub account_id: String,
    pub name: String,
    pub active: bool,
}

/// One sync attempt. At most one row with `is_executed = false` may exist per
/// (account, provider); rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncJob {
    pub id: i64,
    pub queue_name: String,
    pub account_id: String,
    pub user_id: String,
    pub provider_id: String,
    pub created_at: String,
    pub executed_at: Option<String>,
    pub is_executed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Email {
    pub id: String,
    pub account_id: String,
    pub provider_message_id: String,
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub body: String,
    pub snippet: Option<String>,
    pub received_at: String,
    pub references_list: Option<String>,
    pub in_reply_to: Option<String>,
    pub is_read: bool,
    pub folder: String,
    /// Per-account sequence marker, assigned at insert.
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub email_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Webhook {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub secret: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid delivery status: {other}")),
        }
    }
}

/// One fan-out attempt against one webhook. Append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub webhook_id: String,
    pub status: DeliveryStatus,
    pub created_at: String,
}

fn parse_json_array(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

fn invalid_text<E>(raw: &str, error: E) -> rusqlite::Error
where
    E: std::fmt::Display,
{
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            error.to_string(),
        )),
    )
}

impl Provider {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let kind_raw: String = row.get("kind")?;
        let kind = ProviderKind::from_str(&kind_raw).map_err(|e| invalid_text(&kind_raw, e))?;

        Ok(Self {
            provider_id: row.get("provider_id")?,
            kind,
            imap_host: row.get("imap_host")?,
            imap_port: row
                .get::<_, Option<i64>>("imap_port")?
                .map(|port| port as u16),
            smtp_host: row.get("smtp_host")?,
            smtp_port: row
                .get::<_, Option<i64>>("smtp_port")?
                .map(|port| port as u16),
            encryption: row.get("encryption")?,
            token_url: row.get("token_url")?,
            scopes: parse_json_array(row.get("scopes")?),
        })
    }
}

impl Account {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let auth_raw: String = row.get("auth")?;
        let auth = AuthKind::from_str(&auth_raw).map_err(|e| invalid_text(&auth_raw, e))?;

        Ok(Self {
            account_id: row.get("account_id")?,
            user_id: row.get("user_id")?,
            provider_id: row.get("provider_id")?,
            address: row.get("address")?,
            display_name: row.get("display_name")?,
            auth,
            credential: row.get("credential")?,
            enabled: row.get("enabled")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl Folder {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            account_id: row.get("account_id")?,
            name: row.get("name")?,
            active: row.get("active")?,
        })
    }
}

impl SyncJob {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            queue_name: row.get("queue_name")?,
            account_id: row.get("account_id")?,
            user_id: row.get("user_id")?,
            provider_id: row.get("provider_id")?,
            created_at: row.get("created_at")?,
            executed_at: row.get("executed_at")?,
            is_executed: row.get("is_executed")?,
        })
    }
}

impl Email {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            provider_message_id: row.get("provider_message_id")?,
            subject: row.get("subject")?,
            sender: row.get("sender")?,
            recipients: parse_json_array(row.get("recipients")?),
            cc: parse_json_array(row.get("cc")?),
            body: row.get("body")?,
            snippet: row.get("snippet")?,
            received_at: row.get("received_at")?,
            references_list: row.get("references_list")?,
            in_reply_to: row.get("in_reply_to")?,
            is_read: row.get("is_read")?,
            folder: row.get("folder")?,
            seq: row.get("seq")?,
        })
    }
}

impl Attachment {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            email_id: row.get("email_id")?,
            filename: row.get("filename")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
            content_hash: row.get("content_hash")?,
            storage_key: row.get("storage_key")?,
        })
    }
}

impl Webhook {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            url: row.get("url")?,
            secret: row.get("secret")?,
            active: row.get("active")?,
        })
    }
}

impl EventRecord {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let status_raw: String = row.get("status")?;
        let status =
            DeliveryStatus::from_str(&status_raw).map_err(|e| invalid_text(&status_raw, e))?;
        let payload_raw: String = row.get("payload")?;
        let payload =
            serde_json::from_str(&payload_raw).map_err(|e| invalid_text(&payload_raw, e))?;

        Ok(Self {
            id: row.get("id")?,
            event_type: row.get("event_type")?,
            payload,
            webhook_id: row.get("webhook_id")?,
            status,
            created_at: row.get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Account, AuthKind, DeliveryStatus, Email, ProviderKind};

    #[test]
    fn provider_kind_display_and_parse() {
        assert_eq!(ProviderKind::Imap.to_string(), "imap");
        assert_eq!(ProviderKind::Outlook.to_string(), "outlook");
        assert_eq!(
            "gmail".parse::<ProviderKind>().expect("parse provider kind"),
            ProviderKind::Gmail
        );
        assert_eq!(
            "graph".parse::<ProviderKind>().expect("parse graph alias"),
            ProviderKind::Outlook
        );
        assert!("pop3".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn auth_kind_and_delivery_status_parse() {
        assert_eq!(
            "oauth2".parse::<AuthKind>().expect("parse auth kind"),
            AuthKind::OAuth
        );
        assert_eq!(AuthKind::Password.to_string(), "password");
        assert_eq!(
            "failed".parse::<DeliveryStatus>().expect("parse status"),
            DeliveryStatus::Failed
        );
    }

    #[test]
    fn serde_round_trip_models() {
        let account = Account {
            account_id: "acc-1".to_string(),
            user_id: "user-1".to_string(),
            provider_id: "prov-imap".to_string(),
            address: "person@example.com".to_string(),
            display_name: Some("Person".to_string()),
            auth: AuthKind::Password,
            credential: None,
            enabled: true,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };

        let email = Email {
            id: "row-1".to_string(),
            account_id: "acc-1".to_string(),
            provider_message_id: "<m1@example.com>".to_string(),
            subject: "Subject".to_string(),
            sender: "sender@example.com".to_string(),
            recipients: vec!["to@example.com".to_string()],
            cc: vec![],
            body: "Hello".to_string(),
            snippet: Some("Hello".to_string()),
            received_at: "2026-01-01T00:00:00Z".to_string(),
            references_list: Some("<m0@example.com>".to_string()),
            in_reply_to: Some("<m0@example.com>".to_string()),
            is_read: false,
            folder: "INBOX".to_string(),
            seq: 1,
        };

        let account_json = serde_json::to_string(&account).expect("serialize account");
        let _: Account = serde_json::from_str(&account_json).expect("deserialize account");

        let email_json = serde_json::to_string(&email).expect("serialize email");
        let _: Email = serde_json::from_str(&email_json).expect("deserialize email");
    }
}
