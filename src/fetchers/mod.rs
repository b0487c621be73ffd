use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::credentials::Secret;
use crate::db::models::{Account, Provider, ProviderKind};

pub mod gmail;
pub mod http;
pub mod imap;
pub mod outlook;

pub use gmail::GmailFetcher;
pub use imap::ImapFetcher;
pub use outlook::OutlookFetcher;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport or authentication failure. The orchestrator may refresh the
    /// credential and retry once.
    #[error("connection: {0}")]
    Connection(String),

    /// The provider answered but the payload could not be handled. Not
    /// retried; the offending message is skipped.
    #[error("protocol: {0}")]
    Protocol(String),
}

/// A message as it came off the wire, before normalization. Optional fields
/// stay optional here; the normalizer decides what is a skip and what gets a
/// placeholder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub provider_message_id: Option<String>,
    pub folder: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub has_bcc: bool,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub references: Vec<String>,
    pub in_reply_to: Option<String>,
    pub is_read: bool,
    pub has_attachments: bool,
    /// Populated by fetchers that get attachment bodies for free with the
    /// message (IMAP). REST fetchers leave this `None` and serve
    /// `fetch_attachments` instead.
    pub inline_attachments: Option<Vec<RawAttachment>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawAttachment {
    pub filename: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

#[async_trait(?Send)]
pub trait MailFetcher {
    fn provider_name(&self) -> &str;

    /// Folders the provider currently reports for the account.
    async fn list_folders(&mut self) -> Result<Vec<String>, FetchError>;

    /// Messages in `folder` received at or after `watermark` (all messages
    /// when `None`). Providers with date-granular filters may over-fetch;
    /// dedup downstream absorbs the overlap.
    async fn fetch_since(
        &mut self,
        folder: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, FetchError>;

    /// Attachment bodies for a message whose `inline_attachments` is `None`.
    async fn fetch_attachments(
        &mut self,
        message: &RawMessage,
    ) -> Result<Vec<RawAttachment>, FetchError>;

    async fn move_message(
        &mut self,
        message_id: &str,
        from_folder: &str,
        to_folder: &str,
    ) -> Result<(), FetchError>;

    async fn delete_message(
        &mut self,
        message_id: &str,
        folder: &str,
    ) -> Result<(), FetchError>;
}

/// One-shot dispatch on the provider kind. The rest of the engine only sees
/// the trait.
pub fn resolve_fetcher(
    provider: &Provider,
    account: &Account,
    secret: Secret,
) -> Result<Box<dyn MailFetcher>, FetchError> {
    match provider.kind {
        ProviderKind::Imap => {
            let fetcher = ImapFetcher::new(provider, account, secret)?;
            Ok(Box::new(fetcher))
        }
        ProviderKind::Gmail => {
            let fetcher = GmailFetcher::new(account, secret)?;
            Ok(Box::new(fetcher))
        }
        ProviderKind::Outlook => {
            let fetcher = OutlookFetcher::new(account, secret)?;
            Ok(Box::new(fetcher))
        }
    }
}
