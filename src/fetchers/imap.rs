//! Basic-IMAP fetcher over TLS. The session is opened lazily on first use
//! and reused across calls for the lifetime of the sync run.

use async_imap::types::{Fetch, Flag, NameAttribute};
use async_native_tls::{TlsConnector, TlsStream};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::credentials::Secret;
use crate::db::models::{Account, Provider};

use super::{FetchError, MailFetcher, RawAttachment, RawMessage};

const DEFAULT_IMAP_PORT: u16 = 993;

type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

pub struct ImapFetcher {
    host: String,
    port: u16,
    address: String,
    secret: Secret,
    session: Option<ImapSession>,
}

struct XOAuth2 {
    response: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}

impl ImapFetcher {
    pub fn new(
        provider: &Provider,
        account: &Account,
        secret: Secret,
    ) -> Result<Self, FetchError> {
        let host = provider
            .imap_host
            .clone()
            .ok_or_else(|| {
                FetchError::Connection(format!(
                    "provider {} has no imap host configured",
                    provider.provider_id
                ))
            })?;

        Ok(Self {
            host,
            port: provider.imap_port.unwrap_or(DEFAULT_IMAP_PORT),
            address: account.address.clone(),
            secret,
            session: None,
        })
    }

    async fn session(&mut self) -> Result<&mut ImapSession, FetchError> {
        if self.session.is_none() {
            let tcp = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| {
                    FetchError::Connection(format!(
                        "tcp connect to {}:{}: {e}",
                        self.host, self.port
                    ))
                })?;

            let tls = TlsConnector::new()
                .connect(&self.host, tcp)
                .await
                .map_err(|e| {
                    FetchError::Connection(format!("tls handshake with {}: {e}", self.host))
                })?;

            let mut client = async_imap::Client::new(tls);
            // Consume the server greeting before authenticating; the
            // XOAUTH2 handshake loop would otherwise read it as the "+"
            // continuation.
            client
                .read_response()
                .await
                .ok_or_else(|| {
                    FetchError::Connection(format!(
                        "imap greeting from {}: connection closed",
                        self.host
                    ))
                })?
                .map_err(|e| {
                    FetchError::Connection(format!("read imap greeting: {e}"))
                })?;

            let session = match &self.secret {
                Secret::Password(password) => client
                    .login(&self.address, password)
                    .await
                    .map_err(|(e, _)| {
                        FetchError::Connection(format!("imap login for {}: {e}", self.address))
                    })?,
                Secret::OAuthAccess(token) => {
                    let authenticator = XOAuth2 {
                        response: format!(
                            "user={}\x01auth=Bearer {}\x01\x01",
                            self.address, token
                        ),
                    };
                    client
                        .authenticate("XOAUTH2", authenticator)
                        .await
                        .map_err(|(e, _)| {
                            FetchError::Connection(format!(
                                "imap xoauth2 for {}: {e}",
                                self.address
                            ))
                        })?
                }
            };

            debug!(account = %self.address, host = %self.host, "imap session established");
            self.session = Some(session);
        }

        Ok(self.session.as_mut().ok_or_else(|| {
            FetchError::Connection("imap session unavailable".to_string())
        })?)
    }

    async fn find_uid(
        &mut self,
        folder: &str,
        message_id: &str,
    ) -> Result<u32, FetchError> {
        let session = self.session().await?;
        session
            .select(folder)
            .await
            .map_err(|e| FetchError::Connection(format!("select '{folder}': {e}")))?;

        let uids = session
            .uid_search(format!("HEADER Message-ID {message_id}"))
            .await
            .map_err(|e| FetchError::Connection(format!("uid search: {e}")))?;

        uids.into_iter().next().ok_or_else(|| {
            FetchError::Protocol(format!("message '{message_id}' not found in '{folder}'"))
        })
    }
}

#[async_trait(?Send)]
impl MailFetcher for ImapFetcher {
    fn provider_name(&self) -> &str {
        "imap"
    }

    async fn list_folders(&mut self) -> Result<Vec<String>, FetchError> {
        let session = self.session().await?;
        let names = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| FetchError::Connection(format!("imap list: {e}")))?
            .collect::<Vec<_>>()
            .await;

        let mut folders = Vec::new();
        for name in names {
            let name =
                name.map_err(|e| FetchError::Protocol(format!("imap list entry: {e}")))?;
            let selectable = !name
                .attributes()
                .iter()
                .any(|attr| matches!(attr, NameAttribute::NoSelect));
            if selectable {
                folders.push(name.name().to_string());
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
        let address = self.address.clone();
        let session = self.session().await?;
        session
            .select(folder)
            .await
            .map_err(|e| FetchError::Connection(format!("select '{folder}': {e}")))?;

        // SINCE is date-granular and inclusive; the resulting overlap around
        // the watermark is absorbed by the duplicate check downstream.
        let query = match watermark {
            Some(since) => format!("SINCE {}", since.format("%d-%b-%Y")),
            None => "ALL".to_string(),
        };
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| FetchError::Connection(format!("uid search '{query}': {e}")))?;

        if uids.is_empty() {
            return Ok(vec![]);
        }

        let mut uid_vec: Vec<u32> = uids.into_iter().collect();
        uid_vec.sort_unstable();
        let uid_set = uid_vec
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let fetches: Vec<_> = session
            .uid_fetch(&uid_set, "(UID FLAGS INTERNALDATE RFC822)")
            .await
            .map_err(|e| FetchError::Connection(format!("uid fetch: {e}")))?
            .collect()
            .await;

        let mut messages = Vec::new();
        for fetch in fetches {
            let fetch =
                fetch.map_err(|e| FetchError::Protocol(format!("imap fetch entry: {e}")))?;
            match parse_fetch(&fetch, folder) {
                Some(message) => messages.push(message),
                None => warn!(
                    account = %address,
                    folder, uid = fetch.uid, "skipping unparseable imap message"
                ),
            }
        }

        debug!(account = %address, folder, count = messages.len(), "fetched imap messages");
        Ok(messages)
    }

    async fn fetch_attachments(
        &mut self,
        _message: &RawMessage,
    ) -> Result<Vec<RawAttachment>, FetchError> {
        // RFC822 bodies already carry their MIME parts; attachments ride in
        // `inline_attachments` on the message itself.
        Ok(vec![])
    }

    async fn move_message(
        &mut self,
        message_id: &str,
        from_folder: &str,
        to_folder: &str,
    ) -> Result<(), FetchError> {
        let uid = self.find_uid(from_folder, message_id).await?;
        let session = self.session().await?;

        session
            .uid_copy(uid.to_string(), to_folder)
            .await
            .map_err(|e| FetchError::Connection(format!("uid copy to '{to_folder}': {e}")))?;

        let updates: Vec<_> = session
            .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
            .await
            .map_err(|e| FetchError::Connection(format!("uid store: {e}")))?
            .collect()
            .await;
        drop(updates);

        let expunged: Vec<_> = session
            .expunge()
            .await
            .map_err(|e| FetchError::Connection(format!("expunge: {e}")))?
            .collect()
            .await;
        drop(expunged);

        Ok(())
    }

    async fn delete_message(
        &mut self,
        message_id: &str,
        folder: &str,
    ) -> Result<(), FetchError> {
        let uid = self.find_uid(folder, message_id).await?;
        let session = self.session().await?;

        let updates: Vec<_> = session
            .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
            .await
            .map_err(|e| FetchError::Connection(format!("uid store: {e}")))?
            .collect()
            .await;
        drop(updates);

        let expunged: Vec<_> = session
            .expunge()
            .await
            .map_err(|e| FetchError::Connection(format!("expunge: {e}")))?
            .collect()
            .await;
        drop(expunged);

        Ok(())
    }
}

fn parse_fetch(fetch: &Fetch, folder: &str) -> Option<RawMessage> {
    let body = fetch.body()?;
    let parsed = MessageParser::default().parse(body)?;

    let is_read = fetch.flags().any(|flag| matches!(flag, Flag::Seen));
    let received_at = fetch
        .internal_date()
        .map(|date| date.with_timezone(&Utc))
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single())
        });

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        attachments.push(RawAttachment {
            filename: part
                .attachment_name()
                .unwrap_or("attachment")
                .to_string(),
            mime_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{subtype}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content: part.contents().to_vec(),
        });
    }
    let has_attachments = !attachments.is_empty();

    Some(RawMessage {
        // The RFC 5322 Message-ID is stable across folder moves, unlike the
        // per-mailbox UID.
        provider_message_id: parsed.message_id().map(str::to_string),
        folder: folder.to_string(),
        subject: parsed.subject().map(str::to_string),
        sender: parsed.from().and_then(first_display),
        recipients: address_list(parsed.to()),
        cc: address_list(parsed.cc()),
        has_bcc: parsed.bcc().is_some_and(|addr| {
            addr.iter().next().is_some()
        }),
        body_text: parsed.body_text(0).map(|cow| cow.to_string()),
        body_html: parsed.body_html(0).map(|cow| cow.to_string()),
        received_at,
        references: header_id_list(parsed.header("References")),
        in_reply_to: header_id_list(parsed.header("In-Reply-To"))
            .into_iter()
            .next(),
        is_read,
        has_attachments,
        inline_attachments: Some(attachments),
    })
}

fn first_display(address: &mail_parser::Address) -> Option<String> {
    let addr = address.iter().next()?;
    let name = addr
        .name
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let email = addr
        .address
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match (name, email) {
        (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
        (None, Some(email)) => Some(email.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}

fn address_list(address: Option<&mail_parser::Address>) -> Vec<String> {
    address
        .map(|list| {
            list.iter()
                .filter_map(|addr| addr.address.as_deref())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn header_id_list(value: Option<&HeaderValue>) -> Vec<String> {
    match value {
        Some(HeaderValue::Text(text)) => text
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        Some(HeaderValue::TextList(items)) => {
            items.iter().map(|item| item.to_string()).collect()
        }
        _ => Vec::new(),
    }
}
