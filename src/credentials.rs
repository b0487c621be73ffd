//! Credential storage and resolution.
//!
//! Account credentials live in the `accounts.credential` column as an
//! AES-256-GCM envelope; the key comes from `ESYNC_CREDENTIAL_KEY` (64 hex
//! characters). Password accounts resolve to the stored password, OAuth
//! accounts resolve to a valid access token, refreshing through the
//! provider's token endpoint when the cached one is expired and persisting
//! the rotated token pair.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::db::models::{Account, AuthKind, Provider};
use crate::db::{Database, DbError};

pub const CREDENTIAL_KEY_ENV: &str = "ESYNC_CREDENTIAL_KEY";

const CREDENTIAL_KEY_BYTES: usize = 32;
const CREDENTIAL_NONCE_BYTES: usize = 12;
const CREDENTIAL_ENVELOPE_VERSION: u8 = 1;

/// Refresh this many seconds before the recorded expiry so a token handed to
/// a fetcher does not die mid-request.
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("account {0} has no stored credential")]
    Missing(String),

    #[error("{CREDENTIAL_KEY_ENV} must be 64 hex characters (32 bytes)")]
    InvalidKey,

    #[error("credential envelope: {0}")]
    Envelope(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// What a fetcher actually authenticates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    OAuthAccess(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredCredential {
    pub kind: AuthKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredCredential {
    fn access_token_still_valid(&self) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        let expires_at = self.expires_at?;
        if expires_at > Utc::now() + Duration::seconds(EXPIRY_SKEW_SECONDS) {
            Some(token)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedCredentialEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

pub struct CredentialResolver {
    client: Client,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Decrypt the account's stored credential and turn it into something a
    /// fetcher can log in with, refreshing an expired OAuth token in place.
    pub async fn resolve(
        &self,
        db: &Database,
        account: &Account,
        provider: &Provider,
    ) -> Result<Secret, CredentialError> {
        let stored = self.load(account)?;

        match stored.kind {
            AuthKind::Password => {
                let password = stored
                    .password
                    .ok_or_else(|| CredentialError::Missing(account.account_id.clone()))?;
                Ok(Secret::Password(password))
            }
            AuthKind::OAuth => {
                if let Some(token) = stored.access_token_still_valid() {
                    return Ok(Secret::OAuthAccess(token.to_string()));
                }
                self.exchange_and_store(db, account, provider, stored).await
            }
        }
    }

    /// Force a refresh-token exchange regardless of cached expiry. Used after
    /// an authentication failure mid-sync.
    pub async fn refresh(
        &self,
        db: &Database,
        account: &Account,
        provider: &Provider,
    ) -> Result<Secret, CredentialError> {
        let stored = self.load(account)?;
        match stored.kind {
            AuthKind::Password => {
                let password = stored
                    .password
                    .ok_or_else(|| CredentialError::Missing(account.account_id.clone()))?;
                Ok(Secret::Password(password))
            }
            AuthKind::OAuth => self.exchange_and_store(db, account, provider, stored).await,
        }
    }

    fn load(&self, account: &Account) -> Result<StoredCredential, CredentialError> {
        let raw = account
            .credential
            .as_deref()
            .ok_or_else(|| CredentialError::Missing(account.account_id.clone()))?;
        let key = encryption_key()?;
        decrypt_credential(raw, &key)
    }

    async fn exchange_and_store(
        &self,
        db: &Database,
        account: &Account,
        provider: &Provider,
        mut stored: StoredCredential,
    ) -> Result<Secret, CredentialError> {
        let token_url = provider.token_url.as_deref().ok_or_else(|| {
            CredentialError::Exchange(format!(
                "provider {} has no token endpoint",
                provider.provider_id
            ))
        })?;
        let refresh_token = stored
            .refresh_token
            .clone()
            .ok_or_else(|| CredentialError::Missing(account.account_id.clone()))?;

        let scope = provider.scopes.join(" ");
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        if let Some(client_id) = stored.client_id.as_deref() {
            form.push(("client_id", client_id));
        }
        if let Some(client_secret) = stored.client_secret.as_deref() {
            form.push(("client_secret", client_secret));
        }
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self.client.post(token_url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CredentialError::Exchange(format!(
                "status={status} from {token_url}"
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| CredentialError::Exchange(format!("decode token response: {e}")))?;

        let expires_at = Utc::now() + Duration::seconds(payload.expires_in as i64);
        stored.access_token = Some(payload.access_token.clone());
        stored.expires_at = Some(expires_at);
        if let Some(rotated) = payload.refresh_token {
            stored.refresh_token = Some(rotated);
        }

        let key = encryption_key()?;
        let sealed = encrypt_credential(&stored, &key)?;
        db.update_account_credential(&account.account_id, &sealed)?;
        debug!(
            account = %account.account_id,
            "refreshed oauth access token (expires {})", expires_at
        );

        Ok(Secret::OAuthAccess(payload.access_token))
    }
}

/// Seal a credential for storage. Used by the CLI when registering accounts.
pub fn seal_credential(credential: &StoredCredential) -> Result<String, CredentialError> {
    let key = encryption_key()?;
    encrypt_credential(credential, &key)
}

fn encryption_key() -> Result<[u8; CREDENTIAL_KEY_BYTES], CredentialError> {
    let raw = std::env::var(CREDENTIAL_KEY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(CredentialError::InvalidKey)?;

    let decoded = hex_decode(&raw).map_err(|_| CredentialError::InvalidKey)?;
    decoded.try_into().map_err(|_| CredentialError::InvalidKey)
}

fn encrypt_credential(
    credential: &StoredCredential,
    encryption_key: &[u8; CREDENTIAL_KEY_BYTES],
) -> Result<String, CredentialError> {
    let mut plaintext = serde_json::to_vec(credential)
        .map_err(|e| CredentialError::Envelope(format!("serialize credential: {e}")))?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, encryption_key)
        .map_err(|_| CredentialError::Envelope("construct AES-256-GCM key".to_string()))?;
    let key = LessSafeKey::new(unbound_key);

    let mut nonce_bytes = [0u8; CREDENTIAL_NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CredentialError::Envelope("generate random nonce".to_string()))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut plaintext,
    )
    .map_err(|_| CredentialError::Envelope("encrypt credential".to_string()))?;

    let envelope = EncryptedCredentialEnvelope {
        version: CREDENTIAL_ENVELOPE_VERSION,
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&plaintext),
    };

    serde_json::to_string(&envelope)
        .map_err(|e| CredentialError::Envelope(format!("serialize envelope: {e}")))
}

fn decrypt_credential(
    raw: &str,
    encryption_key: &[u8; CREDENTIAL_KEY_BYTES],
) -> Result<StoredCredential, CredentialError> {
    let envelope: EncryptedCredentialEnvelope = serde_json::from_str(raw)
        .map_err(|e| CredentialError::Envelope(format!("parse envelope: {e}")))?;

    if envelope.version != CREDENTIAL_ENVELOPE_VERSION {
        return Err(CredentialError::Envelope(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    let nonce_vec = hex_decode(&envelope.nonce_hex)
        .map_err(|_| CredentialError::Envelope("decode envelope nonce".to_string()))?;
    let nonce_bytes: [u8; CREDENTIAL_NONCE_BYTES] = nonce_vec
        .try_into()
        .map_err(|_| CredentialError::Envelope("invalid nonce length".to_string()))?;
    let mut ciphertext = hex_decode(&envelope.ciphertext_hex)
        .map_err(|_| CredentialError::Envelope("decode envelope ciphertext".to_string()))?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, encryption_key)
        .map_err(|_| CredentialError::Envelope("construct AES-256-GCM key".to_string()))?;
    let key = LessSafeKey::new(unbound_key);

    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| CredentialError::Envelope("decrypt credential".to_string()))?;

    serde_json::from_slice(plaintext)
        .map_err(|e| CredentialError::Envelope(format!("parse decrypted credential: {e}")))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

pub(crate) fn hex_decode(raw: &str) -> Result<Vec<u8>, String> {
    let value = raw.trim();
    if value.len() % 2 != 0 {
        return Err("hex string length must be even".to_string());
    }

    let mut out = Vec::with_capacity(value.len() / 2);
    let bytes = value.as_bytes();
    let mut idx = 0usize;
    while idx < bytes.len() {
        let hi = decode_hex_nibble(bytes[idx]).ok_or("invalid hex digit")?;
        let lo = decode_hex_nibble(bytes[idx + 1]).ok_or("invalid hex digit")?;
        out.push((hi << 4) | lo);
        idx += 2;
    }
    Ok(out)
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
