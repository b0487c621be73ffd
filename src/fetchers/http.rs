//! Shared REST plumbing for the Gmail and Outlook fetchers: bearer-auth
//! requests with rate-limit retries and redacted error bodies.

use std::time::Duration as StdDuration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use super::FetchError;

const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REDACTED_BODY_MAX_LEN: usize = 256;

pub struct RestClient {
    client: Client,
}

impl RestClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Connection(format!("build http client: {e}")))?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        token: &str,
        url: &str,
    ) -> Result<T, FetchError> {
        let body = self.request_with_retry(Method::GET, token, url, None).await?;
        serde_json::from_str(&body)
            .map_err(|e| FetchError::Protocol(format!("decode JSON from {url}: {e}")))
    }

    pub async fn post_json(
        &self,
        token: &str,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<(), FetchError> {
        self.request_with_retry(Method::POST, token, url, Some(payload))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, token: &str, url: &str) -> Result<(), FetchError> {
        self.request_with_retry(Method::DELETE, token, url, None)
            .await?;
        Ok(())
    }

    /// One request with the rate-limit loop: 429 honors `retry-after` when
    /// present, otherwise doubles a backoff capped at 32s, up to
    /// `MAX_RATE_LIMIT_RETRIES` attempts.
    async fn request_with_retry(
        &self,
        method: Method,
        token: &str,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<String, FetchError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let mut request = self
                .client
                .request(method.clone(), url)
                .bearer_auth(token)
                .header("accept", "application/json");
            if let Some(payload) = payload {
                request = request.json(payload);
            }

            let response = request
                .send()
                .await
                .map_err(|e| FetchError::Connection(format!("request {url}: {e}")))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response.text().await.unwrap_or_default();
                    return Err(FetchError::Protocol(format!(
                        "rate-limit retries exhausted for {url}: {}",
                        redact_response_body(&body)
                    )));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| FetchError::Connection(format!("read response from {url}: {e}")))?;

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(FetchError::Connection(format!(
                    "authentication rejected by {url}: status={status}"
                )));
            }
            if !status.is_success() {
                return Err(FetchError::Protocol(format!(
                    "request to {url} failed: status={status} body={}",
                    redact_response_body(&body)
                )));
            }

            return Ok(body);
        }

        Err(FetchError::Connection(format!(
            "request to {url} failed without response"
        )))
    }
}

/// Keep response bodies out of logs past a short prefix; provider errors can
/// echo message content back.
fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}
