//! Webhook fan-out. Every event is delivered to each of the owning user's
//! active webhooks; each delivery attempt leaves an `events` row with its
//! outcome, and one dead endpoint never blocks the others.

use std::time::Duration as StdDuration;

use reqwest::Client;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::models::{DeliveryStatus, EventRecord};
use crate::db::{now_utc, Database, DbError};

pub const EVENT_EMAIL_INGESTED: &str = "email_ingested";
pub const EVENT_SYNC_COMPLETED: &str = "sync_completed";
pub const EVENT_SYNC_FAILED: &str = "sync_failed";

pub const WEBHOOK_TIMEOUT_ENV: &str = "ESYNC_WEBHOOK_TIMEOUT_SECS";
const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 10;

fn delivery_timeout() -> StdDuration {
    let seconds = std::env::var(WEBHOOK_TIMEOUT_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_DELIVERY_TIMEOUT_SECS);
    StdDuration::from_secs(seconds)
}

pub struct EventPublisher {
    client: Client,
}

impl EventPublisher {
    pub fn new() -> Result<Self, DbError> {
        let client = Client::builder()
            .timeout(delivery_timeout())
            .build()
            .map_err(|e| DbError::Config(format!("build webhook client: {e}")))?;
        Ok(Self { client })
    }

    /// Deliver one event to every active webhook owned by `user_id`. Returns
    /// the per-webhook delivery records.
    pub async fn publish(
        &self,
        db: &Database,
        user_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Vec<EventRecord>, DbError> {
        let webhooks = db.list_active_webhooks(user_id)?;
        if webhooks.is_empty() {
            debug!(user = user_id, event_type, "no active webhooks, event dropped");
            return Ok(vec![]);
        }

        let envelope = serde_json::json!({
            "event_type": event_type,
            "occurred_at": now_utc(),
            "payload": payload,
        });

        let mut records = Vec::with_capacity(webhooks.len());
        for webhook in webhooks {
            let delivered = self
                .client
                .post(&webhook.url)
                .bearer_auth(&webhook.secret)
                .json(&envelope)
                .send()
                .await;

            let status = match delivered {
                Ok(response) if response.status().is_success() => DeliveryStatus::Sent,
                Ok(response) => {
                    warn!(
                        webhook = %webhook.id,
                        status = %response.status(),
                        event_type,
                        "webhook rejected event"
                    );
                    DeliveryStatus::Failed
                }
                Err(err) => {
                    warn!(webhook = %webhook.id, event_type, "webhook delivery failed: {err}");
                    DeliveryStatus::Failed
                }
            };

            let record = EventRecord {
                id: Uuid::new_v4().to_string(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
                webhook_id: webhook.id.clone(),
                status,
                created_at: now_utc(),
            };
            db.insert_event(&record)?;
            records.push(record);
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use super::*;
    use crate::db::models::Webhook;

    fn temp_db() -> (Database, PathBuf) {
        let mut path = std::env::temp_dir();
        path.push(format!("esync-events-{}.db", Uuid::new_v4()));
        let db = Database::open(&path).expect("open db");
        (db, path)
    }

    /// Accept `n` requests, answer each with the given status line.
    async fn responder(n: usize, status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for _ in 0..n {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/hook")
    }

    fn seed_webhook(db: &Database, id: &str, user_id: &str, url: &str, active: bool) {
        db.insert_webhook(&Webhook {
            id: id.to_string(),
            user_id: user_id.to_string(),
            url: url.to_string(),
            secret: "hook-secret".to_string(),
            active,
        })
        .expect("webhook");
    }

    #[tokio::test]
    async fn delivers_to_active_webhooks_and_records_outcome() {
        let (db, path) = temp_db();
        let url = responder(1, "HTTP/1.1 200 OK").await;
        seed_webhook(&db, "wh-1", "user-1", &url, true);

        let publisher = EventPublisher::new().expect("publisher");
        let records = publisher
            .publish(
                &db,
                "user-1",
                EVENT_SYNC_COMPLETED,
                &serde_json::json!({"job_id": 1}),
            )
            .await
            .expect("publish");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::Sent);
        assert_eq!(db.list_recent_events(10).expect("events").len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn one_failing_webhook_does_not_block_the_rest() {
        let (db, path) = temp_db();
        let good = responder(1, "HTTP/1.1 200 OK").await;
        let bad = responder(1, "HTTP/1.1 500 Internal Server Error").await;
        seed_webhook(&db, "wh-bad", "user-1", &bad, true);
        seed_webhook(&db, "wh-good", "user-1", &good, true);

        let publisher = EventPublisher::new().expect("publisher");
        let records = publisher
            .publish(
                &db,
                "user-1",
                EVENT_EMAIL_INGESTED,
                &serde_json::json!({"email_id": "e-1"}),
            )
            .await
            .expect("publish");

        assert_eq!(records.len(), 2);
        let sent = records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Sent)
            .count();
        let failed = records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Failed)
            .count();
        assert_eq!((sent, failed), (1, 1));
        let _ = std::fs::remove_file(path);
    }

    /// Accept one connection, read the request, then go quiet until the
    /// client gives up.
    async fn hung_responder() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
        });
        format!("http://{addr}/hook")
    }

    #[tokio::test]
    async fn hung_webhook_times_out_without_blocking_the_rest() {
        let (db, path) = temp_db();
        std::env::set_var(WEBHOOK_TIMEOUT_ENV, "1");
        let hung = hung_responder().await;
        let good = responder(1, "HTTP/1.1 200 OK").await;
        seed_webhook(&db, "wh-hung", "user-1", &hung, true);
        seed_webhook(&db, "wh-good", "user-1", &good, true);

        let publisher = EventPublisher::new().expect("publisher");
        let records = publisher
            .publish(
                &db,
                "user-1",
                EVENT_SYNC_COMPLETED,
                &serde_json::json!({"job_id": 9}),
            )
            .await
            .expect("publish");
        std::env::remove_var(WEBHOOK_TIMEOUT_ENV);

        assert_eq!(records.len(), 2);
        for record in &records {
            match record.webhook_id.as_str() {
                "wh-hung" => assert_eq!(record.status, DeliveryStatus::Failed),
                "wh-good" => assert_eq!(record.status, DeliveryStatus::Sent),
                other => panic!("unexpected webhook id {other}"),
            }
        }
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn inactive_webhooks_and_other_users_are_ignored() {
        let (db, path) = temp_db();
        let url = responder(1, "HTTP/1.1 200 OK").await;
        seed_webhook(&db, "wh-off", "user-1", &url, false);
        seed_webhook(&db, "wh-other", "user-2", &url, true);

        let publisher = EventPublisher::new().expect("publisher");
        let records = publisher
            .publish(&db, "user-1", EVENT_SYNC_FAILED, &serde_json::json!({}))
            .await
            .expect("publish");

        assert!(records.is_empty());
        assert!(db.list_recent_events(10).expect("events").is_empty());
        let _ = std::fs::remove_file(path);
    }
}
