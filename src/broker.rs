//! Durable task queue over the `queue_messages` table.
//!
//! Semantics mirror a conventional broker: published messages survive
//! restarts, consumers claim one message at a time, an acknowledged message
//! is done, a negatively-acknowledged one is redelivered with backoff until
//! the delivery cap moves it to the dead state. The SQL substrate keeps the
//! whole engine on one storage dependency; a network broker could replace
//! this module behind the same surface.

use std::future::Future;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{now_utc, Database, DbError};
use crate::sync::CancelFlag;

/// Redeliveries stop after this many claims; the message then parks in the
/// dead state for operator inspection.
pub const MAX_DELIVERIES: i64 = 5;

pub const STALE_CLAIM_MINUTES_ENV: &str = "ESYNC_STALE_CLAIM_MINUTES";
const DEFAULT_STALE_CLAIM_MINUTES: i64 = 10;

const IDLE_POLL: StdDuration = StdDuration::from_secs(1);

fn stale_claim_minutes() -> i64 {
    std::env::var(STALE_CLAIM_MINUTES_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|minutes| *minutes > 0)
        .unwrap_or(DEFAULT_STALE_CLAIM_MINUTES)
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

impl From<DbError> for BrokerError {
    fn from(err: DbError) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub attempts: i64,
}

/// Consumer's verdict on one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    Requeue,
}

pub fn publish(
    db: &Database,
    queue_name: &str,
    payload: &serde_json::Value,
    correlation_id: Option<&str>,
) -> Result<String, BrokerError> {
    let id = Uuid::new_v4().to_string();
    let body = serde_json::to_string(payload)
        .map_err(|e| BrokerError::Unavailable(format!("encode payload: {e}")))?;

    db.conn().execute(
        r#"
        INSERT INTO queue_messages (id, queue_name, payload, correlation_id, state, attempts, available_at, created_at)
        VALUES (?, ?, ?, ?, 'ready', 0, ?, ?)
        "#,
        params![id, queue_name, body, correlation_id, now_utc(), now_utc()],
    )?;

    debug!(queue = queue_name, message_id = %id, "published message");
    Ok(id)
}

/// Return messages whose claim outlived its worker. A crashed consumer never
/// settles, so aged inflight claims go back to ready (or dead once past the
/// delivery cap); the attempt already counted at claim time keeps the cap
/// binding.
fn reclaim_stale_claims(db: &Database, queue_name: &str) -> Result<(), BrokerError> {
    let cutoff = (Utc::now() - Duration::minutes(stale_claim_minutes()))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();

    let parked = db.conn().execute(
        r#"
        UPDATE queue_messages SET state = 'dead', claimed_at = NULL
        WHERE queue_name = ? AND state = 'inflight' AND claimed_at <= ? AND attempts >= ?
        "#,
        params![queue_name, cutoff, MAX_DELIVERIES],
    )?;
    let returned = db.conn().execute(
        r#"
        UPDATE queue_messages SET state = 'ready', available_at = ?, claimed_at = NULL
        WHERE queue_name = ? AND state = 'inflight' AND claimed_at <= ?
        "#,
        params![now_utc(), queue_name, cutoff],
    )?;

    if parked + returned > 0 {
        warn!(
            queue = queue_name,
            returned, parked, "reclaimed abandoned inflight claims"
        );
    }
    Ok(())
}

/// Claim the oldest ready message, if any. The claim marks it inflight and
/// counts a delivery attempt.
pub fn claim_next(db: &Database, queue_name: &str) -> Result<Option<QueueMessage>, BrokerError> {
    reclaim_stale_claims(db, queue_name)?;

    let claimed: Option<(String, String, Option<String>, i64)> = db
        .conn()
        .query_row(
            r#"
            UPDATE queue_messages
            SET state = 'inflight', attempts = attempts + 1, claimed_at = ?
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue_name = ? AND state = 'ready' AND available_at <= ?
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, payload, correlation_id, attempts
            "#,
            params![now_utc(), queue_name, now_utc()],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            },
        )
        .optional()?;

    let Some((id, body, correlation_id, attempts)) = claimed else {
        return Ok(None);
    };

    let payload = serde_json::from_str(&body)
        .map_err(|e| BrokerError::Unavailable(format!("decode payload of {id}: {e}")))?;

    Ok(Some(QueueMessage {
        id,
        queue_name: queue_name.to_string(),
        payload,
        correlation_id,
        attempts,
    }))
}

pub fn ack(db: &Database, message_id: &str) -> Result<(), BrokerError> {
    db.conn().execute(
        "UPDATE queue_messages SET state = 'done' WHERE id = ?",
        [message_id],
    )?;
    Ok(())
}

/// Return a message to the queue with exponential backoff, or park it dead
/// once the delivery cap is reached.
pub fn requeue(db: &Database, message: &QueueMessage) -> Result<(), BrokerError> {
    if message.attempts >= MAX_DELIVERIES {
        db.conn().execute(
            "UPDATE queue_messages SET state = 'dead' WHERE id = ?",
            [message.id.as_str()],
        )?;
        warn!(
            queue = %message.queue_name,
            message_id = %message.id,
            attempts = message.attempts,
            "delivery cap reached, message parked dead"
        );
        return Ok(());
    }

    let backoff_seconds = (1i64 << message.attempts.min(6)).min(60);
    let available_at = (Utc::now() + Duration::seconds(backoff_seconds))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();

    db.conn().execute(
        "UPDATE queue_messages SET state = 'ready', available_at = ?, claimed_at = NULL WHERE id = ?",
        params![available_at, message.id],
    )?;
    Ok(())
}

pub fn dead_letter_count(db: &Database, queue_name: &str) -> Result<i64, BrokerError> {
    let count = db.conn().query_row(
        "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ? AND state = 'dead'",
        [queue_name],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Prefetch-1 consume loop: claim, hand to the handler, settle on its
/// verdict, repeat until cancelled. An idle queue is polled once a second.
pub async fn run_consumer<F, Fut>(
    db: &Database,
    queue_name: &str,
    cancel: &CancelFlag,
    mut handler: F,
) -> Result<(), BrokerError>
where
    F: FnMut(QueueMessage) -> Fut,
    Fut: Future<Output = Verdict>,
{
    while !cancel.is_cancelled() {
        match claim_next(db, queue_name)? {
            Some(message) => {
                let id = message.id.clone();
                match handler(message.clone()).await {
                    Verdict::Ack => ack(db, &id)?,
                    Verdict::Requeue => requeue(db, &message)?,
                }
            }
            None => sleep(IDLE_POLL).await,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;

    fn temp_db() -> (Database, PathBuf) {
        let mut path = std::env::temp_dir();
        path.push(format!("esync-broker-{}.db", Uuid::new_v4()));
        let db = Database::open(&path).expect("open db");
        (db, path)
    }

    #[test]
    fn publish_then_claim_delivers_payload() {
        let (db, path) = temp_db();
        let payload = serde_json::json!({"job_id": 7});

        publish(&db, "sync.tasks", &payload, Some("corr-1")).expect("publish");

        let message = claim_next(&db, "sync.tasks")
            .expect("claim")
            .expect("message available");
        assert_eq!(message.payload, payload);
        assert_eq!(message.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(message.attempts, 1);

        // Inflight messages are not claimable again.
        assert!(claim_next(&db, "sync.tasks").expect("claim again").is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn ack_settles_a_delivery() {
        let (db, path) = temp_db();
        publish(&db, "q", &serde_json::json!({}), None).expect("publish");

        let message = claim_next(&db, "q").expect("claim").expect("message");
        ack(&db, &message.id).expect("ack");

        assert!(claim_next(&db, "q").expect("claim").is_none());
        assert_eq!(dead_letter_count(&db, "q").expect("count"), 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn requeue_backs_off_then_dead_letters_at_cap() {
        let (db, path) = temp_db();
        publish(&db, "q", &serde_json::json!({}), None).expect("publish");

        let mut message = claim_next(&db, "q").expect("claim").expect("message");
        for _ in 0..(MAX_DELIVERIES - 1) {
            requeue(&db, &message).expect("requeue");
            // Collapse the backoff window so the next claim sees it.
            db.conn()
                .execute(
                    "UPDATE queue_messages SET available_at = '2000-01-01T00:00:00Z' WHERE id = ?",
                    [message.id.as_str()],
                )
                .expect("reset backoff");
            message = claim_next(&db, "q").expect("claim").expect("redelivered");
        }

        assert_eq!(message.attempts, MAX_DELIVERIES);
        requeue(&db, &message).expect("final requeue");

        assert!(claim_next(&db, "q").expect("claim").is_none());
        assert_eq!(dead_letter_count(&db, "q").expect("count"), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stale_inflight_claims_are_redelivered() {
        let (db, path) = temp_db();
        publish(&db, "q", &serde_json::json!({"n": 1}), None).expect("publish");

        let first = claim_next(&db, "q").expect("claim").expect("message");
        assert!(claim_next(&db, "q").expect("claim while inflight").is_none());

        // A worker that died mid-delivery never settles its claim.
        db.conn()
            .execute(
                "UPDATE queue_messages SET claimed_at = '2000-01-01T00:00:00Z' WHERE id = ?",
                [first.id.as_str()],
            )
            .expect("age claim");

        let redelivered = claim_next(&db, "q").expect("claim").expect("reclaimed");
        assert_eq!(redelivered.id, first.id);
        assert_eq!(redelivered.attempts, 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stale_claims_past_the_delivery_cap_park_dead() {
        let (db, path) = temp_db();
        publish(&db, "q", &serde_json::json!({}), None).expect("publish");

        let message = claim_next(&db, "q").expect("claim").expect("message");
        db.conn()
            .execute(
                "UPDATE queue_messages SET claimed_at = '2000-01-01T00:00:00Z', attempts = ? WHERE id = ?",
                params![MAX_DELIVERIES, message.id],
            )
            .expect("age claim at cap");

        assert!(claim_next(&db, "q").expect("claim").is_none());
        assert_eq!(dead_letter_count(&db, "q").expect("count"), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn queues_are_isolated_by_name() {
        let (db, path) = temp_db();
        publish(&db, "a", &serde_json::json!({"n": 1}), None).expect("publish");

        assert!(claim_next(&db, "b").expect("claim other queue").is_none());
        assert!(claim_next(&db, "a").expect("claim own queue").is_some());
        let _ = std::fs::remove_file(path);
    }
}
