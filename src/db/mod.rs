use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::models::{
    Account, Attachment, Email, EventRecord, Folder, Provider, SyncJob, Webhook,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

/// Store timestamps in one canonical shape so lexicographic ordering matches
/// chronological ordering (watermark queries rely on this).
pub fn now_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_accounts: i64,
    pub total_emails: i64,
    pub total_attachments: i64,
    pub total_events: i64,
    pub pending_jobs: i64,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // The CLI and a standing worker share this file; wait out the other
        // writer instead of surfacing SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".esync").join("esync.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_provider(&self, provider: &Provider) -> Result<(), DbError> {
        let scopes = serde_json::to_string(&provider.scopes)?;

        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO providers (
                provider_id, kind, imap_host, imap_port, smtp_host, smtp_port,
                encryption, token_url, scopes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                provider.provider_id,
                provider.kind.to_string(),
                provider.imap_host,
                provider.imap_port.map(i64::from),
                provider.smtp_host,
                provider.smtp_port.map(i64::from),
                provider.encryption,
                provider.token_url,
                scopes,
            ],
        )?;

        Ok(())
    }

    pub fn get_provider(&self, provider_id: &str) -> Result<Option<Provider>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT provider_id, kind, imap_host, imap_port, smtp_host, smtp_port,
                   encryption, token_url, scopes
            FROM providers
            WHERE provider_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([provider_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Provider::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_providers(&self) -> Result<Vec<Provider>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT provider_id, kind, imap_host, imap_port, smtp_host, smtp_port,
                   encryption, token_url, scopes
            FROM providers
            ORDER BY provider_id ASC
            "#,
        )?;

        let providers = stmt
            .query_map([], Provider::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(providers)
    }

    pub fn insert_account(&self, account: &Account) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO accounts (
                account_id, user_id, provider_id, address, display_name, auth,
                credential, enabled, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                account.account_id,
                account.user_id,
                account.provider_id,
                account.address,
                account.display_name,
                account.auth.to_string(),
                account.credential,
                account.enabled,
                account.created_at,
            ],
        )?;

        Ok(())
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<Account>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT account_id, user_id, provider_id, address, display_name, auth,
                   credential, enabled, created_at
            FROM accounts
            WHERE account_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([account_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Account::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT account_id, user_id, provider_id, address, display_name, auth,
                   credential, enabled, created_at
            FROM accounts
            ORDER BY address ASC
            "#,
        )?;

        let accounts = stmt
            .query_map([], Account::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn remove_account(&self, account_id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM accounts WHERE account_id = ?", [account_id])?;
        Ok(deleted)
    }

    /// The credential column is the only account field the engine writes
    /// (OAuth token rotation by the resolver).
    pub fn update_account_credential(
        &self,
        account_id: &str,
        credential: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE accounts SET credential = ? WHERE account_id = ?",
            params![credential, account_id],
        )?;
        Ok(())
    }

    pub fn upsert_folder(&self, folder: &Folder) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO folders (account_id, name, active)
            VALUES (?, ?, ?)
            ON CONFLICT(account_id, name) DO UPDATE SET active = excluded.active
            "#,
            params![folder.account_id, folder.name, folder.active],
        )?;
        Ok(())
    }

    pub fn list_active_folders(&self, account_id: &str) -> Result<Vec<Folder>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT account_id, name, active
            FROM folders
            WHERE account_id = ? AND active = true
            ORDER BY name ASC
            "#,
        )?;

        let folders = stmt
            .query_map([account_id], Folder::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    pub fn remove_folder(&self, account_id: &str, name: &str) -> Result<usize, DbError> {
        let deleted = self.conn.execute(
            "DELETE FROM folders WHERE account_id = ? AND name = ?",
            params![account_id, name],
        )?;
        Ok(deleted)
    }

    /// Insert a canonical email row; the per-account `seq` is assigned inside
    /// the statement so it stays atomic on a single connection.
    pub fn insert_email(&self, email: &Email) -> Result<(), DbError> {
        let recipients = serde_json::to_string(&email.recipients)?;
        let cc = serde_json::to_string(&email.cc)?;

        self.conn.execute(
            r#"
            INSERT INTO emails (
                id, account_id, provider_message_id, subject, sender, recipients, cc,
                body, snippet, received_at, references_list, in_reply_to, is_read,
                folder, seq
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      (SELECT COALESCE(MAX(seq), 0) + 1 FROM emails WHERE account_id = ?2))
            "#,
            params![
                email.id,
                email.account_id,
                email.provider_message_id,
                email.subject,
                email.sender,
                recipients,
                cc,
                email.body,
                email.snippet,
                email.received_at,
                email.references_list,
                email.in_reply_to,
                email.is_read,
                email.folder,
            ],
        )?;

        Ok(())
    }

    pub fn get_email(&self, id: &str) -> Result<Option<Email>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, account_id, provider_message_id, subject, sender, recipients, cc,
                   body, snippet, received_at, references_list, in_reply_to, is_read,
                   folder, seq
            FROM emails
            WHERE id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Email::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Dedup check for (account, provider_message_id): re-fetch of an
    /// already-stored message is a no-op upstream.
    pub fn email_exists(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM emails WHERE account_id = ? AND provider_message_id = ? LIMIT 1",
                params![account_id, provider_message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_emails(&self, account_id: &str, limit: usize) -> Result<Vec<Email>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, account_id, provider_message_id, subject, sender, recipients, cc,
                   body, snippet, received_at, references_list, in_reply_to, is_read,
                   folder, seq
            FROM emails
            WHERE account_id = ?
            ORDER BY received_at DESC
            LIMIT ?
            "#,
        )?;

        let emails = stmt
            .query_map(params![account_id, limit as i64], Email::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    /// Latest successfully-ingested message timestamp per (account, folder);
    /// bounds the next incremental fetch.
    pub fn folder_watermark(
        &self,
        account_id: &str,
        folder: &str,
    ) -> Result<Option<String>, DbError> {
        let watermark: Option<String> = self.conn.query_row(
            "SELECT MAX(received_at) FROM emails WHERE account_id = ? AND folder = ?",
            params![account_id, folder],
            |row| row.get(0),
        )?;
        Ok(watermark)
    }

    /// Attachment rows go with the email via the cascade.
    pub fn remove_email(&self, id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM emails WHERE id = ?", [id])?;
        Ok(deleted)
    }

    pub fn update_email_folder(&self, id: &str, folder: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE emails SET folder = ? WHERE id = ?",
            params![folder, id],
        )?;
        Ok(())
    }

    pub fn mark_email_read(&self, id: &str, is_read: bool) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE emails SET is_read = ? WHERE id = ?",
            params![is_read, id],
        )?;
        Ok(())
    }

    pub fn insert_attachment(&self, attachment: &Attachment) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO attachments (
                id, email_id, filename, mime_type, size_bytes, content_hash, storage_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                attachment.id,
                attachment.email_id,
                attachment.filename,
                attachment.mime_type,
                attachment.size_bytes,
                attachment.content_hash,
                attachment.storage_key,
            ],
        )?;
        Ok(())
    }

    /// Content-level dedup: any prior attachment with the same hash donates
    /// its storage key, regardless of which email it belongs to.
    pub fn find_storage_key_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<String>, DbError> {
        let key: Option<String> = self
            .conn
            .query_row(
                "SELECT storage_key FROM attachments WHERE content_hash = ? LIMIT 1",
                [content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    pub fn list_attachments(&self, email_id: &str) -> Result<Vec<Attachment>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, email_id, filename, mime_type, size_bytes, content_hash, storage_key
            FROM attachments
            WHERE email_id = ?
            ORDER BY filename ASC
            "#,
        )?;

        let attachments = stmt
            .query_map([email_id], Attachment::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    pub fn insert_webhook(&self, webhook: &Webhook) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO webhooks (id, user_id, url, secret, active)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                webhook.id,
                webhook.user_id,
                webhook.url,
                webhook.secret,
                webhook.active,
            ],
        )?;
        Ok(())
    }

    pub fn list_active_webhooks(&self, user_id: &str) -> Result<Vec<Webhook>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, url, secret, active
            FROM webhooks
            WHERE user_id = ? AND active = true
            ORDER BY id ASC
            "#,
        )?;

        let webhooks = stmt
            .query_map([user_id], Webhook::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(webhooks)
    }

    pub fn remove_webhook(&self, id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM webhooks WHERE id = ?", [id])?;
        Ok(deleted)
    }

    pub fn insert_event(&self, event: &EventRecord) -> Result<(), DbError> {
        let payload = serde_json::to_string(&event.payload)?;

        self.conn.execute(
            r#"
            INSERT INTO events (id, event_type, payload, webhook_id, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                event.id,
                event.event_type,
                payload,
                event.webhook_id,
                event.status.to_string(),
                event.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, event_type, payload, webhook_id, status, created_at
            FROM events
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )?;

        let events = stmt
            .query_map([limit as i64], EventRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn get_sync_job(&self, id: i64) -> Result<Option<SyncJob>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, queue_name, account_id, user_id, provider_id, created_at,
                   executed_at, is_executed
            FROM sync_jobs
            WHERE id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SyncJob::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_sync_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, queue_name, account_id, user_id, provider_id, created_at,
                   executed_at, is_executed
            FROM sync_jobs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )?;

        let jobs = stmt
            .query_map([limit as i64], SyncJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let total_accounts: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        let total_emails: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))?;
        let total_attachments: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))?;
        let total_events: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        let pending_jobs: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_jobs WHERE is_executed = 0",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseStats {
            total_accounts,
            total_emails,
            total_attachments,
            total_events,
            pending_jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::Database;
    use crate::db::models::{
        Account, Attachment, AuthKind, Email, Folder, Provider, ProviderKind,
    };

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("esync-test-{}.db", Uuid::new_v4()));
        path
    }

    fn sample_provider() -> Provider {
        Provider {
            provider_id: "prov-imap".to_string(),
            kind: ProviderKind::Imap,
            imap_host: Some("imap.example.com".to_string()),
            imap_port: Some(993),
            smtp_host: Some("smtp.example.com".to_string()),
            smtp_port: Some(587),
            encryption: Some("ssl".to_string()),
            token_url: None,
            scopes: vec![],
        }
    }

    fn sample_account() -> Account {
        Account {
            account_id: "acc-1".to_string(),
            user_id: "user-1".to_string(),
            provider_id: "prov-imap".to_string(),
            address: "owner@example.com".to_string(),
            display_name: Some("Owner".to_string()),
            auth: AuthKind::Password,
            credential: None,
            enabled: true,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn sample_email(id: &str, provider_message_id: &str, received_at: &str) -> Email {
        Email {
            id: id.to_string(),
            account_id: "acc-1".to_string(),
            provider_message_id: provider_message_id.to_string(),
            subject: "Project kickoff".to_string(),
            sender: "sender@example.com".to_string(),
            recipients: vec!["owner@example.com".to_string()],
            cc: vec![],
            body: "Let us meet tomorrow".to_string(),
            snippet: None,
            received_at: received_at.to_string(),
            references_list: None,
            in_reply_to: None,
            is_read: false,
            folder: "INBOX".to_string(),
            seq: 0,
        }
    }

    #[test]
    fn open_sets_a_busy_timeout_for_concurrent_writers() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let timeout_ms: i64 = db
            .conn()
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .expect("read busy_timeout");
        assert!(timeout_ms >= 5000);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn insert_and_get_email_roundtrip() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.insert_provider(&sample_provider()).expect("insert provider");
        db.insert_account(&sample_account()).expect("insert account");
        db.insert_email(&sample_email("row-1", "<m1@example.com>", "2026-02-01T12:00:00Z"))
            .expect("insert email");

        let loaded = db
            .get_email("row-1")
            .expect("get email")
            .expect("email exists");
        assert_eq!(loaded.provider_message_id, "<m1@example.com>");
        assert_eq!(loaded.seq, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn email_uniqueness_is_per_account_and_provider_id() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.insert_provider(&sample_provider()).expect("insert provider");
        db.insert_account(&sample_account()).expect("insert account");
        db.insert_email(&sample_email("row-1", "<m1@example.com>", "2026-02-01T12:00:00Z"))
            .expect("insert email");

        assert!(db
            .email_exists("acc-1", "<m1@example.com>")
            .expect("check exists"));
        assert!(!db
            .email_exists("acc-1", "<m2@example.com>")
            .expect("check missing"));

        let duplicate =
            sample_email("row-2", "<m1@example.com>", "2026-02-01T13:00:00Z");
        assert!(db.insert_email(&duplicate).is_err(), "unique constraint holds");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn seq_increments_per_account() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.insert_provider(&sample_provider()).expect("insert provider");
        db.insert_account(&sample_account()).expect("insert account");
        db.insert_email(&sample_email("row-1", "<m1@example.com>", "2026-02-01T12:00:00Z"))
            .expect("insert first");
        db.insert_email(&sample_email("row-2", "<m2@example.com>", "2026-02-01T13:00:00Z"))
            .expect("insert second");

        let second = db.get_email("row-2").expect("get").expect("exists");
        assert_eq!(second.seq, 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn remove_email_cascades_to_attachments() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.insert_provider(&sample_provider()).expect("insert provider");
        db.insert_account(&sample_account()).expect("insert account");
        db.insert_email(&sample_email("row-1", "<m1@example.com>", "2026-02-01T12:00:00Z"))
            .expect("insert email");
        db.insert_attachment(&Attachment {
            id: "att-1".to_string(),
            email_id: "row-1".to_string(),
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 4,
            content_hash: "abcd".to_string(),
            storage_key: "attachments/ab/abcd".to_string(),
        })
        .expect("insert attachment");

        assert_eq!(db.remove_email("row-1").expect("remove"), 1);
        assert!(db.get_email("row-1").expect("lookup").is_none());
        assert!(db.list_attachments("row-1").expect("attachments").is_empty());
        assert_eq!(db.remove_email("row-1").expect("second remove"), 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn folder_watermark_tracks_max_received_at() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.insert_provider(&sample_provider()).expect("insert provider");
        db.insert_account(&sample_account()).expect("insert account");

        assert_eq!(
            db.folder_watermark("acc-1", "INBOX").expect("empty watermark"),
            None
        );

        db.insert_email(&sample_email("row-1", "<m1@example.com>", "2026-02-01T12:00:00Z"))
            .expect("insert first");
        db.insert_email(&sample_email("row-2", "<m2@example.com>", "2026-02-03T09:00:00Z"))
            .expect("insert second");

        assert_eq!(
            db.folder_watermark("acc-1", "INBOX")
                .expect("watermark")
                .as_deref(),
            Some("2026-02-03T09:00:00Z")
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn attachment_hash_lookup_shares_storage_key() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.insert_provider(&sample_provider()).expect("insert provider");
        db.insert_account(&sample_account()).expect("insert account");
        db.insert_email(&sample_email("row-1", "<m1@example.com>", "2026-02-01T12:00:00Z"))
            .expect("insert email");

        let attachment = Attachment {
            id: "att-1".to_string(),
            email_id: "row-1".to_string(),
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 4,
            content_hash: "abcd".to_string(),
            storage_key: "attachments/ab/abcd".to_string(),
        };
        db.insert_attachment(&attachment).expect("insert attachment");

        assert_eq!(
            db.find_storage_key_by_hash("abcd")
                .expect("hash lookup")
                .as_deref(),
            Some("attachments/ab/abcd")
        );
        assert!(db
            .find_storage_key_by_hash("ffff")
            .expect("missing hash")
            .is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn folders_upsert_and_active_filter() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.insert_provider(&sample_provider()).expect("insert provider");
        db.insert_account(&sample_account()).expect("insert account");

        for (name, active) in [("INBOX", true), ("Archive", true), ("Spam", false)] {
            db.upsert_folder(&Folder {
                account_id: "acc-1".to_string(),
                name: name.to_string(),
                active,
            })
            .expect("upsert folder");
        }

        let active = db.list_active_folders("acc-1").expect("list folders");
        let names: Vec<_> = active.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Archive", "INBOX"]);
        let _ = std::fs::remove_file(path);
    }
}
