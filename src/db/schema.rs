//! Table definitions, split along the schema's version history: the mail
//! store came first, webhook delivery and the task queue arrived later.
//! `migrations` replays whichever steps a database is missing.

use rusqlite::Connection;

/// Version 1: providers, accounts, folders, the single-flight job table and
/// the mail/attachment store.
pub fn create_mail_store(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS providers (
            provider_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK(kind IN ('imap', 'gmail', 'outlook')),
            imap_host TEXT,
            imap_port INTEGER,
            smtp_host TEXT,
            smtp_port INTEGER,
            encryption TEXT,
            token_url TEXT,
            scopes TEXT
        );

        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider_id TEXT NOT NULL REFERENCES providers(provider_id),
            address TEXT NOT NULL,
            display_name TEXT,
            auth TEXT NOT NULL CHECK(auth IN ('password', 'oauth')),
            credential TEXT,
            enabled BOOLEAN NOT NULL DEFAULT true,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS folders (
            account_id TEXT NOT NULL REFERENCES accounts(account_id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT true,
            PRIMARY KEY (account_id, name)
        );

        CREATE TABLE IF NOT EXISTS sync_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_name TEXT NOT NULL,
            account_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            executed_at TEXT,
            is_executed BOOLEAN NOT NULL DEFAULT false
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_single_flight
            ON sync_jobs(account_id, provider_id) WHERE is_executed = 0;

        CREATE TABLE IF NOT EXISTS emails (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(account_id),
            provider_message_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipients TEXT NOT NULL,
            cc TEXT NOT NULL,
            body TEXT NOT NULL,
            snippet TEXT,
            received_at TEXT NOT NULL,
            references_list TEXT,
            in_reply_to TEXT,
            is_read BOOLEAN NOT NULL DEFAULT false,
            folder TEXT NOT NULL,
            seq INTEGER NOT NULL,
            UNIQUE (account_id, provider_message_id)
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            email_id TEXT NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            storage_key TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_accounts_user_id ON accounts(user_id);
        CREATE INDEX IF NOT EXISTS idx_sync_jobs_account ON sync_jobs(account_id, provider_id);
        CREATE INDEX IF NOT EXISTS idx_emails_account_folder_received
            ON emails(account_id, folder, received_at);
        CREATE INDEX IF NOT EXISTS idx_attachments_content_hash ON attachments(content_hash);
        "#,
    )
}

/// Version 2: webhook subscriptions, the delivery log, and the durable task
/// queue behind `broker`.
pub fn create_dispatch_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            url TEXT NOT NULL,
            secret TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT true
        );

        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            webhook_id TEXT NOT NULL REFERENCES webhooks(id),
            status TEXT NOT NULL CHECK(status IN ('sent', 'failed')),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS queue_messages (
            id TEXT PRIMARY KEY,
            queue_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            correlation_id TEXT,
            state TEXT NOT NULL CHECK(state IN ('ready', 'inflight', 'done', 'dead')),
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at TEXT NOT NULL,
            claimed_at TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_webhooks_user_id ON webhooks(user_id);
        CREATE INDEX IF NOT EXISTS idx_events_webhook_id ON events(webhook_id);
        CREATE INDEX IF NOT EXISTS idx_queue_messages_claim
            ON queue_messages(queue_name, state, available_at);
        "#,
    )
}
