use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

use esync::attachments::{AttachmentStore, FsObjectStore};
use esync::db::models::{Account, AuthKind, Folder, Provider, ProviderKind, Webhook};
use esync::db::Database;
use esync::fetchers::{FetchError, MailFetcher, RawAttachment, RawMessage};
use esync::sync::guard;
use esync::sync::{CancelFlag, FetcherFactory, SyncEngine};

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("esync-engine-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

fn seed_account(db: &Database) -> Account {
    db.insert_provider(&Provider {
        provider_id: "prov-imap".to_string(),
        kind: ProviderKind::Imap,
        imap_host: Some("imap.example.com".to_string()),
        imap_port: Some(993),
        smtp_host: None,
        smtp_port: None,
        encryption: Some("ssl".to_string()),
        token_url: None,
        scopes: vec![],
    })
    .expect("insert provider");

    let account = Account {
        account_id: "acc-1".to_string(),
        user_id: "user-1".to_string(),
        provider_id: "prov-imap".to_string(),
        address: "owner@example.com".to_string(),
        display_name: Some("Owner".to_string()),
        auth: AuthKind::Password,
        credential: None,
        enabled: true,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    };
    db.insert_account(&account).expect("insert account");
    account
}

fn associate_folder(db: &Database, name: &str) {
    db.upsert_folder(&Folder {
        account_id: "acc-1".to_string(),
        name: name.to_string(),
        active: true,
    })
    .expect("associate folder");
}

fn received(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, hour, 0, 0).unwrap()
}

fn message(id: &str, folder: &str, hour: u32) -> RawMessage {
    RawMessage {
        provider_message_id: Some(id.to_string()),
        folder: folder.to_string(),
        subject: Some(format!("Subject {id}")),
        sender: Some("sender@example.com".to_string()),
        recipients: vec!["owner@example.com".to_string()],
        cc: vec![],
        has_bcc: false,
        body_text: Some("body".to_string()),
        body_html: None,
        received_at: Some(received(hour)),
        references: vec![],
        in_reply_to: None,
        is_read: false,
        has_attachments: false,
        inline_attachments: None,
    }
}

enum Scripted {
    Messages(Vec<RawMessage>),
    ConnectionError(&'static str),
}

/// Shared script driving the fake fetcher; the test keeps a handle for
/// assertions about what the engine actually asked for.
struct Script {
    folders: Vec<String>,
    responses: RefCell<HashMap<String, VecDeque<Scripted>>>,
    fetch_calls: RefCell<Vec<(String, Option<DateTime<Utc>>)>>,
    builds: Cell<usize>,
    refreshes: Cell<usize>,
}

impl Script {
    fn new(folders: &[&str]) -> Rc<Self> {
        Rc::new(Self {
            folders: folders.iter().map(|f| f.to_string()).collect(),
            responses: RefCell::new(HashMap::new()),
            fetch_calls: RefCell::new(Vec::new()),
            builds: Cell::new(0),
            refreshes: Cell::new(0),
        })
    }

    fn push(&self, folder: &str, response: Scripted) {
        self.responses
            .borrow_mut()
            .entry(folder.to_string())
            .or_default()
            .push_back(response);
    }
}

struct FakeFetcher {
    script: Rc<Script>,
}

#[async_trait(?Send)]
impl MailFetcher for FakeFetcher {
    fn provider_name(&self) -> &str {
        "fake"
    }

    async fn list_folders(&mut self) -> Result<Vec<String>, FetchError> {
        Ok(self.script.folders.clone())
    }

    async fn fetch_since(
        &mut self,
        folder: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, FetchError> {
        self.script
            .fetch_calls
            .borrow_mut()
            .push((folder.to_string(), watermark));

        let next = self
            .script
            .responses
            .borrow_mut()
            .get_mut(folder)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Scripted::Messages(messages)) => Ok(messages),
            Some(Scripted::ConnectionError(msg)) => {
                Err(FetchError::Connection(msg.to_string()))
            }
            None => Ok(vec![]),
        }
    }

    async fn fetch_attachments(
        &mut self,
        _message: &RawMessage,
    ) -> Result<Vec<RawAttachment>, FetchError> {
        Ok(vec![])
    }

    async fn move_message(
        &mut self,
        _message_id: &str,
        _from_folder: &str,
        _to_folder: &str,
    ) -> Result<(), FetchError> {
        Ok(())
    }

    async fn delete_message(
        &mut self,
        _message_id: &str,
        _folder: &str,
    ) -> Result<(), FetchError> {
        Ok(())
    }
}

struct FakeFactory {
    script: Rc<Script>,
}

#[async_trait(?Send)]
impl FetcherFactory for FakeFactory {
    async fn create(
        &self,
        _db: &Database,
        _account: &Account,
        _provider: &Provider,
        refresh: bool,
    ) -> Result<Box<dyn MailFetcher>> {
        self.script.builds.set(self.script.builds.get() + 1);
        if refresh {
            self.script.refreshes.set(self.script.refreshes.get() + 1);
        }
        Ok(Box::new(FakeFetcher {
            script: Rc::clone(&self.script),
        }))
    }
}

fn engine(root: &std::path::Path) -> SyncEngine<FsObjectStore> {
    SyncEngine::new(AttachmentStore::new(FsObjectStore::new(
        root.join("objects"),
    )))
    .expect("build engine")
}

/// Accept `n` webhook requests, always answering 200.
async fn webhook_responder(n: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        for _ in 0..n {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let mut buf = [0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        }
    });
    format!("http://{addr}/hook")
}

#[tokio::test]
async fn full_run_stores_deduplicates_and_emits_events() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "INBOX");

    let url = webhook_responder(3).await;
    db.insert_webhook(&Webhook {
        id: "wh-1".to_string(),
        user_id: "user-1".to_string(),
        url,
        secret: "hook-secret".to_string(),
        active: true,
    })?;

    let script = Script::new(&["INBOX"]);
    script.push(
        "INBOX",
        Scripted::Messages(vec![
            message("<m1@example.com>", "INBOX", 9),
            message("<m2@example.com>", "INBOX", 10),
            message("<m1@example.com>", "INBOX", 9), // duplicate id
        ]),
    );
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };

    let engine = engine(&root);
    let cancel = CancelFlag::new();
    let report = engine
        .sync_now(&db, &factory, "acc-1", &cancel)
        .await?
        .expect("sync ran");

    assert_eq!(report.emails_stored, 2);
    assert_eq!(report.emails_skipped, 1);
    assert_eq!(report.folders_synced, 1);
    assert!(report.errors.is_empty());
    assert_eq!(db.list_emails("acc-1", 10)?.len(), 2);

    // Two ingestion events plus exactly one terminal completion.
    let events = db.list_recent_events(10)?;
    let ingested = events
        .iter()
        .filter(|e| e.event_type == "email_ingested")
        .count();
    let completed = events
        .iter()
        .filter(|e| e.event_type == "sync_completed")
        .count();
    let failed = events
        .iter()
        .filter(|e| e.event_type == "sync_failed")
        .count();
    assert_eq!((ingested, completed, failed), (2, 1, 0));

    // The guard slot is free again.
    let jobs = db.list_sync_jobs(10)?;
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].is_executed);

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[tokio::test]
async fn connection_failure_keeps_partial_progress_and_fails_once() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "Alpha");
    associate_folder(&db, "Beta");

    let url = webhook_responder(2).await;
    db.insert_webhook(&Webhook {
        id: "wh-1".to_string(),
        user_id: "user-1".to_string(),
        url,
        secret: "hook-secret".to_string(),
        active: true,
    })?;

    let script = Script::new(&["Alpha", "Beta"]);
    script.push(
        "Alpha",
        Scripted::Messages(vec![message("<a1@example.com>", "Alpha", 9)]),
    );
    // Beta fails, and keeps failing after the one allowed credential
    // refresh.
    script.push("Beta", Scripted::ConnectionError("socket reset"));
    script.push("Beta", Scripted::ConnectionError("socket reset again"));
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };

    let engine = engine(&root);
    let cancel = CancelFlag::new();
    let result = engine.sync_now(&db, &factory, "acc-1", &cancel).await;
    assert!(result.is_err());

    // Alpha's message survived the failed run.
    assert_eq!(db.list_emails("acc-1", 10)?.len(), 1);

    // One refresh attempt happened, then the run aborted.
    assert_eq!(script.refreshes.get(), 1);
    assert_eq!(script.builds.get(), 2);

    // Terminal state: guard released, exactly one failure event.
    let jobs = db.list_sync_jobs(10)?;
    assert!(jobs[0].is_executed);
    let events = db.list_recent_events(10)?;
    let failed = events
        .iter()
        .filter(|e| e.event_type == "sync_failed")
        .count();
    let completed = events
        .iter()
        .filter(|e| e.event_type == "sync_completed")
        .count();
    assert_eq!((failed, completed), (1, 0));

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[tokio::test]
async fn only_associated_folders_are_fetched() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "INBOX");
    // "Junk" exists on the provider but was never associated; "Ghost" is
    // associated but the provider no longer reports it.
    associate_folder(&db, "Ghost");

    let script = Script::new(&["INBOX", "Junk"]);
    script.push(
        "INBOX",
        Scripted::Messages(vec![message("<m1@example.com>", "INBOX", 9)]),
    );
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };

    let engine = engine(&root);
    let cancel = CancelFlag::new();
    engine.sync_now(&db, &factory, "acc-1", &cancel).await?;

    let fetched: Vec<String> = script
        .fetch_calls
        .borrow()
        .iter()
        .map(|(folder, _)| folder.clone())
        .collect();
    assert_eq!(fetched, vec!["INBOX"]);

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[tokio::test]
async fn second_run_passes_the_watermark() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "INBOX");

    let script = Script::new(&["INBOX"]);
    script.push(
        "INBOX",
        Scripted::Messages(vec![
            message("<m1@example.com>", "INBOX", 9),
            message("<m2@example.com>", "INBOX", 11),
        ]),
    );
    script.push("INBOX", Scripted::Messages(vec![]));
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };

    let engine = engine(&root);
    let cancel = CancelFlag::new();
    engine.sync_now(&db, &factory, "acc-1", &cancel).await?;
    engine.sync_now(&db, &factory, "acc-1", &cancel).await?;

    let calls = script.fetch_calls.borrow();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, None);
    assert_eq!(calls[1].1, Some(received(11)));

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[tokio::test]
async fn incomplete_and_bcc_messages_are_never_persisted() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "INBOX");

    let mut no_id = message("<unused>", "INBOX", 9);
    no_id.provider_message_id = None;
    let mut bcc = message("<bcc@example.com>", "INBOX", 10);
    bcc.has_bcc = true;

    let script = Script::new(&["INBOX"]);
    script.push("INBOX", Scripted::Messages(vec![no_id, bcc]));
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };

    let engine = engine(&root);
    let cancel = CancelFlag::new();
    let report = engine
        .sync_now(&db, &factory, "acc-1", &cancel)
        .await?
        .expect("sync ran");

    assert_eq!(report.emails_stored, 0);
    assert_eq!(report.emails_skipped, 2);
    assert!(db.list_emails("acc-1", 10)?.is_empty());

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[tokio::test]
async fn inline_attachments_deduplicate_by_content() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "INBOX");

    let shared = RawAttachment {
        filename: "report.pdf".to_string(),
        mime_type: "application/pdf".to_string(),
        content: b"identical bytes".to_vec(),
    };
    let mut first = message("<m1@example.com>", "INBOX", 9);
    first.has_attachments = true;
    first.inline_attachments = Some(vec![shared.clone()]);
    let mut second = message("<m2@example.com>", "INBOX", 10);
    second.has_attachments = true;
    second.inline_attachments = Some(vec![shared]);

    let script = Script::new(&["INBOX"]);
    script.push("INBOX", Scripted::Messages(vec![first, second]));
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };

    let engine = engine(&root);
    let cancel = CancelFlag::new();
    let report = engine
        .sync_now(&db, &factory, "acc-1", &cancel)
        .await?
        .expect("sync ran");
    assert_eq!(report.attachments_stored, 2);

    let emails = db.list_emails("acc-1", 10)?;
    let mut storage_keys = Vec::new();
    for email in &emails {
        for attachment in db.list_attachments(&email.id)? {
            storage_keys.push(attachment.storage_key);
        }
    }
    assert_eq!(storage_keys.len(), 2);
    assert_eq!(storage_keys[0], storage_keys[1]);

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[tokio::test]
async fn sync_is_single_flight_per_account() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "INBOX");

    // Another run holds the slot.
    guard::try_acquire(&db, "acc-1", "user-1", "prov-imap")?;

    let script = Script::new(&["INBOX"]);
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };
    let engine = engine(&root);
    let cancel = CancelFlag::new();

    // The second trigger is a no-op, not an error.
    let outcome = engine.sync_now(&db, &factory, "acc-1", &cancel).await?;
    assert!(outcome.is_none());

    // The engine never even built a fetcher.
    assert_eq!(script.builds.get(), 0);

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[tokio::test]
async fn cancelled_run_releases_the_guard() -> Result<()> {
    let root = temp_root();
    let db = Database::open(&root.join("esync.db"))?;
    seed_account(&db);
    associate_folder(&db, "INBOX");

    let script = Script::new(&["INBOX"]);
    script.push(
        "INBOX",
        Scripted::Messages(vec![message("<m1@example.com>", "INBOX", 9)]),
    );
    let factory = FakeFactory {
        script: Rc::clone(&script),
    };

    let engine = engine(&root);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let result = engine.sync_now(&db, &factory, "acc-1", &cancel).await;
    assert!(result.is_err());

    let jobs = db.list_sync_jobs(10)?;
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].is_executed, "cancelled run must release its job");

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}
