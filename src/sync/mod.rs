//! Sync orchestration: acquire the single-flight slot, walk the account's
//! folders through the fetcher, normalize and store what comes back, and
//! finish with the guard released and exactly one terminal event, on every
//! path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attachments::{AttachmentStore, ObjectStore};
use crate::broker;
use crate::credentials::CredentialResolver;
use crate::db::models::{Account, Provider, SyncJob};
use crate::db::Database;
use crate::events::{
    EventPublisher, EVENT_EMAIL_INGESTED, EVENT_SYNC_COMPLETED, EVENT_SYNC_FAILED,
};
use crate::fetchers::{resolve_fetcher, FetchError, MailFetcher, RawAttachment};

pub mod guard;
pub mod normalize;

use guard::GuardError;
use normalize::{ingest_message, IngestOutcome};

pub const RUN_DEADLINE_SECS_ENV: &str = "ESYNC_RUN_DEADLINE_SECS";
const DEFAULT_RUN_DEADLINE_SECS: u64 = 900;

/// Queue every sync task is dispatched through; workers consume it without
/// having to discover per-job queue names.
pub const TASK_QUEUE: &str = "sync.tasks";

/// Cooperative cancellation shared between the orchestrator and whatever
/// drives it (signal handler, worker shutdown).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Broker payload for one dispatched sync job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncTask {
    pub job_id: i64,
    pub account_id: String,
    pub user_id: String,
    pub provider_id: String,
}

/// Immediate answer to a sync trigger. Another run holding the slot is a
/// no-op for the caller, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Dispatched(SyncJob),
    AlreadyRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub job_id: i64,
    pub account_id: String,
    pub folders_synced: usize,
    pub emails_stored: usize,
    pub emails_skipped: usize,
    pub attachments_stored: usize,
    pub errors: Vec<String>,
}

/// Builds a fetcher for an account. `refresh` forces a credential refresh
/// first; the orchestrator sets it when rebuilding after a connection
/// failure.
#[async_trait(?Send)]
pub trait FetcherFactory {
    async fn create(
        &self,
        db: &Database,
        account: &Account,
        provider: &Provider,
        refresh: bool,
    ) -> Result<Box<dyn MailFetcher>>;
}

/// Production factory: resolve (or refresh) the credential, then dispatch on
/// the provider kind.
pub struct CredentialFetcherFactory {
    resolver: CredentialResolver,
}

impl Default for CredentialFetcherFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialFetcherFactory {
    pub fn new() -> Self {
        Self {
            resolver: CredentialResolver::new(),
        }
    }
}

#[async_trait(?Send)]
impl FetcherFactory for CredentialFetcherFactory {
    async fn create(
        &self,
        db: &Database,
        account: &Account,
        provider: &Provider,
        refresh: bool,
    ) -> Result<Box<dyn MailFetcher>> {
        let secret = if refresh {
            self.resolver.refresh(db, account, provider).await?
        } else {
            self.resolver.resolve(db, account, provider).await?
        };
        Ok(resolve_fetcher(provider, account, secret)?)
    }
}

fn run_deadline() -> StdDuration {
    let seconds = std::env::var(RUN_DEADLINE_SECS_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_RUN_DEADLINE_SECS);
    StdDuration::from_secs(seconds)
}

fn parse_watermark(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

pub struct SyncEngine<S: ObjectStore> {
    publisher: EventPublisher,
    attachments: AttachmentStore<S>,
}

impl<S: ObjectStore> SyncEngine<S> {
    pub fn new(attachments: AttachmentStore<S>) -> Result<Self> {
        Ok(Self {
            publisher: EventPublisher::new()?,
            attachments,
        })
    }

    /// Acquire the single-flight slot and dispatch the job to the task
    /// queue. If the dispatch fails the job is released as failed so the
    /// account is not wedged.
    pub async fn start_sync(&self, db: &Database, account_id: &str) -> Result<StartOutcome> {
        let (account, provider) = load_account(db, account_id)?;

        let job = match guard::try_acquire(
            db,
            &account.account_id,
            &account.user_id,
            &provider.provider_id,
        ) {
            Ok(job) => job,
            Err(GuardError::AlreadyRunning { .. }) => {
                info!(account = account_id, "sync already in flight, nothing to do");
                return Ok(StartOutcome::AlreadyRunning);
            }
            Err(err) => return Err(err.into()),
        };

        let task = SyncTask {
            job_id: job.id,
            account_id: account.account_id.clone(),
            user_id: account.user_id.clone(),
            provider_id: provider.provider_id.clone(),
        };
        let payload = serde_json::to_value(&task).context("encode sync task")?;

        if let Err(publish_err) = broker::publish(db, TASK_QUEUE, &payload, Some(&job.queue_name))
        {
            guard::release(db, job.id)?;
            self.emit_failed(db, &task, &format!("dispatch failed: {publish_err}"))
                .await;
            return Err(anyhow!(publish_err).context("dispatch sync job"));
        }

        info!(job_id = job.id, account = account_id, "sync job dispatched");
        Ok(StartOutcome::Dispatched(job))
    }

    /// Acquire and run in the calling task, without going through the queue.
    /// Returns `None` when another run already holds the account's slot.
    pub async fn sync_now<F: FetcherFactory>(
        &self,
        db: &Database,
        factory: &F,
        account_id: &str,
        cancel: &CancelFlag,
    ) -> Result<Option<SyncReport>> {
        let (account, provider) = load_account(db, account_id)?;
        let job = match guard::try_acquire(
            db,
            &account.account_id,
            &account.user_id,
            &provider.provider_id,
        ) {
            Ok(job) => job,
            Err(GuardError::AlreadyRunning { .. }) => {
                info!(account = account_id, "sync already in flight, nothing to do");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let task = SyncTask {
            job_id: job.id,
            account_id: account.account_id.clone(),
            user_id: account.user_id.clone(),
            provider_id: provider.provider_id.clone(),
        };
        let report = self.run_job(db, factory, &task, cancel).await?;
        Ok(Some(report))
    }

    /// Execute a dispatched job to its terminal state: the guard is released
    /// and exactly one terminal event goes out, whether the pipeline
    /// succeeded, failed, or was cancelled.
    pub async fn run_job<F: FetcherFactory>(
        &self,
        db: &Database,
        factory: &F,
        task: &SyncTask,
        cancel: &CancelFlag,
    ) -> Result<SyncReport> {
        let result = match load_account(db, &task.account_id) {
            Ok((account, provider)) => {
                self.run_pipeline(db, factory, &account, &provider, task, cancel)
                    .await
            }
            Err(err) => Err(err),
        };

        // The terminal event must go out even when the release write fails;
        // stale-job reclamation unwedges the slot later.
        if let Err(release_err) = guard::release(db, task.job_id) {
            warn!(job_id = task.job_id, "failed to release sync job: {release_err}");
        }

        match result {
            Ok(report) => {
                let payload = serde_json::to_value(&report).context("encode sync report")?;
                self.publisher
                    .publish(db, &task.user_id, EVENT_SYNC_COMPLETED, &payload)
                    .await?;
                info!(
                    job_id = task.job_id,
                    stored = report.emails_stored,
                    skipped = report.emails_skipped,
                    "sync completed"
                );
                Ok(report)
            }
            Err(err) => {
                self.emit_failed(db, task, &format!("{err:#}")).await;
                Err(err)
            }
        }
    }

    async fn emit_failed(&self, db: &Database, task: &SyncTask, reason: &str) {
        let payload = serde_json::json!({
            "job_id": task.job_id,
            "account_id": task.account_id,
            "error": reason,
        });
        if let Err(publish_err) = self
            .publisher
            .publish(db, &task.user_id, EVENT_SYNC_FAILED, &payload)
            .await
        {
            warn!(job_id = task.job_id, "failed to emit terminal event: {publish_err}");
        }
    }

    async fn run_pipeline<F: FetcherFactory>(
        &self,
        db: &Database,
        factory: &F,
        account: &Account,
        provider: &Provider,
        task: &SyncTask,
        cancel: &CancelFlag,
    ) -> Result<SyncReport> {
        let deadline = Instant::now() + run_deadline();
        let mut report = SyncReport {
            job_id: task.job_id,
            account_id: account.account_id.clone(),
            ..SyncReport::default()
        };

        let mut fetcher = factory.create(db, account, provider, false).await?;
        let mut refreshed = false;

        let provider_folders = match fetcher.list_folders().await {
            Ok(folders) => folders,
            Err(FetchError::Connection(msg)) if !refreshed => {
                warn!(account = %account.account_id, "connection lost, refreshing credential: {msg}");
                refreshed = true;
                fetcher = factory.create(db, account, provider, true).await?;
                fetcher.list_folders().await?
            }
            Err(err) => return Err(err.into()),
        };

        // Only folders the operator associated AND the provider still
        // reports are synced; a folder deleted server-side drops out
        // silently.
        let associated = db.list_active_folders(&account.account_id)?;
        let folders: Vec<String> = associated
            .into_iter()
            .map(|folder| folder.name)
            .filter(|name| {
                provider_folders
                    .iter()
                    .any(|remote| remote.eq_ignore_ascii_case(name))
            })
            .collect();

        for folder in &folders {
            check_interrupt(cancel, deadline)?;

            let watermark = db
                .folder_watermark(&account.account_id, folder)?
                .as_deref()
                .and_then(parse_watermark);
            debug!(
                account = %account.account_id,
                folder, ?watermark, "syncing folder"
            );

            let messages = match fetcher.fetch_since(folder, watermark).await {
                Ok(messages) => messages,
                Err(FetchError::Connection(msg)) if !refreshed => {
                    warn!(account = %account.account_id, "connection lost, refreshing credential: {msg}");
                    refreshed = true;
                    fetcher = factory.create(db, account, provider, true).await?;
                    fetcher
                        .fetch_since(folder, watermark)
                        .await
                        .with_context(|| format!("fetch '{folder}' after credential refresh"))?
                }
                Err(err) => return Err(err.into()),
            };

            for raw in &messages {
                check_interrupt(cancel, deadline)?;

                match ingest_message(db, account, raw) {
                    Ok(IngestOutcome::Stored(email)) => {
                        report.emails_stored += 1;

                        if raw.has_attachments {
                            let bodies: Vec<RawAttachment> = match &raw.inline_attachments {
                                Some(inline) => inline.clone(),
                                None => match fetcher.fetch_attachments(raw).await {
                                    Ok(bodies) => bodies,
                                    Err(err) => {
                                        warn!(
                                            email = %email.id,
                                            "attachment fetch failed: {err}"
                                        );
                                        report
                                            .errors
                                            .push(format!("attachments for {}: {err}", email.id));
                                        vec![]
                                    }
                                },
                            };
                            for body in &bodies {
                                match self.attachments.ingest(db, &email.id, body).await {
                                    Ok(_) => report.attachments_stored += 1,
                                    Err(err) => {
                                        warn!(email = %email.id, "attachment store failed: {err}");
                                        report
                                            .errors
                                            .push(format!("attachment for {}: {err}", email.id));
                                    }
                                }
                            }
                        }

                        let payload = serde_json::json!({
                            "email_id": email.id,
                            "account_id": email.account_id,
                            "folder": email.folder,
                            "subject": email.subject,
                        });
                        self.publisher
                            .publish(db, &account.user_id, EVENT_EMAIL_INGESTED, &payload)
                            .await?;
                    }
                    Ok(IngestOutcome::Skipped(reason)) => {
                        debug!(?reason, folder, "message skipped");
                        report.emails_skipped += 1;
                    }
                    Err(err) => {
                        // One bad row should not abort the folder.
                        warn!(folder, "message ingest failed: {err}");
                        report.errors.push(format!("ingest in {folder}: {err}"));
                    }
                }
            }

            report.folders_synced += 1;
        }

        Ok(report)
    }
}

fn check_interrupt(cancel: &CancelFlag, deadline: Instant) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(anyhow!("sync cancelled"));
    }
    if Instant::now() >= deadline {
        return Err(anyhow!("sync run deadline exceeded"));
    }
    Ok(())
}

fn load_account(db: &Database, account_id: &str) -> Result<(Account, Provider)> {
    let account = db
        .get_account(account_id)?
        .with_context(|| format!("unknown account '{account_id}'"))?;
    if !account.enabled {
        return Err(anyhow!("account '{account_id}' is disabled"));
    }
    let provider = db
        .get_provider(&account.provider_id)?
        .with_context(|| format!("unknown provider '{}'", account.provider_id))?;
    Ok((account, provider))
}
