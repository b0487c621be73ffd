use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderKindArg {
    Imap,
    Gmail,
    Outlook,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AuthArg {
    Password,
    Oauth,
}

#[derive(Debug, Parser)]
#[command(name = "esync", version, about = "Email Synchronization Engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage provider definitions
    Providers {
        #[command(subcommand)]
        command: ProviderCommands,
    },
    /// Manage mail accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Manage folder associations per account
    Folders {
        #[command(subcommand)]
        command: FolderCommands,
    },
    /// Manage webhook subscriptions
    Webhooks {
        #[command(subcommand)]
        command: WebhookCommands,
    },
    /// Inspect and act on synced emails
    Emails {
        #[command(subcommand)]
        command: EmailCommands,
    },
    /// Start a sync for one account
    Sync(SyncArgs),
    /// Run a standing worker consuming dispatched sync jobs
    Worker,
    /// List recent sync jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List recent webhook deliveries
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show database stats
    Stats,
}

#[derive(Debug, Subcommand)]
enum ProviderCommands {
    /// Register or update a provider
    Add(ProviderAddArgs),
    /// List registered providers
    List,
}

#[derive(Debug, Args)]
struct ProviderAddArgs {
    provider_id: String,
    #[arg(value_enum)]
    kind: ProviderKindArg,
    #[arg(long)]
    imap_host: Option<String>,
    #[arg(long)]
    imap_port: Option<u16>,
    #[arg(long)]
    smtp_host: Option<String>,
    #[arg(long)]
    smtp_port: Option<u16>,
    #[arg(long)]
    encryption: Option<String>,
    #[arg(long)]
    token_url: Option<String>,
    /// Comma-separated OAuth scopes
    #[arg(long)]
    scopes: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// Register a mail account
    Add(AccountAddArgs),
    /// List registered accounts
    List,
    /// Remove an account
    Remove { account_id: String },
}

#[derive(Debug, Args)]
struct AccountAddArgs {
    address: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    provider: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long, value_enum, default_value = "password")]
    auth: AuthArg,
    /// Password for password-auth accounts (or ESYNC_ACCOUNT_PASSWORD)
    #[arg(long, env = "ESYNC_ACCOUNT_PASSWORD")]
    password: Option<String>,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long, env = "ESYNC_CLIENT_SECRET")]
    client_secret: Option<String>,
    #[arg(long, env = "ESYNC_REFRESH_TOKEN")]
    refresh_token: Option<String>,
}

#[derive(Debug, Subcommand)]
enum FolderCommands {
    /// Associate a folder with an account for syncing
    Add { account_id: String, name: String },
    /// List an account's associated folders
    List { account_id: String },
    /// Remove a folder association
    Remove { account_id: String, name: String },
}

#[derive(Debug, Subcommand)]
enum WebhookCommands {
    /// Register a webhook endpoint for a user
    Add {
        #[arg(long)]
        user: String,
        url: String,
        #[arg(long, env = "ESYNC_WEBHOOK_SECRET")]
        secret: String,
    },
    /// List a user's webhooks
    List {
        #[arg(long)]
        user: String,
    },
    /// Remove a webhook
    Remove { id: String },
}

#[derive(Debug, Subcommand)]
enum EmailCommands {
    /// List an account's most recent emails
    List {
        account_id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one email by id
    Show { id: String },
    /// Move an email to another folder, on the provider and locally
    Move { id: String, folder: String },
    /// Delete an email on the provider and locally
    Delete { id: String },
    /// Set the local read flag
    Mark {
        id: String,
        #[arg(long, default_value_t = false)]
        unread: bool,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    account: String,
    /// Run the sync inline instead of dispatching to a worker
    #[arg(long, default_value_t = false)]
    now: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{anyhow, bail, Context, Result};
    use tracing::{error, info};

    use esync::attachments::{AttachmentStore, FsObjectStore};
    use esync::broker::{self, Verdict};
    use esync::credentials::{seal_credential, StoredCredential};
    use esync::db::models::{Account, AuthKind, Email, Folder, Provider, ProviderKind, Webhook};
    use esync::db::{now_utc, Database};
    use esync::fetchers::MailFetcher;
    use esync::sync::{
        CancelFlag, CredentialFetcherFactory, FetcherFactory, StartOutcome, SyncEngine, SyncTask,
        TASK_QUEUE,
    };

    use super::{
        AccountCommands, AuthArg, Cli, Commands, EmailCommands, FolderCommands, ProviderCommands,
        ProviderKindArg, WebhookCommands,
    };

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Providers { command } => handle_providers(command, cli.json),
            Commands::Accounts { command } => handle_accounts(command, cli.json),
            Commands::Folders { command } => handle_folders(command, cli.json),
            Commands::Webhooks { command } => handle_webhooks(command, cli.json),
            Commands::Emails { command } => handle_emails(command, cli.json).await,
            Commands::Sync(args) => handle_sync(args, cli.json).await,
            Commands::Worker => handle_worker().await,
            Commands::Jobs { limit } => handle_jobs(limit, cli.json),
            Commands::Events { limit } => handle_events(limit, cli.json),
            Commands::Stats => handle_stats(cli.json),
        }
    }

    fn open_db() -> Result<Database> {
        let db_path =
            Database::default_db_path().context("resolve default esync database path")?;
        Database::open(&db_path)
            .with_context(|| format!("open esync database at {}", db_path.display()))
    }

    fn engine() -> Result<SyncEngine<FsObjectStore>> {
        let root = FsObjectStore::default_root()
            .map_err(|e| anyhow!("resolve attachment store root: {e}"))?;
        SyncEngine::new(AttachmentStore::new(FsObjectStore::new(root)))
    }

    fn handle_providers(command: ProviderCommands, json: bool) -> Result<()> {
        let db = open_db()?;
        match command {
            ProviderCommands::Add(args) => {
                let provider = Provider {
                    provider_id: args.provider_id.clone(),
                    kind: match args.kind {
                        ProviderKindArg::Imap => ProviderKind::Imap,
                        ProviderKindArg::Gmail => ProviderKind::Gmail,
                        ProviderKindArg::Outlook => ProviderKind::Outlook,
                    },
                    imap_host: args.imap_host,
                    imap_port: args.imap_port,
                    smtp_host: args.smtp_host,
                    smtp_port: args.smtp_port,
                    encryption: args.encryption,
                    token_url: args.token_url,
                    scopes: args
                        .scopes
                        .map(|raw| {
                            raw.split(',')
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                };
                db.insert_provider(&provider)?;
                println!("Provider '{}' saved", args.provider_id);
                Ok(())
            }
            ProviderCommands::List => {
                let providers = db.list_providers()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&providers)?);
                } else {
                    for provider in providers {
                        println!("{}  {}", provider.provider_id, provider.kind);
                    }
                }
                Ok(())
            }
        }
    }

    fn handle_accounts(command: AccountCommands, json: bool) -> Result<()> {
        let db = open_db()?;
        match command {
            AccountCommands::Add(args) => {
                db.get_provider(&args.provider)?
                    .ok_or_else(|| anyhow!("unknown provider '{}'", args.provider))?;

                let auth = match args.auth {
                    AuthArg::Password => AuthKind::Password,
                    AuthArg::Oauth => AuthKind::OAuth,
                };
                match auth {
                    AuthKind::Password if args.password.is_none() => {
                        bail!("password auth requires --password")
                    }
                    AuthKind::OAuth if args.refresh_token.is_none() => {
                        bail!("oauth auth requires --refresh-token")
                    }
                    _ => {}
                }

                let credential = StoredCredential {
                    kind: auth,
                    password: args.password,
                    client_id: args.client_id,
                    client_secret: args.client_secret,
                    access_token: None,
                    refresh_token: args.refresh_token,
                    expires_at: None,
                };
                let sealed = seal_credential(&credential)
                    .map_err(|e| anyhow!("seal account credential: {e}"))?;

                let account = Account {
                    account_id: uuid::Uuid::new_v4().to_string(),
                    user_id: args.user,
                    provider_id: args.provider,
                    address: args.address,
                    display_name: args.display_name,
                    auth,
                    credential: Some(sealed),
                    enabled: true,
                    created_at: now_utc(),
                };
                db.insert_account(&account)?;
                println!("Account '{}' registered as {}", account.address, account.account_id);
                Ok(())
            }
            AccountCommands::List => {
                let accounts = db.list_accounts()?;
                if json {
                    // The sealed credential stays out of listings.
                    let redacted: Vec<_> = accounts
                        .into_iter()
                        .map(|mut account| {
                            account.credential = None;
                            account
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&redacted)?);
                } else {
                    for account in accounts {
                        println!(
                            "{}  {}  provider={}  auth={}",
                            account.account_id, account.address, account.provider_id, account.auth
                        );
                    }
                }
                Ok(())
            }
            AccountCommands::Remove { account_id } => {
                let removed = db.remove_account(&account_id)?;
                if removed == 0 {
                    bail!("no account with id '{account_id}'");
                }
                println!("Account '{account_id}' removed");
                Ok(())
            }
        }
    }

    fn handle_folders(command: FolderCommands, json: bool) -> Result<()> {
        let db = open_db()?;
        match command {
            FolderCommands::Add { account_id, name } => {
                db.get_account(&account_id)?
                    .ok_or_else(|| anyhow!("unknown account '{account_id}'"))?;
                db.upsert_folder(&Folder {
                    account_id: account_id.clone(),
                    name: name.clone(),
                    active: true,
                })?;
                println!("Folder '{name}' associated with account '{account_id}'");
                Ok(())
            }
            FolderCommands::List { account_id } => {
                let folders = db.list_active_folders(&account_id)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&folders)?);
                } else {
                    for folder in folders {
                        println!("{}", folder.name);
                    }
                }
                Ok(())
            }
            FolderCommands::Remove { account_id, name } => {
                let removed = db.remove_folder(&account_id, &name)?;
                if removed == 0 {
                    bail!("no folder '{name}' on account '{account_id}'");
                }
                println!("Folder '{name}' removed from account '{account_id}'");
                Ok(())
            }
        }
    }

    fn handle_webhooks(command: WebhookCommands, json: bool) -> Result<()> {
        let db = open_db()?;
        match command {
            WebhookCommands::Add { user, url, secret } => {
                let webhook = Webhook {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: user,
                    url,
                    secret,
                    active: true,
                };
                db.insert_webhook(&webhook)?;
                println!("Webhook '{}' registered", webhook.id);
                Ok(())
            }
            WebhookCommands::List { user } => {
                let webhooks = db.list_active_webhooks(&user)?;
                if json {
                    let redacted: Vec<_> = webhooks
                        .into_iter()
                        .map(|mut webhook| {
                            webhook.secret = "***".to_string();
                            webhook
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&redacted)?);
                } else {
                    for webhook in webhooks {
                        println!("{}  {}", webhook.id, webhook.url);
                    }
                }
                Ok(())
            }
            WebhookCommands::Remove { id } => {
                let removed = db.remove_webhook(&id)?;
                if removed == 0 {
                    bail!("no webhook with id '{id}'");
                }
                println!("Webhook '{id}' removed");
                Ok(())
            }
        }
    }

    async fn handle_emails(command: EmailCommands, json: bool) -> Result<()> {
        let db = open_db()?;
        match command {
            EmailCommands::List { account_id, limit } => {
                let emails = db.list_emails(&account_id, limit)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&emails)?);
                } else {
                    for email in emails {
                        let flag = if email.is_read { " " } else { "*" };
                        println!(
                            "{flag} {}  {}  {}  {}",
                            email.id, email.received_at, email.sender, email.subject
                        );
                    }
                }
                Ok(())
            }
            EmailCommands::Show { id } => {
                let email = require_email(&db, &id)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&email)?);
                } else {
                    println!("Subject:  {}", email.subject);
                    println!("From:     {}", email.sender);
                    println!("To:       {}", email.recipients.join(", "));
                    if !email.cc.is_empty() {
                        println!("Cc:       {}", email.cc.join(", "));
                    }
                    println!("Folder:   {}", email.folder);
                    println!("Received: {}", email.received_at);
                    let attachments = db.list_attachments(&email.id)?;
                    for attachment in &attachments {
                        println!(
                            "Attachment: {} ({}, {} bytes)",
                            attachment.filename, attachment.mime_type, attachment.size_bytes
                        );
                    }
                    println!();
                    println!("{}", email.body);
                }
                Ok(())
            }
            EmailCommands::Move { id, folder } => {
                let email = require_email(&db, &id)?;
                let mut fetcher = fetcher_for(&db, &email.account_id).await?;
                let provider = fetcher.provider_name().to_string();
                fetcher
                    .move_message(&email.provider_message_id, &email.folder, &folder)
                    .await
                    .with_context(|| format!("move message on {provider}"))?;
                db.update_email_folder(&email.id, &folder)?;
                println!("Email '{id}' moved to '{folder}'");
                Ok(())
            }
            EmailCommands::Delete { id } => {
                let email = require_email(&db, &id)?;
                let mut fetcher = fetcher_for(&db, &email.account_id).await?;
                let provider = fetcher.provider_name().to_string();
                fetcher
                    .delete_message(&email.provider_message_id, &email.folder)
                    .await
                    .with_context(|| format!("delete message on {provider}"))?;
                db.remove_email(&email.id)?;
                println!("Email '{id}' deleted");
                Ok(())
            }
            EmailCommands::Mark { id, unread } => {
                let email = require_email(&db, &id)?;
                db.mark_email_read(&email.id, !unread)?;
                println!(
                    "Email '{id}' marked {}",
                    if unread { "unread" } else { "read" }
                );
                Ok(())
            }
        }
    }

    fn require_email(db: &Database, id: &str) -> Result<Email> {
        db.get_email(id)?
            .ok_or_else(|| anyhow!("no email with id '{id}'"))
    }

    async fn fetcher_for(db: &Database, account_id: &str) -> Result<Box<dyn MailFetcher>> {
        let account = db
            .get_account(account_id)?
            .ok_or_else(|| anyhow!("unknown account '{account_id}'"))?;
        let provider = db
            .get_provider(&account.provider_id)?
            .ok_or_else(|| anyhow!("unknown provider '{}'", account.provider_id))?;
        let factory = CredentialFetcherFactory::new();
        factory.create(db, &account, &provider, false).await
    }

    async fn handle_sync(args: super::SyncArgs, json: bool) -> Result<()> {
        let db = open_db()?;
        let engine = engine()?;

        if args.now {
            let factory = CredentialFetcherFactory::new();
            let cancel = CancelFlag::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    watcher.cancel();
                }
            });

            let Some(report) = engine
                .sync_now(&db, &factory, &args.account, &cancel)
                .await?
            else {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({"accepted": false, "reason": "a sync is already running"})
                    );
                } else {
                    println!(
                        "A sync is already running for account '{}'; nothing to do",
                        args.account
                    );
                }
                return Ok(());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Sync complete for account {}", report.account_id);
                println!("Folders synced: {}", report.folders_synced);
                println!("Emails stored: {}", report.emails_stored);
                println!("Emails skipped: {}", report.emails_skipped);
                println!("Attachments stored: {}", report.attachments_stored);
                if !report.errors.is_empty() {
                    println!("Errors: {}", report.errors.len());
                    for error in &report.errors {
                        println!("- {error}");
                    }
                }
            }
        } else {
            match engine.start_sync(&db, &args.account).await? {
                StartOutcome::Dispatched(job) => {
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({
                                "accepted": true,
                                "job_id": job.id,
                                "queue_name": job.queue_name,
                            })
                        );
                    } else {
                        println!(
                            "Sync job {} dispatched on queue '{}'",
                            job.id, job.queue_name
                        );
                    }
                }
                StartOutcome::AlreadyRunning => {
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({"accepted": false, "reason": "a sync is already running"})
                        );
                    } else {
                        println!(
                            "A sync is already running for account '{}'; nothing to do",
                            args.account
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_worker() -> Result<()> {
        let db = open_db()?;
        let engine = engine()?;
        let factory = CredentialFetcherFactory::new();

        let cancel = CancelFlag::new();
        let watcher = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                watcher.cancel();
            }
        });

        println!("Worker consuming '{TASK_QUEUE}' (ctrl-c to stop)");
        let db_ref = &db;
        let engine_ref = &engine;
        let factory_ref = &factory;
        let cancel_ref = &cancel;
        broker::run_consumer(&db, TASK_QUEUE, &cancel, move |message| {
            let db = db_ref;
            let engine = engine_ref;
            let factory = factory_ref;
            let cancel = cancel_ref;
            async move {
                let task: SyncTask = match serde_json::from_value(message.payload.clone()) {
                    Ok(task) => task,
                    Err(err) => {
                        // Undecodable payloads can never succeed; settle them.
                        error!(message_id = %message.id, "dropping malformed task: {err}");
                        return Verdict::Ack;
                    }
                };

                match engine.run_job(db, factory, &task, cancel).await {
                    Ok(_) => Verdict::Ack,
                    Err(err) => {
                        error!(job_id = task.job_id, "sync job failed: {err:#}");
                        // A job that reached its terminal state (released)
                        // must not run again; only retry if it never got
                        // there.
                        let terminal = db
                            .get_sync_job(task.job_id)
                            .ok()
                            .flatten()
                            .map(|job| job.is_executed)
                            .unwrap_or(true);
                        if terminal {
                            Verdict::Ack
                        } else {
                            Verdict::Requeue
                        }
                    }
                }
            }
        })
        .await?;

        Ok(())
    }

    fn handle_jobs(limit: usize, json: bool) -> Result<()> {
        let db = open_db()?;
        let jobs = db.list_sync_jobs(limit)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        } else {
            for job in jobs {
                let state = if job.is_executed { "done" } else { "running" };
                println!(
                    "#{}  {}  account={}  created={}  {}",
                    job.id, state, job.account_id, job.created_at, job.queue_name
                );
            }
        }
        Ok(())
    }

    fn handle_events(limit: usize, json: bool) -> Result<()> {
        let db = open_db()?;
        let events = db.list_recent_events(limit)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&events)?);
        } else {
            for event in events {
                println!(
                    "{}  {}  {}  webhook={}",
                    event.created_at, event.event_type, event.status, event.webhook_id
                );
            }
        }
        Ok(())
    }

    fn handle_stats(json: bool) -> Result<()> {
        let db = open_db()?;
        let stats = db.get_stats()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("Database: {}", db.path().display());
            println!("Accounts: {}", stats.total_accounts);
            println!("Emails: {}", stats.total_emails);
            println!("Attachments: {}", stats.total_attachments);
            println!("Events: {}", stats.total_events);
            println!("Pending jobs: {}", stats.pending_jobs);
        }
        Ok(())
    }
}
