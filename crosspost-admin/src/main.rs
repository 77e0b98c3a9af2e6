//! crosspost-admin - Administration tool for crosspost
//!
//! Issues API keys, manages triggers and templates, inspects delivery jobs
//! and runs maintenance by hand.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use libcrosspost::logging::LoggingConfig;
use libcrosspost::service::CrosspostService;
use libcrosspost::triggers::NewTrigger;
use libcrosspost::types::{ApiKeyRecord, ExternalTriggerRecord, JobRecord};
use libcrosspost::{CrosspostError, JobStatus};

#[derive(Parser)]
#[command(name = "crosspost-admin")]
#[command(version)]
#[command(about = "Manage crosspost API keys, triggers, templates and jobs")]
#[command(long_about = r#"Manage crosspost API keys, triggers, templates and jobs.

EXAMPLES:
    # Issue a key (the token is printed once)
    crosspost-admin keys generate alice

    # Post to telegram whenever a twitch channel goes live
    crosspost-admin templates set alice live --title "Live!" \
        --body "{{account}} is streaming {{title}}"
    crosspost-admin triggers add alice --account-type twitch --account-id 12826 \
        --template live --target telegram --frequency 6

    # Faulted jobs as JSON
    crosspost-admin --format json jobs list --status faulted

    # Collect finished bundles and prune a week of webhook history
    crosspost-admin gc --retention 7d

EXIT CODES:
    0 - Success
    1 - Runtime error
    2 - Configuration error
    3 - Invalid input or not found
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage API keys
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Manage external triggers
    #[command(subcommand)]
    Triggers(TriggersCommand),

    /// Manage post templates used by triggers
    #[command(subcommand)]
    Templates(TemplatesCommand),

    /// Inspect delivery jobs
    #[command(subcommand)]
    Jobs(JobsCommand),

    /// Collect finished content bundles and prune old records
    Gc {
        /// How long to remember webhook message ids (e.g. "24h", "7d")
        #[arg(long, value_parser = humantime::parse_duration)]
        retention: Option<std::time::Duration>,
    },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Generate a new API key for a user
    Generate {
        user: String,
    },

    /// List API keys (tokens are never shown)
    List {
        /// Only keys belonging to this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Delete an API key
    Delete {
        user: String,
        key_id: String,
    },
}

#[derive(Subcommand)]
enum TriggersCommand {
    /// Register a trigger for a user
    Add {
        user: String,

        /// External account type (e.g. twitch)
        #[arg(long)]
        account_type: String,

        /// External account id
        #[arg(long)]
        account_id: String,

        /// Template rendered into the post
        #[arg(long)]
        template: String,

        /// Platform the post goes to
        #[arg(long)]
        target: String,

        /// Minimum hours between two posts from this trigger
        #[arg(long, default_value_t = 0)]
        frequency: u32,
    },

    /// List a user's triggers
    List {
        user: String,
    },

    /// Remove a trigger
    Remove {
        user: String,
        trigger_id: String,
    },
}

#[derive(Subcommand)]
enum TemplatesCommand {
    /// Create or replace a template
    Set {
        user: String,
        template_id: String,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long)]
        body: String,
    },

    /// Print a template
    Show {
        user: String,
        template_id: String,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List recent jobs
    List {
        #[arg(long)]
        user: Option<String>,

        /// queued, posting, posted, faulted or some_faults
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one job
    Show {
        job_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<CrosspostError>()
            .map(CrosspostError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let service = CrosspostService::new().await?;
    let format = cli.format;

    match cli.command {
        Commands::Keys(command) => keys(&service, command, format).await,
        Commands::Triggers(command) => triggers(&service, command, format).await,
        Commands::Templates(command) => templates(&service, command, format).await,
        Commands::Jobs(command) => jobs(&service, command, format).await,
        Commands::Gc { retention } => gc(&service, retention, format).await,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

async fn keys(
    service: &CrosspostService,
    command: KeysCommand,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let db = service.database();
    match command {
        KeysCommand::Generate { user } => {
            let key = libcrosspost::auth::generate_api_key(db, &user).await?;
            match format {
                OutputFormat::Json => print_json(&key)?,
                OutputFormat::Text => {
                    println!("user:   {}", key.user_id);
                    println!("key id: {}", key.key_id);
                    println!("token:  {}", key.token);
                    eprintln!("Store the token now; it cannot be shown again.");
                }
            }
        }
        KeysCommand::List { user } => {
            let keys = db.list_api_keys(user.as_deref()).await?;
            match format {
                OutputFormat::Json => print_json(&keys)?,
                OutputFormat::Text => print_keys(&keys),
            }
        }
        KeysCommand::Delete { user, key_id } => {
            if !db.delete_api_key(&user, &key_id).await? {
                return Err(CrosspostError::NotFound(format!(
                    "api key '{}' for user '{}'",
                    key_id, user
                ))
                .into());
            }
            report_done(format, "deleted", &key_id)?;
        }
    }
    Ok(())
}

fn print_keys(keys: &[ApiKeyRecord]) {
    if keys.is_empty() {
        println!("No API keys.");
        return;
    }
    for key in keys {
        println!(
            "{}  {}  created {}",
            key.user_id,
            key.key_id,
            format_timestamp(key.created_at)
        );
    }
}

async fn triggers(
    service: &CrosspostService,
    command: TriggersCommand,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let registry = service.trigger_registry();
    match command {
        TriggersCommand::Add {
            user,
            account_type,
            account_id,
            template,
            target,
            frequency,
        } => {
            let record = registry
                .register(NewTrigger {
                    user_id: user,
                    external_account_type: account_type,
                    external_account_id: account_id,
                    post_template_id: template,
                    target_platform_id: target,
                    notify_frequency_hours: frequency,
                })
                .await?;
            match format {
                OutputFormat::Json => print_json(&record)?,
                OutputFormat::Text => println!("{}", record.trigger_id),
            }
        }
        TriggersCommand::List { user } => {
            let records = registry.list(&user).await?;
            match format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Text => print_triggers(&records),
            }
        }
        TriggersCommand::Remove { user, trigger_id } => {
            if !registry.remove(&user, &trigger_id).await? {
                return Err(CrosspostError::NotFound(format!(
                    "trigger '{}' for user '{}'",
                    trigger_id, user
                ))
                .into());
            }
            report_done(format, "removed", &trigger_id)?;
        }
    }
    Ok(())
}

fn print_triggers(records: &[ExternalTriggerRecord]) {
    if records.is_empty() {
        println!("No triggers.");
        return;
    }
    for t in records {
        let last = t
            .last_notified_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {}:{} -> {} via '{}' every {}h (last {})",
            t.trigger_id,
            t.external_account_type,
            t.external_account_id,
            t.target_platform_id,
            t.post_template_id,
            t.notify_frequency_hours,
            last
        );
    }
}

async fn templates(
    service: &CrosspostService,
    command: TemplatesCommand,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let registry = service.trigger_registry();
    match command {
        TemplatesCommand::Set {
            user,
            template_id,
            title,
            body,
        } => {
            registry.set_template(&user, &template_id, &title, &body).await?;
            report_done(format, "saved", &template_id)?;
        }
        TemplatesCommand::Show { user, template_id } => {
            let template = registry
                .template(&user, &template_id)
                .await?
                .ok_or_else(|| {
                    CrosspostError::NotFound(format!(
                        "template '{}' for user '{}'",
                        template_id, user
                    ))
                })?;
            match format {
                OutputFormat::Json => print_json(&template)?,
                OutputFormat::Text => {
                    println!("title: {}", template.title);
                    println!("body:  {}", template.body);
                }
            }
        }
    }
    Ok(())
}

async fn jobs(
    service: &CrosspostService,
    command: JobsCommand,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let db = service.database();
    match command {
        JobsCommand::List {
            user,
            status,
            limit,
        } => {
            let records = db.list_jobs(user.as_deref(), status, limit).await?;
            match format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Text => {
                    if records.is_empty() {
                        println!("No jobs.");
                    }
                    for job in &records {
                        print_job_line(job);
                    }
                }
            }
        }
        JobsCommand::Show { job_id } => {
            let job = db
                .get_job(&job_id)
                .await?
                .ok_or_else(|| CrosspostError::NotFound(format!("job '{}'", job_id)))?;
            match format {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Text => print_job_detail(&job),
            }
        }
    }
    Ok(())
}

fn print_job_line(job: &JobRecord) {
    println!(
        "{}  {:<11} {:<12} user={} attempts={} {}",
        job.job_id,
        job.status.as_str(),
        job.target_platform_id,
        job.user_id,
        job.attempts,
        format_timestamp(job.created_at)
    );
}

fn print_job_detail(job: &JobRecord) {
    println!("job:       {}", job.job_id);
    println!("root post: {}", job.root_post_id);
    println!("user:      {}", job.user_id);
    println!("target:    {}", job.target_platform_id);
    println!("status:    {}", job.status);
    println!("attempts:  {}", job.attempts);
    if let Some(post_at) = job.post_at {
        println!("post at:   {}", format_timestamp(post_at));
    }
    if let Some(id) = &job.platform_post_id {
        println!("posted as: {}", id);
    }
    if let Some(error) = &job.last_error {
        println!("error:     {}", error);
    }
    for part in &job.failed_parts {
        println!("  failed {}: {}", part.part, part.error);
    }
    println!("created:   {}", format_timestamp(job.created_at));
    println!("updated:   {}", format_timestamp(job.updated_at));
}

async fn gc(
    service: &CrosspostService,
    retention: Option<std::time::Duration>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let report = match retention {
        Some(retention) => service.maintain_with_retention(retention).await?,
        None => service.maintain().await?,
    };

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "collected": report.bundles.collected,
            "locked": report.bundles.locked,
            "ledgerRows": report.ledger_rows,
            "rateWindows": report.rate_windows,
        }))?,
        OutputFormat::Text => {
            println!(
                "collected {} bundle(s), {} still locked",
                report.bundles.collected, report.bundles.locked
            );
            println!(
                "pruned {} webhook record(s) and {} rate window(s)",
                report.ledger_rows, report.rate_windows
            );
        }
    }
    Ok(())
}

fn report_done(format: OutputFormat, action: &str, id: &str) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "action": action, "id": id })),
        OutputFormat::Text => {
            println!("{} {}", action, id);
            Ok(())
        }
    }
}
