//! dcim-sync CLI - reconcile monitoring inventory into the DCIM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dcim_sync::fingerprint::{FingerprintStore, LastSeenStore, MemoryStore, NullStore, RedisStore};
use dcim_sync::source::zabbix::Zabbix;
use dcim_sync::target::netbox::NetBox;
use dcim_sync::{ExitStatus, SyncConfig, SyncEngine, SyncReport};
use notify::{Notifier, NotifyChannel, NotifyEvent, SyncSummary, TelegramChannel};

/// Reconcile monitoring inventory into the DCIM system of record.
#[derive(Parser)]
#[command(name = "dcim-sync", version)]
#[command(about = "Sync hypervisor inventory from Zabbix into NetBox")]
struct Cli {
    /// YAML configuration file. Built-in defaults apply when omitted.
    #[arg(short, long, env = "DCIM_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Zabbix base URL (or set `ZABBIX_URL` env var).
    #[arg(long, env = "ZABBIX_URL")]
    zabbix_url: Option<String>,

    #[arg(long, env = "ZABBIX_USER")]
    zabbix_user: Option<String>,

    #[arg(long, env = "ZABBIX_PASSWORD", hide_env_values = true)]
    zabbix_password: Option<String>,

    /// NetBox base URL (or set `NETBOX_URL` env var).
    #[arg(long, env = "NETBOX_URL")]
    netbox_url: Option<String>,

    #[arg(long, env = "NETBOX_TOKEN", hide_env_values = true)]
    netbox_token: Option<String>,

    /// Verify the NetBox TLS certificate.
    #[arg(long, env = "VERIFY_SSL", default_value_t = true, action = ArgAction::Set)]
    verify_tls: bool,

    /// Redis holding fingerprints and last-seen clocks.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    redis_url: String,

    /// Ignore cached fingerprints and treat every host as new.
    #[arg(long)]
    no_cache: bool,

    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_bot_token: Option<String>,

    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    telegram_chat_id: Option<String>,

    /// Do not send the run digest.
    #[arg(long)]
    no_notify: bool,

    /// Compute everything, write nothing.
    #[arg(long)]
    dry_run: bool,

    /// Process at most this many hosts.
    #[arg(long)]
    limit: Option<usize>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let status = match run(cli).await {
        Ok(status) => status,
        Err(e) => {
            error!(error = format!("{e:#}"), "dcim-sync failed");
            ExitStatus::FailedToStart
        }
    };
    ExitCode::from(u8::try_from(status.code()).unwrap_or(1))
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    config.dry_run |= cli.dry_run;
    if cli.limit.is_some() {
        config.limit = cli.limit;
    }

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(problem = %problem, "Invalid configuration");
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }
    if cli.validate_only {
        info!("Configuration is valid");
        return Ok(ExitStatus::Clean);
    }

    let notifier = build_notifier(&cli);

    let source = Zabbix::new(
        required(cli.zabbix_url.as_deref(), "ZABBIX_URL")?,
        required(cli.zabbix_user.as_deref(), "ZABBIX_USER")?,
        required(cli.zabbix_password.as_deref(), "ZABBIX_PASSWORD")?,
    )
    .context("Failed to create Zabbix client")?;
    let target = NetBox::new(
        required(cli.netbox_url.as_deref(), "NETBOX_URL")?,
        required(cli.netbox_token.as_deref(), "NETBOX_TOKEN")?,
        cli.verify_tls,
    )
    .context("Failed to create NetBox client")?;

    let (fingerprints, clock) = open_stores(&cli.redis_url, &config.cache.key_prefix, cli.no_cache).await;

    let engine = SyncEngine::new(config, Arc::new(source), Arc::new(target), fingerprints, clock);

    if let Err(e) = engine.check().await {
        error!(error = %e, "Remote systems unreachable");
        notify_failure(&notifier, &e.to_string()).await;
        return Ok(ExitStatus::FailedToStart);
    }

    let outcome = tokio::select! {
        outcome = engine.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, records not yet committed will be retried next run");
            return Ok(ExitStatus::Interrupted);
        }
    };

    match outcome {
        Ok(report) => {
            for failure in &report.errors {
                warn!(name = %failure.name, category = failure.category, reason = %failure.reason, "Record failed");
            }
            notifier
                .notify_and_wait(NotifyEvent::SyncCompleted {
                    summary: summarize(&report),
                    timestamp: chrono::Utc::now(),
                })
                .await;
            Ok(report.exit_status())
        }
        Err(e) => {
            error!(error = %e, category = e.category(), "Sync aborted");
            notify_failure(&notifier, &e.to_string()).await;
            Ok(ExitStatus::FailedToStart)
        }
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{name} is required"))
}

fn build_notifier(cli: &Cli) -> Notifier {
    if cli.no_notify {
        return Notifier::disabled();
    }
    match (&cli.telegram_bot_token, &cli.telegram_chat_id) {
        (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
            let telegram: Arc<dyn NotifyChannel> = Arc::new(TelegramChannel::new(token.clone(), chat.clone()));
            Notifier::with_channels(vec![telegram])
        }
        _ => {
            info!("Telegram not configured, digest will not be sent");
            Notifier::disabled()
        }
    }
}

/// Redis for both stores; an in-process store when Redis is unreachable.
async fn open_stores(
    url: &str,
    prefix: &str,
    no_cache: bool,
) -> (Arc<dyn FingerprintStore>, Arc<dyn LastSeenStore>) {
    let (fingerprints, clock): (Arc<dyn FingerprintStore>, Arc<dyn LastSeenStore>) =
        match RedisStore::connect(url, prefix).await {
            Ok(store) => {
                let store = Arc::new(store);
                (store.clone(), store)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, every host will be treated as new");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store)
            }
        };
    if no_cache {
        info!("Fingerprint cache bypassed");
        return (Arc::new(NullStore), clock);
    }
    (fingerprints, clock)
}

async fn notify_failure(notifier: &Notifier, error: &str) {
    notifier
        .notify_and_wait(NotifyEvent::SyncFailed {
            error: error.to_string(),
            timestamp: chrono::Utc::now(),
        })
        .await;
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn summarize(report: &SyncReport) -> SyncSummary {
    let duration_secs = report.duration_secs.round() as u64;
    let names = |changes: &[dcim_sync::engine::DeviceChanges]| {
        changes.iter().map(|c| c.name.clone()).collect::<Vec<_>>()
    };
    SyncSummary {
        dry_run: report.dry_run,
        total: report.total,
        created: report.created.clone(),
        updated: names(&report.updated),
        recovered: names(&report.recovered),
        renamed: report
            .renamed
            .iter()
            .map(|r| format!("{} → {}", r.from, r.to))
            .collect(),
        unchanged: report.unchanged,
        skipped: report.skipped.len(),
        errors: report
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.name, e.reason))
            .collect(),
        conflicts: report
            .conflicts
            .iter()
            .map(|c| format!("{} → {} U{} (held by {})", c.device, c.rack, c.position, c.occupant))
            .collect(),
        unmapped_models: report.unmapped_models.clone(),
        decommissioned: report.decommissioned.clone(),
        deleted: report.deleted.clone(),
        duration_secs,
    }
}
