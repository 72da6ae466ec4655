use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bur_offsite_core::config;
use bur_offsite_core::context::RunContext;
use bur_offsite_core::crypto::CryptoCodec;
use bur_offsite_core::download::DownloadEngine;
use bur_offsite_core::error::BurError;
use bur_offsite_core::remote::{SharedStore, SshRsyncStore};
use bur_offsite_core::retention::RetentionEngine;
use bur_offsite_core::upload::UploadEngine;

/// Encrypted, verifiable, resumable backup transfer between on-site staging and an
/// off-site SSH archive.
#[derive(Parser)]
#[command(name = "bur-offsite")]
#[command(version, about = "Upload, download, or retain off-site backups", long_about = None)]
struct Cli {
    /// 1=upload, 2=download, 3=retention
    #[arg(long, default_value_t = 1)]
    script_option: u8,

    /// Restrict to a single customer
    #[arg(long)]
    customer_name: Option<String>,

    /// Restrict to a single backup tag
    #[arg(long)]
    backup_tag: Option<String>,

    /// Download root (defaults to the customer's local path)
    #[arg(long)]
    backup_destination: Option<PathBuf>,

    /// Path to the INI configuration file
    #[arg(long, default_value = "/etc/bur-offsite/bur-offsite.ini")]
    config_path: PathBuf,

    #[arg(long, default_value_t = 5)]
    number_threads: i64,

    #[arg(long, default_value_t = 5)]
    number_processors: i64,

    #[arg(long, default_value_t = 8)]
    number_transfer_processors: usize,

    /// true=ssh mode, false=daemon
    #[arg(long, default_value_t = false)]
    rsync_ssh: bool,

    /// Overrides config retention count
    #[arg(long)]
    offsite_retention: Option<usize>,

    /// critical/error/warning/info/debug
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Root directory for per-customer/per-operation log files
    #[arg(long)]
    log_root_path: Option<PathBuf>,
}

fn operation_name(script_option: u8) -> &'static str {
    match script_option {
        1 => "upload",
        2 => "download",
        3 => "retention",
        _ => "run",
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_root_path = cli
        .log_root_path
        .clone()
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join("backup")))
        .unwrap_or_else(|| PathBuf::from("/tmp/backup"));
    let log_file_stem = format!(
        "{}_{}",
        operation_name(cli.script_option),
        cli.customer_name.as_deref().unwrap_or("all"),
    );
    let file_appender = tracing_appender::rolling::never(&log_root_path, format!("{log_file_stem}.log"));
    let (file_writer, _file_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("bur_offsite={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(%err, "run failed");
            err.exit_code()
        }
    };
    drop(_file_guard); // flush the per-operation log file before exit() skips destructors
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), BurError> {
    let loaded = config::load(&cli.config_path)?;

    let process_pool_size = RunContext::clamp_process_pool(Some(cli.number_processors), num_cpus::get());
    let ctx = Arc::new(RunContext {
        gpg_home: std::env::var("GNUPGHOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/root/.gnupg")),
        gpg_recipient: loaded.gpg_user_email.clone(),
        tmp_root: loaded.onsite_tmp_root.clone(),
        host_address: format!("{}@{}", loaded.offsite.user, loaded.offsite.host),
        rsync_ssh: cli.rsync_ssh,
        process_pool_size,
        thread_pool_size: cli.number_threads.max(1) as usize,
        transfer_pool_size: cli.number_transfer_processors.max(1),
        ssh_timeout: Duration::from_secs(120),
        max_delay: loaded.max_delay,
    });

    let codec = CryptoCodec::new(ctx.gpg_home.clone(), loaded.gpg_user_name.clone(), loaded.gpg_user_email.clone(), ctx.ssh_timeout);
    codec.ensure_key().await?;

    let store: SharedStore = Arc::new(SshRsyncStore::new(ctx.host_address.clone(), ctx.rsync_ssh, ctx.ssh_timeout));
    let full_root = loaded.offsite.full_root();
    let retention_count = cli.offsite_retention.unwrap_or(loaded.offsite.retention_count);

    let customers: Vec<_> = match &cli.customer_name {
        Some(name) => loaded.customers.into_iter().filter(|c| &c.name == name).collect(),
        None => loaded.customers,
    };
    if customers.is_empty() {
        return Err(BurError::InvalidInput("no matching customer configured".into()));
    }

    match cli.script_option {
        1 => run_upload(&ctx, &codec, &store, &customers, &full_root, cli.backup_tag.as_deref())
            .await
            .map_err(|e| BurError::UploadFailed(Box::new(e))),
        2 => run_download(
            &ctx,
            &codec,
            &store,
            &customers,
            &full_root,
            cli.backup_tag.as_deref(),
            cli.backup_destination.as_deref(),
        )
        .await
        .map_err(|e| BurError::DownloadFailed(Box::new(e))),
        3 => run_retention(&store, &customers, &full_root, retention_count).await,
        other => Err(BurError::InvalidInput(format!("unknown --script_option {other}"))),
    }
}

async fn run_upload(
    ctx: &Arc<RunContext>,
    codec: &CryptoCodec,
    store: &SharedStore,
    customers: &[bur_offsite_core::Customer],
    full_root: &str,
    backup_tag: Option<&str>,
) -> Result<(), BurError> {
    let engine = UploadEngine::new(ctx.clone(), codec.clone());
    let mut failures = Vec::new();

    for customer in customers {
        let results = engine.process_customer(store, customer, full_root, backup_tag).await?;
        for result in results {
            if let Err(e) = result {
                tracing::error!(customer = customer.name, error = %e, "upload failed for backup");
                failures.push(e.to_string());
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BurError::Encode {
            volume: "multiple backups".into(),
            reason: failures.join("; "),
        })
    }
}

async fn run_download(
    ctx: &Arc<RunContext>,
    codec: &CryptoCodec,
    store: &SharedStore,
    customers: &[bur_offsite_core::Customer],
    full_root: &str,
    backup_tag: Option<&str>,
    backup_destination: Option<&std::path::Path>,
) -> Result<(), BurError> {
    let Some(tag) = backup_tag else {
        for customer in customers {
            let entries = store.list(&format!("{full_root}/{}", customer.name), "*").await.map_err(BurError::Transfer)?;
            for entry in entries {
                println!("{}: {entry}", customer.name);
            }
        }
        return Ok(());
    };

    let engine = DownloadEngine::new(ctx.clone(), codec.clone());
    for customer in customers {
        let destination = backup_destination.map(PathBuf::from).unwrap_or_else(|| customer.local_backup_root.clone());
        engine.download_backup(store, customer, full_root, tag, &destination).await?;
    }
    Ok(())
}

async fn run_retention(
    store: &SharedStore,
    customers: &[bur_offsite_core::Customer],
    full_root: &str,
    retention_count: usize,
) -> Result<(), BurError> {
    let engine = RetentionEngine::new();
    let mut not_removed = Vec::new();

    for customer in customers {
        let customer_root = format!("{full_root}/{}", customer.name);
        if let Err(e) = engine.apply(store.as_ref(), &customer_root, retention_count).await {
            tracing::error!(customer = customer.name, error = %e, "retention failed");
            not_removed.push(e.to_string());
        }
    }

    if not_removed.is_empty() {
        Ok(())
    } else {
        Err(BurError::RetentionRemovalFailed(not_removed))
    }
}
