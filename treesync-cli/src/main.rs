use anyhow::{Context, Result};
use clap::Parser;
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use treesync::{Location, Outcome, RunSummary, S3Store, SyncEngine};

mod config;

use config::{FileConfig, OptionOverrides, S3Overrides};

#[derive(Parser)]
#[command(name = "treesync")]
#[command(about = "Mirror a local directory tree to or from an S3 prefix")]
#[command(version)]
struct Cli {
    /// Source: a local path or s3://bucket/prefix
    source: String,

    /// Target: a local path or s3://bucket/prefix
    target: String,

    /// S3 endpoint URL
    #[arg(long, env = "S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// S3 access key ID
    #[arg(long, env = "S3_ACCESS_KEY_ID")]
    s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    s3_secret_access_key: Option<String>,

    /// S3 region
    #[arg(long, env = "S3_REGION")]
    s3_region: Option<String>,

    /// Delete target entries that are not in the source
    #[arg(long)]
    delete: bool,

    /// Transfer every file regardless of size and mtime; download in place
    #[arg(long)]
    overwrite: bool,

    /// Show what would be done without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Number of concurrent transfers
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Modification time resolution used for change detection (e.g. 1s, 500ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    mtime_granularity: Option<std::time::Duration>,

    /// Keep directories on S3 as zero-byte marker objects
    #[arg(long)]
    dir_markers: bool,

    /// Do not apply stored owner and group on download
    #[arg(long)]
    no_preserve_ownership: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log in JSON
    #[arg(long)]
    json_logs: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    summary_json: bool,
}

impl Cli {
    fn option_overrides(&self) -> OptionOverrides {
        OptionOverrides {
            delete: self.delete,
            overwrite: self.overwrite,
            dry_run: self.dry_run,
            jobs: self.jobs,
            mtime_granularity: self.mtime_granularity,
            dir_markers: self.dir_markers,
            no_preserve_ownership: self.no_preserve_ownership,
        }
    }

    fn s3_overrides(&self) -> S3Overrides {
        S3Overrides {
            endpoint: self.s3_endpoint.clone(),
            access_key_id: self.s3_access_key_id.clone(),
            secret_access_key: self.s3_secret_access_key.clone(),
            region: self.s3_region.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    match run(&cli).await {
        Ok(summary) => {
            if let Err(e) = report(&summary, cli.summary_json) {
                error!("Failed to print summary: {:#}", e);
            }
            ExitCode::from(summary.exit_code() as u8)
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("treesync: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("treesync={0},treesync_cli={0}", log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: &Cli) -> Result<RunSummary> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path).await?,
        None => FileConfig::default(),
    };
    let options = cli.option_overrides().apply(file.sync);
    let s3 = cli.s3_overrides().apply(file.s3)?;

    let source = Location::parse(&cli.source)?;
    let target = Location::parse(&cli.target)?;
    let bucket = match (&source, &target) {
        (Location::Remote { bucket, .. }, _) | (_, Location::Remote { bucket, .. }) => bucket.clone(),
        _ => anyhow::bail!("one of SOURCE and TARGET must be s3://bucket/prefix"),
    };

    let store = S3Store::new(&s3, &bucket).context("cannot set up S3 client")?;
    let engine = SyncEngine::new(Arc::new(store), options);

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for in-flight transfers to finish");
            token.cancel();
        }
    });

    info!("Syncing from {} to {}", source, target);
    let summary = engine.sync(&source, &target).await?;
    Ok(summary)
}

fn report(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    for result in summary.failures() {
        if let Outcome::Failed(reason) = &result.outcome {
            eprintln!("failed: {}: {}", result.relative_path, reason);
        }
    }
    for warning in &summary.warnings {
        eprintln!(
            "warning: {}: ignoring {}={:?}: {}",
            warning.path, warning.key, warning.value, warning.reason
        );
    }
    println!("{}", summary.summary());
    Ok(())
}
