//! One reconciliation pass over an explicit window.
//!
//! Exits non-zero when the pass is incomplete (gateway unreachable or at
//! least one payment could not be examined).

use anyhow::Context;
use balance_ledger::{BalanceLedger, Config as LedgerConfig};
use chrono::{DateTime, Utc};
use clap::Parser;
use reconciliation::{
    HttpGatewayClient, ReconciliationConfig, ReconciliationEngine, ReconciliationMode, TimeWindow,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "reconcile")]
#[command(about = "Reconcile internal payments against the payment gateway")]
struct Cli {
    /// Window start, inclusive (RFC 3339)
    #[arg(long)]
    from: DateTime<Utc>,

    /// Window end, exclusive (RFC 3339)
    #[arg(long)]
    to: DateTime<Utc>,

    /// Also examine payments still pending or processing
    #[arg(long)]
    daily: bool,

    /// Reconciliation config (TOML); RECON_* variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ledger config (TOML); LEDGER_* variables are used when absent
    #[arg(long)]
    ledger_config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => ReconciliationConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ReconciliationConfig::default(),
    };
    config.apply_env()?;

    let ledger_config = match &cli.ledger_config {
        Some(path) => LedgerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LedgerConfig::from_env()?,
    };

    let window = TimeWindow::new(cli.from, cli.to)?;
    let mode = if cli.daily {
        ReconciliationMode::Daily
    } else {
        ReconciliationMode::Standard
    };

    let ledger = Arc::new(BalanceLedger::open(ledger_config).context("opening ledger")?);
    let gateway = Arc::new(HttpGatewayClient::new(config.gateway.clone())?);
    let engine = ReconciliationEngine::new(ledger, gateway, config)?;

    let report = engine.run_scheduled(window, mode).await?;

    info!(
        report = %serde_json::to_string(&report)?,
        "Reconciliation report"
    );

    if !report.complete {
        error!(
            failures = report.failures,
            "Reconciliation pass incomplete"
        );
        std::process::exit(2);
    }

    Ok(())
}
