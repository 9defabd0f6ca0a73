//! Cache command implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use serde_json::json;
use teak_core::request::DEFAULT_HOSTNAME;
use teak_core::storage::read_records;
use teak_core::{
    AppIdentity, CacheDatabase, CachedRequestRecord, DeviceIdentity, EventBus, PersistentRequestCache,
    RemoteConfiguration, RequestContext, RequestEngine, ReqwestTransport, SdkConfig, TeakEvent,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Cache subcommands.
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached requests, fewest retries first
    List {
        /// Cache database (defaults to the configured path)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resend every cached request and report the outcome
    Replay {
        /// Cache database (defaults to the configured path)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Teak app id
        #[arg(long)]
        app_id: String,

        /// API key used to sign the replayed requests
        #[arg(long)]
        api_key: String,

        /// Host receiving the requests
        #[arg(long, default_value = DEFAULT_HOSTNAME)]
        host: String,

        /// Seconds to wait for responses
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

/// Execute a cache subcommand.
pub async fn execute(command: CacheCommand, config: &SdkConfig) -> anyhow::Result<()> {
    match command {
        CacheCommand::List { db, json } => list(&existing(db, config)?, json),
        CacheCommand::Replay { db, app_id, api_key, host, timeout } => {
            let app = AppIdentity::new(app_id, api_key);
            app.validate()?;
            replay(&existing(db, config)?, config, app, host, Duration::from_secs(timeout)).await
        }
    }
}

fn existing(db: Option<PathBuf>, config: &SdkConfig) -> anyhow::Result<PathBuf> {
    let path = db.unwrap_or_else(|| config.cache.path.clone());
    if !path.exists() {
        anyhow::bail!("cache database not found: {}", path.display());
    }
    Ok(path)
}

fn list(path: &Path, as_json: bool) -> anyhow::Result<()> {
    let records = read_records(&CacheDatabase::new(path))?;

    if as_json {
        let rows: Vec<_> = records.iter().map(record_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("{}", "No cached requests".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Row", "Request ID", "Endpoint", "Issued", "Retries"]);
    for record in &records {
        table.add_row(vec![
            record.rowid.to_string(),
            record.request_id.clone(),
            record.endpoint.clone(),
            record.issued_at.to_rfc3339(),
            record.retry_count.to_string(),
        ]);
    }
    println!("{table}");
    println!("{}", format!("{} cached request(s)", records.len()).bold());
    Ok(())
}

fn record_json(record: &CachedRequestRecord) -> serde_json::Value {
    json!({
        "rowid": record.rowid,
        "request_id": record.request_id,
        "endpoint": record.endpoint,
        "issued_at": record.issued_at.to_rfc3339(),
        "retry_count": record.retry_count,
        "payload": record.payload,
    })
}

async fn replay(
    path: &Path,
    config: &SdkConfig,
    app: AppIdentity,
    host: String,
    timeout: Duration,
) -> anyhow::Result<()> {
    let db = CacheDatabase::new(path);
    let handle = Handle::current();
    let bus = EventBus::new(&handle);
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.add_listener(Arc::new(move |event: &TeakEvent| {
        if let TeakEvent::CachedRequestResolved { deleted, .. } = event {
            let _ = tx.send(*deleted);
        }
    }));

    let transport = Arc::new(ReqwestTransport::new(&config.transport)?);
    let engine = RequestEngine::new(&handle, transport, &config.transport);
    let cache = PersistentRequestCache::open(&handle, db, engine, bus.clone())?;

    let context =
        RequestContext::new(app, DeviceIdentity::default()).with_remote(Arc::new(RemoteConfiguration::new(host)));
    let sent = cache.resubmit_all(&context);
    if sent == 0 {
        println!("{}", "No cached requests".yellow());
        return Ok(());
    }
    println!("Replaying {sent} cached request(s)...");

    let (mut delivered, mut kept) = (0_usize, 0_usize);
    let deadline = tokio::time::Instant::now() + timeout;
    while delivered + kept < sent {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(true)) => delivered += 1,
            Ok(Some(false)) => kept += 1,
            Ok(None) | Err(_) => break,
        }
    }
    bus.shutdown();

    let unresolved = sent - delivered - kept;
    println!("{}", format!("✓ {delivered} delivered").green());
    if kept > 0 {
        println!("{}", format!("{kept} kept for retry after a server error").yellow());
    }
    if unresolved > 0 {
        println!("{}", format!("{unresolved} unresolved").red());
    }
    Ok(())
}
