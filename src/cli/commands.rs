use crate::channel::DecodedFlow;
use crate::cli::{Commands, RecoveryAction};
use crate::config::Config;
use crate::metrics::{MetricsCollector, PrometheusExporter};
use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use flowacct_worker::backend::{FlowRow, WriteContext};
use flowacct_worker::cache::{CacheEntry, PurgeBatch};
use flowacct_worker::history::Step;
use flowacct_worker::recovery::{read_log, RecoveryContents};
use flowacct_worker::writer::PurgeWriter;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { config, input } => handle_run(config, input).await,
        Commands::CheckConfig { config } => handle_check_config(&config),
        Commands::Recovery { action } => match action {
            RecoveryAction::Dump { file } => handle_dump(&file),
            RecoveryAction::Replay {
                file,
                config,
                plugin,
            } => handle_replay(&file, &config, &plugin).await,
        },
    }
}

fn handle_check_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    for plugin in &config.plugins {
        println!(
            "{}: kind={:?} aggregate={} transport={:?}",
            plugin.name, plugin.kind, plugin.aggregate, plugin.transport
        );
    }
    println!("{} plugin(s), configuration OK", config.plugins.len());
    Ok(())
}

async fn open_input(input: Option<PathBuf>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "unable to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

async fn handle_run(config_path: PathBuf, input: Option<PathBuf>) -> Result<()> {
    let config = Config::load(&config_path)?;
    let metrics = MetricsCollector::new()?;
    let cancel = CancellationToken::new();

    if let Some(addr) = &config.core.metrics_addr {
        let exporter = PrometheusExporter::bind(metrics.registry().clone(), addr)
            .await
            .with_context(|| format!("binding metrics endpoint {}", addr))?;
        tokio::spawn(exporter.serve(cancel.clone()));
    }

    let mut pipeline = Pipeline::start(&config, &metrics)?;
    let mut lines = open_input(input).await?.lines();
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);
    let mut dispatched: u64 = 0;
    let mut rejected: u64 = 0;

    let term = terminate();
    tokio::pin!(term);

    info!(config = %config_path.display(), "flowacct running");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = &mut term => {
                info!("SIGTERM received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match DecodedFlow::from_json(&line) {
                        Ok(flow) => {
                            pipeline.dispatch(&flow);
                            dispatched += 1;
                        }
                        Err(e) => {
                            rejected += 1;
                            debug!(error = %e, "skipping malformed flow");
                        }
                    }
                }
                Ok(None) => {
                    info!("input exhausted");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "input read failed");
                    break;
                }
            },
            exit = pipeline.next_exit(), if pipeline.has_workers() => {
                warn!(worker = %exit.name, "worker exited before shutdown");
            }
            _ = flush.tick() => pipeline.flush(),
        }
    }

    info!(dispatched, rejected, "draining workers");
    let exits = pipeline.shutdown(SHUTDOWN_GRACE).await;
    cancel.cancel();

    let failed: Vec<_> = exits.iter().filter(|e| e.result.is_err()).collect();
    if !failed.is_empty() {
        anyhow::bail!("{} worker(s) exited with an error", failed.len());
    }
    Ok(())
}

fn handle_dump(file: &Path) -> Result<()> {
    let contents = read_log(file).with_context(|| format!("reading {}", file.display()))?;
    let header = &contents.header;
    info!(
        db = %header.db,
        table = %header.table,
        entries = contents.entries.len(),
        "recovery log"
    );
    if contents.trailing > 0 {
        warn!(bytes = contents.trailing, "incomplete record at end of log");
    }

    let ctx = WriteContext {
        table: header.table.clone(),
        what_to_count: header.what_to_count,
        ..Default::default()
    };
    for entry in &contents.entries {
        let row = FlowRow::new(&CacheEntry::from(*entry), &ctx);
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

/// Group the entries of a log by basetime into purge batches.
pub fn replay_batches(contents: &RecoveryContents, now: i64) -> Vec<PurgeBatch> {
    let mut by_basetime: BTreeMap<i64, Vec<CacheEntry>> = BTreeMap::new();
    for entry in &contents.entries {
        by_basetime
            .entry(entry.basetime)
            .or_default()
            .push(CacheEntry::from(*entry));
    }
    by_basetime
        .into_iter()
        .map(|(basetime, entries)| PurgeBatch {
            entries,
            basetime,
            timeslot: contents
                .header
                .history
                .map(|h| h.timeslot(basetime, Step::Add))
                .unwrap_or(0),
            new_basetime: true,
            recover: false,
            now,
        })
        .collect()
}

async fn handle_replay(file: &Path, config_path: &Path, plugin_name: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let plugin = config
        .plugin(plugin_name)
        .ok_or_else(|| crate::FlowAcctError::UnknownPlugin(plugin_name.to_string()))?;
    let contents = read_log(file).with_context(|| format!("reading {}", file.display()))?;

    let logged = contents.header.what_to_count;
    let wanted = plugin.aggregation()?;
    if logged != wanted {
        warn!(
            plugin = %plugin.name,
            "log aggregation differs from the plugin's; columns follow the plugin"
        );
    }

    // Replayed entries must not be spilled back into a log.
    let mut writer_config = plugin.writer_config()?;
    writer_config.recovery = None;

    let metrics = MetricsCollector::new()?;
    let writer = PurgeWriter::new(
        plugin.kind.build(),
        writer_config,
        metrics.workers().for_worker(&plugin.name),
    );

    let now = chrono::Utc::now().timestamp();
    let mut written = 0;
    let mut lost = 0;
    for batch in replay_batches(&contents, now) {
        let report = writer.purge(batch).await;
        written += report.primary + report.backup;
        lost += report.lost + report.recovered;
    }

    info!(written, lost, file = %file.display(), "replay finished");
    if lost > 0 {
        anyhow::bail!("{} entries could not be written", lost);
    }
    Ok(())
}
