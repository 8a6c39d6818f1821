use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use huginn::config::Config;
use huginn::input::{self, FileTailer, InputError, SyslogListener};
use huginn::models::RawLine;
use huginn::persistence::{AlertStore, SqliteAlertStore};
use huginn::sink::{AlertSink, FanoutSink};
use huginn::{OutputHandler, Pipeline, WebhookSink};

/// Main daemon entry point for the log analysis pipeline
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting Huginn daemon...");

    // Load configuration
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("Config file not found, using defaults");
        Config::default()
    };
    config.validate()?;

    // Alert sinks
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(
        OutputHandler::from_config(&config.output)?.with_forwarded_logs(config.pipeline.forward_logs),
    )];
    let store = match config.storage.sqlite_path {
        Some(ref path) => {
            let store = Arc::new(SqliteAlertStore::new(path)?);
            log::info!("Persisting alerts to {:?}", path);
            sinks.push(store.clone());
            Some(store)
        }
        None => None,
    };
    if !config.webhooks.is_empty() {
        log::info!("{} webhook(s) configured", config.webhooks.len());
        sinks.push(Arc::new(WebhookSink::new(config.webhooks.clone())?));
    }
    let sink: Arc<dyn AlertSink> = Arc::new(FanoutSink::new(sinks));

    let pipeline = Arc::new(Pipeline::new(&config, sink)?);
    pipeline.start_workers();
    log::info!("{} detection rules loaded", pipeline.rule_engine().rules().len());

    // Setup graceful shutdown signal handling
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal = shutdown_tx.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        signal.send_replace(true);
    })?;

    let mut background = Vec::new();
    if config.anomaly.enabled {
        let trainer = pipeline.model_trainer(&config.anomaly);
        if let Some(ref path) = config.anomaly.bootstrap_file {
            match input::read_file_lines(path).await {
                Ok(lines) => {
                    bootstrap(&pipeline, &lines);
                    match trainer.retrain().await {
                        Ok(model) => log::info!("Bootstrapped anomaly model v{} from {:?}", model.version, path),
                        Err(e) => log::warn!("Could not bootstrap anomaly model: {}", e),
                    }
                }
                Err(e) => log::warn!("Cannot read bootstrap file {:?}: {}", path, e),
            }
        }
        background.push(trainer.spawn_retrain_loop(config.anomaly.retrain_interval(), shutdown_rx.clone()));
    }

    background.push(spawn_maintenance(
        pipeline.clone(),
        store,
        config.pipeline.maintenance_interval(),
        config.storage.retention_days,
        shutdown_rx.clone(),
    ));

    // Initialize input source
    let (tx, rx) = mpsc::channel(config.input.channel_capacity.max(1));
    let collector = spawn_collector(&config, tx, shutdown_rx.clone()).await?;

    log::info!("Daemon running. Press Ctrl+C to stop.");
    pipeline.run(rx, shutdown_rx).await;

    shutdown_tx.send_replace(true);
    pipeline.shutdown().await;
    for handle in background {
        if let Err(e) = handle.await {
            log::error!("Background task failed: {}", e);
        }
    }
    match collector.await {
        Ok(Err(InputError::ChannelClosed)) | Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Input source failed: {}", e),
        Err(e) => log::error!("Input task failed: {}", e),
    }

    log::info!("Huginn daemon stopped");
    Ok(())
}

fn bootstrap(pipeline: &Pipeline, lines: &[RawLine]) {
    for line in lines {
        pipeline.learn(line);
    }
    log::info!("Loaded {} historical lines for training", lines.len());
}

/// Start the configured log collector
async fn spawn_collector(
    config: &Config,
    tx: mpsc::Sender<RawLine>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<Result<(), InputError>>, Box<dyn std::error::Error>> {
    match config.input.source_type.as_str() {
        "syslog" => {
            let address = config
                .input
                .syslog_address
                .clone()
                .ok_or("syslog input requires a bind address")?;
            let listener = SyslogListener::bind(&address).await?;
            log::info!("Listening on syslog: {}", address);
            Ok(tokio::spawn(async move { listener.run(tx, shutdown).await }))
        }
        _ => {
            let path = config.input.file_path.clone().ok_or("file input requires a path")?;
            log::info!("Monitoring log file: {:?}", path);
            let tailer = FileTailer::new(path);
            Ok(tokio::spawn(async move { tailer.run(tx, shutdown).await }))
        }
    }
}

/// Periodically expire idle detection state, log counters and prune the store
fn spawn_maintenance(
    pipeline: Arc<Pipeline>,
    store: Option<Arc<SqliteAlertStore>>,
    every: Duration,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    pipeline.maintenance(now.timestamp_millis());
                    log::info!("Pipeline stats: {}", pipeline.stats().snapshot());

                    if let Some(ref store) = store {
                        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
                        match store.prune_older_than(cutoff) {
                            Ok(0) => {}
                            Ok(pruned) => log::info!("Pruned {} stored records older than {} days", pruned, retention_days),
                            Err(e) => log::error!("Failed to prune alert store: {}", e),
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
