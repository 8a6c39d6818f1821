use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;

use huginn::anomaly::{AnomalyScorer, FeatureEncoder, FeatureSchema, ModelTrainer, TrainingBuffer};
use huginn::config::Config;
use huginn::output::OutputFormat;
use huginn::persistence::{AlertStore, SqliteAlertStore};
use huginn::{input, Normalizer, OutputHandler};

/// Huginn security log analysis command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "huginn", about = "Security log analysis pipeline CLI")]
pub enum Cli {
    /// Validate the configuration used by the daemon
    Daemon {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Parse and display normalized log events from a file
    Parse {
        /// Path to log file
        #[structopt(short, long)]
        file: PathBuf,
        /// Number of lines to parse
        #[structopt(short, long, default_value = "10")]
        lines: usize,
        /// Configuration providing custom patterns
        #[structopt(short, long)]
        config: Option<PathBuf>,
    },
    /// Show the most recent stored alerts
    Alerts {
        /// Path to the alert database
        #[structopt(short, long, default_value = "huginn.db")]
        db: PathBuf,
        /// Number of alerts to show
        #[structopt(short, long, default_value = "20")]
        limit: usize,
    },
    /// Fit an anomaly model from a log file and summarize it
    Train {
        /// Path to historical log file
        #[structopt(short, long)]
        file: PathBuf,
        /// Configuration providing anomaly settings
        #[structopt(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Daemon { config } => {
            if config.exists() {
                let loaded = Config::from_file(&config)?;
                loaded.validate()?;
                println!("Configuration loaded and validated: {:?}", config);
                println!("  rules: {}", loaded.rules.len());
                println!("  input: {}", loaded.input.source_type);
                println!("Use 'huginn_daemon {}' to run the daemon", config.display());
            } else {
                eprintln!("Configuration file not found: {:?}", config);
                eprintln!("Run 'huginn config' to generate a default configuration");
                std::process::exit(1);
            }
        }
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Parse { file, lines, config } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }

            let config = load_config(config.as_ref())?;
            let normalizer = Normalizer::from_config(&config.normalizer)?;
            let raw_lines = input::read_file_lines(&file).await?;
            let display_count = std::cmp::min(lines, raw_lines.len());

            println!("Parsed {} line(s) (showing {}):\n", raw_lines.len(), display_count);
            for raw in raw_lines.iter().take(display_count) {
                let event = normalizer.normalize(raw);
                println!(
                    "  [{}] {} id={}",
                    event.extractor.as_deref().unwrap_or("unparsed"),
                    event.timestamp.to_rfc3339(),
                    &event.id[..12.min(event.id.len())]
                );
                for (name, value) in &event.parsed_fields {
                    println!("      {} = {}", name, value);
                }
            }
        }
        Cli::Alerts { db, limit } => {
            if !db.exists() {
                eprintln!("Database not found: {:?}", db);
                std::process::exit(1);
            }

            let store = SqliteAlertStore::new(&db)?;
            let alerts = store.recent_alerts(limit)?;
            println!("{} alert(s) stored, showing {}:\n", store.alert_count()?, alerts.len());

            let console = OutputHandler::new(OutputFormat::Console, None)?;
            for alert in &alerts {
                print!("{}", console.render_alert(alert)?);
            }
        }
        Cli::Train { file, config } => {
            let config = load_config(config.as_ref())?;
            let normalizer = Normalizer::from_config(&config.normalizer)?;
            let schema = FeatureSchema::from_names(&config.anomaly.features)?;
            let encoder = FeatureEncoder::new(schema.clone());
            let buffer = Arc::new(TrainingBuffer::new(
                config.anomaly.max_samples,
                config.anomaly.training_window(),
            ));

            let raw_lines = input::read_file_lines(&file).await?;
            for raw in &raw_lines {
                buffer.push(&encoder.encode(&normalizer.normalize(raw)));
            }

            let trainer = ModelTrainer::from_config(buffer.clone(), Arc::new(AnomalyScorer::new()), schema, &config.anomaly);
            let model = trainer.fit()?;

            let samples = buffer.snapshot();
            let flagged = samples
                .iter()
                .filter(|values| model.detector.score(values) >= model.decision_threshold)
                .count();

            println!("Trained anomaly model from {:?}", file);
            println!("  lines read:         {}", raw_lines.len());
            println!("  training samples:   {}", model.sample_count);
            println!("  features:           {}", model.feature_schema.names().join(", "));
            println!("  decision threshold: {:.2}", model.decision_threshold);
            println!("  flagged in sample:  {} of {}", flagged, samples.len());
        }
    }

    Ok(())
}
