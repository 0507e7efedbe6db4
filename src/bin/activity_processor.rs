use std::{path::PathBuf, sync::Arc, time::Duration};

use activity_processor::{
    bus::kafka::KafkaBus,
    config::{ProcessorConfig, UpdateTarget},
    processor::Processor,
    registry::http::HttpRegistry,
    Error, ProcessorResult,
};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Optional JSON config file providing base values
    #[arg(short, long, env = "PROCESSOR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "KAFKA_HOST")]
    kafka_host: Option<String>,

    #[arg(long, env = "KAFKA_PORT")]
    kafka_port: Option<u16>,

    #[arg(long, env = "KAFKA_GROUP_ID")]
    group_id: Option<String>,

    #[arg(long, env = "KAFKA_FETCH_MAX_WAIT_MS")]
    fetch_max_wait_ms: Option<u64>,

    #[arg(long, env = "KAFKA_FETCH_MAX_BYTES")]
    fetch_max_bytes: Option<usize>,

    #[arg(long, env = "REGISTRY_URL")]
    registry_url: Option<String>,

    #[arg(long, env = "REGISTRY_TOKEN", hide_env_values = true)]
    registry_token: Option<String>,

    /// Evaluation interval in milliseconds
    #[arg(long, env = "CHECK_ACTIVITY_COUNT")]
    interval_ms: Option<u64>,

    /// Where updates go: bus or registry
    #[arg(long, env = "UPDATE_TARGET")]
    update_target: Option<UpdateTarget>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> ProcessorResult<ProcessorConfig> {
        let mut config = match &self.config {
            Some(path) => ProcessorConfig::from_file(path)?,
            None => ProcessorConfig::default(),
        };
        if let Some(host) = self.kafka_host {
            config.bus.host = host;
        }
        if let Some(port) = self.kafka_port {
            config.bus.port = port;
        }
        if let Some(group_id) = self.group_id {
            config.bus.group_id = group_id;
        }
        if let Some(wait) = self.fetch_max_wait_ms {
            config.bus.fetch_max_wait = Duration::from_millis(wait);
        }
        if let Some(bytes) = self.fetch_max_bytes {
            config.bus.fetch_max_bytes = bytes;
        }
        if let Some(url) = self.registry_url {
            config.registry.base_url = url;
        }
        if self.registry_token.is_some() {
            config.registry.token = self.registry_token;
        }
        if let Some(interval) = self.interval_ms {
            config.evaluation_interval = Duration::from_millis(interval);
        }
        if let Some(target) = self.update_target {
            config.update_target = target;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok(config)
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: ProcessorConfig) -> ProcessorResult<()> {
    debug!("config: {:?}", config);

    let bus = Arc::new(KafkaBus::connect(&config.bus)?);
    let registry = Arc::new(HttpRegistry::new(&config.registry)?);
    let processor = Processor::new(config, bus, registry)?;

    processor.start().await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::internal(format!("Failed to wait for Ctrl+C: {}", e)))?;
    info!("Shutdown signal received");

    processor.shutdown().await
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);

    if let Err(e) = run(config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
