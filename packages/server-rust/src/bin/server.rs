//! Waybill server binary: the operator HTTP surface over the queue layer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waybill_server::network::{NetworkConfig, NetworkModule};
use waybill_server::{broker, JobMetrics, QueueConfig, QueueRegistry, RecoveryService};

#[derive(Parser, Debug)]
#[command(name = "waybill-server")]
#[command(about = "Circuit-gated job queues with dead-letter recovery")]
struct Cli {
    /// Broker connection URL. Without it every job runs through its fallback.
    #[arg(long, env = "WAYBILL_BROKER_URL")]
    broker_url: Option<String>,

    #[arg(long, env = "WAYBILL_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "WAYBILL_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "WAYBILL_GEOCODING_QUEUE", default_value = "geocoding-queue")]
    geocoding_queue: String,

    #[arg(long, env = "WAYBILL_ROUTE_DISTANCE_QUEUE", default_value = "route-distance-queue")]
    route_distance_queue: String,

    #[arg(long, env = "WAYBILL_DEAD_LETTER_QUEUE", default_value = "dead-letter-queue")]
    dead_letter_queue: String,

    /// Attempts per job before the broker marks it failed.
    #[arg(long, env = "WAYBILL_JOB_ATTEMPTS", default_value_t = 3)]
    attempts: u32,

    #[arg(long, env = "WAYBILL_BACKOFF_BASE_MS", default_value_t = 1000)]
    backoff_base_ms: u64,

    #[arg(long, env = "WAYBILL_REMOVE_ON_COMPLETE", default_value_t = 1000)]
    remove_on_complete: usize,

    #[arg(long, env = "WAYBILL_REMOVE_ON_FAIL", default_value_t = 5000)]
    remove_on_fail: usize,

    /// How long callers wait for a job before falling back.
    #[arg(long, env = "WAYBILL_WAIT_TIMEOUT_MS", default_value_t = 10_000)]
    wait_timeout_ms: u64,

    #[arg(long, env = "WAYBILL_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "WAYBILL_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            broker_url: self.broker_url.clone(),
            geocoding_queue: self.geocoding_queue.clone(),
            route_distance_queue: self.route_distance_queue.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
            attempts: self.attempts,
            backoff_base_ms: self.backoff_base_ms,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
        }
    }

    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..NetworkConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install the Prometheus recorder")?;

    let config = cli.queue_config();
    config.validate()?;
    let config = Arc::new(config);

    let broker = match config.broker_url.as_deref() {
        Some(url) => match broker::connect(url) {
            Ok(broker) => Some(broker),
            Err(e) => {
                warn!(error = %e, "broker unavailable, queue path disabled");
                None
            }
        },
        None => None,
    };

    let registry = QueueRegistry::new(broker);
    let recovery = Arc::new(RecoveryService::new(Arc::clone(&registry), Arc::clone(&config)));
    let metrics = Arc::new(JobMetrics::new());

    let mut module = NetworkModule::new(cli.network_config(), registry, recovery, metrics)
        .with_prometheus(prometheus);
    let port = module.start().await?;
    info!(port, "waybill server started");

    module
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
}
