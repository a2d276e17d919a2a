mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use parking_lot::Mutex;
use remote_config::config::ValidationError;
use remote_config::metrics_defs::{ALL_METRICS, MetricType};
use remote_config::priority_merger::{PriorityMerger, lib_config_handler};
use remote_config::{ProductHandler, RemoteConfigManager};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(version, about = "Polls the agent for remote configuration")]
enum CliCommand {
    /// Subscribe to the configured products and poll until interrupted.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid remote_config section: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid sentry DSN: {0}")]
    SentryDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not create statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("could not install metrics recorder: {0}")]
    MetricsRecorder(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match &cli {
        CliCommand::Run(args) => run(&args.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.remote_config.validate()?;

    // Installed before the runtime starts and kept until shutdown
    let _sentry = config.logging.as_ref().map(init_sentry).transpose()?;
    init_tracing(config.logging.is_some());

    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_client(config))
}

fn init_sentry(logging: &LoggingConfig) -> Result<sentry::ClientInitGuard, CliError> {
    let dsn: sentry::types::Dsn = logging.sentry_dsn.parse()?;
    Ok(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

fn init_tracing(with_sentry: bool) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(with_sentry.then(|| sentry::integrations::tracing::layer()))
        .init();
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port).build(None)?;
    metrics::set_global_recorder(recorder)
        .map_err(|err| CliError::MetricsRecorder(err.to_string()))?;

    for def in ALL_METRICS {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
    Ok(())
}

fn logging_handler(product: &str) -> ProductHandler {
    let product = product.to_string();
    ProductHandler::sync(move |action, content, id| {
        tracing::info!(
            product = %product,
            %action,
            id,
            has_content = content.is_some(),
            "received configuration"
        );
        Ok(())
    })
}

async fn run_client(config: Config) -> Result<(), CliError> {
    let settings = &config.remote_config;
    let manager = RemoteConfigManager::with_http_transport(settings);

    for bit in &config.capabilities {
        manager.update_capabilities(*bit, true);
    }

    if let Some(product) = &config.lib_config_product {
        let merger = Arc::new(Mutex::new(PriorityMerger::new(
            &settings.service,
            settings.env.as_deref(),
        )));
        let handler = lib_config_handler(merger, |merged| match merged {
            Some(lib_config) => tracing::info!(
                lib_config = %JsonValue::Object(lib_config),
                "effective library configuration changed"
            ),
            None => tracing::info!("library configuration cleared"),
        });
        manager.set_product_handler(product, handler);
    }

    for product in &config.products {
        manager.set_product_handler(product, logging_handler(product));
    }

    tracing::info!(
        client_id = manager.client_id(),
        products = ?manager.products(),
        url = %settings.url,
        "remote config client started"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    manager.unsubscribe_products(manager.products());
    Ok(())
}
