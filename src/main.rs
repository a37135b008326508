use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use llm_gateway::config::{api_key_env_var, InstanceConfig, ProviderConfig};
use llm_gateway::gateway::Gateway;
use llm_gateway::ingest::Extractors;
use llm_gateway::llm::provider::{Provider, ProviderCore};
use llm_gateway::llm::{AnthropicProvider, GeminiProvider, OpenAiProvider};
use llm_gateway::observe::{cleanup_logs, cleanup_metrics, CostStore, DialogLogger};
use llm_gateway::server;

/// Unified LLM provider gateway. One instance, one upstream provider.
#[derive(Parser, Debug)]
#[command(name = "llm-gateway")]
#[command(version)]
#[command(about = "Unified LLM provider gateway", long_about = None)]
struct Cli {
    /// Upstream adapter to run (anthropic, openai, google)
    #[arg(long, env = "PROVIDER_TYPE", default_value = "anthropic")]
    provider_type: String,

    /// Provider YAML (name, api_base, default_model, ...)
    #[arg(long, env = "CONFIG_PATH", default_value = "/config/anthropic.yaml")]
    config_path: PathBuf,

    /// Instance YAML (api_key, log_requests, database.url, retention)
    #[arg(long, env = "INSTANCE_CONFIG", default_value = "/config/instance.yaml")]
    instance_config: PathBuf,

    /// Data directory for dialog logs and the default SQLite store
    #[arg(long, env = "LOG_DIR", default_value = "/data")]
    log_dir: PathBuf,

    /// Listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Fail-fast: refuse to start with a missing or placeholder API key.
fn check_api_key(provider_type: &str, env_var: &str, key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with("sk-...") || key.starts_with("sk-ant-...") {
        bail!(
            "FATAL: API key missing for provider '{provider_type}'. \
             Set {env_var} as an environment variable or in the instance config."
        );
    }
    Ok(())
}

fn create_provider(provider_type: &str, core: ProviderCore) -> Result<Arc<dyn Provider>> {
    Ok(match provider_type {
        "anthropic" => Arc::new(AnthropicProvider::new(core)),
        "openai" => Arc::new(OpenAiProvider::new(core)),
        "google" => Arc::new(GeminiProvider::new(core)),
        other => bail!("unknown provider type: {other}"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    tracing::info!("starting llm-gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = ProviderConfig::load(&cli.config_path)
        .with_context(|| format!("loading provider config {}", cli.config_path.display()))?;
    let instance = InstanceConfig::load(&cli.instance_config);

    let api_key = match api_key_env_var(&cli.provider_type) {
        Some(env_var) => {
            let key = instance.api_key(env_var);
            check_api_key(&cli.provider_type, env_var, &key)?;
            key
        }
        // custom provider types skip the standard key check
        None => instance.api_key("API_KEY"),
    };

    let extractors = Arc::new(Extractors::default());
    let core = ProviderCore::new(config, api_key, extractors);
    let provider = create_provider(&cli.provider_type, core)?;
    provider.connect();

    let database_url = instance.database_url(&cli.log_dir);
    let costs = Arc::new(CostStore::connect(&database_url).await);
    let dialog = Arc::new(DialogLogger::new(
        provider.name(),
        cli.log_dir.clone(),
        instance.log_requests(),
    ));
    let retention = instance.retention();

    tracing::info!(
        provider = provider.name(),
        dialog_logging = dialog.enabled(),
        "provider started"
    );

    // retention sweep at startup
    let log_stats = cleanup_logs(&cli.log_dir, &retention);
    tracing::info!(
        compressed = log_stats.compressed,
        deleted = log_stats.deleted,
        freed_mb = log_stats.freed_mb,
        "startup log retention"
    );
    cleanup_metrics(&costs, &retention).await;

    let gateway = Arc::new(Gateway::new(
        provider.clone(),
        dialog,
        costs.clone(),
        cli.log_dir.clone(),
        retention,
    ));

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(addr = %cli.listen, "listening");

    axum::serve(listener, server::router(gateway))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    provider.disconnect();
    costs.close().await;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
