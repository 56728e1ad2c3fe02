use bridge::api::{self, AppState};
use bridge::config::{Config, ConfigError};
use bridge::dedup::DedupStore;
use bridge::identity::IdentityClient;
use bridge::jira::JiraClient;
use bridge::orchestrator::Orchestrator;
use bridge::secrets::{self, SecretsError};
use bridge::table::{self, TableError};
use bridge::telemetry::TelemetryClient;
use bridge::vault::{VaultClient, VaultError};
use clap::Parser;
use metrics_exporter_statsd::StatsdBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "excbridge", about = "Exception-to-ticket bridge service")]
struct Cli {
    /// Listening port, overriding PORT from the environment
    #[arg(long)]
    port: Option<u16>,
}

#[derive(thiserror::Error, Debug)]
enum StartupError {
    #[error("AZURE_VAULT_NAME environment variable is not set")]
    VaultNameMissing,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to load secrets: {0}")]
    Secrets(#[from] SecretsError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("invalid storage configuration: {0}")]
    Storage(#[from] TableError),
    #[error("server error: {0}")]
    Server(#[from] api::ApiError),
    #[error("metrics exporter error: {0}")]
    Metrics(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "startup failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    init_metrics()?;

    // Configuration errors here are fatal: the process must not start
    // without its full secret set.
    let vault_name =
        std::env::var("AZURE_VAULT_NAME").map_err(|_| StartupError::VaultNameMissing)?;
    let vault_url = std::env::var("VAULT_URL")
        .unwrap_or_else(|_| format!("https://{vault_name}.vault.azure.net"));

    let identity = IdentityClient::from_env();
    let vault = VaultClient::connect(&vault_url, &identity).await?;
    let resolved = secrets::resolve(&vault).await?;
    secrets::export_to_env(&resolved);
    tracing::info!("successfully loaded secrets");

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let account = table::parse_connection_string(&config.connection_string)?;
    let store = Arc::new(DedupStore::new(
        account,
        config.max_retries,
        config.retry_delay,
        config.request_timeout,
    ));
    let telemetry = Arc::new(TelemetryClient::new(&config));
    let jira = Arc::new(JiraClient::new(&config));

    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(telemetry.clone(), jira, store)),
        source: telemetry,
    };

    api::serve(state, config.port).await?;
    Ok(())
}

/// Install the statsd exporter when STATSD_HOST is set; otherwise metrics
/// are recorded against the default no-op recorder.
fn init_metrics() -> Result<(), StartupError> {
    let Ok(host) = std::env::var("STATSD_HOST") else {
        return Ok(());
    };
    let port = std::env::var("STATSD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8125);

    let recorder = StatsdBuilder::from(host.as_str(), port)
        .build(Some("excbridge"))
        .map_err(|e| StartupError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| StartupError::Metrics(e.to_string()))?;
    Ok(())
}
