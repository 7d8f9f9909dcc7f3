use anyhow::Result;
use tracing_subscriber::EnvFilter;

use chronicle::pipeline::NarrativeService;
use chronicle::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let service = NarrativeService::connect(&config).await?;
    tracing::info!(
        answer_model = %config.models.answer_model,
        requests_per_day = config.rate_limits.requests_per_day,
        "narrative service ready"
    );

    run_server(config, service).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
