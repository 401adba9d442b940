use finance_assistant_pipeline::{api::start_server, build_orchestrator, PipelineConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env();
    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY not set in .env, serving scripted demo replies");
    }

    info!("Finance Assistant Pipeline - API Server");
    info!("Port: {}", config.port);

    let orchestrator = Arc::new(build_orchestrator(&config)?);

    info!("Starting API server...");

    start_server(orchestrator, config.default_max_tools, config.port).await?;

    Ok(())
}
