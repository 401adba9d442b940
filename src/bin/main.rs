use finance_assistant_pipeline::{
    build_orchestrator,
    models::{Request, UserState},
    PipelineConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Finance Assistant Pipeline demo starting");

    let config = PipelineConfig::from_env();
    let orchestrator = build_orchestrator(&config)?;

    let message = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "I spent 12.50 on lunch today".to_string());

    let request = Request::text("demo-user", message)
        .with_session("demo-session")
        .with_user_state(UserState {
            has_wallets: true,
            ..UserState::default()
        });

    info!(request_id = %request.request_id, "Running pipeline");

    let result = orchestrator.process(request).await;

    println!("\n=== PIPELINE RESULT ===");
    println!("Outcome: {:?}", result.outcome);
    println!("Answer: {}", result.answer);
    println!(
        "Security: threat_level={} blocked={}",
        result.security.threat_level, result.security.blocked
    );
    if let Some(confidence) = &result.confidence {
        println!("Confidence: {} ({})", confidence.overall, confidence.reasoning);
        for suggestion in &confidence.suggestions {
            println!("  - {}", suggestion);
        }
    }
    println!("\nTrace:");
    for (i, stage) in result.trace.stages.iter().enumerate() {
        println!("  {}: {}", i + 1, stage);
    }
    println!("Tools used: {:?}", result.trace.tools_used);
    println!("Latency: {} ms", result.trace.total_latency_ms);

    Ok(())
}
