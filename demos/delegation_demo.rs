//! End-to-end delegation demo against a local Ollama server.
//!
//! Requires a running Ollama instance (default http://localhost:11434) with
//! the model below pulled. Usage:
//!
//! ```bash
//! RUST_LOG=info cargo run --example delegation_demo -- "List files in 'src' and summarize"
//! ```

use std::sync::Arc;
use swarmllm::cancel::CancelToken;
use swarmllm::clients::ollama::OllamaClient;
use swarmllm::config::{EndpointConfig, EngineConfig};
use swarmllm::engine::DelegationEngine;
use swarmllm::registry::AgentRegistry;
use swarmllm::tool_backend::BuiltinToolBackend;
use swarmllm::trace::TraceLevel;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let query = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "List files in the current directory and summarize them".to_string());

    let base_url =
        std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
    let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "qwen2.5:7b".to_string());

    let config = EngineConfig {
        planner_model_id: Some(model.clone()),
        endpoints: vec![EndpointConfig::new(&base_url, &model)],
        trace_level: TraceLevel::Basic,
        ..EngineConfig::default()
    };

    let mut registry = AgentRegistry::builtin();
    if let Ok(dir) = std::env::var("SWARMLLM_AGENTS_DIR") {
        let loaded = registry.load_dir(dir.as_ref())?;
        println!("loaded {} role definition(s) from {}", loaded, dir);
    }

    let engine = DelegationEngine::new(
        config,
        registry,
        Arc::new(OllamaClient::new(&base_url)),
        Arc::new(BuiltinToolBackend::new("workspace".into())?),
    );

    let output = engine.run(&query, &CancelToken::new()).await?;

    println!("\n=== Final response ===\n{}", output.final_text);
    println!("\n=== Outcomes ===");
    for outcome in &output.outcomes {
        println!(
            "{} [{}] {} ({} ms)",
            outcome.id, outcome.role, outcome.status, outcome.duration_ms
        );
    }
    if let Some(path) = &output.trace_path {
        println!("\ntrace written to {}", path.display());
    }
    Ok(())
}
