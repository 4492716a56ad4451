mod config;
mod errors;
mod evaluation;
mod llm_client;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, Provider};
use crate::evaluation::pipeline::Pipeline;
use crate::llm_client::anthropic::AnthropicBackend;
use crate::llm_client::openai::OpenAiBackend;
use crate::llm_client::{BackendHandle, CompletionBackend, CompletionClient};
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on malformed or missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("candidate_eval={}", &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting candidate evaluation API v{}", env!("CARGO_PKG_VERSION"));

    // Completion backends, in the configured preference order
    let backends = build_backends(&config)?;
    let handle = BackendHandle::new(config.evaluation.max_concurrent_calls);
    let client = CompletionClient::new(backends, config.evaluation.retry.clone(), handle);
    info!(
        "Completion client initialized (models: {})",
        config.evaluation.model_order.join(" -> ")
    );

    let pipeline = Pipeline::new(client, config.evaluation.clone());
    let port = config.port;
    let state = AppState::new(pipeline, config);

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_backends(config: &Config) -> Result<Vec<Arc<dyn CompletionBackend>>> {
    config
        .models
        .iter()
        .map(|spec| -> Result<Arc<dyn CompletionBackend>> {
            let backend: Arc<dyn CompletionBackend> = match spec.provider {
                Provider::Anthropic => {
                    let api_key = config
                        .anthropic_api_key
                        .clone()
                        .context("ANTHROPIC_API_KEY is not set")?;
                    Arc::new(
                        AnthropicBackend::new(spec.model.clone(), api_key, config.request_timeout)
                            .context("failed to build Anthropic HTTP client")?,
                    )
                }
                Provider::OpenAi => Arc::new(
                    OpenAiBackend::new(
                        spec.model.clone(),
                        config.openai_base_url.clone(),
                        config.openai_api_key.clone(),
                        config.request_timeout,
                    )
                    .context("failed to build OpenAI-compatible HTTP client")?,
                ),
            };
            info!("Registered {:?} backend for model {}", spec.provider, spec.model);
            Ok(backend)
        })
        .collect()
}
