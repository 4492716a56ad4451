use std::sync::Arc;

use crate::config::Config;
use crate::evaluation::pipeline::Pipeline;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, config: Config) -> Self {
        Self {
            pipeline,
            config: Arc::new(config),
        }
    }
}
