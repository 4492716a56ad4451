// Candidate evaluation pipeline.
// Stages: prompt_builder → llm_client (completion) → parser → aggregator → report.
// Every model call goes through llm_client::CompletionClient; no stage talks to a backend directly.

pub mod aggregator;
pub mod handlers;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod prompt_builder;
pub mod prompts;
pub mod report;
