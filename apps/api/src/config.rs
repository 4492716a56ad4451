use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::evaluation::aggregator::{RecommendationThresholds, WeightTable};
use crate::evaluation::models::Criterion;
use crate::evaluation::pipeline::EvaluationSettings;
use crate::llm_client::openai::DEFAULT_BASE_URL;

/// Primary model only; set EVAL_MODEL_ORDER to add fallbacks.
pub const DEFAULT_MODEL_ORDER: &str = "anthropic:claude-sonnet-4-5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

/// One entry of the model preference order, written `provider:model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model: String,
}

impl FromStr for ModelSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (provider, model) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("model '{s}' must be written provider:model"))?;
        let provider = match provider.trim().to_lowercase().as_str() {
            "anthropic" => Provider::Anthropic,
            "openai" => Provider::OpenAi,
            other => bail!("unknown model provider '{other}' (expected anthropic or openai)"),
        };
        let model = model.trim();
        if model.is_empty() {
            bail!("model name missing in '{s}'");
        }
        Ok(ModelSpec {
            provider,
            model: model.to_string(),
        })
    }
}

/// Application configuration loaded from environment variables.
/// Fails at startup on malformed values or a missing key for a configured provider.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rust_log: String,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub models: Vec<ModelSpec>,
    /// HTTP timeout for a single backend call.
    pub request_timeout: Duration,
    /// Deadline after which an in-flight evaluation is cancelled.
    pub run_timeout: Duration,
    pub evaluation: EvaluationSettings,
}

impl Default for Config {
    fn default() -> Self {
        let models = parse_model_order(DEFAULT_MODEL_ORDER).unwrap_or_default();
        let evaluation = EvaluationSettings {
            model_order: models.iter().map(|m| m.model.clone()).collect(),
            ..EvaluationSettings::default()
        };
        Self {
            port: 8080,
            rust_log: "info".to_string(),
            anthropic_api_key: None,
            openai_api_key: None,
            openai_base_url: DEFAULT_BASE_URL.to_string(),
            models,
            request_timeout: evaluation.retry.attempt_timeout,
            run_timeout: Duration::from_secs(600),
            evaluation,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Config::default();
        let mut evaluation = defaults.evaluation;

        let models = match var("EVAL_MODEL_ORDER") {
            Some(raw) => parse_model_order(&raw).context("EVAL_MODEL_ORDER is invalid")?,
            None => defaults.models,
        };
        evaluation.model_order = models.iter().map(|m| m.model.clone()).collect();

        let anthropic_api_key = var("ANTHROPIC_API_KEY");
        if anthropic_api_key.is_none() && models.iter().any(|m| m.provider == Provider::Anthropic) {
            bail!("ANTHROPIC_API_KEY must be set when EVAL_MODEL_ORDER names an anthropic model");
        }

        if let Some(raw) = var("EVAL_WEIGHTS") {
            evaluation.weights = parse_weights(&raw).context("EVAL_WEIGHTS is invalid")?;
        }
        if let Some(raw) = var("EVAL_THRESHOLDS") {
            evaluation.thresholds =
                parse_thresholds(&raw).context("EVAL_THRESHOLDS is invalid")?;
        }

        let request_timeout = Duration::from_secs(parse_var(
            var("EVAL_REQUEST_TIMEOUT_SECS"),
            "EVAL_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?);
        evaluation.retry.attempt_timeout = request_timeout;
        evaluation.retry.max_attempts = parse_var(
            var("EVAL_MAX_ATTEMPTS"),
            "EVAL_MAX_ATTEMPTS",
            evaluation.retry.max_attempts,
        )?;
        evaluation.retry.base_delay = Duration::from_millis(parse_var(
            var("EVAL_BACKOFF_BASE_MS"),
            "EVAL_BACKOFF_BASE_MS",
            evaluation.retry.base_delay.as_millis() as u64,
        )?);
        evaluation.retry.max_delay = Duration::from_millis(parse_var(
            var("EVAL_BACKOFF_MAX_MS"),
            "EVAL_BACKOFF_MAX_MS",
            evaluation.retry.max_delay.as_millis() as u64,
        )?);
        evaluation.parse_rerequests = parse_var(
            var("EVAL_PARSE_REREQUESTS"),
            "EVAL_PARSE_REREQUESTS",
            evaluation.parse_rerequests,
        )?;
        evaluation.min_criteria = parse_var(
            var("EVAL_MIN_CRITERIA"),
            "EVAL_MIN_CRITERIA",
            evaluation.min_criteria,
        )?;
        evaluation.out_of_range =
            parse_var(var("EVAL_OUT_OF_RANGE"), "EVAL_OUT_OF_RANGE", evaluation.out_of_range)?;
        evaluation.reprompt = parse_var(var("EVAL_REPROMPT"), "EVAL_REPROMPT", evaluation.reprompt)?;
        evaluation.params.temperature = parse_var(
            var("EVAL_TEMPERATURE"),
            "EVAL_TEMPERATURE",
            evaluation.params.temperature,
        )?;
        evaluation.params.max_tokens =
            parse_var(var("EVAL_MAX_TOKENS"), "EVAL_MAX_TOKENS", evaluation.params.max_tokens)?;
        evaluation.max_input_chars = parse_var(
            var("EVAL_MAX_INPUT_CHARS"),
            "EVAL_MAX_INPUT_CHARS",
            evaluation.max_input_chars,
        )?;
        evaluation.max_concurrent_calls = parse_var(
            var("EVAL_MAX_CONCURRENT_CALLS"),
            "EVAL_MAX_CONCURRENT_CALLS",
            evaluation.max_concurrent_calls,
        )?;
        evaluation.batch_parallelism = parse_var(
            var("EVAL_BATCH_PARALLELISM"),
            "EVAL_BATCH_PARALLELISM",
            evaluation.batch_parallelism,
        )?;
        evaluation.per_answer_scoring = parse_var(
            var("EVAL_PER_ANSWER_SCORING"),
            "EVAL_PER_ANSWER_SCORING",
            evaluation.per_answer_scoring,
        )?;
        evaluation.validate().map_err(|e| anyhow!(e))?;

        Ok(Config {
            port: parse_var(var("PORT"), "PORT", defaults.port)?,
            rust_log: var("RUST_LOG").unwrap_or(defaults.rust_log),
            anthropic_api_key,
            openai_api_key: var("OPENAI_API_KEY"),
            openai_base_url: var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            models,
            request_timeout,
            run_timeout: Duration::from_secs(parse_var(
                var("EVAL_RUN_TIMEOUT_SECS"),
                "EVAL_RUN_TIMEOUT_SECS",
                defaults.run_timeout.as_secs(),
            )?),
            evaluation,
        })
    }
}

fn parse_var<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("{key} has invalid value '{raw}': {e}")),
    }
}

/// `anthropic:claude-sonnet-4-5, openai:gpt-4o-mini`, primary first.
fn parse_model_order(raw: &str) -> Result<Vec<ModelSpec>> {
    let models: Vec<ModelSpec> = raw
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect::<Result<_>>()?;
    if models.is_empty() {
        bail!("at least one model is required");
    }
    let mut seen = HashSet::new();
    for m in &models {
        if !seen.insert(m.model.as_str()) {
            bail!("model '{}' is listed more than once", m.model);
        }
    }
    Ok(models)
}

/// `technical_skill=0.4,experience=0.3`; unlisted criteria get no weight.
fn parse_weights(raw: &str) -> Result<WeightTable> {
    let mut pairs = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("'{part}' must be written criterion=weight"))?;
        let criterion: Criterion = key.parse().map_err(|e: String| anyhow!(e))?;
        let weight: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("weight for {criterion} is not a number"))?;
        pairs.push((criterion, weight));
    }
    WeightTable::new(pairs).map_err(|e| anyhow!(e))
}

/// `strong_fit,fit,weak_fit` lower bounds, e.g. `85,65,40`.
fn parse_thresholds(raw: &str) -> Result<RecommendationThresholds> {
    let values: Vec<f64> = raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .context("thresholds must be numbers")?;
    let [strong_fit, fit, weak_fit] = values[..] else {
        bail!("expected three thresholds, got {}", values.len());
    };
    let thresholds = RecommendationThresholds {
        strong_fit,
        fit,
        weak_fit,
    };
    thresholds.validate().map_err(|e| anyhow!(e))?;
    Ok(thresholds)
}
