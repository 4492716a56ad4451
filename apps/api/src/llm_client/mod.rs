/// Completion Client: the single point of entry for all model calls.
///
/// ARCHITECTURAL RULE: No other module may talk to a model backend directly.
/// Pipeline stages hand a prompt to `CompletionClient::complete` and get back
/// text tagged with the model that actually answered.
///
/// Backends are interchangeable implementations of `CompletionBackend`; the
/// fallback order is data (a list of model ids), never a branch on a name.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

pub mod anthropic;
pub mod openai;
pub mod prompts;

// ────────────────────────────────────────────────────────────────────────────
// Wire contract
// ────────────────────────────────────────────────────────────────────────────

/// Sampling parameters forwarded to every backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: String,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Ok,
    Timeout,
    Unavailable,
    Refused,
}

impl CompletionStatus {
    /// Transient failures are retried on the same model; `Refused` is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionStatus::Timeout | CompletionStatus::Unavailable)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionStatus::Ok => "ok",
            CompletionStatus::Timeout => "timeout",
            CompletionStatus::Unavailable => "unavailable",
            CompletionStatus::Refused => "refused",
        };
        f.write_str(s)
    }
}

/// Raw reply from a single backend call.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub text: String,
    pub status: CompletionStatus,
}

impl BackendReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: CompletionStatus::Ok,
        }
    }

    pub fn failed(status: CompletionStatus, detail: impl Into<String>) -> Self {
        Self {
            text: detail.into(),
            status,
        }
    }
}

/// Successful completion, tagged with the model that produced it.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub model_used: String,
    /// Total backend calls made, across every model tried.
    pub attempts: u32,
}

impl CompletionResponse {
    /// Calls beyond the first one.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// A text-completion capability. Implementations never return `Err`: every
/// outcome is expressed through `BackendReply::status`.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> BackendReply;
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelFailure {
    pub model: String,
    pub last_status: Option<CompletionStatus>,
    pub attempts: u32,
    pub detail: String,
}

impl fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_status {
            Some(status) => write!(
                f,
                "{} ({} after {} attempt(s): {})",
                self.model, status, self.attempts, self.detail
            ),
            None => write!(f, "{} ({})", self.model, self.detail),
        }
    }
}

/// Every model in the preference order failed after its retry budget.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("all models failed: {}", describe_failures(.failures))]
pub struct BackendExhausted {
    pub failures: Vec<ModelFailure>,
}

fn describe_failures(failures: &[ModelFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl BackendExhausted {
    #[cfg(test)]
    pub fn total_attempts(&self) -> u32 {
        self.failures.iter().map(|f| f.attempts).sum()
    }

    #[cfg(test)]
    pub fn models(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.model.as_str()).collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Retry policy and backend resource handle
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Calls per model, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single backend call.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `retry` (1-based): base, 2x, 4x ... capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Owned handle on backend capacity. Each backend call holds one permit for
/// its duration; the permit is released when the call returns or is dropped.
#[derive(Clone)]
pub struct BackendHandle {
    permits: Arc<Semaphore>,
}

impl BackendHandle {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

/// Ordered-fallback client over a registry of backends.
#[derive(Clone)]
pub struct CompletionClient {
    backends: HashMap<String, Arc<dyn CompletionBackend>>,
    retry: RetryPolicy,
    handle: BackendHandle,
}

impl CompletionClient {
    pub fn new(
        backends: Vec<Arc<dyn CompletionBackend>>,
        retry: RetryPolicy,
        handle: BackendHandle,
    ) -> Self {
        let backends = backends
            .into_iter()
            .map(|b| (b.model_id().to_string(), b))
            .collect();
        Self {
            backends,
            retry,
            handle,
        }
    }

    /// Tries each model in `preference` order. Transient failures are retried
    /// on the same model with backoff; refusals and exhausted budgets advance
    /// to the next model.
    ///
    /// `calls` is bumped as each backend call goes out, so a caller that drops
    /// this future part-way still knows how many calls were made.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        preference: &[String],
        calls: &AtomicU32,
    ) -> Result<CompletionResponse, BackendExhausted> {
        let mut failures = Vec::with_capacity(preference.len());
        let mut total_attempts = 0u32;

        for model in preference {
            let Some(backend) = self.backends.get(model) else {
                warn!("No backend registered for model {model}, skipping");
                failures.push(ModelFailure {
                    model: model.clone(),
                    last_status: None,
                    attempts: 0,
                    detail: "no backend registered".to_string(),
                });
                continue;
            };

            let mut last = BackendReply::failed(CompletionStatus::Unavailable, "not attempted");
            let mut attempts = 0u32;

            for attempt in 0..self.retry.max_attempts.max(1) {
                if attempt > 0 {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "Model {} attempt {} returned {}, retrying after {}ms...",
                        model,
                        attempt,
                        last.status,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }

                attempts += 1;
                total_attempts += 1;
                calls.fetch_add(1, Ordering::Relaxed);
                last = self.call_once(backend.as_ref(), request).await;

                match last.status {
                    CompletionStatus::Ok if last.text.trim().is_empty() => {
                        last = BackendReply::failed(
                            CompletionStatus::Refused,
                            "backend returned empty content",
                        );
                        break;
                    }
                    CompletionStatus::Ok => {
                        debug!("Model {model} answered after {attempts} attempt(s)");
                        if !failures.is_empty() {
                            info!("Fell back to model {model}");
                        }
                        return Ok(CompletionResponse {
                            text: last.text,
                            model_used: model.clone(),
                            attempts: total_attempts,
                        });
                    }
                    status if status.is_transient() => continue,
                    _ => break,
                }
            }

            warn!(
                "Model {} gave up after {} attempt(s): {}",
                model, attempts, last.status
            );
            failures.push(ModelFailure {
                model: model.clone(),
                last_status: Some(last.status),
                attempts,
                detail: truncate_detail(&last.text),
            });
        }

        Err(BackendExhausted { failures })
    }

    async fn call_once(
        &self,
        backend: &dyn CompletionBackend,
        request: &CompletionRequest,
    ) -> BackendReply {
        let Some(_permit) = self.handle.acquire().await else {
            return BackendReply::failed(CompletionStatus::Unavailable, "backend handle closed");
        };
        match tokio::time::timeout(self.retry.attempt_timeout, backend.complete(request)).await {
            Ok(reply) => reply,
            Err(_) => BackendReply::failed(
                CompletionStatus::Timeout,
                format!(
                    "no reply within {}ms",
                    self.retry.attempt_timeout.as_millis()
                ),
            ),
        }
    }
}

/// Maps an HTTP status from a backend API to the completion status domain.
pub(crate) fn status_for_http(code: u16) -> CompletionStatus {
    match code {
        200..=299 => CompletionStatus::Ok,
        408 => CompletionStatus::Timeout,
        429 | 500..=599 => CompletionStatus::Unavailable,
        _ => CompletionStatus::Refused,
    }
}

/// Maps a transport-level failure to the completion status domain.
pub(crate) fn status_for_transport(err: &reqwest::Error) -> CompletionStatus {
    if err.is_timeout() {
        CompletionStatus::Timeout
    } else {
        CompletionStatus::Unavailable
    }
}

fn truncate_detail(text: &str) -> String {
    text.chars().take(200).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Backend that always answers with the same status.
    pub struct FixedBackend {
        pub model: String,
        pub reply: BackendReply,
        pub calls: AtomicU32,
    }

    impl FixedBackend {
        pub fn new(model: &str, status: CompletionStatus, text: &str) -> Arc<Self> {
            Arc::new(Self {
                model: model.to_string(),
                reply: BackendReply {
                    text: text.to_string(),
                    status,
                },
                calls: AtomicU32::new(0),
            })
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionBackend for FixedBackend {
        fn model_id(&self) -> &str {
            &self.model
        }

        async fn complete(&self, _request: &CompletionRequest) -> BackendReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    /// Backend that plays back a queue of replies, repeating the last one.
    pub struct ScriptedBackend {
        pub model: String,
        replies: Mutex<VecDeque<BackendReply>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        pub fn new(model: &str, replies: Vec<BackendReply>) -> Arc<Self> {
            Arc::new(Self {
                model: model.to_string(),
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn model_id(&self) -> &str {
            &self.model
        }

        async fn complete(&self, request: &CompletionRequest) -> BackendReply {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies
                    .front()
                    .cloned()
                    .unwrap_or_else(|| BackendReply::failed(CompletionStatus::Unavailable, "empty script"))
            }
        }
    }

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    pub fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.to_string(),
            system: "system".to_string(),
            params: GenerationParams::default(),
        }
    }
}
