//! Evaluation pipeline: drives one candidate through every stage.
//!
//! Flow: build prompt → request completion → parse (re-request on failure,
//!       bounded) → aggregate → assemble report.
//!
//! When the template reads an interview transcript, each answer is also
//! scored on its own with the interview template, and the per-answer scores
//! are folded into criterion means and a consistency figure.
//!
//! Each run is independent: the only thing runs share is the `CompletionClient`,
//! whose backend handle bounds concurrent model calls. Completion calls are
//! the only suspension points and the only places a run can be cancelled.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::evaluation::aggregator::{
    self, default_min_criteria, AggregationError, CriteriaAggregator, RecommendationThresholds,
    WeightTable,
};
use crate::evaluation::models::{
    AnswerScore, Criterion, EvaluationRequest, EvaluationResult, GenerationMetadata,
    InterviewBreakdown, UnscoredAnswer,
};
use crate::evaluation::parser::{
    ExpectedSchema, OutOfRangePolicy, ParseFailure, ParsedAssessment, ResponseParser,
};
use crate::evaluation::prompt_builder::{
    InputField, PromptBuilder, TemplateError, TemplateId, DEFAULT_MAX_INPUT_CHARS,
};
use crate::evaluation::report::{self, EvaluationRecord};
use crate::llm_client::prompts::JSON_ONLY_SYSTEM;
use crate::llm_client::{
    BackendExhausted, CompletionClient, CompletionRequest, GenerationParams, RetryPolicy,
};

/// Parse re-requests allowed after the first reply.
pub const DEFAULT_PARSE_REREQUESTS: u32 = 2;

// ────────────────────────────────────────────────────────────────────────────
// Settings
// ────────────────────────────────────────────────────────────────────────────

/// What to send after a reply fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepromptStrategy {
    /// Original prompt plus an instruction naming the missing fields.
    #[default]
    Stricter,
    /// Resend the original prompt unchanged.
    Same,
}

impl FromStr for RepromptStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stricter" | "strict" => Ok(RepromptStrategy::Stricter),
            "same" => Ok(RepromptStrategy::Same),
            other => Err(format!("unknown re-request strategy '{other}'")),
        }
    }
}

/// Static configuration supplied when the pipeline is constructed.
#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    /// Model ids in preference order: primary first.
    pub model_order: Vec<String>,
    pub weights: WeightTable,
    pub thresholds: RecommendationThresholds,
    pub min_criteria: usize,
    pub retry: RetryPolicy,
    pub parse_rerequests: u32,
    pub reprompt: RepromptStrategy,
    pub out_of_range: OutOfRangePolicy,
    pub params: GenerationParams,
    pub max_input_chars: usize,
    pub max_concurrent_calls: usize,
    pub batch_parallelism: usize,
    /// Score every transcript answer on its own as well as the whole run.
    pub per_answer_scoring: bool,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            model_order: Vec::new(),
            weights: WeightTable::default(),
            thresholds: RecommendationThresholds::default(),
            min_criteria: default_min_criteria(),
            retry: RetryPolicy::default(),
            parse_rerequests: DEFAULT_PARSE_REREQUESTS,
            reprompt: RepromptStrategy::default(),
            out_of_range: OutOfRangePolicy::default(),
            params: GenerationParams::default(),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            max_concurrent_calls: 4,
            batch_parallelism: 4,
            per_answer_scoring: true,
        }
    }
}

impl EvaluationSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.model_order.is_empty() {
            return Err("model order must name at least one model".to_string());
        }
        self.thresholds.validate()?;
        if self.retry.max_attempts == 0 {
            return Err("completion attempts per model must be at least 1".to_string());
        }
        // Every template must be able to reach the minimum on its own.
        let ceiling = TemplateId::ALL
            .iter()
            .map(|t| t.criteria().len())
            .min()
            .unwrap_or(Criterion::ALL.len());
        if self.min_criteria == 0 || self.min_criteria > ceiling {
            return Err(format!(
                "minimum criteria must be between 1 and {ceiling}, got {}",
                self.min_criteria
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Cancellation
// ────────────────────────────────────────────────────────────────────────────

/// Caller side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by a run at its suspension point.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, token) = cancel_pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Pends forever if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Run state and failures
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Built,
    Requested,
    Parsed,
    Aggregated,
    Reported,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Built => "built",
            RunStage::Requested => "requested",
            RunStage::Parsed => "parsed",
            RunStage::Aggregated => "aggregated",
            RunStage::Reported => "reported",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum FailureReason {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    BackendExhausted(#[from] BackendExhausted),

    #[error("unparseable reply: {0}")]
    Unparseable(ParseFailure),

    #[error(transparent)]
    InsufficientCriteria(#[from] AggregationError),

    #[error("run cancelled")]
    Cancelled,

    #[error("evaluation task aborted: {0}")]
    Aborted(String),
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Template(_) => "TEMPLATE_ERROR",
            FailureReason::BackendExhausted(_) => "BACKEND_EXHAUSTED",
            FailureReason::Unparseable(_) => "UNPARSEABLE",
            FailureReason::InsufficientCriteria(_) => "INSUFFICIENT_CRITERIA",
            FailureReason::Cancelled => "CANCELLED",
            FailureReason::Aborted(_) => "ABORTED",
        }
    }
}

/// Terminal failure of one run, with the last-known state so the caller can
/// decide whether to resubmit.
#[derive(Debug, Clone, Error)]
#[error("evaluation of '{candidate_id}' failed at {stage}: {reason}")]
pub struct RunFailure {
    pub candidate_id: String,
    pub stage: RunStage,
    pub reason: FailureReason,
    /// Backend calls made across every completion request of the run.
    pub completion_attempts: u32,
    /// Replies handed to the parser.
    pub parse_attempts: u32,
}

/// A finished run: the result plus its structured record. Other formats are
/// rendered on demand through `report::render`.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub result: EvaluationResult,
    pub record: EvaluationRecord,
}

/// One accepted reply.
struct Exchange {
    assessment: ParsedAssessment,
    degraded: bool,
    model_used: String,
    /// Backend calls beyond the first plus parse re-requests.
    retries: u32,
}

/// Mutable bookkeeping local to one run.
struct Progress<'a> {
    candidate_id: &'a str,
    stage: RunStage,
    completion_attempts: u32,
    parse_attempts: u32,
}

impl<'a> Progress<'a> {
    fn new(candidate_id: &'a str) -> Self {
        Self {
            candidate_id,
            stage: RunStage::Built,
            completion_attempts: 0,
            parse_attempts: 0,
        }
    }

    fn advance(&mut self, stage: RunStage) {
        debug!("{}: {} -> {}", self.candidate_id, self.stage, stage);
        self.stage = stage;
    }

    fn fail(&self, reason: impl Into<FailureReason>) -> RunFailure {
        let failure = RunFailure {
            candidate_id: self.candidate_id.to_string(),
            stage: self.stage,
            reason: reason.into(),
            completion_attempts: self.completion_attempts,
            parse_attempts: self.parse_attempts,
        };
        warn!("{failure}");
        failure
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pipeline
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Pipeline {
    client: CompletionClient,
    builder: PromptBuilder,
    parser: ResponseParser,
    aggregator: CriteriaAggregator,
    settings: Arc<EvaluationSettings>,
}

impl Pipeline {
    pub fn new(client: CompletionClient, settings: EvaluationSettings) -> Self {
        Self {
            client,
            builder: PromptBuilder::new(settings.max_input_chars),
            parser: ResponseParser::new(settings.out_of_range),
            aggregator: CriteriaAggregator::new(
                settings.weights.clone(),
                settings.thresholds,
                settings.min_criteria,
            ),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    /// Runs with the template implied by the request (interview-aware when a
    /// transcript is present).
    pub async fn run(
        &self,
        request: &EvaluationRequest,
        cancel: &CancelToken,
    ) -> Result<CompletedRun, RunFailure> {
        self.run_with_template(request, TemplateId::for_request(request), cancel)
            .await
    }

    pub async fn run_with_template(
        &self,
        request: &EvaluationRequest,
        template: TemplateId,
        cancel: &CancelToken,
    ) -> Result<CompletedRun, RunFailure> {
        let run_id = Uuid::new_v4();
        let mut progress = Progress::new(&request.candidate_id);
        info!(
            "Evaluating candidate {} (run {run_id}, template {template})",
            request.candidate_id
        );

        let exchange = self.converse(request, template, cancel, &mut progress).await?;
        let mut retry_count = exchange.retries;
        let mut degraded = exchange.degraded;
        let assessment = exchange.assessment;

        progress.advance(RunStage::Aggregated);
        let aggregate = self
            .aggregator
            .aggregate(&assessment.scores)
            .map_err(|e| progress.fail(e))?;
        debug!(
            "{}: composite over {} criteria",
            request.candidate_id, aggregate.criteria_used
        );

        let interview = if self.settings.per_answer_scoring && template.reads(InputField::Transcript)
        {
            let (breakdown, retries, answers_degraded) =
                self.score_answers(request, cancel, &mut progress).await?;
            retry_count += retries;
            degraded |= answers_degraded;
            Some(breakdown)
        } else {
            None
        };

        let result = EvaluationResult {
            candidate_id: request.candidate_id.clone(),
            criterion_scores: assessment.scores,
            composite_score: aggregate.composite_score,
            recommendation: aggregate.recommendation,
            metadata: GenerationMetadata {
                run_id,
                model_used: exchange.model_used,
                generated_at: Utc::now(),
                retry_count,
                template: template.as_str().to_string(),
                degraded,
            },
            strengths: assessment.strengths,
            weaknesses: assessment.weaknesses,
            summary: assessment.summary,
            skill_gaps: assessment.skill_gaps,
            interview,
        };

        progress.advance(RunStage::Reported);
        let record = report::to_record(&result);

        info!(
            "Candidate {} scored {:.1} ({}) via {}",
            result.candidate_id,
            result.composite_score,
            result.recommendation,
            result.metadata.model_used
        );
        Ok(CompletedRun { result, record })
    }

    /// Requests a completion and parses it, re-requesting within the parse
    /// budget. Cancellation is observed while a completion is pending.
    async fn converse(
        &self,
        request: &EvaluationRequest,
        template: TemplateId,
        cancel: &CancelToken,
        progress: &mut Progress<'_>,
    ) -> Result<Exchange, RunFailure> {
        let prompt = self
            .builder
            .build(request, template)
            .map_err(|e| progress.fail(e))?;
        let schema = ExpectedSchema::for_template(template);

        let mut next_prompt = prompt.clone();
        let mut retries = 0u32;
        let mut parses = 0u32;

        loop {
            progress.advance(RunStage::Requested);
            if cancel.is_cancelled() {
                return Err(progress.fail(FailureReason::Cancelled));
            }

            let completion = CompletionRequest {
                prompt: std::mem::take(&mut next_prompt),
                system: JSON_ONLY_SYSTEM.to_string(),
                params: self.settings.params,
            };
            let calls = AtomicU32::new(0);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    progress.completion_attempts += calls.load(Ordering::Relaxed);
                    return Err(progress.fail(FailureReason::Cancelled));
                }
                outcome = self.client.complete(&completion, &self.settings.model_order, &calls) => outcome,
            };
            progress.completion_attempts += calls.load(Ordering::Relaxed);
            let response = outcome.map_err(|exhausted| progress.fail(exhausted))?;
            retries += response.retries();

            progress.advance(RunStage::Parsed);
            progress.parse_attempts += 1;
            parses += 1;
            match self.parser.parse(&response.text, &schema).into_result() {
                Ok((assessment, degraded)) => {
                    if degraded {
                        info!(
                            "Reply from {} for {} parsed in degraded mode",
                            response.model_used, request.candidate_id
                        );
                    }
                    return Ok(Exchange {
                        assessment,
                        degraded,
                        model_used: response.model_used,
                        retries,
                    });
                }
                Err(failure) => {
                    if parses > self.settings.parse_rerequests {
                        return Err(progress.fail(FailureReason::Unparseable(failure)));
                    }
                    warn!(
                        "Reply for {} missing {}, re-requesting ({}/{})",
                        request.candidate_id,
                        failure.missing.join(", "),
                        parses,
                        self.settings.parse_rerequests
                    );
                    retries += 1;
                    next_prompt = match self.settings.reprompt {
                        RepromptStrategy::Stricter => self
                            .builder
                            .build_reprompt(request, template, &failure.missing)
                            .map_err(|e| progress.fail(e))?,
                        RepromptStrategy::Same => prompt.clone(),
                    };
                }
            }
        }
    }

    /// Scores each transcript answer on its own. An answer that cannot be
    /// scored is listed as unscored; only cancellation fails the run.
    /// Returns the breakdown, the retries spent and whether any reply was degraded.
    async fn score_answers(
        &self,
        request: &EvaluationRequest,
        cancel: &CancelToken,
        progress: &mut Progress<'_>,
    ) -> Result<(InterviewBreakdown, u32, bool), RunFailure> {
        let transcript = request.transcript.as_deref().unwrap_or_default();
        let mut answers = Vec::with_capacity(transcript.len());
        let mut unscored = Vec::new();
        let mut retries = 0u32;
        let mut degraded = false;

        for (index, qa) in transcript.iter().enumerate() {
            if qa.question.trim().is_empty() || qa.answer.trim().is_empty() {
                unscored.push(UnscoredAnswer {
                    index,
                    reason: "blank question or answer".to_string(),
                });
                continue;
            }
            let single = EvaluationRequest {
                transcript: Some(vec![qa.clone()]),
                ..request.clone()
            };
            let mut answer_progress = Progress::new(&request.candidate_id);
            let outcome = self
                .converse(&single, TemplateId::InterviewScoring, cancel, &mut answer_progress)
                .await;
            progress.completion_attempts += answer_progress.completion_attempts;
            progress.parse_attempts += answer_progress.parse_attempts;

            let exchange = match outcome {
                Ok(exchange) => exchange,
                Err(failure) if matches!(failure.reason, FailureReason::Cancelled) => {
                    return Err(progress.fail(FailureReason::Cancelled));
                }
                Err(failure) => {
                    warn!(
                        "Answer {} for {} left unscored: {}",
                        index + 1,
                        request.candidate_id,
                        failure.reason
                    );
                    unscored.push(UnscoredAnswer {
                        index,
                        reason: failure.reason.to_string(),
                    });
                    continue;
                }
            };
            retries += exchange.retries;
            degraded |= exchange.degraded;

            match self.aggregator.aggregate(&exchange.assessment.scores) {
                Ok(aggregate) => answers.push(AnswerScore {
                    index,
                    question: qa.question.trim().to_string(),
                    criterion_scores: exchange.assessment.scores,
                    composite_score: aggregate.composite_score,
                }),
                Err(e) => unscored.push(UnscoredAnswer {
                    index,
                    reason: e.to_string(),
                }),
            }
        }

        let breakdown = aggregator::interview_breakdown(answers, unscored);
        info!(
            "Scored {} of {} answers for {} (consistency {})",
            breakdown.answers.len(),
            transcript.len(),
            request.candidate_id,
            breakdown
                .consistency
                .map(|c| format!("{c:.1}"))
                .unwrap_or_else(|| "n/a".to_string())
        );
        Ok((breakdown, retries, degraded))
    }

    /// Evaluates every request concurrently, at most `batch_parallelism` at a
    /// time. Outcomes are returned in input order.
    pub async fn run_batch(
        &self,
        requests: Vec<EvaluationRequest>,
        cancel: &CancelToken,
    ) -> Vec<Result<CompletedRun, RunFailure>> {
        let parallel = self.settings.batch_parallelism.max(1);
        let sem = Arc::new(Semaphore::new(parallel));
        let mut join_set = JoinSet::new();
        let candidate_ids: Vec<String> =
            requests.iter().map(|r| r.candidate_id.clone()).collect();
        info!("Evaluating batch of {} (parallel {parallel})", requests.len());

        for (index, request) in requests.into_iter().enumerate() {
            let permit = sem.clone().acquire_owned().await;
            let pipeline = self.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = permit;
                (index, pipeline.run(&request, &cancel).await)
            });
        }

        let mut slots: Vec<Option<Result<CompletedRun, RunFailure>>> =
            candidate_ids.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => error!("Evaluation task failed to complete: {e}"),
            }
        }

        slots
            .into_iter()
            .zip(candidate_ids)
            .map(|(slot, candidate_id)| {
                slot.unwrap_or_else(|| {
                    Err(RunFailure {
                        candidate_id,
                        stage: RunStage::Built,
                        reason: FailureReason::Aborted("task did not complete".to_string()),
                        completion_attempts: 0,
                        parse_attempts: 0,
                    })
                })
            })
            .collect()
    }
}
