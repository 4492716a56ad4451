use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lower bound of every criterion score and of the composite score.
pub const SCORE_MIN: f64 = 0.0;
/// Upper bound of every criterion score and of the composite score.
pub const SCORE_MAX: f64 = 100.0;

// ────────────────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────────────────

/// A single interview exchange, in the order it was asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// Everything the pipeline needs to evaluate one candidate.
/// Stages only ever borrow it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub candidate_id: String,
    pub cv_text: String,
    pub job_requirements: String,
    #[serde(default)]
    pub transcript: Option<Vec<QaPair>>,
}

impl EvaluationRequest {
    pub fn new(
        candidate_id: impl Into<String>,
        cv_text: impl Into<String>,
        job_requirements: impl Into<String>,
    ) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            cv_text: cv_text.into(),
            job_requirements: job_requirements.into(),
            transcript: None,
        }
    }

    pub fn with_transcript(mut self, transcript: Vec<QaPair>) -> Self {
        self.transcript = Some(transcript);
        self
    }

    /// True when a transcript with at least one exchange is attached.
    pub fn has_transcript(&self) -> bool {
        self.transcript
            .as_ref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Criteria
// ────────────────────────────────────────────────────────────────────────────

/// The fixed evaluation axes. Declaration order is report order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    TechnicalSkill,
    Experience,
    Communication,
    CulturalFit,
}

impl Criterion {
    pub const ALL: [Criterion; 4] = [
        Criterion::TechnicalSkill,
        Criterion::Experience,
        Criterion::Communication,
        Criterion::CulturalFit,
    ];

    /// Key used in the structured model output and in the record.
    pub fn key(&self) -> &'static str {
        match self {
            Criterion::TechnicalSkill => "technical_skill",
            Criterion::Experience => "experience",
            Criterion::Communication => "communication",
            Criterion::CulturalFit => "cultural_fit",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Criterion::TechnicalSkill => "Technical skill",
            Criterion::Experience => "Experience",
            Criterion::Communication => "Communication",
            Criterion::CulturalFit => "Cultural fit",
        }
    }

    /// Phrases a model is likely to use when it drifts from the JSON keys.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Criterion::TechnicalSkill => &[
                "technical_skill",
                "technical skills",
                "technical skill",
                "technical knowledge",
                "technical",
            ],
            Criterion::Experience => &["experience", "relevant experience"],
            Criterion::Communication => &["communication skills", "communication"],
            Criterion::CulturalFit => &["cultural_fit", "cultural fit", "culture fit", "culture"],
        }
    }

    /// Resolves a free-form key (`"Technical Skill"`, `"cultural-fit"`, ...) to a criterion.
    pub fn from_key(raw: &str) -> Option<Criterion> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        Criterion::ALL.into_iter().find(|c| {
            c.key() == normalized
                || c
                    .aliases()
                    .iter()
                    .any(|alias| alias.replace(' ', "_") == normalized)
        })
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Criterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Criterion::from_key(s).ok_or_else(|| format!("unknown criterion '{s}'"))
    }
}

/// One scored axis. `score` is always within `[SCORE_MIN, SCORE_MAX]` and
/// `rationale` is never empty once constructed through [`CriterionScore::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion: Criterion,
    pub score: f64,
    pub rationale: String,
}

impl CriterionScore {
    /// Returns `None` if the score is out of bounds or the rationale is blank.
    pub fn new(criterion: Criterion, score: f64, rationale: impl Into<String>) -> Option<Self> {
        let rationale = rationale.into().trim().to_string();
        if !score.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&score) || rationale.is_empty()
        {
            return None;
        }
        Some(Self {
            criterion,
            score,
            rationale,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outputs
// ────────────────────────────────────────────────────────────────────────────

/// Gaps between the CV and the job requirements, as reported by the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SkillGaps {
    #[serde(default)]
    pub missing_technical_skills: Vec<String>,
    #[serde(default)]
    pub missing_tools: Vec<String>,
    #[serde(default)]
    pub experience_gap: Option<String>,
}

impl SkillGaps {
    pub fn is_empty(&self) -> bool {
        self.missing_technical_skills.is_empty()
            && self.missing_tools.is_empty()
            && self.experience_gap.is_none()
    }
}

/// One interview answer scored on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerScore {
    /// Position in the transcript, 0-based.
    pub index: usize,
    pub question: String,
    pub criterion_scores: Vec<CriterionScore>,
    pub composite_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnscoredAnswer {
    pub index: usize,
    pub reason: String,
}

/// Mean of one criterion across every scored answer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CriterionMean {
    pub criterion: Criterion,
    pub mean: f64,
    pub answers: usize,
}

/// Per-answer view of an interview transcript.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InterviewBreakdown {
    pub answers: Vec<AnswerScore>,
    pub unscored: Vec<UnscoredAnswer>,
    pub criterion_means: Vec<CriterionMean>,
    /// 0-100, higher means the answers scored more alike. `None` when no
    /// answer could be scored.
    pub consistency: Option<f64>,
}

/// Hiring recommendation band derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    StrongFit,
    Fit,
    WeakFit,
    NoFit,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongFit => "strong-fit",
            Recommendation::Fit => "fit",
            Recommendation::WeakFit => "weak-fit",
            Recommendation::NoFit => "no-fit",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the final result was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub run_id: Uuid,
    pub model_used: String,
    pub generated_at: DateTime<Utc>,
    /// Completion retries (same-model and fallback) plus parse re-requests.
    pub retry_count: u32,
    pub template: String,
    /// True when the accepted parse needed heuristic extraction or clamping.
    pub degraded: bool,
}

/// The assembled outcome of one pipeline run. Re-evaluation produces a new
/// value rather than mutating an old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub candidate_id: String,
    pub criterion_scores: Vec<CriterionScore>,
    pub composite_score: f64,
    pub recommendation: Recommendation,
    pub metadata: GenerationMetadata,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub skill_gaps: SkillGaps,
    #[serde(default)]
    pub interview: Option<InterviewBreakdown>,
}
