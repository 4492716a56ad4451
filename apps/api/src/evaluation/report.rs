//! Report Assembler: renders an `EvaluationResult` into its two external
//! representations: the structured record and a human-readable document.
//! Pure transformations; the only failures are serialization errors and
//! unsupported output targets, both returned to the caller.

use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluation::models::{
    CriterionScore, EvaluationResult, InterviewBreakdown, Recommendation, SkillGaps,
};
use crate::evaluation::pipeline::RunFailure;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unsupported output format '{0}' (expected json or markdown)")]
    UnsupportedFormat(String),

    #[error("failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to write report: {0}")]
    Write(#[from] std::fmt::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Markdown,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Json => "application/json",
            OutputFormat::Markdown => "text/markdown; charset=utf-8",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(ReportError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// The structured record handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub candidate_id: String,
    pub criterion_scores: Vec<CriterionScore>,
    pub composite_score: f64,
    pub recommendation: Recommendation,
    pub model_used: String,
    pub generated_at: DateTime<Utc>,
}

impl From<&EvaluationResult> for EvaluationRecord {
    fn from(result: &EvaluationResult) -> Self {
        Self {
            candidate_id: result.candidate_id.clone(),
            criterion_scores: result.criterion_scores.clone(),
            composite_score: result.composite_score,
            recommendation: result.recommendation,
            model_used: result.metadata.model_used.clone(),
            generated_at: result.metadata.generated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// High when the composite or any single criterion is poor; low only when
/// both the composite and the weakest criterion are comfortably good.
pub fn assess_risk(result: &EvaluationResult) -> RiskLevel {
    let weakest = result
        .criterion_scores
        .iter()
        .map(|s| s.score)
        .fold(f64::INFINITY, f64::min);

    if result.composite_score < 50.0 || weakest < 40.0 {
        RiskLevel::High
    } else if result.composite_score >= 70.0 && weakest >= 60.0 {
        RiskLevel::Low
    } else {
        RiskLevel::Medium
    }
}

/// A rendered artifact and its media type.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub content_type: &'static str,
    pub body: String,
}

pub fn to_record(result: &EvaluationResult) -> EvaluationRecord {
    EvaluationRecord::from(result)
}

pub fn to_json(result: &EvaluationResult) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(&to_record(result))?)
}

pub fn to_markdown(result: &EvaluationResult) -> Result<String, ReportError> {
    let mut doc = String::new();
    writeln!(doc, "# Candidate Evaluation Report: {}", result.candidate_id)?;
    writeln!(doc)?;
    writeln!(doc, "## Executive Summary")?;
    writeln!(doc)?;
    writeln!(doc, "- **Composite score:** {:.1} / 100", result.composite_score)?;
    writeln!(doc, "- **Recommendation:** {}", result.recommendation)?;
    writeln!(doc, "- **Risk level:** {}", assess_risk(result).as_str())?;
    if let Some(summary) = &result.summary {
        writeln!(doc)?;
        writeln!(doc, "{}", summary.trim())?;
    }
    writeln!(doc)?;

    writeln!(doc, "## Criterion Scores")?;
    writeln!(doc)?;
    writeln!(doc, "| Criterion | Score | Rationale |")?;
    writeln!(doc, "|---|---:|---|")?;
    for s in &result.criterion_scores {
        writeln!(
            doc,
            "| {} | {:.1} | {} |",
            s.criterion.label(),
            s.score,
            table_cell(&s.rationale)
        )?;
    }
    writeln!(doc)?;

    if !result.strengths.is_empty() {
        writeln!(doc, "## Strengths")?;
        writeln!(doc)?;
        for item in &result.strengths {
            writeln!(doc, "- {item}")?;
        }
        writeln!(doc)?;
    }
    if !result.weaknesses.is_empty() {
        writeln!(doc, "## Areas of Concern")?;
        writeln!(doc)?;
        for item in &result.weaknesses {
            writeln!(doc, "- {item}")?;
        }
        writeln!(doc)?;
    }

    if !result.skill_gaps.is_empty() {
        write_skill_gaps(&mut doc, &result.skill_gaps)?;
    }
    if let Some(interview) = &result.interview {
        write_interview(&mut doc, interview)?;
    }

    let meta = &result.metadata;
    writeln!(doc, "## Generation Metadata")?;
    writeln!(doc)?;
    writeln!(doc, "- Model used: {}", meta.model_used)?;
    writeln!(doc, "- Generated at: {}", meta.generated_at.to_rfc3339())?;
    writeln!(doc, "- Template: {}", meta.template)?;
    writeln!(doc, "- Retries: {}", meta.retry_count)?;
    writeln!(
        doc,
        "- Parse quality: {}",
        if meta.degraded { "degraded" } else { "well-formed" }
    )?;
    writeln!(doc, "- Run: {}", meta.run_id)?;
    Ok(doc)
}

fn write_skill_gaps(doc: &mut String, gaps: &SkillGaps) -> Result<(), ReportError> {
    writeln!(doc, "## Skill Gaps")?;
    writeln!(doc)?;
    if !gaps.missing_technical_skills.is_empty() {
        writeln!(
            doc,
            "- **Missing technical skills:** {}",
            gaps.missing_technical_skills.join(", ")
        )?;
    }
    if !gaps.missing_tools.is_empty() {
        writeln!(doc, "- **Missing tools:** {}", gaps.missing_tools.join(", "))?;
    }
    if let Some(gap) = &gaps.experience_gap {
        writeln!(doc, "- **Experience gap:** {}", gap.trim())?;
    }
    writeln!(doc)?;
    Ok(())
}

fn write_interview(doc: &mut String, interview: &InterviewBreakdown) -> Result<(), ReportError> {
    writeln!(doc, "## Interview Breakdown")?;
    writeln!(doc)?;
    match interview.consistency {
        Some(c) => writeln!(doc, "- **Answer consistency:** {c:.1} / 100")?,
        None => writeln!(doc, "- **Answer consistency:** n/a")?,
    }
    writeln!(
        doc,
        "- **Answers scored:** {} of {}",
        interview.answers.len(),
        interview.answers.len() + interview.unscored.len()
    )?;
    writeln!(doc)?;

    if !interview.answers.is_empty() {
        writeln!(doc, "| Answer | Question | Composite |")?;
        writeln!(doc, "|---|---|---:|")?;
        for a in &interview.answers {
            writeln!(
                doc,
                "| Q{} | {} | {:.1} |",
                a.index + 1,
                table_cell(&a.question),
                a.composite_score
            )?;
        }
        writeln!(doc)?;
    }

    if !interview.criterion_means.is_empty() {
        writeln!(doc, "| Criterion | Mean | Answers |")?;
        writeln!(doc, "|---|---:|---:|")?;
        for m in &interview.criterion_means {
            writeln!(doc, "| {} | {:.1} | {} |", m.criterion.label(), m.mean, m.answers)?;
        }
        writeln!(doc)?;
    }

    for u in &interview.unscored {
        writeln!(doc, "- Q{} not scored: {}", u.index + 1, u.reason)?;
    }
    if !interview.unscored.is_empty() {
        writeln!(doc)?;
    }
    Ok(())
}

pub fn render(result: &EvaluationResult, format: OutputFormat) -> Result<Rendered, ReportError> {
    let body = match format {
        OutputFormat::Json => to_json(result)?,
        OutputFormat::Markdown => to_markdown(result)?,
    };
    Ok(Rendered {
        content_type: format.content_type(),
        body,
    })
}

/// Ranks completed candidates by composite score (descending, ties by id)
/// and lists failed runs separately.
pub fn batch_summary(
    results: &[&EvaluationResult],
    failures: &[&RunFailure],
) -> Result<String, ReportError> {
    let mut ranked: Vec<&EvaluationResult> = results.to_vec();
    ranked.sort_by(|a, b| {
        b.composite_score
            .total_cmp(&a.composite_score)
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });

    let mut doc = String::new();
    writeln!(doc, "# Candidate Comparison")?;
    writeln!(doc)?;
    writeln!(
        doc,
        "{} evaluated, {} failed.",
        ranked.len(),
        failures.len()
    )?;
    writeln!(doc)?;

    if !ranked.is_empty() {
        writeln!(doc, "| Rank | Candidate | Composite | Recommendation | Risk |")?;
        writeln!(doc, "|---:|---|---:|---|---|")?;
        for (i, r) in ranked.iter().enumerate() {
            writeln!(
                doc,
                "| {} | {} | {:.1} | {} | {} |",
                i + 1,
                table_cell(&r.candidate_id),
                r.composite_score,
                r.recommendation,
                assess_risk(r).as_str()
            )?;
        }
        writeln!(doc)?;
    }

    if !failures.is_empty() {
        writeln!(doc, "## Failed Evaluations")?;
        writeln!(doc)?;
        for f in failures {
            writeln!(doc, "- {}: failed at {} ({})", f.candidate_id, f.stage, f.reason)?;
        }
    }
    Ok(doc)
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}


#[cfg(test)]
mod tests {
    use super::fixtures::result;
    use super::*;
    use crate::evaluation::models::Criterion;
    use crate::evaluation::pipeline::{FailureReason, RunStage};

    fn sample() -> EvaluationResult {
        result(
            "cand-7",
            78.4,
            &[(Criterion::TechnicalSkill, 82.0), (Criterion::Experience, 72.5)],
        )
    }

    #[test]
    fn test_record_has_external_field_names() {
        let json = to_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "candidate_id",
                "composite_score",
                "criterion_scores",
                "generated_at",
                "model_used",
                "recommendation"
            ]
        );
        assert_eq!(value["recommendation"], "fit");
        assert_eq!(value["criterion_scores"][0]["criterion"], "technical_skill");
        assert_eq!(value["model_used"], "primary-model");
    }

    #[test]
    fn test_markdown_contains_same_fields() {
        let doc = to_markdown(&sample()).unwrap();
        assert!(doc.contains("# Candidate Evaluation Report: cand-7"));
        assert!(doc.contains("**Composite score:** 78.4 / 100"));
        assert!(doc.contains("**Recommendation:** fit"));
        assert!(doc.contains("| Technical skill | 82.0 | technical_skill rationale |"));
        assert!(doc.contains("- Model used: primary-model"));
        assert!(doc.contains("- Generated at: 2026-03-01T12:00:00+00:00"));
        assert!(doc.contains("## Strengths"));
        assert!(!doc.contains("## Areas of Concern"));
    }

    #[test]
    fn test_markdown_lists_skill_gaps_when_present() {
        let mut r = sample();
        assert!(!to_markdown(&r).unwrap().contains("## Skill Gaps"));
        r.skill_gaps = SkillGaps {
            missing_technical_skills: vec!["Kubernetes".to_string(), "gRPC".to_string()],
            missing_tools: vec![],
            experience_gap: Some("No team lead experience".to_string()),
        };
        let doc = to_markdown(&r).unwrap();
        assert!(doc.contains("## Skill Gaps"));
        assert!(doc.contains("- **Missing technical skills:** Kubernetes, gRPC"));
        assert!(!doc.contains("Missing tools"));
        assert!(doc.contains("- **Experience gap:** No team lead experience"));
    }

    #[test]
    fn test_markdown_interview_breakdown() {
        use crate::evaluation::models::{AnswerScore, CriterionMean, UnscoredAnswer};

        let mut r = sample();
        r.interview = Some(InterviewBreakdown {
            answers: vec![AnswerScore {
                index: 0,
                question: "Explain | ownership".to_string(),
                criterion_scores: vec![],
                composite_score: 74.0,
            }],
            unscored: vec![UnscoredAnswer {
                index: 1,
                reason: "answer is blank".to_string(),
            }],
            criterion_means: vec![CriterionMean {
                criterion: Criterion::Communication,
                mean: 74.0,
                answers: 1,
            }],
            consistency: Some(100.0),
        });
        let doc = to_markdown(&r).unwrap();
        assert!(doc.contains("## Interview Breakdown"));
        assert!(doc.contains("- **Answer consistency:** 100.0 / 100"));
        assert!(doc.contains("- **Answers scored:** 1 of 2"));
        assert!(doc.contains("| Q1 | Explain \\| ownership | 74.0 |"));
        assert!(doc.contains("| Communication | 74.0 | 1 |"));
        assert!(doc.contains("- Q2 not scored: answer is blank"));
        let interview_at = doc.find("## Interview Breakdown").unwrap();
        assert!(interview_at < doc.find("## Generation Metadata").unwrap());
    }

    #[test]
    fn test_table_cells_escape_pipes_and_newlines() {
        assert_eq!(table_cell("a | b\nc"), "a \\| b c");
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("MD".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        let err = "pdf".parse::<OutputFormat>().unwrap_err();
        assert!(matches!(err, ReportError::UnsupportedFormat(ref f) if f == "pdf"));
    }

    #[test]
    fn test_render_sets_content_type() {
        let rendered = render(&sample(), OutputFormat::Markdown).unwrap();
        assert!(rendered.content_type.starts_with("text/markdown"));
        let rendered = render(&sample(), OutputFormat::Json).unwrap();
        assert_eq!(rendered.content_type, "application/json");
    }

    #[test]
    fn test_risk_levels() {
        let low = result("a", 80.0, &[(Criterion::TechnicalSkill, 80.0), (Criterion::Experience, 65.0)]);
        assert_eq!(assess_risk(&low), RiskLevel::Low);
        let medium = result("b", 66.0, &[(Criterion::TechnicalSkill, 70.0), (Criterion::Experience, 55.0)]);
        assert_eq!(assess_risk(&medium), RiskLevel::Medium);
        let weak_axis = result("c", 75.0, &[(Criterion::TechnicalSkill, 95.0), (Criterion::Experience, 30.0)]);
        assert_eq!(assess_risk(&weak_axis), RiskLevel::High);
        let low_composite = result("d", 45.0, &[(Criterion::TechnicalSkill, 45.0), (Criterion::Experience, 45.0)]);
        assert_eq!(assess_risk(&low_composite), RiskLevel::High);
    }

    #[test]
    fn test_batch_summary_ranks_and_lists_failures() {
        let a = result("alice", 71.0, &[(Criterion::TechnicalSkill, 71.0), (Criterion::Experience, 71.0)]);
        let b = result("bob", 88.0, &[(Criterion::TechnicalSkill, 88.0), (Criterion::Experience, 88.0)]);
        let failure = RunFailure {
            candidate_id: "carol".to_string(),
            stage: RunStage::Requested,
            reason: FailureReason::Cancelled,
            completion_attempts: 1,
            parse_attempts: 0,
        };
        let doc = batch_summary(&[&a, &b], &[&failure]).unwrap();
        let bob_at = doc.find("| 1 | bob |").unwrap();
        let alice_at = doc.find("| 2 | alice |").unwrap();
        assert!(bob_at < alice_at);
        assert!(doc.contains("2 evaluated, 1 failed."));
        assert!(doc.contains("- carol: failed at requested (run cancelled)"));
    }
}
