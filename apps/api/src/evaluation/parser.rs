//! Response Parser: extracts criterion scores from raw model text.
//!
//! Two passes:
//! 1. Strict: the reply (optionally fenced) is the JSON object the prompt asked for.
//! 2. Heuristic: for every criterion the strict pass did not yield, look for a
//!    score-like number near the criterion's name in the raw text.
//!
//! A reply is `WellFormed` only if the strict pass produced every required
//! criterion without clamping. Anything recovered by the second pass, or
//! clamped into bounds, is `Degraded`. If required criteria are still missing
//! the outcome is `Failure` with the list of missing fields.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::evaluation::models::{Criterion, CriterionScore, SkillGaps, SCORE_MAX, SCORE_MIN};
use crate::evaluation::prompt_builder::TemplateId;

/// Characters of slack allowed between a criterion name and its score.
const MAX_LABEL_GAP: usize = 40;
/// How far past a heuristic score to look for a labelled rationale.
const RATIONALE_WINDOW: usize = 300;

lazy_static! {
    static ref CRITERION_PATTERNS: HashMap<Criterion, Regex> = Criterion::ALL
        .iter()
        .map(|c| (*c, criterion_pattern(*c)))
        .collect();
    static ref ALIAS_MENTIONS: HashMap<Criterion, Regex> = Criterion::ALL
        .iter()
        .map(|c| (*c, alias_mention(*c)))
        .collect();
    static ref RATIONALE_FIELD: Regex =
        Regex::new(r#"(?i)"?(?:rationale|reason|justification)"?\s*[:=]\s*"([^"\n]+)""#).unwrap();
    static ref LABEL_PREFIX: Regex =
        Regex::new(r"(?i)^(?:rationale|reason|justification|because)\s*[:=\-]?\s*").unwrap();
}

/// Alternation over a criterion's aliases, longest first. Words may be joined
/// by spaces, underscores or hyphens but never by a line break.
fn alias_alternation(criterion: Criterion) -> String {
    let mut aliases: Vec<&str> = criterion.aliases().to_vec();
    aliases.sort_by_key(|a| std::cmp::Reverse(a.len()));
    aliases
        .iter()
        .map(|a| {
            a.split(|ch: char| ch == ' ' || ch == '_')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"[ \t_\-]+")
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// A criterion name in label position followed by a score on the same line.
///
/// Label position is the start of a line (after list bullets, heading marks or
/// emphasis), a table cell, or a quoted JSON key followed by `:`. The gap to
/// the number holds no digits and stops at a line break, `,` or `;`, except
/// for a line break straight into a `score` key.
fn criterion_pattern(criterion: Criterion) -> Regex {
    let alternation = alias_alternation(criterion);
    let pattern = format!(
        r#"(?im)(?:(?:^[ \t]*(?:(?:[-*•>#{{]+|\d{{1,2}}[.)])[ \t]*)*|\|[ \t]*)[*_"]*(?:{alternation})\b|"(?:{alternation})"[ \t]*:)(?P<gap>[^\d\n;,]{{0,{MAX_LABEL_GAP}}}?|[^\d\n;,]{{0,{MAX_LABEL_GAP}}}?\n[ \t]*"?score"?[ \t]*[:=][ \t]*)(?P<score>-?\d{{1,3}}(?:\.\d+)?)\b(?:[ \t]*/[ \t]*(?P<scale>100|10)\b)?"#
    );
    Regex::new(&pattern).unwrap()
}

/// Any mention of a criterion, wherever it appears.
fn alias_mention(criterion: Criterion) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{})\b", alias_alternation(criterion))).unwrap()
}

// ────────────────────────────────────────────────────────────────────────────
// Schema and policy
// ────────────────────────────────────────────────────────────────────────────

/// What to do with a score outside the declared bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRangePolicy {
    /// Clamp to the nearest bound and flag the result as degraded.
    #[default]
    Clamp,
    /// Treat the field as missing.
    Reject,
}

impl FromStr for OutOfRangePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clamp" => Ok(OutOfRangePolicy::Clamp),
            "reject" => Ok(OutOfRangePolicy::Reject),
            other => Err(format!("unknown out-of-range policy '{other}'")),
        }
    }
}

/// The fields a reply must contain and their value domain.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedSchema {
    pub required: Vec<Criterion>,
    pub min: f64,
    pub max: f64,
}

impl ExpectedSchema {
    pub fn new(required: Vec<Criterion>) -> Self {
        Self {
            required,
            min: SCORE_MIN,
            max: SCORE_MAX,
        }
    }

    pub fn for_template(template: TemplateId) -> Self {
        Self::new(template.criteria().to_vec())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outcome types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ParsedAssessment {
    /// Ordered by criterion declaration order.
    pub scores: Vec<CriterionScore>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub summary: Option<String>,
    /// Optional: never makes a reply degraded or failed.
    pub skill_gaps: SkillGaps,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradeReason {
    /// Recovered by the heuristic pass.
    Heuristic { criterion: Criterion },
    /// Raw score was outside the declared bounds and was clamped.
    Clamped { criterion: Criterion, raw: f64 },
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradeReason::Heuristic { criterion } => {
                write!(f, "{criterion} recovered heuristically")
            }
            DegradeReason::Clamped { criterion, raw } => {
                write!(f, "{criterion} clamped from {raw}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("reply missing required field(s): {}", .missing.join(", "))]
pub struct ParseFailure {
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    WellFormed(ParsedAssessment),
    Degraded {
        assessment: ParsedAssessment,
        reasons: Vec<DegradeReason>,
    },
    Failure(ParseFailure),
}

impl ParseOutcome {
    #[cfg(test)]
    pub fn is_well_formed(&self) -> bool {
        matches!(self, ParseOutcome::WellFormed(_))
    }

    /// Splits a successful outcome into its assessment and a degraded flag.
    pub fn into_result(self) -> Result<(ParsedAssessment, bool), ParseFailure> {
        match self {
            ParseOutcome::WellFormed(a) => Ok((a, false)),
            ParseOutcome::Degraded { assessment, .. } => Ok((assessment, true)),
            ParseOutcome::Failure(f) => Err(f),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Parser
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    policy: OutOfRangePolicy,
}

/// One criterion value before bounds are applied.
struct RawScore {
    score: f64,
    rationale: String,
}

impl ResponseParser {
    pub fn new(policy: OutOfRangePolicy) -> Self {
        Self { policy }
    }

    pub fn parse(&self, raw_text: &str, schema: &ExpectedSchema) -> ParseOutcome {
        let mut assessment = ParsedAssessment::default();
        let mut reasons = Vec::new();
        let mut found: HashMap<Criterion, CriterionScore> = HashMap::new();

        // Pass 1: strict JSON
        let strict = strict_extract(raw_text, &schema.required, &mut assessment);
        for (criterion, raw) in strict {
            if let Some(score) = self.bound(criterion, raw, schema, &mut reasons) {
                found.insert(criterion, score);
            }
        }

        // Pass 2: heuristic, only for what is still missing
        for criterion in schema.required.iter().copied() {
            if found.contains_key(&criterion) {
                continue;
            }
            if let Some(raw) = heuristic_extract(raw_text, criterion) {
                if let Some(score) = self.bound(criterion, raw, schema, &mut reasons) {
                    reasons.push(DegradeReason::Heuristic { criterion });
                    found.insert(criterion, score);
                }
            }
        }

        let missing: Vec<String> = schema
            .required
            .iter()
            .filter(|c| !found.contains_key(c))
            .map(|c| c.key().to_string())
            .collect();
        if !missing.is_empty() {
            debug!("Parse failed, missing: {}", missing.join(", "));
            return ParseOutcome::Failure(ParseFailure { missing });
        }

        let mut scores: Vec<CriterionScore> = found.into_values().collect();
        scores.sort_by_key(|s| s.criterion);
        assessment.scores = scores;

        if reasons.is_empty() {
            ParseOutcome::WellFormed(assessment)
        } else {
            ParseOutcome::Degraded {
                assessment,
                reasons,
            }
        }
    }

    /// Applies the out-of-range policy. `None` means the field is treated as missing.
    fn bound(
        &self,
        criterion: Criterion,
        raw: RawScore,
        schema: &ExpectedSchema,
        reasons: &mut Vec<DegradeReason>,
    ) -> Option<CriterionScore> {
        if !raw.score.is_finite() {
            return None;
        }
        let mut score = raw.score;
        if score < schema.min || score > schema.max {
            match self.policy {
                OutOfRangePolicy::Reject => return None,
                OutOfRangePolicy::Clamp => {
                    score = score.clamp(schema.min, schema.max);
                    reasons.push(DegradeReason::Clamped {
                        criterion,
                        raw: raw.score,
                    });
                }
            }
        }
        CriterionScore::new(criterion, score, raw.rationale)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Strict pass
// ────────────────────────────────────────────────────────────────────────────

/// Strips ```json ... ``` or ``` ... ``` code fences from model output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}

/// The outermost `{ ... }` span of the text, if any.
fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn strict_extract(
    raw_text: &str,
    required: &[Criterion],
    assessment: &mut ParsedAssessment,
) -> Vec<(Criterion, RawScore)> {
    let Some(object) = outermost_object(strip_json_fences(raw_text)) else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(object) else {
        return Vec::new();
    };

    assessment.strengths = string_list(value.get("strengths"));
    assessment.weaknesses = string_list(value.get("weaknesses"));
    assessment.summary = value
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if let Some(gaps) = value.get("skill_gaps") {
        assessment.skill_gaps = SkillGaps {
            missing_technical_skills: string_list(gaps.get("missing_technical_skills")),
            missing_tools: string_list(gaps.get("missing_tools")),
            experience_gap: gaps
                .get("experience_gap")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };
    }

    let Some(criteria) = value.get("criteria").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (key, entry) in criteria {
        let Some(criterion) = Criterion::from_key(key) else {
            continue;
        };
        if !required.contains(&criterion) || out.iter().any(|(c, _)| *c == criterion) {
            continue;
        }
        let score = entry.get("score").and_then(Value::as_f64);
        let rationale = entry
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let (Some(score), Some(rationale)) = (score, rationale) {
            out.push((
                criterion,
                RawScore {
                    score,
                    rationale: rationale.to_string(),
                },
            ));
        }
    }
    out
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ────────────────────────────────────────────────────────────────────────────
// Heuristic pass
// ────────────────────────────────────────────────────────────────────────────

fn heuristic_extract(raw_text: &str, criterion: Criterion) -> Option<RawScore> {
    let pattern = CRITERION_PATTERNS.get(&criterion)?;

    for caps in pattern.captures_iter(raw_text) {
        let gap = caps.name("gap").map(|m| m.as_str()).unwrap_or_default();
        if names_other_criterion(gap, criterion) {
            continue;
        }
        let Some(Ok(mut score)) = caps.name("score").map(|m| m.as_str().parse::<f64>()) else {
            continue;
        };
        if caps.name("scale").map(|m| m.as_str()) == Some("10") {
            score *= 10.0;
        }
        let tail = &raw_text[caps.get(0).map(|m| m.end()).unwrap_or(raw_text.len())..];
        if let Some(rationale) = rationale_after(tail) {
            return Some(RawScore { score, rationale });
        }
    }
    None
}

/// True when `text` mentions a criterion other than `criterion`.
fn names_other_criterion(text: &str, criterion: Criterion) -> bool {
    ALIAS_MENTIONS
        .iter()
        .any(|(other, mention)| *other != criterion && mention.is_match(text))
}

/// Finds a rationale following a heuristic score: a labelled field within the
/// same object, else the rest of the line, else the next non-empty line.
fn rationale_after(tail: &str) -> Option<String> {
    let window_end = tail
        .char_indices()
        .take_while(|(i, _)| *i < RATIONALE_WINDOW)
        .find(|(_, c)| *c == '}')
        .map(|(i, _)| i)
        .unwrap_or_else(|| {
            tail.char_indices()
                .nth(RATIONALE_WINDOW)
                .map(|(i, _)| i)
                .unwrap_or(tail.len())
        });
    if let Some(caps) = RATIONALE_FIELD.captures(&tail[..window_end]) {
        if let Some(text) = clean_fragment(&caps[1]) {
            return Some(text);
        }
    }

    let mut lines = tail.lines();
    if let Some(text) = lines
        .next()
        .and_then(clean_fragment)
        .filter(|text| !is_criterion_label(text))
    {
        return Some(text);
    }
    lines
        .find(|l| !l.trim().is_empty())
        .and_then(clean_fragment)
        .filter(|text| !is_criterion_label(text))
}

/// Trims punctuation and a leading label; `None` unless something wordy remains.
fn clean_fragment(fragment: &str) -> Option<String> {
    const LEAD: &[char] = &[
        ' ', '\t', '"', '\'', '{', '}', '[', ']', ',', ':', ';', '-', '–', '—', '.', ')', '(', '*',
        '|',
    ];
    const TRAIL: &[char] = &[
        ' ', '\t', '"', '\'', '{', '}', '[', ']', ',', ':', ';', '-', '–', '—', '*', '|',
    ];
    let trimmed = fragment.trim_start_matches(LEAD).trim_end_matches(TRAIL);
    let unlabelled = LABEL_PREFIX.replace(trimmed, "");
    let cleaned = unlabelled.trim_start_matches(LEAD).trim_end_matches(TRAIL);
    cleaned
        .chars()
        .any(char::is_alphabetic)
        .then(|| cleaned.to_string())
}

/// A line such as `Experience: 70` or `technical skill = 8`, as opposed to a
/// sentence that merely starts with a criterion name.
fn is_criterion_label(text: &str) -> bool {
    let lower = text
        .trim_start_matches(|ch: char| ch.is_whitespace() || matches!(ch, '*' | '"' | '#' | '-'))
        .to_lowercase();
    Criterion::ALL
        .iter()
        .flat_map(|c| c.aliases().iter())
        .any(|alias| {
            lower.strip_prefix(alias).is_some_and(|rest| {
                rest.trim_start_matches(|ch: char| ch.is_whitespace() || matches!(ch, '*' | '"' | '_'))
                    .starts_with(|ch: char| ch == ':' || ch == '=' || ch.is_ascii_digit())
            })
        })
}
