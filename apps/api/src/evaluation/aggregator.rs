//! Criteria Aggregator: combines per-criterion scores into a composite score
//! and a recommendation band.
//!
//! composite = Σ(weight × score) / Σ(weight), over criteria that were actually
//! scored AND have a weight. Missing criteria are excluded from both sums.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluation::models::{
    AnswerScore, Criterion, CriterionMean, CriterionScore, InterviewBreakdown, Recommendation,
    UnscoredAnswer, SCORE_MAX, SCORE_MIN,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("only {scored} criteria scored, at least {required} required")]
    InsufficientCriteria { scored: usize, required: usize },
}

/// Non-negative weight per criterion. Weights need not sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTable(BTreeMap<Criterion, f64>);

impl Default for WeightTable {
    fn default() -> Self {
        Self(BTreeMap::from([
            (Criterion::TechnicalSkill, 0.35),
            (Criterion::Experience, 0.25),
            (Criterion::Communication, 0.20),
            (Criterion::CulturalFit, 0.20),
        ]))
    }
}

impl WeightTable {
    /// Rejects negative or non-finite weights.
    pub fn new(weights: impl IntoIterator<Item = (Criterion, f64)>) -> Result<Self, String> {
        let mut table = BTreeMap::new();
        for (criterion, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(format!("weight for {criterion} must be a non-negative number"));
            }
            table.insert(criterion, weight);
        }
        Ok(Self(table))
    }

    pub fn weight(&self, criterion: Criterion) -> Option<f64> {
        self.0.get(&criterion).copied()
    }
}

/// Lower bounds (inclusive) of each recommendation band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecommendationThresholds {
    pub strong_fit: f64,
    pub fit: f64,
    pub weak_fit: f64,
}

impl Default for RecommendationThresholds {
    fn default() -> Self {
        Self {
            strong_fit: 85.0,
            fit: 65.0,
            weak_fit: 40.0,
        }
    }
}

impl RecommendationThresholds {
    /// Cut points must be strictly descending and inside the score bounds.
    pub fn validate(&self) -> Result<(), String> {
        let in_bounds = |v: f64| (SCORE_MIN..=SCORE_MAX).contains(&v);
        if !(in_bounds(self.strong_fit) && in_bounds(self.fit) && in_bounds(self.weak_fit)) {
            return Err(format!("thresholds must lie within {SCORE_MIN}..={SCORE_MAX}"));
        }
        if !(self.strong_fit > self.fit && self.fit > self.weak_fit) {
            return Err("thresholds must be strictly descending: strong_fit > fit > weak_fit"
                .to_string());
        }
        Ok(())
    }

    pub fn classify(&self, composite: f64) -> Recommendation {
        if composite >= self.strong_fit {
            Recommendation::StrongFit
        } else if composite >= self.fit {
            Recommendation::Fit
        } else if composite >= self.weak_fit {
            Recommendation::WeakFit
        } else {
            Recommendation::NoFit
        }
    }
}

/// Default minimum: at least half of the enumerated criteria, rounded up.
pub fn default_min_criteria() -> usize {
    Criterion::ALL.len().div_ceil(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    pub composite_score: f64,
    pub recommendation: Recommendation,
    /// Criteria that contributed to the composite.
    pub criteria_used: usize,
}

#[derive(Debug, Clone)]
pub struct CriteriaAggregator {
    weights: WeightTable,
    thresholds: RecommendationThresholds,
    min_criteria: usize,
}

impl CriteriaAggregator {
    pub fn new(
        weights: WeightTable,
        thresholds: RecommendationThresholds,
        min_criteria: usize,
    ) -> Self {
        Self {
            weights,
            thresholds,
            min_criteria: min_criteria.max(1),
        }
    }

    /// Deterministic: the same scores and table always give the same result.
    /// When a criterion appears twice, the first occurrence is used.
    pub fn aggregate(&self, scores: &[CriterionScore]) -> Result<Aggregate, AggregationError> {
        let mut seen: Vec<Criterion> = Vec::with_capacity(scores.len());
        let mut weighted_sum = 0.0_f64;
        let mut weight_total = 0.0_f64;

        for s in scores {
            if seen.contains(&s.criterion) {
                continue;
            }
            seen.push(s.criterion);
            let Some(weight) = self.weights.weight(s.criterion) else {
                continue;
            };
            if weight <= 0.0 {
                continue;
            }
            weighted_sum += weight * s.score.clamp(SCORE_MIN, SCORE_MAX);
            weight_total += weight;
        }

        let criteria_used = seen
            .iter()
            .filter(|c| self.weights.weight(**c).is_some_and(|w| w > 0.0))
            .count();

        if criteria_used < self.min_criteria || weight_total <= 0.0 {
            return Err(AggregationError::InsufficientCriteria {
                scored: criteria_used,
                required: self.min_criteria,
            });
        }

        let composite_score = (weighted_sum / weight_total).clamp(SCORE_MIN, SCORE_MAX);
        Ok(Aggregate {
            composite_score,
            recommendation: self.thresholds.classify(composite_score),
            criteria_used,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interview answers
// ────────────────────────────────────────────────────────────────────────────

/// Folds individually scored answers into per-criterion means and a
/// consistency figure.
pub fn interview_breakdown(
    answers: Vec<AnswerScore>,
    unscored: Vec<UnscoredAnswer>,
) -> InterviewBreakdown {
    let criterion_means = Criterion::ALL
        .iter()
        .filter_map(|criterion| {
            let values: Vec<f64> = answers
                .iter()
                .filter_map(|a| {
                    a.criterion_scores
                        .iter()
                        .find(|s| s.criterion == *criterion)
                        .map(|s| s.score)
                })
                .collect();
            (!values.is_empty()).then(|| CriterionMean {
                criterion: *criterion,
                mean: values.iter().sum::<f64>() / values.len() as f64,
                answers: values.len(),
            })
        })
        .collect();
    let composites: Vec<f64> = answers.iter().map(|a| a.composite_score).collect();

    InterviewBreakdown {
        consistency: consistency_score(&composites),
        answers,
        unscored,
        criterion_means,
    }
}

/// `100 - sample_variance / 10`, floored at 0. A single answer is fully
/// consistent; no answers gives `None`.
pub fn consistency_score(composites: &[f64]) -> Option<f64> {
    match composites.len() {
        0 => None,
        1 => Some(SCORE_MAX),
        n => {
            let mean = composites.iter().sum::<f64>() / n as f64;
            let variance = composites
                .iter()
                .map(|c| (c - mean).powi(2))
                .sum::<f64>()
                / (n - 1) as f64;
            Some((SCORE_MAX - variance / 10.0).clamp(SCORE_MIN, SCORE_MAX))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(criterion: Criterion, value: f64) -> CriterionScore {
        CriterionScore::new(criterion, value, "because").unwrap()
    }

    fn aggregator(weights: WeightTable, min: usize) -> CriteriaAggregator {
        CriteriaAggregator::new(weights, RecommendationThresholds::default(), min)
    }

    #[test]
    fn test_missing_criterion_excluded_from_denominator() {
        let weights = WeightTable::new([
            (Criterion::TechnicalSkill, 1.0),
            (Criterion::Experience, 1.0),
        ])
        .unwrap();
        let result = aggregator(weights, 1)
            .aggregate(&[score(Criterion::TechnicalSkill, 80.0)])
            .unwrap();
        assert_eq!(result.composite_score, 80.0);
        assert_eq!(result.criteria_used, 1);
    }

    #[test]
    fn test_weighted_mean() {
        let weights = WeightTable::new([
            (Criterion::TechnicalSkill, 3.0),
            (Criterion::Experience, 1.0),
        ])
        .unwrap();
        let result = aggregator(weights, 2)
            .aggregate(&[
                score(Criterion::TechnicalSkill, 90.0),
                score(Criterion::Experience, 50.0),
            ])
            .unwrap();
        // (3*90 + 1*50) / 4 = 80
        assert!((result.composite_score - 80.0).abs() < 1e-9);
        assert_eq!(result.recommendation, Recommendation::Fit);
    }

    #[test]
    fn test_boundaries_are_inclusive_on_lower_bound() {
        let t = RecommendationThresholds::default();
        assert_eq!(t.classify(85.0), Recommendation::StrongFit);
        assert_eq!(t.classify(84.999), Recommendation::Fit);
        assert_eq!(t.classify(65.0), Recommendation::Fit);
        assert_eq!(t.classify(64.999), Recommendation::WeakFit);
        assert_eq!(t.classify(40.0), Recommendation::WeakFit);
        assert_eq!(t.classify(39.999), Recommendation::NoFit);
        assert_eq!(t.classify(0.0), Recommendation::NoFit);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let agg = aggregator(WeightTable::default(), 2);
        let scores = vec![
            score(Criterion::TechnicalSkill, 77.0),
            score(Criterion::Experience, 63.5),
            score(Criterion::CulturalFit, 91.0),
        ];
        let first = agg.aggregate(&scores).unwrap();
        for _ in 0..10 {
            assert_eq!(agg.aggregate(&scores).unwrap(), first);
        }
    }

    #[test]
    fn test_insufficient_criteria() {
        let agg = aggregator(WeightTable::default(), default_min_criteria());
        let err = agg
            .aggregate(&[score(Criterion::Communication, 70.0)])
            .unwrap_err();
        assert_eq!(
            err,
            AggregationError::InsufficientCriteria {
                scored: 1,
                required: 2
            }
        );
    }

    #[test]
    fn test_zero_total_weight_is_insufficient() {
        let weights = WeightTable::new([(Criterion::TechnicalSkill, 0.0)]).unwrap();
        let err = aggregator(weights, 1)
            .aggregate(&[score(Criterion::TechnicalSkill, 70.0)])
            .unwrap_err();
        assert!(matches!(err, AggregationError::InsufficientCriteria { scored: 0, .. }));
    }

    #[test]
    fn test_duplicate_criterion_uses_first() {
        let agg = aggregator(WeightTable::default(), 1);
        let result = agg
            .aggregate(&[
                score(Criterion::Experience, 60.0),
                score(Criterion::Experience, 100.0),
            ])
            .unwrap();
        assert_eq!(result.composite_score, 60.0);
    }

    #[test]
    fn test_composite_stays_within_bounds() {
        let agg = aggregator(WeightTable::default(), 1);
        for v in [0.0, 0.5, 50.0, 99.9, 100.0] {
            let result = agg
                .aggregate(&[
                    score(Criterion::TechnicalSkill, v),
                    score(Criterion::Communication, 100.0 - v),
                ])
                .unwrap();
            assert!((SCORE_MIN..=SCORE_MAX).contains(&result.composite_score));
        }
    }

    #[test]
    fn test_negative_weight_rejected() {
        assert!(WeightTable::new([(Criterion::Experience, -0.1)]).is_err());
        assert!(WeightTable::new([(Criterion::Experience, f64::NAN)]).is_err());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(RecommendationThresholds::default().validate().is_ok());
        let bad = RecommendationThresholds {
            strong_fit: 60.0,
            fit: 65.0,
            weak_fit: 40.0,
        };
        assert!(bad.validate().is_err());
        let out_of_bounds = RecommendationThresholds {
            strong_fit: 120.0,
            fit: 65.0,
            weak_fit: 40.0,
        };
        assert!(out_of_bounds.validate().is_err());
    }

    #[test]
    fn test_default_min_criteria_is_half() {
        assert_eq!(default_min_criteria(), 2);
    }

    #[test]
    fn test_consistency_score() {
        assert_eq!(consistency_score(&[]), None);
        assert_eq!(consistency_score(&[42.0]), Some(100.0));
        assert_eq!(consistency_score(&[70.0, 70.0, 70.0]), Some(100.0));
        // sample variance of 60 and 80 is 200
        assert!((consistency_score(&[60.0, 80.0]).unwrap() - 80.0).abs() < 1e-9);
        assert_eq!(consistency_score(&[0.0, 100.0]), Some(0.0));
    }

    #[test]
    fn test_interview_breakdown_means_per_criterion() {
        let answer = |index: usize, tech: f64, comm: Option<f64>| {
            let mut criterion_scores = vec![score(Criterion::TechnicalSkill, tech)];
            if let Some(c) = comm {
                criterion_scores.push(score(Criterion::Communication, c));
            }
            AnswerScore {
                index,
                question: format!("q{index}"),
                criterion_scores,
                composite_score: tech,
            }
        };
        let breakdown = interview_breakdown(
            vec![answer(0, 90.0, Some(60.0)), answer(2, 70.0, None)],
            vec![UnscoredAnswer {
                index: 1,
                reason: "blank answer".to_string(),
            }],
        );
        assert_eq!(breakdown.criterion_means.len(), 2);
        assert_eq!(breakdown.criterion_means[0].criterion, Criterion::TechnicalSkill);
        assert_eq!(breakdown.criterion_means[0].mean, 80.0);
        assert_eq!(breakdown.criterion_means[0].answers, 2);
        assert_eq!(breakdown.criterion_means[1].mean, 60.0);
        assert_eq!(breakdown.criterion_means[1].answers, 1);
        assert!((breakdown.consistency.unwrap() - 80.0).abs() < 1e-9);
        assert_eq!(breakdown.unscored[0].index, 1);
    }
}
