//! Hybrid scores and per-model statistics.

use crate::model_id::IDEAL_MODEL_ID;
use crate::models::{
    EvaluationResults, ModelScore, ModelStatSummary, PromptDifferentiation, Statistics,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How similarity and coverage combine into one hybrid score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ScoreCombiner {
    /// Weighted arithmetic mean; weights are normalized by their sum
    Weighted {
        #[serde(default = "default_similarity_weight")]
        similarity_weight: f64,
        #[serde(default = "default_coverage_weight")]
        coverage_weight: f64,
    },
    GeometricMean,
    /// Coverage when present, similarity otherwise
    CoverageOnly,
}

fn default_similarity_weight() -> f64 {
    0.35
}

fn default_coverage_weight() -> f64 {
    0.65
}

impl Default for ScoreCombiner {
    fn default() -> Self {
        Self::Weighted {
            similarity_weight: default_similarity_weight(),
            coverage_weight: default_coverage_weight(),
        }
    }
}

impl ScoreCombiner {
    /// Combine two present, non-negative scores
    fn combine(&self, similarity: f64, coverage: f64) -> f64 {
        match *self {
            Self::Weighted {
                similarity_weight,
                coverage_weight,
            } => {
                let total = similarity_weight + coverage_weight;
                if total <= 0.0 {
                    (similarity + coverage) / 2.0
                } else {
                    (similarity_weight * similarity + coverage_weight * coverage) / total
                }
            }
            Self::GeometricMean => (similarity * coverage).sqrt(),
            Self::CoverageOnly => coverage,
        }
    }
}

fn valid(score: Option<f64>) -> Option<f64> {
    score.filter(|s| !s.is_nan()).map(|s| s.max(0.0))
}

/// Combine similarity and coverage for one (model, prompt). `None` means unknown, not zero.
pub fn hybrid_score(
    similarity: Option<f64>,
    coverage: Option<f64>,
    combiner: &ScoreCombiner,
) -> Option<f64> {
    match (valid(similarity), valid(coverage)) {
        (Some(sim), Some(cov)) => Some(combiner.combine(sim, cov)),
        (Some(sim), None) => Some(sim),
        (None, Some(cov)) => Some(cov),
        (None, None) => None,
    }
}

pub fn mean(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// Sample standard deviation (n - 1); undefined below two values
pub fn stddev(scores: &[f64]) -> Option<f64> {
    if scores.len() < 2 {
        return None;
    }
    let avg = mean(scores)?;
    let variance =
        scores.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / (scores.len() - 1) as f64;
    Some(variance.sqrt())
}

pub fn summarize(scores: &[f64]) -> ModelStatSummary {
    ModelStatSummary {
        average: mean(scores),
        stddev: stddev(scores),
    }
}

/// Models that take part in statistics, in run order
fn candidate_models(model_ids: &[String]) -> impl Iterator<Item = &String> {
    model_ids.iter().filter(|id| id.as_str() != IDEAL_MODEL_ID)
}

/// Per-model summary of `score` over every prompt
fn per_model_summary<F>(
    prompt_ids: &[String],
    model_ids: &[String],
    score: F,
) -> BTreeMap<String, ModelStatSummary>
where
    F: Fn(&str, &str) -> Option<f64>,
{
    candidate_models(model_ids)
        .map(|model_id| {
            let scores: Vec<f64> = prompt_ids
                .iter()
                .filter_map(|prompt_id| score(prompt_id, model_id))
                .collect();
            (model_id.clone(), summarize(&scores))
        })
        .collect()
}

/// Hybrid score statistics per non-ideal model
pub fn calculate_model_stats(
    prompt_ids: &[String],
    model_ids: &[String],
    results: &EvaluationResults,
    combiner: &ScoreCombiner,
) -> BTreeMap<String, ModelStatSummary> {
    per_model_summary(prompt_ids, model_ids, |prompt_id, model_id| {
        hybrid_score(
            results.similarity(prompt_id, model_id),
            results.coverage(prompt_id, model_id),
            combiner,
        )
    })
}

/// Highest and lowest average, scanning models in `order`; ties keep the first seen
pub fn best_and_worst(
    stats: &BTreeMap<String, ModelStatSummary>,
    order: &[String],
) -> (Option<ModelScore>, Option<ModelScore>) {
    let mut best: Option<ModelScore> = None;
    let mut worst: Option<ModelScore> = None;

    for model_id in order {
        let Some(average) = stats.get(model_id).and_then(|s| s.average) else {
            continue;
        };
        if best.as_ref().is_none_or(|b| average > b.score) {
            best = Some(ModelScore {
                model_id: model_id.clone(),
                score: average,
            });
        }
        if worst.as_ref().is_none_or(|w| average < w.score) {
            worst = Some(ModelScore {
                model_id: model_id.clone(),
                score: average,
            });
        }
    }

    (best, worst)
}

/// The prompt whose hybrid scores spread the most across models
pub fn most_differentiating_prompt(
    prompt_ids: &[String],
    model_ids: &[String],
    results: &EvaluationResults,
    combiner: &ScoreCombiner,
) -> Option<PromptDifferentiation> {
    let models: Vec<&String> = candidate_models(model_ids).collect();
    if models.len() < 2 {
        return None;
    }

    let mut most: Option<PromptDifferentiation> = None;
    for prompt_id in prompt_ids {
        let scores: Vec<f64> = models
            .iter()
            .filter_map(|model_id| {
                hybrid_score(
                    results.similarity(prompt_id, model_id),
                    results.coverage(prompt_id, model_id),
                    combiner,
                )
            })
            .collect();
        let Some(spread) = stddev(&scores) else {
            continue;
        };
        if most.as_ref().is_none_or(|m| spread > m.stddev) {
            most = Some(PromptDifferentiation {
                prompt_id: prompt_id.clone(),
                stddev: spread,
            });
        }
    }
    most
}

/// Every statistic of a run
pub fn build_statistics(
    prompt_ids: &[String],
    model_ids: &[String],
    results: &EvaluationResults,
    combiner: &ScoreCombiner,
) -> Statistics {
    let per_model_hybrid = calculate_model_stats(prompt_ids, model_ids, results, combiner);
    let per_model_similarity = per_model_summary(prompt_ids, model_ids, |p, m| {
        valid(results.similarity(p, m))
    });
    let per_model_coverage =
        per_model_summary(prompt_ids, model_ids, |p, m| valid(results.coverage(p, m)));

    let all_hybrid: Vec<f64> = candidate_models(model_ids)
        .flat_map(move |model_id| {
            prompt_ids.iter().filter_map(move |prompt_id| {
                hybrid_score(
                    results.similarity(prompt_id, model_id),
                    results.coverage(prompt_id, model_id),
                    combiner,
                )
            })
        })
        .collect();

    let order: Vec<String> = candidate_models(model_ids).cloned().collect();
    let (best_model, worst_model) = best_and_worst(&per_model_hybrid, &order);

    Statistics {
        most_differentiating_prompt: most_differentiating_prompt(
            prompt_ids, model_ids, results, combiner,
        ),
        overall_hybrid: summarize(&all_hybrid),
        per_model_hybrid,
        per_model_similarity,
        per_model_coverage,
        best_model,
        worst_model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CoverageResult;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn set_similarity(results: &mut EvaluationResults, prompt: &str, model: &str, score: f64) {
        results
            .per_prompt_similarities
            .entry(prompt.to_string())
            .or_default()
            .insert(model.to_string(), score);
    }

    fn set_coverage(results: &mut EvaluationResults, prompt: &str, model: &str, score: f64) {
        results
            .llm_coverage_scores
            .entry(prompt.to_string())
            .or_default()
            .insert(
                model.to_string(),
                CoverageResult {
                    avg_coverage_extent: Some(score),
                    key_point_assessments: Vec::new(),
                    error: None,
                },
            );
    }

    #[test]
    fn test_hybrid_score_presence_rules() {
        let combiner = ScoreCombiner::default();
        assert_eq!(hybrid_score(None, None, &combiner), None);
        assert_eq!(hybrid_score(Some(0.8), None, &combiner), Some(0.8));
        assert_eq!(hybrid_score(None, Some(0.4), &combiner), Some(0.4));
        assert_eq!(hybrid_score(Some(f64::NAN), None, &combiner), None);
        assert_eq!(hybrid_score(Some(0.0), None, &combiner), Some(0.0));
    }

    #[test]
    fn test_hybrid_score_clamps_negative_inputs() {
        let combiner = ScoreCombiner::default();
        assert_eq!(hybrid_score(Some(-0.3), None, &combiner), Some(0.0));

        let combined = hybrid_score(Some(-1.0), Some(1.0), &combiner).unwrap();
        assert!((combined - 0.65).abs() < 1e-9);

        let geometric = hybrid_score(Some(-0.5), Some(0.9), &ScoreCombiner::GeometricMean);
        assert_eq!(geometric, Some(0.0));
    }

    #[test]
    fn test_combiner_strategies() {
        let weighted = hybrid_score(Some(0.6), Some(0.8), &ScoreCombiner::default()).unwrap();
        assert!((weighted - (0.35 * 0.6 + 0.65 * 0.8)).abs() < 1e-9);

        let geometric = hybrid_score(Some(0.25), Some(1.0), &ScoreCombiner::GeometricMean).unwrap();
        assert!((geometric - 0.5).abs() < 1e-9);

        let coverage = hybrid_score(Some(0.1), Some(0.7), &ScoreCombiner::CoverageOnly);
        assert_eq!(coverage, Some(0.7));
        assert_eq!(hybrid_score(Some(0.1), None, &ScoreCombiner::CoverageOnly), Some(0.1));
    }

    #[test]
    fn test_combiner_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            score_combiner: ScoreCombiner,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
[score_combiner]
strategy = "weighted"
similarity_weight = 0.5
"#,
        )
        .unwrap();
        assert_eq!(
            parsed.score_combiner,
            ScoreCombiner::Weighted {
                similarity_weight: 0.5,
                coverage_weight: 0.65
            }
        );

        let parsed: Wrapper =
            toml::from_str("[score_combiner]\nstrategy = \"geometric_mean\"\n").unwrap();
        assert_eq!(parsed.score_combiner, ScoreCombiner::GeometricMean);
    }

    #[test]
    fn test_stddev() {
        assert_eq!(stddev(&[]), None);
        assert_eq!(stddev(&[0.5]), None);
        let spread = stddev(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert!((spread - 1.5811).abs() < 1e-4);
    }

    #[test]
    fn test_summarize_sizes() {
        assert_eq!(summarize(&[]), ModelStatSummary { average: None, stddev: None });
        assert_eq!(summarize(&[0.7]), ModelStatSummary { average: Some(0.7), stddev: None });
    }

    #[test]
    fn test_model_stats_with_zero_and_two_scores() {
        let prompts = ids(&["p1", "p2"]);
        let models = ids(&["a", "b", IDEAL_MODEL_ID]);
        let mut results = EvaluationResults::default();
        set_similarity(&mut results, "p1", "b", 0.6);
        set_similarity(&mut results, "p2", "b", 0.8);
        set_similarity(&mut results, "p1", IDEAL_MODEL_ID, 1.0);

        let stats = calculate_model_stats(&prompts, &models, &results, &ScoreCombiner::default());

        assert_eq!(stats.get("a"), Some(&ModelStatSummary::default()));
        assert!(!stats.contains_key(IDEAL_MODEL_ID));

        let b = stats.get("b").unwrap();
        assert!((b.average.unwrap() - 0.7).abs() < 1e-9);
        let expected = ((0.6f64 - 0.7).powi(2) + (0.8f64 - 0.7).powi(2)).sqrt();
        assert!((b.stddev.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_best_and_worst_ties_keep_first() {
        let mut stats = BTreeMap::new();
        stats.insert("z".to_string(), ModelStatSummary { average: Some(0.9), stddev: None });
        stats.insert("a".to_string(), ModelStatSummary { average: Some(0.9), stddev: None });
        stats.insert("m".to_string(), ModelStatSummary { average: Some(0.2), stddev: None });
        stats.insert("n".to_string(), ModelStatSummary::default());

        let (best, worst) = best_and_worst(&stats, &ids(&["z", "n", "a", "m"]));
        assert_eq!(best.unwrap().model_id, "z");
        assert_eq!(worst.unwrap().model_id, "m");

        let (best, worst) = best_and_worst(&stats, &ids(&["n"]));
        assert!(best.is_none());
        assert!(worst.is_none());
    }

    #[test]
    fn test_most_differentiating_prompt() {
        let prompts = ids(&["p1", "p2", "p3"]);
        let models = ids(&["a", "b"]);
        let mut results = EvaluationResults::default();
        set_coverage(&mut results, "p1", "a", 0.5);
        set_coverage(&mut results, "p1", "b", 0.6);
        set_coverage(&mut results, "p2", "a", 0.1);
        set_coverage(&mut results, "p2", "b", 0.9);
        set_coverage(&mut results, "p3", "a", 1.0);

        let combiner = ScoreCombiner::default();
        let most = most_differentiating_prompt(&prompts, &models, &results, &combiner).unwrap();
        assert_eq!(most.prompt_id, "p2");

        let single = ids(&["a", IDEAL_MODEL_ID]);
        assert!(most_differentiating_prompt(&prompts, &single, &results, &combiner).is_none());
    }

    #[test]
    fn test_build_statistics() {
        let prompts = ids(&["p1"]);
        let models = ids(&["a", "b"]);
        let mut results = EvaluationResults::default();
        set_similarity(&mut results, "p1", "a", 0.4);
        set_coverage(&mut results, "p1", "a", 0.4);
        set_coverage(&mut results, "p1", "b", 0.8);

        let stats = build_statistics(&prompts, &models, &results, &ScoreCombiner::default());
        assert_eq!(stats.best_model.unwrap().model_id, "b");
        assert_eq!(stats.worst_model.unwrap().model_id, "a");
        assert_eq!(stats.per_model_similarity["b"].average, None);
        assert_eq!(stats.per_model_coverage["b"].average, Some(0.8));
        assert!((stats.overall_hybrid.average.unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(stats.most_differentiating_prompt.unwrap().prompt_id, "p1");
    }
}
