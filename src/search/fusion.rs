// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Score fusion across search strategies.
//!
//! # Algorithm (score modes)
//!
//! ```text
//! per strategy s:
//!     drop non-finite scores, keep max score per document
//!     norm_s(d) = (score - min_s) / (max_s - min_s)     (1.0 when max_s == min_s)
//! combined(d) = Σ_s weight_s × norm_s(d)                (missing weight = 0.0)
//! order by combined desc, document_id asc; skip offset; take limit
//! ```
//!
//! [`FusionMode::NormalizedWeights`] first rescales the request's weights to
//! sum to 1. [`FusionMode::ReciprocalRank`] ignores score magnitudes and
//! contributes `weight_s / (k + rank_s(d))` with 1-based ranks.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Constant used by RRF when none is configured
pub const DEFAULT_RRF_K: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FusionMode {
    /// Weights used exactly as given
    #[default]
    WeightedSum,
    /// Weights rescaled to sum to 1.0 before combining
    NormalizedWeights,
    /// Reciprocal rank fusion
    ReciprocalRank { k: u32 },
}

/// One strategy's score for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyHit {
    pub document_id: String,
    pub score: f64,
}

impl StrategyHit {
    pub fn new(document_id: impl Into<String>, score: f64) -> Self {
        Self {
            document_id: document_id.into(),
            score,
        }
    }
}

/// All hits returned by one strategy for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResults {
    pub strategy: String,
    pub hits: Vec<StrategyHit>,
}

impl StrategyResults {
    pub fn new(strategy: impl Into<String>, hits: Vec<StrategyHit>) -> Self {
        Self {
            strategy: strategy.into(),
            hits,
        }
    }
}

/// A fused result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_id: String,
    /// Per-strategy contribution before weighting (normalised score, or
    /// the reciprocal rank term in RRF mode)
    pub source_scores: BTreeMap<String, f64>,
    pub combined_score: f64,
}

/// A search request. Built once with the chained setters and then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    query: String,
    strategy_weights: BTreeMap<String, f64>,
    limit: usize,
    offset: usize,
    mode: FusionMode,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            strategy_weights: BTreeMap::new(),
            limit: 10,
            offset: 0,
            mode: FusionMode::WeightedSum,
        }
    }

    #[must_use]
    pub fn weight(mut self, strategy: impl Into<String>, weight: f64) -> Self {
        self.strategy_weights.insert(strategy.into(), weight);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: FusionMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn strategy_weights(&self) -> &BTreeMap<String, f64> {
        &self.strategy_weights
    }

    #[must_use]
    pub fn page_limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn page_offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn fusion_mode(&self) -> FusionMode {
        self.mode
    }

    /// Effective weight of `strategy`. Missing and non-finite weights are 0.
    #[must_use]
    pub fn weight_of(&self, strategy: &str) -> f64 {
        let raw = self.raw_weight(strategy);
        match self.mode {
            FusionMode::NormalizedWeights => {
                let total: f64 = self.strategy_weights.keys().map(|s| self.raw_weight(s)).sum();
                if total == 0.0 || !total.is_finite() {
                    0.0
                } else {
                    raw / total
                }
            }
            _ => raw,
        }
    }

    /// Copy with non-finite weights set to 0.0, which fuses identically.
    pub(crate) fn with_finite_weights(&self) -> Self {
        let mut request = self.clone();
        for weight in request.strategy_weights.values_mut() {
            if !weight.is_finite() {
                *weight = 0.0;
            }
        }
        request
    }

    fn raw_weight(&self, strategy: &str) -> f64 {
        self.strategy_weights
            .get(strategy)
            .copied()
            .filter(|w| w.is_finite())
            .unwrap_or(0.0)
    }
}

/// Best finite score per document for one strategy; duplicate strategy
/// names are merged.
fn collect_scores(results: &[StrategyResults]) -> BTreeMap<&str, BTreeMap<&str, f64>> {
    let mut per_strategy: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for result in results {
        let docs = per_strategy.entry(result.strategy.as_str()).or_default();
        for hit in result.hits.iter().filter(|h| h.score.is_finite()) {
            docs.entry(hit.document_id.as_str())
                .and_modify(|best| *best = best.max(hit.score))
                .or_insert(hit.score);
        }
    }
    per_strategy
}

fn min_max_normalize<'a>(docs: &BTreeMap<&'a str, f64>) -> BTreeMap<&'a str, f64> {
    let (min, max) = docs
        .values()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| (lo.min(*s), hi.max(*s)));
    let range = max - min;

    docs.iter()
        .map(|(doc, score)| {
            let norm = if range > 0.0 && range.is_finite() {
                (score - min) / range
            } else {
                1.0
            };
            (*doc, norm)
        })
        .collect()
}

fn reciprocal_ranks<'a>(docs: &BTreeMap<&'a str, f64>, k: u32) -> BTreeMap<&'a str, f64> {
    let mut ranked: Vec<(&'a str, f64)> = docs.iter().map(|(d, s)| (*d, *s)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (doc, _))| (doc, 1.0 / (f64::from(k) + (i + 1) as f64)))
        .collect()
}

fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.combined_score
        .total_cmp(&a.combined_score)
        .then_with(|| a.document_id.cmp(&b.document_id))
}

/// Merge per-strategy results into one ranked page.
///
/// Deterministic: the same request and results always yield the same
/// page, regardless of the order strategies or hits were supplied in.
#[must_use]
pub fn fuse(request: &SearchRequest, results: &[StrategyResults]) -> Vec<SearchHit> {
    if request.page_limit() == 0 {
        return Vec::new();
    }

    let mut fused: BTreeMap<&str, SearchHit> = BTreeMap::new();
    for (strategy, docs) in collect_scores(results) {
        if docs.is_empty() {
            continue;
        }
        let contributions = match request.fusion_mode() {
            FusionMode::ReciprocalRank { k } => reciprocal_ranks(&docs, k),
            FusionMode::WeightedSum | FusionMode::NormalizedWeights => min_max_normalize(&docs),
        };
        let weight = request.weight_of(strategy);

        for (doc, contribution) in contributions {
            let hit = fused.entry(doc).or_insert_with(|| SearchHit {
                document_id: doc.to_string(),
                source_scores: BTreeMap::new(),
                combined_score: 0.0,
            });
            hit.source_scores.insert(strategy.to_string(), contribution);
            hit.combined_score += weight * contribution;
        }
    }

    let mut ranked: Vec<SearchHit> = fused.into_values().collect();
    ranked.sort_by(rank_order);
    ranked
        .into_iter()
        .skip(request.page_offset())
        .take(request.page_limit())
        .collect()
}
