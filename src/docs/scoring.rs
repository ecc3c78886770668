//! Pluggable ranking functions for keyword search.
//!
//! A scorer is a pure function of the query terms, the per-version term
//! statistics returned by the index backend and corpus statistics over the
//! eligible versions. Same inputs, same score.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::backend::TermMatch;

pub const BM25_K1: f64 = 1.2;
pub const BM25_B: f64 = 0.75;

/// Statistics over the versions eligible for one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorpusStats {
    pub documents: usize,
    pub average_length: f64,
    /// Number of eligible versions containing each query term.
    pub document_frequency: HashMap<String, usize>,
}

impl CorpusStats {
    pub fn new(lengths: impl IntoIterator<Item = usize>, matches: &[TermMatch]) -> Self {
        let (documents, total) = lengths
            .into_iter()
            .fold((0usize, 0usize), |(n, sum), len| (n + 1, sum + len));
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for m in matches {
            for term in m.term_frequencies.keys() {
                *document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
        }
        Self {
            documents,
            average_length: if documents == 0 {
                0.0
            } else {
                total as f64 / documents as f64
            },
            document_frequency,
        }
    }
}

pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, terms: &[String], matched: &TermMatch, corpus: &CorpusStats) -> f64;
}

/// Fraction of query terms present, weighted by log-scaled frequency.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermFrequencyScorer;

impl Scorer for TermFrequencyScorer {
    fn name(&self) -> &'static str {
        "term_frequency"
    }

    fn score(&self, terms: &[String], matched: &TermMatch, _corpus: &CorpusStats) -> f64 {
        if terms.is_empty() {
            return 0.0;
        }
        let weights: Vec<f64> = terms
            .iter()
            .filter_map(|t| matched.term_frequencies.get(t))
            .filter(|tf| **tf > 0)
            .map(|tf| 1.0 + (*tf as f64).ln())
            .collect();
        if weights.is_empty() {
            return 0.0;
        }
        let coverage = weights.len() as f64 / terms.len() as f64;
        let mean_weight = weights.iter().sum::<f64>() / weights.len() as f64;
        coverage * mean_weight
    }
}

/// BM25 Okapi.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Scorer {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Self {
            k1: BM25_K1,
            b: BM25_B,
        }
    }
}

impl Scorer for Bm25Scorer {
    fn name(&self) -> &'static str {
        "bm25"
    }

    fn score(&self, terms: &[String], matched: &TermMatch, corpus: &CorpusStats) -> f64 {
        if corpus.documents == 0 {
            return 0.0;
        }
        let n = corpus.documents as f64;
        let avgdl = if corpus.average_length > 0.0 {
            corpus.average_length
        } else {
            1.0
        };
        let dl = matched.length as f64;

        terms
            .iter()
            .filter_map(|term| {
                let tf = *matched.term_frequencies.get(term)? as f64;
                let df = corpus.document_frequency.get(term).copied().unwrap_or(1) as f64;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                let tf_norm = (tf * (self.k1 + 1.0)) / (tf + self.k1 * (1.0 - self.b + self.b * dl / avgdl));
                Some(idf * tf_norm)
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    #[default]
    TermFrequency,
    Bm25,
}

impl ScorerKind {
    pub fn build(self) -> Arc<dyn Scorer> {
        match self {
            ScorerKind::TermFrequency => Arc::new(TermFrequencyScorer),
            ScorerKind::Bm25 => Arc::new(Bm25Scorer::default()),
        }
    }
}
