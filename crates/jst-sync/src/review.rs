//! Advisory near-duplicate detection. Nothing here merges records; it only
//! lists key pairs that exact matching kept apart but probably should not have.

use std::collections::BTreeMap;

use jst_core::TargetTable;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy)]
pub struct ReviewConfig {
    pub review_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicate {
    pub table: TargetTable,
    pub key_a: String,
    pub key_b: String,
    pub confidence_score: f64,
}

/// Company/name pair under comparison, e.g. ("OpenAI", "ML Engineer").
#[derive(Debug, Clone)]
pub struct ReviewKey {
    pub company: String,
    pub label: String,
}

pub struct NearDuplicateDetector {
    config: ReviewConfig,
}

impl NearDuplicateDetector {
    pub fn new(config: ReviewConfig) -> Self {
        Self { config }
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn similarity(&self, a: &ReviewKey, b: &ReviewKey) -> f64 {
        let company_score = jaro_winkler(
            &Self::normalize_key_fragment(&a.company),
            &Self::normalize_key_fragment(&b.company),
        );
        let label_score = jaro_winkler(
            &Self::normalize_key_fragment(&a.label),
            &Self::normalize_key_fragment(&b.label),
        );
        (company_score * 0.5) + (label_score * 0.5)
    }

    /// Pairs are only compared inside blocks sharing the first character of
    /// the normalized company, which keeps large job tables tractable.
    pub fn scan(&self, table: TargetTable, keys: &[ReviewKey]) -> Vec<NearDuplicate> {
        let mut blocks: BTreeMap<char, Vec<&ReviewKey>> = BTreeMap::new();
        for key in keys {
            let block = Self::normalize_key_fragment(&key.company)
                .chars()
                .next()
                .unwrap_or(' ');
            blocks.entry(block).or_default().push(key);
        }

        let mut found = Vec::new();
        for members in blocks.values() {
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let (a, b) = (members[i], members[j]);
                    if a.company == b.company && a.label == b.label {
                        continue;
                    }
                    let score = self.similarity(a, b);
                    if score >= self.config.review_threshold {
                        found.push(NearDuplicate {
                            table,
                            key_a: format!("{} / {}", a.company, a.label),
                            key_b: format!("{} / {}", b.company, b.label),
                            confidence_score: score,
                        });
                    }
                }
            }
        }
        found.sort_by(|x, y| y.confidence_score.total_cmp(&x.confidence_score));
        found
    }
}
