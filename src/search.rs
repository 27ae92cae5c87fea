use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::normalize::Operation;

const DEFAULT_LIMIT: usize = 8;
const MAX_LIMIT: usize = 25;

const FULL_MATCH_BOOST: f64 = 6.0;
const PATH_MATCH_BOOST: f64 = 3.0;
const TITLE_MATCH_BOOST: f64 = 2.0;
const METHOD_MATCH_BOOST: f64 = 1.0;
const DOCS_MATCH_BOOST: f64 = 0.25;

#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct SearchHit {
    pub operation_id: String,
    pub method: String,
    pub path: String,
    pub summary: String,
    pub required_params: Vec<String>,
    pub is_mutating: bool,
    pub score: f64,
}

struct IndexedDoc {
    operation_id: String,
    method: String,
    method_lower: String,
    path: String,
    path_lower: String,
    title_lower: String,
    summary: String,
    required_params: Vec<String>,
    is_mutating: bool,
    tf: HashMap<String, f64>,
    max_tf: f64,
    haystack: String,
    filter_blob: String,
}

/// Inverted TF·IDF scorer over a published catalog plus the docs-context
/// side channel. Rebuilt from scratch on every catalog publication; the
/// previous index stays readable until the swap.
pub struct SearchIndex {
    docs: Vec<IndexedDoc>,
    idf: HashMap<String, f64>,
    docs_context_tokens: HashSet<String>,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::build(&[], None)
    }
}

impl SearchIndex {
    pub fn build(operations: &[Operation], docs_context: Option<&str>) -> Self {
        let mut docs = Vec::with_capacity(operations.len());
        let mut df: HashMap<String, usize> = HashMap::new();

        for op in operations {
            let text = [
                op.operation_id.as_str(),
                op.title.as_deref().unwrap_or(""),
                op.description.as_deref().unwrap_or(""),
                op.search_text.as_str(),
                op.path_template.as_str(),
                op.method.as_str(),
                op.definition_name.as_deref().unwrap_or(""),
            ]
            .join(" ");

            let mut tf: HashMap<String, f64> = HashMap::new();
            for token in tokenize(&text) {
                *tf.entry(token).or_insert(0.0) += 1.0;
            }
            let max_tf = tf.values().copied().fold(1.0_f64, f64::max);
            for token in tf.keys() {
                *df.entry(token.clone()).or_insert(0) += 1;
            }

            let summary = op
                .description
                .clone()
                .or_else(|| op.title.clone())
                .unwrap_or_else(|| format!("{} {}", op.method, op.path_template));
            let haystack = [
                op.operation_id.as_str(),
                op.path_template.as_str(),
                op.title.as_deref().unwrap_or(""),
                op.description.as_deref().unwrap_or(""),
                op.rel.as_deref().unwrap_or(""),
            ]
            .join(" ")
            .to_lowercase();
            let filter_blob = format!(
                "{} {} {}",
                op.definition_name.as_deref().unwrap_or(""),
                op.path_template,
                op.operation_id
            )
            .to_lowercase();

            docs.push(IndexedDoc {
                operation_id: op.operation_id.clone(),
                method: op.method.clone(),
                method_lower: op.method.to_lowercase(),
                path: op.path_template.clone(),
                path_lower: op.path_template.to_lowercase(),
                title_lower: op.title.as_deref().unwrap_or("").to_lowercase(),
                summary,
                required_params: op.required_params.clone(),
                is_mutating: op.is_mutating,
                tf,
                max_tf,
                haystack,
                filter_blob,
            });
        }

        let doc_count = docs.len().max(1) as f64;
        let idf = df
            .into_iter()
            .map(|(token, count)| {
                let value = ((1.0 + doc_count) / (1.0 + count as f64)).ln() + 1.0;
                (token, value)
            })
            .collect();

        let docs_context_tokens = docs_context
            .map(|blob| tokenize(blob).into_iter().collect())
            .unwrap_or_default();

        Self {
            docs,
            idf,
            docs_context_tokens,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        resource_filter: &[String],
    ) -> Vec<SearchHit> {
        let query_lower = query.trim().to_lowercase();
        if query_lower.is_empty() {
            return Vec::new();
        }
        let query_tokens = tokenize(&query_lower);

        let filters: Vec<String> = resource_filter
            .iter()
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();

        let docs_share_token = query_tokens
            .iter()
            .any(|token| self.docs_context_tokens.contains(token));

        let mut hits: Vec<SearchHit> = Vec::new();
        for doc in &self.docs {
            if !filters.is_empty() && !filters.iter().any(|f| doc.filter_blob.contains(f)) {
                continue;
            }

            let mut score = 0.0;
            for token in &query_tokens {
                let Some(tf) = doc.tf.get(token) else {
                    continue;
                };
                let idf = self.idf.get(token).copied().unwrap_or(0.0);
                score += (tf / doc.max_tf) * idf;
            }

            if doc.haystack.contains(&query_lower) {
                score += FULL_MATCH_BOOST;
            }
            if doc.path_lower.contains(&query_lower) {
                score += PATH_MATCH_BOOST;
            }
            if !doc.title_lower.is_empty() && doc.title_lower.contains(&query_lower) {
                score += TITLE_MATCH_BOOST;
            }
            if query_tokens.iter().any(|token| *token == doc.method_lower) {
                score += METHOD_MATCH_BOOST;
            }
            if docs_share_token {
                score += DOCS_MATCH_BOOST;
            }

            if score > 0.0 {
                hits.push(SearchHit {
                    operation_id: doc.operation_id.clone(),
                    method: doc.method.clone(),
                    path: doc.path.clone(),
                    summary: doc.summary.clone(),
                    required_params: doc.required_params.clone(),
                    is_mutating: doc.is_mutating,
                    score: round4(score),
                });
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT));
        hits
    }
}

/// Lowercase, split on anything outside `[a-z0-9_]`, drop single chars.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'))
        .filter(|token| token.len() > 1)
        .map(str::to_string)
        .collect()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
