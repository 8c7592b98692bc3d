//! Hybrid retrieval: BM25 keyword search fused with dense-vector search.
//!
//! # Scoring
//!
//! 1. Fetch `2·limit` keyword candidates from FTS5 (BM25 rank, negated so
//!    higher is better) and `2·limit` vector candidates (cosine), each
//!    aggregated to the best chunk per document.
//! 2. Normalize each set to `[0, 1]` by dividing by its maximum.
//! 3. Fuse: `score = w_bm25 · ŝ_bm25 + w_vec · ŝ_vec`.
//! 4. Walk the progressive thresholds `[0.40, 0.25, 0.15, 0.05]`,
//!    returning as soon as at least `⌈limit/2⌉` hits clear one; a final
//!    0.01 safety net maximizes recall.
//! 5. Tie-break by raw query-term overlap in title + snippet, then by
//!    recency.
//!
//! # Degradation
//!
//! A dead vector backend yields keyword-only hits with `vector_score = 0`
//! and a warning; both backends dead yields an empty result with a
//! warning. The caller never sees an error for backend loss. A wall-clock
//! budget bounds the whole search; on exhaustion whatever fused so far is
//! returned with `partial = true`.

use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{DocumentKind, SearchHit};
use crate::query;
use crate::store::Store;
use crate::vector::VectorIndex;

/// Descending score floors tried until enough hits clear one.
const PROGRESSIVE_THRESHOLDS: &[f64] = &[0.40, 0.25, 0.15, 0.05];
/// Recall-maximizing floor applied when every threshold came up short.
const SAFETY_NET_THRESHOLD: f64 = 0.01;
/// Approximate token context on each side of a snippet match.
const SNIPPET_CONTEXT_TOKENS: u32 = 32;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub kinds: Vec<DocumentKind>,
    pub bm25_weight: f64,
    pub embedding_weight: f64,
    /// Run the query-enhancement layer (entity extraction + auxiliary
    /// single-term searches). Off by default; the raw path is the ground
    /// truth.
    pub enhance: bool,
    pub budget_ms: u64,
}

impl SearchOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            limit: config.default_limit,
            kinds: Vec::new(),
            bm25_weight: config.bm25_weight,
            embedding_weight: config.embedding_weight,
            enhance: false,
            budget_ms: config.budget_ms,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// True when the wall-clock budget expired before both backends ran.
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl SearchResponse {
    fn empty() -> Self {
        Self {
            hits: Vec::new(),
            partial: false,
            warning: None,
        }
    }
}

#[derive(Clone)]
pub struct HybridSearch {
    store: Store,
    vector: VectorIndex,
    embedder: Arc<dyn Embedder>,
}

/// Per-document candidate from one backend.
struct DocCandidate {
    document_id: String,
    chunk_id: Option<String>,
    raw_score: f64,
    snippet: String,
}

impl HybridSearch {
    pub fn new(store: Store, vector: VectorIndex, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            vector,
            embedder,
        }
    }

    pub async fn search(&self, query_text: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Ok(SearchResponse::empty());
        }

        let deadline = Instant::now() + Duration::from_millis(opts.budget_ms.max(1));
        let candidate_k = (opts.limit.max(1) * 2) as i64;
        let mut partial = false;
        let mut warning: Option<String> = None;

        // ---- keyword phase ----
        let mut keyword = match tokio::time::timeout(
            remaining(deadline),
            self.fetch_keyword_candidates(query_text, candidate_k, &opts.kinds),
        )
        .await
        {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                warn!(error = %e, "keyword backend failed");
                warning = Some(format!("keyword search unavailable: {e}"));
                Vec::new()
            }
            Err(_) => {
                partial = true;
                Vec::new()
            }
        };

        // Auxiliary single-term searches from the enhancement layer merge
        // into the keyword candidate set and dedupe by document.
        if opts.enhance && !partial {
            let enhanced = query::enhance(query_text);
            for term in &enhanced.auxiliary_terms {
                if Instant::now() >= deadline {
                    partial = true;
                    break;
                }
                if let Ok(extra) = self
                    .fetch_keyword_candidates(term, candidate_k, &opts.kinds)
                    .await
                {
                    merge_candidates(&mut keyword, extra);
                }
            }
        }

        // ---- vector phase ----
        let vector = if partial {
            Vec::new()
        } else {
            match tokio::time::timeout(
                remaining(deadline),
                self.fetch_vector_candidates(query_text, candidate_k as usize),
            )
            .await
            {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(e)) => {
                    warn!(error = %e, "vector backend unavailable, degrading to keyword-only");
                    if warning.is_none() {
                        warning = Some(format!("vector backend unavailable: {e}"));
                    }
                    Vec::new()
                }
                Err(_) => {
                    partial = true;
                    Vec::new()
                }
            }
        };

        if keyword.is_empty() && vector.is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                partial,
                warning,
            });
        }

        let hits = self
            .fuse(query_text, keyword, vector, opts)
            .await?;

        Ok(SearchResponse {
            hits,
            partial,
            warning,
        })
    }

    /// Keyword-only search used by the plain `search` command.
    pub async fn keyword_only(
        &self,
        query_text: &str,
        limit: usize,
        kinds: &[DocumentKind],
    ) -> Result<Vec<SearchHit>> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = self
            .fetch_keyword_candidates(query_text, limit.max(1) as i64, kinds)
            .await?;
        let opts = SearchOptions {
            limit,
            kinds: kinds.to_vec(),
            bm25_weight: 1.0,
            embedding_weight: 0.0,
            enhance: false,
            budget_ms: 0,
        };
        self.fuse(query_text, candidates, Vec::new(), &opts).await
    }

    // ============ Fusion ============

    async fn fuse(
        &self,
        query_text: &str,
        keyword: Vec<DocCandidate>,
        vector: Vec<DocCandidate>,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let keyword_max = max_score(&keyword);
        let vector_max = max_score(&vector);

        struct Fused {
            chunk_id: Option<String>,
            bm25_raw: f64,
            vector_raw: f64,
            bm25_norm: f64,
            vector_norm: f64,
            snippet: String,
        }

        let mut by_doc: HashMap<String, Fused> = HashMap::new();

        for c in keyword {
            let norm = if keyword_max > 0.0 { c.raw_score / keyword_max } else { 0.0 };
            let entry = by_doc.entry(c.document_id).or_insert(Fused {
                chunk_id: None,
                bm25_raw: 0.0,
                vector_raw: 0.0,
                bm25_norm: 0.0,
                vector_norm: 0.0,
                snippet: String::new(),
            });
            if norm >= entry.bm25_norm {
                entry.bm25_raw = c.raw_score;
                entry.bm25_norm = norm;
                if !c.snippet.is_empty() {
                    entry.snippet = c.snippet;
                }
            }
        }

        for c in vector {
            let norm = if vector_max > 0.0 { c.raw_score / vector_max } else { 0.0 };
            let entry = by_doc.entry(c.document_id).or_insert(Fused {
                chunk_id: None,
                bm25_raw: 0.0,
                vector_raw: 0.0,
                bm25_norm: 0.0,
                vector_norm: 0.0,
                snippet: String::new(),
            });
            if norm >= entry.vector_norm {
                entry.vector_raw = c.raw_score;
                entry.vector_norm = norm;
                entry.chunk_id = c.chunk_id;
                if entry.snippet.is_empty() {
                    entry.snippet = c.snippet;
                }
            }
        }

        let mut hits = Vec::new();
        for (doc_id, fused) in by_doc {
            let Some(doc) = self.store.get_document(&doc_id).await? else {
                continue;
            };
            if doc.deleted {
                continue;
            }
            if !opts.kinds.is_empty() && !opts.kinds.contains(&doc.kind) {
                continue;
            }

            let score =
                opts.bm25_weight * fused.bm25_norm + opts.embedding_weight * fused.vector_norm;
            hits.push(SearchHit {
                document_id: doc.id,
                chunk_id: fused.chunk_id,
                title: doc.title,
                snippet: fused.snippet,
                score,
                bm25_score: fused.bm25_raw,
                vector_score: fused.vector_raw,
                source_app: doc.source_app,
                source_uri: doc.source_uri,
                updated_at: doc.updated_at,
            });
        }

        // Progressive fallback: accept the highest floor that still leaves
        // enough hits, degrading to the safety net.
        let needed = opts.limit.max(1).div_ceil(2);
        let mut floor = SAFETY_NET_THRESHOLD;
        for threshold in PROGRESSIVE_THRESHOLDS {
            if hits.iter().filter(|h| h.score > *threshold).count() >= needed {
                floor = *threshold;
                break;
            }
        }
        hits.retain(|h| h.score > floor);

        let query_terms: Vec<String> = query_text
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    term_overlap(b, &query_terms).cmp(&term_overlap(a, &query_terms))
                })
                .then(b.updated_at.cmp(&a.updated_at))
        });
        hits.truncate(opts.limit.max(1));
        Ok(hits)
    }

    // ============ Keyword candidates ============

    async fn fetch_keyword_candidates(
        &self,
        query_text: &str,
        candidate_k: i64,
        kinds: &[DocumentKind],
    ) -> Result<Vec<DocCandidate>> {
        let Some(match_expr) = fts_match_expr(query_text) else {
            return Ok(Vec::new());
        };

        let kind_filter = if kinds.is_empty() {
            String::new()
        } else {
            let placeholders = vec!["?"; kinds.len()].join(", ");
            format!("AND d.kind IN ({placeholders})")
        };

        let sql = format!(
            r#"
            SELECT documents_fts.document_id AS document_id,
                   documents_fts.rank AS rank,
                   snippet(documents_fts, 2, '<mark>', '</mark>', '…', {SNIPPET_CONTEXT_TOKENS}) AS body_snippet,
                   snippet(documents_fts, 1, '<mark>', '</mark>', '…', {SNIPPET_CONTEXT_TOKENS}) AS title_snippet
            FROM documents_fts
            JOIN documents d ON d.id = documents_fts.document_id
            WHERE documents_fts MATCH ? AND d.deleted = 0 {kind_filter}
            ORDER BY rank
            LIMIT ?
            "#
        );

        let mut query = sqlx::query(&sql).bind(&match_expr);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let rows = query.bind(candidate_k).fetch_all(self.store.pool()).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                let body_snippet: String = row.get("body_snippet");
                let title_snippet: String = row.get("title_snippet");
                let snippet = if body_snippet.contains("<mark>") || title_snippet.is_empty() {
                    body_snippet
                } else {
                    title_snippet
                };
                DocCandidate {
                    document_id: row.get("document_id"),
                    chunk_id: None,
                    // FTS5 rank is negative, lower-is-better; negate so
                    // higher is better before normalization.
                    raw_score: -rank,
                    snippet,
                }
            })
            .collect())
    }

    // ============ Vector candidates ============

    async fn fetch_vector_candidates(
        &self,
        query_text: &str,
        candidate_k: usize,
    ) -> Result<Vec<DocCandidate>> {
        let query_vec = self.embedder.embed_query(query_text).await?;
        let hits = self.vector.search(&query_vec, candidate_k).await?;

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            let text: Option<String> = sqlx::query_scalar("SELECT text FROM chunks WHERE id = ?")
                .bind(&hit.chunk_id)
                .fetch_optional(self.store.pool())
                .await?;
            let snippet = mark_terms(&excerpt(text.as_deref().unwrap_or("")), query_text);
            candidates.push(DocCandidate {
                document_id: hit.document_id,
                chunk_id: Some(hit.chunk_id),
                raw_score: hit.similarity as f64,
                snippet,
            });
        }
        Ok(candidates)
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn max_score(candidates: &[DocCandidate]) -> f64 {
    candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(0.0f64, f64::max)
}

fn merge_candidates(base: &mut Vec<DocCandidate>, extra: Vec<DocCandidate>) {
    for candidate in extra {
        match base
            .iter_mut()
            .find(|c| c.document_id == candidate.document_id)
        {
            Some(existing) => {
                if candidate.raw_score > existing.raw_score {
                    existing.raw_score = candidate.raw_score;
                    existing.snippet = candidate.snippet;
                }
            }
            None => base.push(candidate),
        }
    }
}

/// Count of raw query terms appearing in a hit's title or snippet.
fn term_overlap(hit: &SearchHit, query_terms: &[String]) -> usize {
    let haystack = format!("{} {}", hit.title, hit.snippet).to_lowercase();
    query_terms
        .iter()
        .filter(|term| haystack.contains(term.as_str()))
        .count()
}

/// Build an FTS5 MATCH expression from free text: each alphanumeric token
/// quoted and OR-joined, so user punctuation can never break the query
/// syntax. Returns `None` when no searchable token remains.
fn fts_match_expr(query_text: &str) -> Option<String> {
    let tokens: Vec<String> = query_text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// First ~240 bytes of a chunk, cut at a char boundary.
fn excerpt(text: &str) -> String {
    const MAX: usize = 240;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Wrap occurrences of query terms in `<mark>` markers.
fn mark_terms(snippet: &str, query_text: &str) -> String {
    let mut marked = snippet.to_string();
    for term in query_text.split_whitespace() {
        let term = term.trim_matches(|c: char| !c.is_alphanumeric());
        if term.len() < 2 {
            continue;
        }
        let lower = marked.to_lowercase();
        if let Some(pos) = lower.find(&term.to_lowercase()) {
            if marked.is_char_boundary(pos) && marked.is_char_boundary(pos + term.len()) {
                let original = marked[pos..pos + term.len()].to_string();
                marked.replace_range(pos..pos + term.len(), &format!("<mark>{original}</mark>"));
            }
        }
    }
    marked
}
