//! Keyword, semantic, and hybrid search over the library.
//!
//! Keyword candidates come from FTS5 (BM25 `rank`, negated so higher is
//! better); semantic candidates from brute-force cosine similarity over the
//! stored vectors. Each candidate set is min-max normalized to `[0, 1]`, then
//! combined per chunk as `(1 - alpha) * k + alpha * v`. Documents take the
//! MAX of their chunks and are ordered by score desc, `updated_at` desc,
//! id asc.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::Config;
use crate::embedding;
use crate::migrate;
use crate::models::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    fn alpha(&self, hybrid_alpha: f64) -> f64 {
        match self {
            SearchMode::Keyword => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => hybrid_alpha,
        }
    }

    fn uses_keyword(&self) -> bool {
        matches!(self, SearchMode::Keyword | SearchMode::Hybrid)
    }

    fn uses_vectors(&self) -> bool {
        matches!(self, SearchMode::Semantic | SearchMode::Hybrid)
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub media: Option<MediaKind>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub id: String,
    pub title: Option<String>,
    pub source: String,
    pub media: String,
    pub source_url: Option<String>,
    pub updated_at: i64,
    pub score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone)]
struct ChunkCandidate {
    chunk_id: String,
    document_id: String,
    raw_score: f64,
    snippet: String,
}

/// Quote each term so user punctuation can never break FTS5 syntax. Terms
/// are OR-ed; BM25 ranks chunks matching more of them higher.
pub fn sanitize_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Ranked documents for `query`. An empty query yields no results.
pub async fn search_documents(
    config: &Config,
    pool: &SqlitePool,
    query: &str,
    mode: SearchMode,
    filters: &SearchFilters,
    limit: Option<i64>,
) -> Result<Vec<SearchResultItem>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    if mode.uses_vectors() && !config.embedding.is_enabled() {
        bail!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            match mode {
                SearchMode::Semantic => "semantic",
                _ => "hybrid",
            }
        );
    }

    let final_limit = limit.unwrap_or(config.retrieval.final_limit).max(1) as usize;

    let keyword = if mode.uses_keyword() {
        match sanitize_fts_query(query) {
            Some(fts) => {
                fetch_keyword_candidates(pool, &fts, filters, config.retrieval.candidate_k_keyword)
                    .await?
            }
            None => Vec::new(),
        }
    } else {
        Vec::new()
    };

    let vector = if mode.uses_vectors() {
        fetch_vector_candidates(pool, config, query, filters, config.retrieval.candidate_k_vector)
            .await?
    } else {
        Vec::new()
    };

    let merged = merge_candidates(&keyword, &vector, mode.alpha(config.retrieval.hybrid_alpha));
    if merged.is_empty() {
        return Ok(Vec::new());
    }

    let mut results = Vec::with_capacity(merged.len());
    for (doc_id, score, snippet) in merged {
        let row = sqlx::query(
            "SELECT id, title, source, media, source_url, updated_at FROM documents WHERE id = ?",
        )
        .bind(&doc_id)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = row {
            results.push(SearchResultItem {
                id: row.get("id"),
                title: row.get("title"),
                source: row.get("source"),
                media: row.get("media"),
                source_url: row.get("source_url"),
                updated_at: row.get("updated_at"),
                score,
                snippet,
            });
        }
    }

    sort_results(&mut results);
    results.truncate(final_limit);
    Ok(results)
}

fn sort_results(results: &mut [SearchResultItem]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Combine normalized channels per chunk, then keep the best chunk per
/// document. Returns `(document_id, score, snippet)`.
fn merge_candidates(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    alpha: f64,
) -> Vec<(String, f64, String)> {
    let kw: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut chunks: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        chunks.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut best: HashMap<&str, (f64, &str)> = HashMap::new();
    for (chunk_id, cand) in chunks {
        let k = kw.get(chunk_id).copied().unwrap_or(0.0);
        let v = vec.get(chunk_id).copied().unwrap_or(0.0);
        let score = (1.0 - alpha) * k + alpha * v;
        let entry = best
            .entry(cand.document_id.as_str())
            .or_insert((score, cand.snippet.as_str()));
        if score > entry.0 {
            *entry = (score, cand.snippet.as_str());
        }
    }

    best.into_iter()
        .map(|(doc, (score, snippet))| (doc.to_string(), score, snippet.to_string()))
        .collect()
}

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    fts_query: &str,
    filters: &SearchFilters,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let media = filters.media.map(|m| m.as_str());
    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id, chunks_fts.document_id, chunks_fts.rank AS rank,
               snippet(chunks_fts, 2, '>>>', '<<<', '...', 48) AS snippet
        FROM chunks_fts
        JOIN documents d ON d.id = chunks_fts.document_id
        WHERE chunks_fts MATCH ?
          AND (? IS NULL OR d.media = ?)
          AND (? IS NULL OR d.source = ?)
        ORDER BY chunks_fts.rank
        LIMIT ?
        "#,
    )
    .bind(fts_query)
    .bind(media)
    .bind(media)
    .bind(&filters.source)
    .bind(&filters.source)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                raw_score: -rank,
                snippet: row.get("snippet"),
            }
        })
        .collect())
}

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    filters: &SearchFilters,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let provider = embedding::create_provider(config)?;
    let query_vec = embedding::embed_query(provider.as_ref(), query).await?;

    let media = filters.media.map(|m| m.as_str());
    let rows = sqlx::query(
        r#"
        SELECT cv.chunk_id, cv.document_id, cv.embedding,
               COALESCE(substr(c.text, 1, 240), '') AS snippet
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        JOIN documents d ON d.id = cv.document_id
        WHERE (? IS NULL OR d.media = ?)
          AND (? IS NULL OR d.source = ?)
        "#,
    )
    .bind(media)
    .bind(media)
    .bind(&filters.source)
    .bind(&filters.source)
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<ChunkCandidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let similarity =
                embedding::cosine_similarity(&query_vec, &embedding::blob_to_vec(&blob)) as f64;
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                raw_score: similarity,
                snippet: row.get("snippet"),
            }
        })
        .collect();

    candidates.sort_by(|a, b| b.raw_score.partial_cmp(&a.raw_score).unwrap_or(Ordering::Equal));
    candidates.truncate(candidate_k.max(0) as usize);
    Ok(candidates)
}

/// Min-max normalize to `[0, 1]`; a flat set normalizes to all ones.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates.iter().map(|c| c.raw_score).fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// CLI entry point for `search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    filters: SearchFilters,
    limit: Option<i64>,
) -> Result<()> {
    let mode: SearchMode = mode.parse()?;
    let pool = migrate::connect_and_migrate(config).await?;
    let results = search_documents(config, &pool, query, mode, &filters, limit).await?;
    pool.close().await;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(result.updated_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.media,
            result.title.as_deref().unwrap_or("(untitled)")
        );
        println!("    updated: {}", date);
        println!("    source: {}", result.source);
        if let Some(ref url) = result.source_url {
            println!("    url: {}", url);
        }
        println!("    excerpt: \"{}\"", result.snippet.replace('\n', " ").trim());
        println!("    id: {}", result.id);
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(chunk_id: &str, doc_id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            raw_score: score,
            snippet: format!("snippet {}", chunk_id),
        }
    }

    #[test]
    fn sanitize_quotes_terms() {
        assert_eq!(
            sanitize_fts_query("lisbon trip").as_deref(),
            Some("\"lisbon\" OR \"trip\"")
        );
        assert_eq!(
            sanitize_fts_query("what's \"up\" (AND) NEAR").as_deref(),
            Some("\"what's\" OR \"up\" OR \"(AND)\" OR \"NEAR\"")
        );
        assert_eq!(sanitize_fts_query("  ?? -- "), None);
        assert_eq!(sanitize_fts_query(""), None);
    }

    #[test]
    fn normalize_range_and_flat() {
        let cands = vec![cand("c1", "d1", 10.0), cand("c2", "d2", 5.0), cand("c3", "d3", 0.0)];
        let norm = normalize_scores(&cands);
        assert!((norm[0].1 - 1.0).abs() < 1e-9);
        assert!((norm[1].1 - 0.5).abs() < 1e-9);
        assert!(norm[2].1.abs() < 1e-9);

        let flat = vec![cand("c1", "d1", 3.0), cand("c2", "d2", 3.0)];
        assert!(normalize_scores(&flat).iter().all(|(_, s)| (*s - 1.0).abs() < 1e-9));
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn merge_takes_max_chunk_per_document() {
        let kw = vec![cand("c1", "d1", 10.0), cand("c2", "d1", 2.0), cand("c3", "d2", 6.0)];
        let mut merged = merge_candidates(&kw, &[], 0.0);
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].0, "d1");
        assert!((merged[0].1 - 1.0).abs() < 1e-9);
        assert_eq!(merged[0].2, "snippet c1");
        assert!((merged[1].1 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn alpha_weights_channels() {
        let kw = vec![cand("c1", "d1", 10.0), cand("c2", "d2", 0.0)];
        let vec = vec![cand("c1", "d1", 0.1), cand("c2", "d2", 0.9)];

        let score = |alpha: f64, doc: &str| {
            merge_candidates(&kw, &vec, alpha)
                .into_iter()
                .find(|(d, _, _)| d == doc)
                .map(|(_, s, _)| s)
                .unwrap()
        };
        assert!(score(0.0, "d1") > score(0.0, "d2"));
        assert!(score(1.0, "d2") > score(1.0, "d1"));
        assert!((score(0.5, "d1") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ties_break_on_recency_then_id() {
        let item = |id: &str, score: f64, updated_at: i64| SearchResultItem {
            id: id.to_string(),
            title: None,
            source: "claude".into(),
            media: "documents".into(),
            source_url: None,
            updated_at,
            score,
            snippet: String::new(),
        };
        let mut results = vec![item("b", 0.5, 10), item("a", 0.5, 10), item("c", 0.5, 20), item("d", 0.9, 0)];
        sort_results(&mut results);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn modes_parse() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::Keyword.alpha(0.6), 0.0);
        assert_eq!(SearchMode::Hybrid.alpha(0.6), 0.6);
    }
}
