//! Loading scraped articles into the vector store.

pub mod walker;

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::ArticleMetadata;
use crate::rag::embeddings::Embedder;
use crate::rag::vector_store::VectorStore;
use self::walker::Article;

pub const MAX_DOCUMENT_CHARS: usize = 3000;
pub const MIN_BODY_CHARS: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedArticle {
    pub id: String,
    pub document: String,
    pub metadata: ArticleMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub indexed: usize,
    pub skipped: usize,
}

/// Stable point id for an article, so re-indexing replaces instead of duplicating.
pub fn article_id(url: &str) -> String {
    let digest = Sha256::digest(url.trim().as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// `None` for articles without a URL or with too little body text.
pub fn prepare_article(article: &Article, ingested_at: DateTime<Utc>) -> Option<PreparedArticle> {
    let body = article.content.trim();
    let url = article.url.trim();
    if url.is_empty() || body.chars().count() <= MIN_BODY_CHARS {
        return None;
    }

    let title = article.title.trim();
    let document = if title.is_empty() {
        body.to_string()
    } else {
        format!("{}\n\n{}", title, body)
    };

    Some(PreparedArticle {
        id: article_id(url),
        document: document.chars().take(MAX_DOCUMENT_CHARS).collect(),
        metadata: ArticleMetadata {
            title: Some(if title.is_empty() { "Untitled" } else { title }.to_string()),
            url: Some(url.to_string()),
            pub_date: Some(
                article
                    .pub_date
                    .clone()
                    .unwrap_or_else(|| ingested_at.to_rfc3339()),
            ),
        },
    })
}

/// Embed and store one batch. Returns the number of documents written.
pub async fn index_batch(embedder: &Embedder, store: &dyn VectorStore, batch: &[PreparedArticle]) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    let documents: Vec<String> = batch.iter().map(|a| a.document.clone()).collect();
    let vectors = embedder.embed_batch(&documents).await;
    store
        .add(
            batch.iter().map(|a| a.id.clone()).collect(),
            vectors,
            documents,
            batch.iter().map(|a| a.metadata.clone()).collect(),
        )
        .await?;

    Ok(batch.len())
}

/// Drop unusable and duplicate articles, keeping the first occurrence of each URL.
pub fn prepare_all(articles: &[Article], ingested_at: DateTime<Utc>) -> (Vec<PreparedArticle>, usize) {
    let mut seen = HashSet::new();
    let mut prepared = Vec::with_capacity(articles.len());
    for article in articles {
        match prepare_article(article, ingested_at) {
            Some(p) if seen.insert(p.id.clone()) => prepared.push(p),
            _ => {}
        }
    }
    let skipped = articles.len() - prepared.len();
    (prepared, skipped)
}

pub async fn index_articles(
    embedder: &Embedder,
    store: &dyn VectorStore,
    articles: &[Article],
    batch_size: usize,
) -> Result<IndexStats> {
    let (prepared, skipped) = prepare_all(articles, Utc::now());
    let mut stats = IndexStats {
        indexed: 0,
        skipped,
    };

    for batch in prepared.chunks(batch_size.max(1)) {
        stats.indexed += index_batch(embedder, store, batch).await?;
    }

    tracing::info!("Indexed {} articles ({} skipped)", stats.indexed, stats.skipped);
    Ok(stats)
}
