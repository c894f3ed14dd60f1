use std::sync::Arc;

use super::embeddings::Embedder;
use super::vector_store::{QueryResult, VectorStore, INCLUDE_ALL};
use crate::models::RetrievedItem;

pub struct Retriever {
    embedder: Arc<Embedder>,
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(embedder: Arc<Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Nearest documents first, at most `top_k`. Store errors yield no context.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Vec<RetrievedItem> {
        let query_vector = self.embedder.embed(query).await;

        match self.store.query(vec![query_vector], top_k, &INCLUDE_ALL).await {
            Ok(result) => {
                let items = unpack(result, top_k);
                tracing::debug!("Retrieved {} articles for query", items.len());
                items
            }
            Err(e) => {
                tracing::warn!("Article retrieval failed, answering without context: {:#}", e);
                Vec::new()
            }
        }
    }
}

fn unpack(result: QueryResult, top_k: usize) -> Vec<RetrievedItem> {
    let QueryResult {
        documents,
        metadatas,
        distances,
    } = result;

    let Some(documents) = documents.into_iter().next() else {
        return Vec::new();
    };
    let mut metadatas = metadatas.into_iter().next().unwrap_or_default().into_iter();
    let mut distances = distances.into_iter().next().unwrap_or_default().into_iter();

    let mut items: Vec<RetrievedItem> = documents
        .into_iter()
        .map(|content| RetrievedItem {
            content,
            metadata: metadatas.next().unwrap_or_default(),
            distance: distances.next().unwrap_or(f32::MAX),
        })
        .collect();

    items.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    items.truncate(top_k);
    items
}
