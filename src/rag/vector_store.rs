use anyhow::{Context, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use tokio::sync::{OnceCell, RwLock};

use crate::models::ArticleMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include {
    Documents,
    Metadatas,
    Distances,
}

pub const INCLUDE_ALL: [Include; 3] = [Include::Documents, Include::Metadatas, Include::Distances];

/// Parallel arrays, one row per query vector, each row ordered by ascending distance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub documents: Vec<Vec<String>>,
    pub metadatas: Vec<Vec<ArticleMetadata>>,
    pub distances: Vec<Vec<f32>>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(
        &self,
        query_vectors: Vec<Vec<f32>>,
        top_k: usize,
        include: &[Include],
    ) -> Result<QueryResult>;

    /// Insert or replace documents by id.
    async fn add(
        &self,
        ids: Vec<String>,
        vectors: Vec<Vec<f32>>,
        documents: Vec<String>,
        metadatas: Vec<ArticleMetadata>,
    ) -> Result<()>;
}

fn check_lengths(ids: usize, vectors: usize, documents: usize, metadatas: usize) -> Result<()> {
    if ids != vectors || ids != documents || ids != metadatas {
        anyhow::bail!(
            "add() needs parallel arrays: {} ids, {} vectors, {} documents, {} metadatas",
            ids,
            vectors,
            documents,
            metadatas
        );
    }
    Ok(())
}

pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
    dimension: usize,
    ready: OnceCell<()>,
}

impl QdrantStore {
    /// Builds the client only. The collection is created on first use.
    pub fn new(url: &str, collection_name: &str, dimension: usize) -> Result<Self> {
        tracing::info!("Building Qdrant client for URL: {}", url);
        let client = Qdrant::from_url(url)
            .build()
            .context("Qdrant client build failed")?;

        Ok(Self {
            client,
            collection_name: collection_name.to_string(),
            dimension,
            ready: OnceCell::new(),
        })
    }

    pub async fn get_or_create_collection(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                if !self.client.collection_exists(&self.collection_name).await? {
                    tracing::info!(
                        "Creating Qdrant collection {} ({} dims, cosine)",
                        self.collection_name,
                        self.dimension
                    );
                    self.client
                        .create_collection(
                            CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                                VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                            ),
                        )
                        .await?;
                }
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

fn payload_str(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn query(
        &self,
        query_vectors: Vec<Vec<f32>>,
        top_k: usize,
        include: &[Include],
    ) -> Result<QueryResult> {
        self.get_or_create_collection().await?;

        let mut result = QueryResult::default();
        for vector in query_vectors {
            let response = self
                .client
                .search_points(
                    SearchPointsBuilder::new(&self.collection_name, vector, top_k as u64)
                        .with_payload(true),
                )
                .await?;

            let mut documents = Vec::new();
            let mut metadatas = Vec::new();
            let mut distances = Vec::new();
            for point in response.result {
                if include.contains(&Include::Documents) {
                    documents.push(payload_str(&point.payload, "text").unwrap_or_default());
                }
                if include.contains(&Include::Metadatas) {
                    metadatas.push(ArticleMetadata {
                        title: payload_str(&point.payload, "title"),
                        url: payload_str(&point.payload, "url"),
                        pub_date: payload_str(&point.payload, "pub_date"),
                    });
                }
                if include.contains(&Include::Distances) {
                    // Cosine similarity to cosine distance.
                    distances.push(1.0 - point.score);
                }
            }
            result.documents.push(documents);
            result.metadatas.push(metadatas);
            result.distances.push(distances);
        }
        Ok(result)
    }

    async fn add(
        &self,
        ids: Vec<String>,
        vectors: Vec<Vec<f32>>,
        documents: Vec<String>,
        metadatas: Vec<ArticleMetadata>,
    ) -> Result<()> {
        check_lengths(ids.len(), vectors.len(), documents.len(), metadatas.len())?;
        if ids.is_empty() {
            return Ok(());
        }
        self.get_or_create_collection().await?;

        let points: Vec<PointStruct> = ids
            .into_iter()
            .zip(vectors)
            .zip(documents)
            .zip(metadatas)
            .map(|(((id, vector), text), metadata)| {
                let mut payload_map = JsonMap::new();
                payload_map.insert("text".to_string(), JsonValue::String(text));
                for (key, value) in [
                    ("title", metadata.title),
                    ("url", metadata.url),
                    ("pub_date", metadata.pub_date),
                ] {
                    if let Some(value) = value {
                        payload_map.insert(key.to_string(), JsonValue::String(value));
                    }
                }
                PointStruct::new(id, vector, payload_map)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await?;
        Ok(())
    }
}

struct StoredDocument {
    id: String,
    vector: Vec<f32>,
    document: String,
    metadata: ArticleMetadata,
}

/// Brute-force cosine search over documents held in process.
#[derive(Default)]
pub struct InMemoryVectorStore {
    documents: RwLock<Vec<StoredDocument>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn query(
        &self,
        query_vectors: Vec<Vec<f32>>,
        top_k: usize,
        include: &[Include],
    ) -> Result<QueryResult> {
        let stored = self.documents.read().await;
        let mut result = QueryResult::default();

        for vector in query_vectors {
            let mut scored: Vec<(f32, &StoredDocument)> = stored
                .iter()
                .map(|doc| (cosine_distance(&vector, &doc.vector), doc))
                .collect();
            scored.sort_by(|a, b| a.0.total_cmp(&b.0));
            scored.truncate(top_k);

            let keep = |field: Include| include.contains(&field);
            result.documents.push(if keep(Include::Documents) {
                scored.iter().map(|(_, doc)| doc.document.clone()).collect()
            } else {
                Vec::new()
            });
            result.metadatas.push(if keep(Include::Metadatas) {
                scored.iter().map(|(_, doc)| doc.metadata.clone()).collect()
            } else {
                Vec::new()
            });
            result.distances.push(if keep(Include::Distances) {
                scored.iter().map(|(distance, _)| *distance).collect()
            } else {
                Vec::new()
            });
        }
        Ok(result)
    }

    async fn add(
        &self,
        ids: Vec<String>,
        vectors: Vec<Vec<f32>>,
        documents: Vec<String>,
        metadatas: Vec<ArticleMetadata>,
    ) -> Result<()> {
        check_lengths(ids.len(), vectors.len(), documents.len(), metadatas.len())?;

        let mut stored = self.documents.write().await;
        for (((id, vector), document), metadata) in ids.into_iter().zip(vectors).zip(documents).zip(metadatas) {
            let doc = StoredDocument {
                id,
                vector,
                document,
                metadata,
            };
            match stored.iter_mut().find(|existing| existing.id == doc.id) {
                Some(existing) => *existing = doc,
                None => stored.push(doc),
            }
        }
        Ok(())
    }
}
