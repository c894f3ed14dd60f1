pub mod embeddings;
pub mod generator;
pub mod retriever;
pub mod vector_store;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use self::embeddings::Embedder;
use self::generator::Generator;
use self::retriever::Retriever;
use self::vector_store::{InMemoryVectorStore, QdrantStore, VectorStore};
use crate::config::{Settings, VectorBackend};
use crate::error::PipelineError;
use crate::llm::CompletionApi;
use crate::models::{ChatRequest, ChatResponse, RetrievedItem, Role, Source, StreamEvent, Turn};
use crate::session::SessionStore;

pub const DEFAULT_TOP_K: usize = 5;
pub const SNIPPET_CHARS: usize = 200;
pub const NO_CONTEXT_RESPONSE: &str = "I couldn't find relevant information in the news articles to answer your question. Please try rephrasing or asking about a different topic.";

/// Live event feed for one streamed answer: `Chunk`* then one `Done` or `Error`.
pub struct EventStream {
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// End-to-end question answering over the article collection.
///
/// Each request: resolve the session, refresh its TTL and load history,
/// record the user turn, retrieve context, generate (or fall back to a fixed
/// answer when nothing was retrieved), record the assistant turn and return
/// the answer with its sources. Only generation errors reach the caller.
pub struct RagPipeline {
    sessions: Arc<SessionStore>,
    retriever: Retriever,
    generator: Generator,
    top_k: usize,
}

impl RagPipeline {
    pub fn new(sessions: Arc<SessionStore>, retriever: Retriever, generator: Generator) -> Self {
        Self {
            sessions,
            retriever,
            generator,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub async fn answer(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let query = validate_query(&request)?;
        let session_id = self.resolve_session(request.session_id);

        let history = self.begin(&session_id, &query).await;
        let items = self.retriever.retrieve(&query, self.top_k).await;

        let response = if items.is_empty() {
            NO_CONTEXT_RESPONSE.to_string()
        } else {
            self.generator.generate(&query, &items, &history).await?
        };

        Ok(self.finish(session_id, response, &items).await)
    }

    pub async fn answer_streaming<F>(&self, request: ChatRequest, on_fragment: F) -> Result<ChatResponse, PipelineError>
    where
        F: FnMut(&str) + Send,
    {
        let query = validate_query(&request)?;
        let session_id = self.resolve_session(request.session_id);
        self.run_streaming(session_id, query, on_fragment).await
    }

    /// Run a streamed answer on its own task and return its events.
    ///
    /// Dropping the receiver cancels the task, including the in-flight
    /// provider request; the assistant turn is then never recorded.
    pub fn stream(self: &Arc<Self>, request: ChatRequest) -> Result<EventStream, PipelineError> {
        let query = validate_query(&request)?;
        let session_id = self.resolve_session(request.session_id);

        let (tx, events) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(self);
        let task_session_id = session_id.clone();

        tokio::spawn(async move {
            let chunks = tx.clone();
            let run = pipeline.run_streaming(task_session_id.clone(), query, move |fragment| {
                let _ = chunks.send(StreamEvent::Chunk {
                    chunk: fragment.to_string(),
                });
            });

            tokio::select! {
                result = run => {
                    let event = match result {
                        Ok(response) => StreamEvent::Done {
                            sources: response.sources,
                            session_id: response.session_id,
                        },
                        Err(e) => {
                            tracing::error!("Streaming response for session {} failed: {}", task_session_id, e);
                            StreamEvent::Error { error: e.to_string() }
                        }
                    };
                    let _ = tx.send(event);
                }
                _ = tx.closed() => {
                    tracing::info!("Client disconnected, cancelled response for session {}", task_session_id);
                }
            }
        });

        Ok(EventStream { session_id, events })
    }

    async fn run_streaming<F>(&self, session_id: String, query: String, mut on_fragment: F) -> Result<ChatResponse, PipelineError>
    where
        F: FnMut(&str) + Send,
    {
        let history = self.begin(&session_id, &query).await;
        let items = self.retriever.retrieve(&query, self.top_k).await;

        let response = if items.is_empty() {
            on_fragment(NO_CONTEXT_RESPONSE);
            NO_CONTEXT_RESPONSE.to_string()
        } else {
            self.generator
                .generate_streaming(&query, &items, &history, on_fragment)
                .await?
        };

        Ok(self.finish(session_id, response, &items).await)
    }

    fn resolve_session(&self, session_id: Option<String>) -> String {
        session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.sessions.new_id())
    }

    /// Refresh TTL, load prior history, then record the user turn.
    /// Returns the history as it was before this turn.
    async fn begin(&self, session_id: &str, query: &str) -> Vec<Turn> {
        self.sessions.touch(session_id).await;
        let history = self.sessions.history(session_id).await;
        self.sessions.append_turn(session_id, Role::User, query).await;
        history
    }

    async fn finish(&self, session_id: String, response: String, items: &[RetrievedItem]) -> ChatResponse {
        self.sessions
            .append_turn(&session_id, Role::Assistant, response.clone())
            .await;

        ChatResponse {
            session_id,
            response,
            sources: items.iter().map(to_source).collect(),
        }
    }
}

fn validate_query(request: &ChatRequest) -> Result<String, PipelineError> {
    match request.query.as_deref() {
        Some(query) if !query.trim().is_empty() => Ok(query.to_string()),
        _ => Err(PipelineError::MissingQuery),
    }
}

pub fn to_source(item: &RetrievedItem) -> Source {
    let snippet: String = item.content.chars().take(SNIPPET_CHARS).collect();
    Source {
        title: item
            .metadata
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        url: item.metadata.url.clone().unwrap_or_default(),
        snippet: format!("{}...", snippet),
    }
}

pub fn vector_store_from_settings(settings: &Settings) -> Result<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match settings.vector_backend {
        VectorBackend::Qdrant => Arc::new(QdrantStore::new(
            &settings.qdrant_url,
            &settings.qdrant_collection,
            settings.embedding_dimension,
        )?),
        VectorBackend::Memory => {
            tracing::warn!("Using in-process vector store; the collection starts empty");
            Arc::new(InMemoryVectorStore::new())
        }
    };
    Ok(store)
}

/// Wire the pipeline's components together.
pub fn build_pipeline(
    settings: &Settings,
    sessions: Arc<SessionStore>,
    embedder: Arc<Embedder>,
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn CompletionApi>,
) -> RagPipeline {
    RagPipeline::new(sessions, Retriever::new(embedder, store), Generator::new(llm)).with_top_k(settings.top_k)
}
