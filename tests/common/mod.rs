#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use news_rag::error::GenerationError;
use news_rag::indexer::index_articles;
use news_rag::indexer::walker::Article;
use news_rag::llm::{CompletionApi, FragmentStream};
use news_rag::rag::embeddings::Embedder;
use news_rag::rag::generator::Generator;
use news_rag::rag::retriever::Retriever;
use news_rag::rag::vector_store::InMemoryVectorStore;
use news_rag::rag::RagPipeline;
use news_rag::session::SessionStore;

pub const DIMENSION: usize = 64;

/// Completion provider that replays fixed fragments and records prompts.
pub struct ScriptedLlm {
    fragments: Vec<String>,
    fail: bool,
    stalled: Option<Arc<AtomicBool>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn answering(fragments: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail: false,
            stalled: None,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fragments: Vec::new(),
            fail: true,
            stalled: None,
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Streams `fragments`, then never finishes. `dropped` flips once the
    /// fragment stream is dropped.
    pub fn stalling(fragments: &[&str], dropped: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail: false,
            stalled: Some(dropped),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn provider_down() -> GenerationError {
        GenerationError::Status {
            status: 503,
            body: "provider unavailable".to_string(),
        }
    }
}

#[async_trait]
impl CompletionApi for ScriptedLlm {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail {
            return Err(Self::provider_down());
        }
        Ok(self.fragments.concat())
    }

    async fn complete_stream(&self, prompt: &str) -> Result<FragmentStream, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail {
            return Err(Self::provider_down());
        }
        let fragments: Vec<Result<String, GenerationError>> =
            self.fragments.iter().cloned().map(Ok).collect();
        match &self.stalled {
            None => Ok(stream::iter(fragments).boxed()),
            Some(dropped) => {
                let guard = DropFlag(Arc::clone(dropped));
                Ok(stream::iter(fragments)
                    .chain(stream::pending())
                    .map(move |fragment| {
                        let _held = &guard;
                        fragment
                    })
                    .boxed())
            }
        }
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub fn article(title: &str, url: &str, topic: &str) -> Article {
    Article {
        title: title.to_string(),
        content: format!("{} ", topic).repeat(40),
        url: url.to_string(),
        pub_date: Some("2024-05-01T00:00:00Z".to_string()),
    }
}

pub fn sample_articles() -> Vec<Article> {
    vec![
        article("Central bank holds rates", "https://news.test/1", "inflation rates bank"),
        article("Chipmaker unveils processor", "https://news.test/2", "semiconductor chip"),
        article("Cup final goes to extra time", "https://news.test/3", "football final"),
        article("Storm hits the coast", "https://news.test/4", "storm weather coast"),
        article("Election results announced", "https://news.test/5", "election votes"),
        article("Oil prices climb", "https://news.test/6", "oil energy prices"),
        article("New vaccine approved", "https://news.test/7", "vaccine health"),
    ]
}

pub struct Fixture {
    pub pipeline: Arc<RagPipeline>,
    pub sessions: Arc<SessionStore>,
    pub embedder: Arc<Embedder>,
    pub store: Arc<InMemoryVectorStore>,
    pub llm: Arc<ScriptedLlm>,
}

pub async fn fixture(llm: Arc<ScriptedLlm>, articles: &[Article]) -> Fixture {
    fixture_with_ttl(llm, articles, Duration::from_secs(3600)).await
}

pub async fn fixture_with_ttl(llm: Arc<ScriptedLlm>, articles: &[Article], ttl: Duration) -> Fixture {
    let embedder = Arc::new(Embedder::local(DIMENSION));
    let store = Arc::new(InMemoryVectorStore::new());
    index_articles(&embedder, store.as_ref(), articles, 4)
        .await
        .expect("in-memory indexing succeeds");

    let sessions = Arc::new(SessionStore::in_memory(ttl));
    let pipeline = Arc::new(RagPipeline::new(
        Arc::clone(&sessions),
        Retriever::new(Arc::clone(&embedder), store.clone()),
        Generator::new(llm.clone()),
    ));

    Fixture {
        pipeline,
        sessions,
        embedder,
        store,
        llm,
    }
}
