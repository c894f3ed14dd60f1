use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use news_rag::config::Settings;
use news_rag::llm::LiteLLMClient;
use news_rag::rag::embeddings::Embedder;
use news_rag::rag::{build_pipeline, vector_store_from_settings};
use news_rag::server::{create_app, AppState};
use news_rag::session::SessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("news_rag=info,tower_http=info")),
        )
        .init();

    let settings = Settings::load()?;

    tracing::info!("Connecting to Qdrant: {}", settings.qdrant_url);
    tracing::info!("Connecting to LiteLLM: {}", settings.litellm_url);

    let sessions = Arc::new(SessionStore::from_settings(&settings));
    SessionStore::start_sweeper(Arc::clone(&sessions), settings.session_sweep_interval());

    let embedder = Arc::new(Embedder::from_settings(&settings)?);
    let store = vector_store_from_settings(&settings)?;
    let llm = Arc::new(LiteLLMClient::from_settings(&settings)?);

    let pipeline = Arc::new(build_pipeline(
        &settings,
        Arc::clone(&sessions),
        Arc::clone(&embedder),
        store,
        llm.clone(),
    ));

    let state = Arc::new(AppState::new(pipeline, embedder).with_llm_health(llm));
    let app = create_app(state, settings.frontend_url.as_deref());

    let listener = tokio::net::TcpListener::bind(settings.listen_addr()).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
