use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;

/// Runtime settings. Environment variables use the upper-case field name,
/// e.g. `DATABASE_URL`, `JINA_API_KEY`, `TOP_K`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub frontend_url: Option<String>,

    #[serde(default)]
    pub database_url: Option<String>,
    pub session_ttl_secs: u64,
    pub session_sweep_secs: u64,

    pub vector_backend: VectorBackend,
    pub qdrant_url: String,
    pub qdrant_collection: String,

    #[serde(default)]
    pub jina_api_key: Option<String>,
    pub jina_api_url: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,

    pub litellm_url: String,
    #[serde(default)]
    pub litellm_api_key: Option<String>,
    pub llm_model: String,

    pub top_k: usize,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Qdrant,
    Memory,
}

impl Settings {
    /// Load `.env`, then the process environment, over built-in defaults.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let builder = defaults()?.add_source(Environment::default().try_parsing(true));
        Self::build(builder)
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let builder = defaults()?.add_source(File::from_str(source, FileFormat::Toml));
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings: Settings = builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(settings.normalized())
    }

    // Blank values count as unset so `JINA_API_KEY=` selects fallback mode.
    fn normalized(mut self) -> Self {
        for value in [
            &mut self.frontend_url,
            &mut self.database_url,
            &mut self.jina_api_key,
            &mut self.litellm_api_key,
        ] {
            if value.as_deref().map(str::trim).map_or(false, str::is_empty) {
                *value = None;
            }
        }
        self
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
    let builder = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", 3001_i64)?
        .set_default("session_ttl_secs", 86_400_i64)?
        .set_default("session_sweep_secs", 600_i64)?
        .set_default("vector_backend", "qdrant")?
        .set_default("qdrant_url", "http://localhost:6334")?
        .set_default("qdrant_collection", "news_articles")?
        .set_default("jina_api_url", "https://api.jina.ai/v1/embeddings")?
        .set_default("embedding_model", "jina-embeddings-v2-base-en")?
        .set_default("embedding_dimension", 768_i64)?
        .set_default("litellm_url", "http://localhost:4000")?
        .set_default("llm_model", "gemini-pro")?
        .set_default("top_k", 5_i64)?
        .set_default("http_timeout_secs", 60_i64)?;
    Ok(builder)
}
