use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use news_rag::indexer::walker::{load_articles, walk_directory};
use news_rag::indexer::{index_batch, prepare_all, DEFAULT_BATCH_SIZE};
use news_rag::rag::embeddings::{Embedder, EmbeddingApi, JinaEmbeddings, DEFAULT_DIMENSION};
use news_rag::rag::vector_store::QdrantStore;

#[derive(Parser, Debug)]
#[command(name = "news-indexer")]
#[command(about = "Index scraped news articles into the vector store")]
struct Args {
    /// Directory of .json / .jsonl article files
    #[arg(short, long)]
    dir: PathBuf,

    /// Qdrant server URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6334")]
    qdrant_url: String,

    /// Qdrant collection name
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "news_articles")]
    collection: String,

    /// Jina API key; omit to index with fallback embeddings
    #[arg(long, env = "JINA_API_KEY")]
    jina_api_key: Option<String>,

    #[arg(long, env = "JINA_API_URL", default_value = "https://api.jina.ai/v1/embeddings")]
    jina_api_url: String,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "jina-embeddings-v2-base-en")]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSION", default_value_t = DEFAULT_DIMENSION)]
    dimension: usize,

    /// Timeout for each embedding request
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 60)]
    http_timeout_secs: u64,

    /// Articles embedded per request
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if !args.dir.exists() {
        anyhow::bail!("Directory does not exist: {}", args.dir.display());
    }

    let remote: Option<Arc<dyn EmbeddingApi>> = match args.jina_api_key.clone().filter(|k| !k.is_empty()) {
        Some(key) => Some(Arc::new(JinaEmbeddings::new(
            args.jina_api_url.clone(),
            key,
            args.embedding_model.clone(),
            Duration::from_secs(args.http_timeout_secs),
        )?)),
        None => {
            println!("JINA_API_KEY not set, indexing with fallback embeddings");
            None
        }
    };
    let embedder = Embedder::new(remote, args.dimension);

    println!("Connecting to Qdrant at {}...", args.qdrant_url);
    let store = QdrantStore::new(&args.qdrant_url, &args.collection, args.dimension)?;
    store.get_or_create_collection().await?;

    println!("Scanning directory: {}", args.dir.display());
    let files = walk_directory(&args.dir);
    println!("Found {} article files", files.len());

    let mut articles = Vec::new();
    let mut failed_files: Vec<(PathBuf, String)> = Vec::new();
    for (path, format) in &files {
        match load_articles(path, *format) {
            Ok(mut loaded) => articles.append(&mut loaded),
            Err(e) => {
                tracing::warn!("Failed to load {}: {:#}", path.display(), e);
                failed_files.push((path.clone(), format!("{:#}", e)));
            }
        }
    }

    let (prepared, skipped) = prepare_all(&articles, Utc::now());
    if prepared.is_empty() {
        println!("No indexable articles found. Exiting.");
        return Ok(());
    }

    let pb = ProgressBar::new(prepared.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut indexed = 0usize;
    let mut failed_batches = 0usize;
    for batch in prepared.chunks(args.batch_size.max(1)) {
        if let Some(first) = batch.first() {
            pb.set_message(first.metadata.title.clone().unwrap_or_default());
        }
        match index_batch(&embedder, &store, batch).await {
            Ok(count) => indexed += count,
            Err(e) => {
                tracing::warn!("Failed to index batch: {}", e);
                failed_batches += 1;
            }
        }
        pb.inc(batch.len() as u64);
    }

    pb.finish_with_message("done");

    println!("\nIndexing complete!");
    println!("  Articles indexed:  {}/{}", indexed, articles.len());
    println!("  Articles skipped:  {}", skipped);
    println!("  Batches failed:    {}", failed_batches);
    println!("  Fallback batches:  {}", embedder.fallback_count());
    println!("  Collection:        {}", args.collection);
    println!("  Qdrant URL:        {}", args.qdrant_url);

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed_files {
            println!("  {}: {}", path.display(), err);
        }
    }

    Ok(())
}
