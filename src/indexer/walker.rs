use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use walkdir::WalkDir;

/// An article as produced by the scraping pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    #[serde(default)]
    pub title: String,
    pub content: String,
    pub url: String,
    #[serde(default)]
    pub pub_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArticleFormat {
    /// One article object or an array of them.
    Json,
    /// One article object per line.
    JsonLines,
}

impl ArticleFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }
}

pub fn walk_directory(dir: &Path) -> Vec<(PathBuf, ArticleFormat)> {
    let mut files: Vec<(PathBuf, ArticleFormat)> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            let ext = path.extension()?.to_str()?;
            let format = ArticleFormat::from_extension(ext)?;
            Some((path, format))
        })
        .collect();
    files.sort();
    files
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Article>),
    One(Article),
}

pub fn load_articles(path: &Path, format: ArticleFormat) -> Result<Vec<Article>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    match format {
        ArticleFormat::Json => {
            let parsed: OneOrMany = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid article JSON in {}", path.display()))?;
            Ok(match parsed {
                OneOrMany::Many(articles) => articles,
                OneOrMany::One(article) => vec![article],
            })
        }
        ArticleFormat::JsonLines => raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid article on line {} of {}", idx + 1, path.display()))
            })
            .collect(),
    }
}
