//! Per-session chat history with a durable backend and an in-process fallback.
//!
//! The durable backend is probed once, on first use. If that probe fails the
//! store keeps every session in memory for the rest of the process. Both
//! backends apply the same retention window: every write and every `touch`
//! pushes expiry out by the full TTL, so idle sessions disappear and active
//! ones live on.

pub mod postgres;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{Role, Turn};
use self::postgres::PostgresKv;

pub const SESSION_KEY_PREFIX: &str = "chat:session:";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(86_400);

/// Durable key-value operations the store relies on.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_expiry(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn refresh_expiry(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Drop expired entries. Backends that expire keys on their own keep the default.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

pub type ConnectFuture = BoxFuture<'static, Result<Arc<dyn KvBackend>>>;
type Connector = Box<dyn Fn() -> ConnectFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Durable backend not probed yet.
    Pending,
    Durable,
    Memory,
}

struct MemoryEntry {
    turns: Vec<Turn>,
    expires_at: Instant,
}

pub struct SessionStore {
    connector: Option<Connector>,
    durable: OnceCell<Option<Arc<dyn KvBackend>>>,
    memory: Mutex<HashMap<String, MemoryEntry>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ttl: Duration,
}

fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, session_id)
}

impl SessionStore {
    fn build(connector: Option<Connector>, durable: OnceCell<Option<Arc<dyn KvBackend>>>, ttl: Duration) -> Self {
        Self {
            connector,
            durable,
            memory: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::build(None, OnceCell::new_with(Some(None)), ttl)
    }

    /// Store backed by an already connected backend.
    pub fn with_backend(backend: Arc<dyn KvBackend>, ttl: Duration) -> Self {
        Self::build(None, OnceCell::new_with(Some(Some(backend))), ttl)
    }

    /// Store that runs `connect` at most once, the first time a session is accessed.
    pub fn with_connector<F, Fut>(connect: F, ttl: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn KvBackend>>> + Send + 'static,
    {
        let connector: Connector = Box::new(move || connect().boxed());
        Self::build(Some(connector), OnceCell::new(), ttl)
    }

    pub fn postgres(database_url: String, ttl: Duration) -> Self {
        Self::with_connector(
            move || {
                let url = database_url.clone();
                async move {
                    let backend: Arc<dyn KvBackend> = Arc::new(PostgresKv::connect(&url).await?);
                    Ok(backend)
                }
            },
            ttl,
        )
    }

    pub fn from_settings(settings: &Settings) -> Self {
        match settings.database_url.clone() {
            Some(url) => Self::postgres(url, settings.session_ttl()),
            None => {
                tracing::info!("DATABASE_URL not set, sessions are kept in memory");
                Self::in_memory(settings.session_ttl())
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mode(&self) -> StoreMode {
        match self.durable.get() {
            None => StoreMode::Pending,
            Some(Some(_)) => StoreMode::Durable,
            Some(None) => StoreMode::Memory,
        }
    }

    pub fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    async fn durable(&self) -> Option<Arc<dyn KvBackend>> {
        self.durable
            .get_or_init(|| async {
                let connect = self.connector.as_ref()?;
                match connect().await {
                    Ok(backend) => {
                        tracing::info!("Durable session store connected");
                        Some(backend)
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Durable session store unavailable, keeping sessions in memory for this process: {:#}",
                            e
                        );
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Durable backend for this session, unless the session lives in memory.
    /// A session that spilled to memory after a failed write stays there.
    async fn durable_for(&self, session_id: &str) -> Option<Arc<dyn KvBackend>> {
        let backend = self.durable().await?;
        if self.memory_get(session_id).await.is_some() {
            return None;
        }
        Some(backend)
    }

    pub async fn history(&self, session_id: &str) -> Vec<Turn> {
        let Some(backend) = self.durable_for(session_id).await else {
            return self.memory_get(session_id).await.unwrap_or_default();
        };

        match backend.get(&session_key(session_id)).await {
            Ok(raw) => decode_history(session_id, raw),
            Err(e) => {
                tracing::warn!("Failed to read session {} from durable store: {:#}", session_id, e);
                self.memory_get(session_id).await.unwrap_or_default()
            }
        }
    }

    /// Append one turn and return the history including it.
    pub async fn append_turn(&self, session_id: &str, role: Role, content: impl Into<String>) -> Vec<Turn> {
        let lock = self.session_lock(session_id).await;
        let guard = lock.lock().await;

        let turn = Turn::new(role, content);
        let history = match self.durable_for(session_id).await {
            Some(backend) => self.append_durable(backend.as_ref(), session_id, turn).await,
            None => self.append_memory(session_id, turn).await,
        };

        drop(guard);
        self.release_lock(session_id, lock).await;
        history
    }

    async fn append_durable(&self, backend: &dyn KvBackend, session_id: &str, turn: Turn) -> Vec<Turn> {
        let key = session_key(session_id);
        let mut history = match backend.get(&key).await {
            Ok(raw) => decode_history(session_id, raw),
            Err(e) => {
                tracing::warn!(
                    "Failed to read session {} before append, continuing in memory: {:#}",
                    session_id,
                    e
                );
                return self.append_memory(session_id, turn).await;
            }
        };
        history.push(turn);

        let written = match serde_json::to_string(&history) {
            Ok(value) => backend.set_with_expiry(&key, self.ttl, &value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            tracing::warn!(
                "Failed to write session {} to durable store, keeping it in memory: {:#}",
                session_id,
                e
            );
            self.memory_put(session_id, history.clone()).await;
        }
        history
    }

    /// Drop all history for the session. If the durable delete fails, an
    /// empty in-memory entry pins the session so the stale copy stays hidden.
    pub async fn clear(&self, session_id: &str) {
        let lock = self.session_lock(session_id).await;
        let guard = lock.lock().await;

        self.memory.lock().await.remove(session_id);
        if let Some(backend) = self.durable().await {
            if let Err(e) = backend.delete(&session_key(session_id)).await {
                tracing::warn!(
                    "Failed to delete session {} from durable store, keeping it cleared in memory: {:#}",
                    session_id,
                    e
                );
                self.memory_put(session_id, Vec::new()).await;
            }
        }

        drop(guard);
        self.release_lock(session_id, lock).await;
    }

    /// Push the session's expiry out by the full TTL without changing it.
    pub async fn touch(&self, session_id: &str) {
        match self.durable_for(session_id).await {
            Some(backend) => {
                if let Err(e) = backend.refresh_expiry(&session_key(session_id), self.ttl).await {
                    tracing::warn!("Failed to extend TTL for session {}: {:#}", session_id, e);
                }
            }
            None => {
                let mut memory = self.memory.lock().await;
                let now = Instant::now();
                if let Some(entry) = memory.get_mut(session_id) {
                    if entry.expires_at > now {
                        entry.expires_at = now + self.ttl;
                    }
                }
            }
        }
    }

    /// Remove expired sessions from memory and, once connected, from the durable backend.
    pub async fn purge_expired(&self) -> u64 {
        let now = Instant::now();
        let mut purged = {
            let mut memory = self.memory.lock().await;
            let before = memory.len();
            memory.retain(|_, entry| entry.expires_at > now);
            (before - memory.len()) as u64
        };

        // Only sweep a backend that is already up; the sweeper must not trigger the probe.
        if let Some(Some(backend)) = self.durable.get() {
            match backend.purge_expired().await {
                Ok(count) => purged += count,
                Err(e) => tracing::warn!("Failed to purge expired sessions: {:#}", e),
            }
        }
        purged
    }

    pub fn start_sweeper(store: Arc<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = store.purge_expired().await;
                if purged > 0 {
                    tracing::info!("Purged {} expired sessions", purged);
                }
            }
        });
    }

    async fn memory_get(&self, session_id: &str) -> Option<Vec<Turn>> {
        let mut memory = self.memory.lock().await;
        let entry = memory.get(session_id)?;
        if entry.expires_at <= Instant::now() {
            memory.remove(session_id);
            return None;
        }
        Some(entry.turns.clone())
    }

    async fn memory_put(&self, session_id: &str, turns: Vec<Turn>) {
        let entry = MemoryEntry {
            turns,
            expires_at: Instant::now() + self.ttl,
        };
        self.memory.lock().await.insert(session_id.to_string(), entry);
    }

    async fn append_memory(&self, session_id: &str, turn: Turn) -> Vec<Turn> {
        let mut memory = self.memory.lock().await;
        let now = Instant::now();
        let entry = memory.entry(session_id.to_string()).or_insert_with(|| MemoryEntry {
            turns: Vec::new(),
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.turns.clear();
        }
        entry.turns.push(turn);
        entry.expires_at = now + self.ttl;
        entry.turns.clone()
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Held by the map and by us only: nobody is waiting on it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(session_id);
        }
    }
}

fn decode_history(session_id: &str, raw: Option<String>) -> Vec<Turn> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(turns) => turns,
        Err(e) => {
            tracing::warn!("Discarding unreadable history for session {}: {}", session_id, e);
            Vec::new()
        }
    }
}
