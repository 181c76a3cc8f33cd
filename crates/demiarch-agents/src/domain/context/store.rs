//! Append-only context store with lazily materialised layers

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::embedding::{Embedder, HashingEmbedder};
use super::error::{ContextError, ContextResult};
use super::item::{ContextItem, ContextItemId, DetailLevel, Layer, NewContextItem, SourceType};
use super::summarize::{ExtractiveSummarizer, Summarizer};
use super::tokenizer::{HeuristicTokenizer, Tokenizer};

/// Token ceilings per detail level
#[derive(Debug, Clone, Copy)]
pub struct LayerCaps {
    pub index: usize,
    pub timeline: usize,
    pub full: usize,
}

impl Default for LayerCaps {
    fn default() -> Self {
        Self {
            index: 100,
            timeline: 500,
            full: 2000,
        }
    }
}

/// A context item as persisted
#[derive(Debug, Clone)]
pub struct StoredContextItem {
    pub id: ContextItemId,
    pub seq: u64,
    pub project_id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
    pub raw: String,
    pub index: Layer,
    /// Only layers that exist are stored; missing ones are regenerated on demand
    pub timeline: Option<Layer>,
    pub full: Option<Layer>,
}

impl StoredContextItem {
    pub fn from_item(item: &ContextItem) -> Self {
        Self {
            id: item.id,
            seq: item.seq,
            project_id: item.project_id.clone(),
            source_type: item.source_type,
            source_id: item.source_id.clone(),
            created_at: item.created_at,
            raw: item.raw.clone(),
            index: item.index.clone(),
            timeline: item.cached_layer(DetailLevel::Timeline).cloned(),
            full: item.cached_layer(DetailLevel::Full).cloned(),
        }
    }

    fn into_item(self) -> ContextItem {
        let timeline = OnceLock::new();
        if let Some(layer) = self.timeline {
            let _ = timeline.set(Some(layer));
        }
        let full = OnceLock::new();
        if let Some(layer) = self.full {
            let _ = full.set(Some(layer));
        }
        ContextItem {
            id: self.id,
            seq: self.seq,
            project_id: self.project_id,
            source_type: self.source_type,
            source_id: self.source_id,
            created_at: self.created_at,
            raw: self.raw,
            index: self.index,
            timeline,
            full,
        }
    }
}

/// Durable storage for context items
#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn insert(&self, item: &StoredContextItem) -> ContextResult<()>;

    /// Persist layers generated after the item was inserted
    async fn update_layers(&self, item: &StoredContextItem) -> ContextResult<()>;

    /// All items in `seq` order
    async fn load_all(&self) -> ContextResult<Vec<StoredContextItem>>;
}

struct StoreInner {
    items: RwLock<Vec<Arc<ContextItem>>>,
    tokenizer: Arc<dyn Tokenizer>,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    caps: LayerCaps,
    repository: Option<Arc<dyn ContextRepository>>,
    appended: Notify,
}

/// Builder for [`ContextStore`]
pub struct ContextStoreBuilder {
    tokenizer: Arc<dyn Tokenizer>,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    caps: LayerCaps,
    repository: Option<Arc<dyn ContextRepository>>,
}

impl Default for ContextStoreBuilder {
    fn default() -> Self {
        Self {
            tokenizer: Arc::new(HeuristicTokenizer),
            embedder: Arc::new(HashingEmbedder::default()),
            summarizer: Arc::new(ExtractiveSummarizer::default()),
            caps: LayerCaps::default(),
            repository: None,
        }
    }
}

impl ContextStoreBuilder {
    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn caps(mut self, caps: LayerCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn repository(mut self, repository: Arc<dyn ContextRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn build(self) -> ContextStore {
        ContextStore {
            inner: Arc::new(StoreInner {
                items: RwLock::new(Vec::new()),
                tokenizer: self.tokenizer,
                embedder: self.embedder,
                summarizer: self.summarizer,
                caps: self.caps,
                repository: self.repository,
                appended: Notify::new(),
            }),
        }
    }
}

/// Append-only store of history items
#[derive(Clone)]
pub struct ContextStore {
    inner: Arc<StoreInner>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ContextStore {
    pub fn builder() -> ContextStoreBuilder {
        ContextStoreBuilder::default()
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.inner.tokenizer.as_ref()
    }

    pub fn caps(&self) -> LayerCaps {
        self.inner.caps
    }

    /// Embed free text with the store's embedder
    pub fn embed(&self, text: &str) -> ContextResult<Vec<f32>> {
        self.inner.embedder.embed(text)
    }

    /// Append a new item; the Index layer is built before this returns
    pub async fn append(&self, new: NewContextItem) -> ContextResult<Arc<ContextItem>> {
        if new.project_id.trim().is_empty() {
            return Err(ContextError::invalid("project id is required"));
        }
        if new.content.trim().is_empty() && new.index.is_none() {
            return Err(ContextError::invalid("context item has no content"));
        }

        let index_text = match new.index.as_deref() {
            Some(text) => text.trim().to_string(),
            None => self.inner.summarizer.index(&new.content)?,
        };
        let index_text = self
            .inner
            .tokenizer
            .truncate(&index_text, self.inner.caps.index)
            .to_string();
        if index_text.trim().is_empty() {
            return Err(ContextError::invalid("index summary is empty"));
        }
        let index = self.build_layer(index_text, false)?;

        let timeline = OnceLock::new();
        if let Some(text) = new.timeline.as_deref() {
            let text = self.inner.tokenizer.truncate(text.trim(), self.inner.caps.timeline);
            let layer = if text == index.text {
                None
            } else {
                Some(self.build_layer(text.to_string(), false)?)
            };
            let _ = timeline.set(layer);
        }
        let full = OnceLock::new();
        if let Some(text) = new.full.as_deref() {
            let text = self.inner.tokenizer.truncate(text.trim(), self.inner.caps.full);
            let _ = full.set(Some(self.build_layer(text.to_string(), false)?));
        }

        let mut items = self.inner.items.write().await;
        let seq = items.last().map_or(0, |item| item.seq + 1);
        let item = Arc::new(ContextItem {
            id: ContextItemId::new(),
            seq,
            project_id: new.project_id,
            source_type: new.source_type,
            source_id: new.source_id,
            created_at: Utc::now(),
            raw: new.content,
            index,
            timeline,
            full,
        });

        if let Some(repo) = &self.inner.repository {
            repo.insert(&StoredContextItem::from_item(&item)).await?;
        }
        items.push(item.clone());
        drop(items);

        debug!(
            item_id = %item.id,
            seq,
            source_type = %item.source_type,
            index_tokens = item.index.tokens,
            "Context item appended"
        );
        self.inner.appended.notify_one();
        Ok(item)
    }

    /// Load persisted items into an empty store
    pub async fn restore(&self) -> ContextResult<usize> {
        let Some(repo) = &self.inner.repository else {
            return Ok(0);
        };
        let stored = repo.load_all().await?;
        let mut items = self.inner.items.write().await;
        if !items.is_empty() {
            return Err(ContextError::invalid("restore requires an empty store"));
        }
        items.extend(stored.into_iter().map(|s| Arc::new(s.into_item())));
        info!(count = items.len(), "Restored context items");
        Ok(items.len())
    }

    /// All items, oldest first
    pub async fn items(&self) -> Vec<Arc<ContextItem>> {
        self.inner.items.read().await.clone()
    }

    pub async fn get(&self, id: ContextItemId) -> Option<Arc<ContextItem>> {
        self.inner
            .items
            .read()
            .await
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.items.read().await.is_empty()
    }

    /// Layer at `level`, generating and memoising it on first use
    ///
    /// Returns `None` when the level would repeat the level below it.
    pub fn layer<'a>(&self, item: &'a ContextItem, level: DetailLevel) -> Option<&'a Layer> {
        match level {
            DetailLevel::Index => Some(&item.index),
            DetailLevel::Timeline => item
                .timeline
                .get_or_init(|| self.generate_timeline(item))
                .as_ref(),
            DetailLevel::Full => item.full.get_or_init(|| self.generate_full(item)).as_ref(),
        }
    }

    fn generate_timeline(&self, item: &ContextItem) -> Option<Layer> {
        if item.raw.trim().is_empty() {
            return None;
        }
        let text = match self.inner.summarizer.timeline(&item.raw) {
            Ok(text) => text,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Timeline summary failed");
                return None;
            }
        };
        let text = self.inner.tokenizer.truncate(&text, self.inner.caps.timeline);
        if text == item.index.text {
            return None;
        }
        self.generated_layer(item, text)
    }

    fn generate_full(&self, item: &ContextItem) -> Option<Layer> {
        let text = self.inner.tokenizer.truncate(item.raw.trim(), self.inner.caps.full);
        if text.is_empty() || text == item.index.text {
            return None;
        }
        let timeline = self.layer(item, DetailLevel::Timeline);
        if timeline.is_some_and(|t| t.text == text) {
            return None;
        }
        self.generated_layer(item, text)
    }

    fn generated_layer(&self, item: &ContextItem, text: &str) -> Option<Layer> {
        match self.build_layer(text.to_string(), true) {
            Ok(layer) => Some(layer),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Layer embedding failed");
                None
            }
        }
    }

    fn build_layer(&self, text: String, generated: bool) -> ContextResult<Layer> {
        let tokens = self.inner.tokenizer.count(&text);
        let embedding = self.inner.embedder.embed(&text)?;
        Ok(Layer {
            text,
            tokens,
            embedding,
            generated,
        })
    }

    /// Materialise every missing layer and persist it
    pub async fn backfill(&self) -> ContextResult<usize> {
        let pending: Vec<Arc<ContextItem>> = self
            .items()
            .await
            .into_iter()
            .filter(|item| !item.is_fully_materialised())
            .collect();

        for item in &pending {
            self.layer(item, DetailLevel::Timeline);
            self.layer(item, DetailLevel::Full);
            if let Some(repo) = &self.inner.repository {
                repo.update_layers(&StoredContextItem::from_item(item)).await?;
            }
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), "Backfilled context layers");
        }
        Ok(pending.len())
    }

    /// Backfill after every append until `shutdown` fires
    pub fn spawn_backfill(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = store.inner.appended.notified() => {
                        if let Err(e) = store.backfill().await {
                            warn!(error = %e, "Context backfill failed");
                        }
                    }
                }
            }
            debug!("Context backfill stopped");
        })
    }
}
