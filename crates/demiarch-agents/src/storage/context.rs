//! SQLite-backed context repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::context::{
    ContextError, ContextItemId, ContextRepository, ContextResult, Layer, SourceType,
    StoredContextItem,
};

/// The detail layers of one item as stored in `layers_json`
#[derive(Serialize, Deserialize)]
struct StoredLayers {
    index: Layer,
    #[serde(default)]
    timeline: Option<Layer>,
    #[serde(default)]
    full: Option<Layer>,
}

/// Context repository over the `context_items` table
#[derive(Debug, Clone)]
pub struct SqliteContextRepository {
    pool: SqlitePool,
}

impl SqliteContextRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of persisted items
    pub async fn count(&self) -> ContextResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM context_items")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(count)
    }
}

fn storage_error(e: sqlx::Error) -> ContextError {
    ContextError::storage(e.to_string())
}

fn layers_json(item: &StoredContextItem) -> ContextResult<String> {
    let layers = StoredLayers {
        index: item.index.clone(),
        timeline: item.timeline.clone(),
        full: item.full.clone(),
    };
    serde_json::to_string(&layers).map_err(|e| ContextError::storage(format!("Failed to encode layers: {}", e)))
}

#[async_trait]
impl ContextRepository for SqliteContextRepository {
    async fn insert(&self, item: &StoredContextItem) -> ContextResult<()> {
        sqlx::query(
            r#"
            INSERT INTO context_items (
                id, seq, project_id, source_type, source_id, raw_content, layers_json, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.seq as i64)
        .bind(&item.project_id)
        .bind(item.source_type.as_str())
        .bind(&item.source_id)
        .bind(&item.raw)
        .bind(layers_json(item)?)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    async fn update_layers(&self, item: &StoredContextItem) -> ContextResult<()> {
        sqlx::query("UPDATE context_items SET layers_json = ? WHERE id = ?")
            .bind(layers_json(item)?)
            .bind(item.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    async fn load_all(&self) -> ContextResult<Vec<StoredContextItem>> {
        let rows: Vec<ContextItemRow> = sqlx::query_as(
            r#"
            SELECT id, seq, project_id, source_type, source_id, raw_content, layers_json, created_at
            FROM context_items
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(ContextItemRow::into_stored).collect()
    }
}

// ========== Database Row Types ==========

#[derive(sqlx::FromRow)]
struct ContextItemRow {
    id: String,
    seq: i64,
    project_id: String,
    source_type: String,
    source_id: String,
    raw_content: String,
    layers_json: String,
    created_at: DateTime<Utc>,
}

impl ContextItemRow {
    fn into_stored(self) -> ContextResult<StoredContextItem> {
        let id = Uuid::parse_str(&self.id)
            .map(ContextItemId::from_uuid)
            .map_err(|e| ContextError::storage(format!("Invalid context item ID: {}", e)))?;
        let source_type: SourceType = self.source_type.parse()?;
        let layers: StoredLayers = serde_json::from_str(&self.layers_json)
            .map_err(|e| ContextError::storage(format!("Invalid layers JSON for {}: {}", id, e)))?;

        Ok(StoredContextItem {
            id,
            seq: u64::try_from(self.seq).unwrap_or_default(),
            project_id: self.project_id,
            source_type,
            source_id: self.source_id,
            created_at: self.created_at,
            raw: self.raw_content,
            index: layers.index,
            timeline: layers.timeline,
            full: layers.full,
        })
    }
}
