//! Context items and their detail layers

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ContextError;

/// Unique identifier for a context item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextItemId(Uuid);

impl ContextItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContextItemId {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ContextError::invalid(format!("bad context item id '{}': {}", s, e)))
    }
}

/// Where a context item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    ChatTurn,
    Feature,
    AgentResult,
    Document,
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatTurn => "chat_turn",
            Self::Feature => "feature",
            Self::AgentResult => "agent_result",
            Self::Document => "document",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat_turn" | "chat" => Ok(Self::ChatTurn),
            "feature" => Ok(Self::Feature),
            "agent_result" | "result" => Ok(Self::AgentResult),
            "document" | "doc" => Ok(Self::Document),
            "other" => Ok(Self::Other),
            other => Err(ContextError::invalid(format!("unknown source type '{}'", other))),
        }
    }
}

/// Detail level of a context item, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    Index,
    Timeline,
    Full,
}

impl DetailLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Timeline => "timeline",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rendered detail level of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub text: String,
    /// Token count under the store's tokenizer
    pub tokens: usize,
    pub embedding: Vec<f32>,
    /// Produced by the summarizer rather than supplied with the item
    pub generated: bool,
}

/// A new item to append to the store
#[derive(Debug, Clone)]
pub struct NewContextItem {
    pub project_id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub content: String,
    /// Explicit index summary; generated from `content` when absent
    pub index: Option<String>,
    pub timeline: Option<String>,
    pub full: Option<String>,
}

impl NewContextItem {
    pub fn new(
        project_id: impl Into<String>,
        source_type: SourceType,
        source_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            source_type,
            source_id: source_id.into(),
            content: content.into(),
            index: None,
            timeline: None,
            full: None,
        }
    }

    pub fn with_index(mut self, summary: impl Into<String>) -> Self {
        self.index = Some(summary.into());
        self
    }

    pub fn with_timeline(mut self, summary: impl Into<String>) -> Self {
        self.timeline = Some(summary.into());
        self
    }

    pub fn with_full(mut self, content: impl Into<String>) -> Self {
        self.full = Some(content.into());
        self
    }
}

/// One retrievable unit of history
///
/// Immutable once appended. The Timeline and Full layers start out empty and
/// are filled in at most once, either on first retrieval need or by the
/// background backfill. `None` inside a filled cell means the level adds
/// nothing over the level below it.
#[derive(Debug)]
pub struct ContextItem {
    pub id: ContextItemId,
    /// Append order within the store
    pub seq: u64,
    pub project_id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
    pub raw: String,
    pub index: Layer,
    pub(crate) timeline: OnceLock<Option<Layer>>,
    pub(crate) full: OnceLock<Option<Layer>>,
}

impl ContextItem {
    /// Layer at `level` if it has been materialised
    pub fn cached_layer(&self, level: DetailLevel) -> Option<&Layer> {
        match level {
            DetailLevel::Index => Some(&self.index),
            DetailLevel::Timeline => self.timeline.get().and_then(Option::as_ref),
            DetailLevel::Full => self.full.get().and_then(Option::as_ref),
        }
    }

    /// Whether the Timeline and Full cells have both been filled
    pub fn is_fully_materialised(&self) -> bool {
        self.timeline.get().is_some() && self.full.get().is_some()
    }

    /// Texts fixed at append time: raw content, Index, and supplied layers
    pub(crate) fn fixed_texts(&self) -> Vec<&str> {
        let mut texts = vec![self.raw.as_str(), self.index.text.as_str()];
        for cell in [&self.timeline, &self.full] {
            match cell.get() {
                Some(Some(layer)) if !layer.generated => texts.push(layer.text.as_str()),
                _ => {}
            }
        }
        texts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_level_ordering() {
        assert!(DetailLevel::Index < DetailLevel::Timeline);
        assert!(DetailLevel::Timeline < DetailLevel::Full);
    }

    #[test]
    fn test_source_type_parse() {
        assert_eq!("chat".parse::<SourceType>().unwrap(), SourceType::ChatTurn);
        assert_eq!(SourceType::AgentResult.to_string(), "agent_result");
        assert!("nonsense".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_item_id_roundtrip() {
        let id = ContextItemId::new();
        assert_eq!(id.to_string().parse::<ContextItemId>().unwrap(), id);
    }
}
