//! Context bundles handed to a single model call

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{ContextItemId, DetailLevel, SourceType};
use crate::error::Error;

/// One item of a bundle at its chosen detail level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub item_id: ContextItemId,
    pub source_type: SourceType,
    pub source_id: String,
    pub level: DetailLevel,
    pub text: String,
    pub tokens: usize,
    /// Similarity to the query; absent when the bundle was truncated before ranking
    pub similarity: Option<f32>,
    pub created_at: DateTime<Utc>,
}

/// The budget-bounded slice of history for one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    /// Most recent first
    pub entries: Vec<BundleEntry>,
    pub total_tokens: usize,
    pub max_tokens: usize,
    /// Not every in-scope item fit at Index level
    pub truncated: bool,
    /// Index tokens all in-scope items would have needed
    pub index_tokens_required: usize,
    /// Items dropped by the injection filter
    pub excluded: Vec<ContextItemId>,
}

impl ContextBundle {
    /// An empty bundle for callers that skip retrieval
    pub fn empty(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, id: ContextItemId) -> Option<&BundleEntry> {
        self.entries.iter().find(|e| e.item_id == id)
    }

    /// Number of entries at each level: (index, timeline, full)
    pub fn level_counts(&self) -> (usize, usize, usize) {
        self.entries
            .iter()
            .fold((0, 0, 0), |(i, t, f), entry| match entry.level {
                DetailLevel::Index => (i + 1, t, f),
                DetailLevel::Timeline => (i, t + 1, f),
                DetailLevel::Full => (i, t, f + 1),
            })
    }

    /// Non-fatal conditions the retrieval resolved locally
    pub fn diagnostics(&self) -> Vec<Error> {
        let mut out = Vec::new();
        if self.truncated {
            out.push(Error::ContextBudgetExceeded {
                required: self.index_tokens_required,
                max_tokens: self.max_tokens,
            });
        }
        out.extend(self.excluded.iter().map(|id| Error::ContextInjectionDetected(*id)));
        out
    }

    /// Render the bundle as a prompt section
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }

        let mut out = String::from("## Project context\n");
        for entry in &self.entries {
            out.push_str(&format!(
                "\n### {} {} ({})\n{}\n",
                entry.source_type, entry.source_id, entry.level, entry.text
            ));
        }
        if self.truncated {
            out.push_str("\n(Older history omitted to fit the context budget.)\n");
        }
        out
    }
}
