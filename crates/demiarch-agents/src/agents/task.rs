//! Task descriptors and the inputs handed to the executor

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::context::SourceScope;
use crate::domain::execution::AgentRole;
use crate::domain::locking::{LockMode, ResourceKey};

/// One resource a task needs, declared before the task starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub key: ResourceKey,
    pub mode: LockMode,
}

impl ResourceRequest {
    pub fn exclusive(key: ResourceKey) -> Self {
        Self {
            key,
            mode: LockMode::Exclusive,
        }
    }

    pub fn shared(key: ResourceKey) -> Self {
        Self {
            key,
            mode: LockMode::Shared,
        }
    }
}

/// A unit of work for one agent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub role: AgentRole,
    pub description: String,
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
}

impl TaskDescriptor {
    pub fn new(task_id: impl Into<String>, role: AgentRole, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            role,
            description: description.into(),
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, key: ResourceKey, mode: LockMode) -> Self {
        self.resources.push(ResourceRequest { key, mode });
        self
    }

    /// Declared resources, one per key in key order, Exclusive winning over Shared
    pub fn lock_plan(&self) -> Vec<ResourceRequest> {
        let mut merged: BTreeMap<&ResourceKey, LockMode> = BTreeMap::new();
        for request in &self.resources {
            merged
                .entry(&request.key)
                .and_modify(|mode| *mode = mode.strongest(request.mode))
                .or_insert(request.mode);
        }
        merged
            .into_iter()
            .map(|(key, mode)| ResourceRequest {
                key: key.clone(),
                mode,
            })
            .collect()
    }
}

/// Everything the executor needs to run one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub descriptor: TaskDescriptor,
    /// Query used to rank context items
    pub context_query: String,
    pub scope: SourceScope,
    /// Context budget; the executor default applies when absent
    pub max_context_tokens: Option<usize>,
    pub model_hint: Option<String>,
}

impl TaskInput {
    /// Input whose context query is the task description
    pub fn new(descriptor: TaskDescriptor, scope: SourceScope) -> Self {
        Self {
            context_query: descriptor.description.clone(),
            descriptor,
            scope,
            max_context_tokens: None,
            model_hint: None,
        }
    }

    pub fn with_max_context_tokens(mut self, max_tokens: usize) -> Self {
        self.max_context_tokens = Some(max_tokens);
        self
    }

    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }
}

/// A feature-level request, the root of one hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureInput {
    pub project_id: String,
    pub feature_id: String,
    pub description: String,
    /// Extra resources the Orchestrator holds besides the feature record
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
    pub model_hint: Option<String>,
    pub max_context_tokens: Option<usize>,
}

impl FeatureInput {
    pub fn new(
        project_id: impl Into<String>,
        feature_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            feature_id: feature_id.into(),
            description: description.into(),
            resources: Vec::new(),
            model_hint: None,
            max_context_tokens: None,
        }
    }

    pub fn with_resource(mut self, key: ResourceKey, mode: LockMode) -> Self {
        self.resources.push(ResourceRequest { key, mode });
        self
    }

    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    pub fn with_max_context_tokens(mut self, max_tokens: usize) -> Self {
        self.max_context_tokens = Some(max_tokens);
        self
    }

    /// The Orchestrator's own task: locks the feature record exclusively
    pub fn orchestrator_input(&self) -> TaskInput {
        let mut descriptor = TaskDescriptor::new(
            format!("{}:orchestrate", self.feature_id),
            AgentRole::Orchestrator,
            self.description.clone(),
        )
        .with_resource(
            ResourceKey::feature(&self.project_id, &self.feature_id),
            LockMode::Exclusive,
        );
        descriptor.resources.extend(self.resources.iter().cloned());

        TaskInput {
            context_query: self.description.clone(),
            descriptor,
            scope: SourceScope::project(&self.project_id),
            max_context_tokens: self.max_context_tokens,
            model_hint: self.model_hint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_plan_dedupes_and_sorts() {
        let a = ResourceKey::file("p", "a.rs");
        let b = ResourceKey::file("p", "b.rs");
        let task = TaskDescriptor::new("t", AgentRole::Coder, "edit")
            .with_resource(b.clone(), LockMode::Shared)
            .with_resource(a.clone(), LockMode::Shared)
            .with_resource(b.clone(), LockMode::Exclusive);

        let plan = task.lock_plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0], ResourceRequest::shared(a));
        assert_eq!(plan[1], ResourceRequest::exclusive(b));
    }

    #[test]
    fn test_orchestrator_input_locks_feature() {
        let feature = FeatureInput::new("proj", "feat-7", "Add password reset")
            .with_resource(ResourceKey::database("proj", "users"), LockMode::Shared);
        let input = feature.orchestrator_input();

        assert_eq!(input.descriptor.role, AgentRole::Orchestrator);
        assert_eq!(input.scope.project_id.as_deref(), Some("proj"));
        let plan = input.descriptor.lock_plan();
        assert!(plan.contains(&ResourceRequest::exclusive(ResourceKey::feature("proj", "feat-7"))));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_task_input_defaults_query_to_description() {
        let input = TaskInput::new(
            TaskDescriptor::new("t", AgentRole::Tester, "cover the reset flow"),
            SourceScope::default(),
        );
        assert_eq!(input.context_query, "cover the reset flow");
        assert!(input.max_context_tokens.is_none());
    }
}
