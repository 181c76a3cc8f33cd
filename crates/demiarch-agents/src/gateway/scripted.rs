//! Deterministic gateway driven by rules, for tests and offline runs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::agents::TaskDescriptor;
use crate::domain::context::ContextBundle;
use crate::domain::execution::AgentRole;

use super::{GatewayError, GatewayResponse, ModelGateway, TokenUsage};

const SCRIPTED_MODEL: &str = "scripted/offline";

#[derive(Debug, Clone)]
enum Outcome {
    Respond(String),
    Fail(GatewayError),
}

/// What the scripted gateway does for matching calls
///
/// A rule matches on role, task id, or both. Rules are checked in the order
/// they were added; the first match wins.
#[derive(Debug, Clone)]
pub struct ScriptRule {
    role: Option<AgentRole>,
    task_id: Option<String>,
    outcome: Option<Outcome>,
    delay: Option<Duration>,
}

impl ScriptRule {
    pub fn for_role(role: AgentRole) -> Self {
        Self {
            role: Some(role),
            task_id: None,
            outcome: None,
            delay: None,
        }
    }

    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            role: None,
            task_id: Some(task_id.into()),
            outcome: None,
            delay: None,
        }
    }

    pub fn respond(mut self, content: impl Into<String>) -> Self {
        self.outcome = Some(Outcome::Respond(content.into()));
        self
    }

    pub fn fail(mut self, error: GatewayError) -> Self {
        self.outcome = Some(Outcome::Fail(error));
        self
    }

    /// Simulated model latency, applied before the outcome
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn matches(&self, task: &TaskDescriptor) -> bool {
        self.role.is_none_or(|role| role == task.role)
            && self
                .task_id
                .as_deref()
                .is_none_or(|id| id == task.task_id)
    }
}

/// One call as observed by the scripted gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCall {
    pub role: AgentRole,
    pub task_id: String,
    pub model_hint: Option<String>,
    pub context_entries: usize,
    pub context_tokens: usize,
    pub context_truncated: bool,
}

/// A [`ModelGateway`] that answers from rules instead of a network model
///
/// Without a matching rule it answers with a well-formed default per role:
/// the Orchestrator briefs the Planner, the Planner plans one coder, one
/// reviewer and one tester task, and workers report completion.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    rules: Vec<ScriptRule>,
    calls: Mutex<Vec<GatewayCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: ScriptRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Calls received so far, in arrival order
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Most calls that were ever in progress at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn rule_for(&self, task: &TaskDescriptor) -> Option<&ScriptRule> {
        self.rules.iter().find(|rule| rule.matches(task))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn complete(
        &self,
        bundle: &ContextBundle,
        task: &TaskDescriptor,
        model_hint: Option<&str>,
    ) -> Result<GatewayResponse, GatewayError> {
        self.calls.lock().push(GatewayCall {
            role: task.role,
            task_id: task.task_id.clone(),
            model_hint: model_hint.map(str::to_string),
            context_entries: bundle.len(),
            context_tokens: bundle.total_tokens,
            context_truncated: bundle.truncated,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let rule = self.rule_for(task);
        if let Some(delay) = rule.and_then(|r| r.delay) {
            tokio::time::sleep(delay).await;
        }

        let content = match rule.and_then(|r| r.outcome.clone()) {
            Some(Outcome::Fail(error)) => return Err(error),
            Some(Outcome::Respond(content)) => content,
            None => default_response(task),
        };

        let prompt = bundle.total_tokens + estimate_tokens(&task.description);
        let completion = estimate_tokens(&content);
        Ok(GatewayResponse::new(
            content,
            model_hint.unwrap_or(SCRIPTED_MODEL),
            TokenUsage::new(
                u32::try_from(prompt).unwrap_or(u32::MAX),
                u32::try_from(completion).unwrap_or(u32::MAX),
            ),
        ))
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn default_response(task: &TaskDescriptor) -> String {
    match task.role {
        AgentRole::Orchestrator => json!({ "planner_brief": task.description }).to_string(),
        AgentRole::Planner => json!({
            "tasks": [
                {
                    "id": "task-1",
                    "role": "coder",
                    "description": format!("Implement: {}", task.description),
                    "resources": [{"kind": "file", "name": "src/feature.rs", "mode": "exclusive"}]
                },
                {
                    "id": "task-2",
                    "role": "reviewer",
                    "description": format!("Review: {}", task.description),
                    "resources": [{"kind": "file", "name": "src/feature.rs", "mode": "shared"}]
                },
                {
                    "id": "task-3",
                    "role": "tester",
                    "description": format!("Test: {}", task.description),
                    "resources": [{"kind": "file", "name": "tests/feature_test.rs", "mode": "exclusive"}]
                }
            ]
        })
        .to_string(),
        role => format!("{} completed {}: {}", role, task.task_id, task.description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(role: AgentRole, id: &str) -> TaskDescriptor {
        TaskDescriptor::new(id, role, "add login")
    }

    #[tokio::test]
    async fn test_defaults_per_role() {
        let gateway = ScriptedGateway::new();
        let bundle = ContextBundle::empty(100);

        let brief = gateway
            .complete(&bundle, &task(AgentRole::Orchestrator, "o"), None)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&brief.content).unwrap();
        assert_eq!(value["planner_brief"], "add login");

        let plan = gateway
            .complete(&bundle, &task(AgentRole::Planner, "p"), None)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&plan.content).unwrap();
        assert_eq!(value["tasks"].as_array().unwrap().len(), 3);

        let work = gateway
            .complete(&bundle, &task(AgentRole::Tester, "t-9"), Some("m/x"))
            .await
            .unwrap();
        assert!(work.content.starts_with("tester completed t-9"));
        assert_eq!(work.model_used, "m/x");
        assert_eq!(gateway.call_count(), 3);
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let gateway = ScriptedGateway::new()
            .with_rule(ScriptRule::for_task("task-2").fail(GatewayError::Timeout))
            .with_rule(ScriptRule::for_role(AgentRole::Coder).respond("custom"));
        let bundle = ContextBundle::empty(0);

        let err = gateway
            .complete(&bundle, &task(AgentRole::Coder, "task-2"), None)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout);

        let ok = gateway
            .complete(&bundle, &task(AgentRole::Coder, "task-1"), None)
            .await
            .unwrap();
        assert_eq!(ok.content, "custom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_and_concurrency_tracking() {
        let gateway = std::sync::Arc::new(
            ScriptedGateway::new()
                .with_rule(ScriptRule::for_role(AgentRole::Coder).delay(Duration::from_secs(5))),
        );

        let mut joins = Vec::new();
        for i in 0..3 {
            let gateway = gateway.clone();
            joins.push(tokio::spawn(async move {
                gateway
                    .complete(&ContextBundle::empty(0), &task(AgentRole::Coder, &format!("c{}", i)), None)
                    .await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        assert_eq!(gateway.peak_concurrency(), 3);
        assert_eq!(gateway.in_flight.load(Ordering::SeqCst), 0);
    }
}
