//! Interpretation of a model response according to the role that asked for it

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::execution::AgentRole;
use crate::domain::locking::{LockMode, ResourceKey, ResourceKind};
use crate::error::{Error, Result};

use super::task::{ResourceRequest, TaskDescriptor};

/// Limits and defaults applied while interpreting a Planner response
#[derive(Debug, Clone)]
pub struct PlanRules {
    /// Project that planned resources belong to
    pub project_id: String,
    pub max_workers: usize,
}

/// What a role's own step produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleOutput {
    /// Orchestrator: hand one brief to a single Planner
    Delegate { planner_brief: String },
    /// Planner: one Worker per descriptor, in declared order
    Fanout { tasks: Vec<TaskDescriptor> },
    /// Worker: the finished task
    Completed { content: String },
}

impl RoleOutput {
    pub fn children(&self) -> usize {
        match self {
            Self::Delegate { .. } => 1,
            Self::Fanout { tasks } => tasks.len(),
            Self::Completed { .. } => 0,
        }
    }
}

impl AgentRole {
    /// Turn this role's model response into its output
    ///
    /// The Orchestrator falls back to its whole response as the brief. A
    /// Planner response without a usable task list is an invalid plan.
    pub fn interpret(&self, content: &str, rules: &PlanRules) -> Result<RoleOutput> {
        match self {
            Self::Orchestrator => Ok(RoleOutput::Delegate {
                planner_brief: parse_brief(content),
            }),
            Self::Planner => parse_plan(content, rules).map(|tasks| RoleOutput::Fanout { tasks }),
            Self::Coder | Self::Reviewer | Self::Tester => Ok(RoleOutput::Completed {
                content: content.to_string(),
            }),
        }
    }
}

/// The slice from the first `{` to the last `}`, if any
fn outermost_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (start < end).then(|| &content[start..=end])
}

#[derive(Deserialize)]
struct BriefJson {
    planner_brief: String,
}

fn parse_brief(content: &str) -> String {
    outermost_json(content)
        .and_then(|json| serde_json::from_str::<BriefJson>(json).ok())
        .map(|brief| brief.planner_brief)
        .filter(|brief| !brief.trim().is_empty())
        .unwrap_or_else(|| content.trim().to_string())
}

#[derive(Deserialize)]
struct PlanJson {
    tasks: Vec<PlannedTask>,
}

#[derive(Deserialize)]
struct PlannedTask {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "agent_type")]
    role: String,
    description: String,
    #[serde(default)]
    resources: Vec<PlannedResource>,
}

#[derive(Deserialize)]
struct PlannedResource {
    #[serde(default)]
    project: Option<String>,
    kind: String,
    name: String,
    #[serde(default)]
    mode: Option<String>,
}

fn parse_plan(content: &str, rules: &PlanRules) -> Result<Vec<TaskDescriptor>> {
    let json = outermost_json(content)
        .ok_or_else(|| Error::InvalidPlan("response contains no JSON task list".to_string()))?;
    let plan: PlanJson = serde_json::from_str(json)
        .map_err(|e| Error::InvalidPlan(format!("malformed task list: {}", e)))?;

    if plan.tasks.is_empty() {
        return Err(Error::InvalidPlan("plan contains no tasks".to_string()));
    }
    if plan.tasks.len() > rules.max_workers {
        return Err(Error::InvalidPlan(format!(
            "plan has {} tasks, at most {} workers are allowed",
            plan.tasks.len(),
            rules.max_workers
        )));
    }

    let mut seen = HashSet::new();
    plan.tasks
        .into_iter()
        .enumerate()
        .map(|(i, task)| {
            let task_id = task
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("task-{}", i + 1));
            if !seen.insert(task_id.clone()) {
                return Err(Error::InvalidPlan(format!("duplicate task id '{}'", task_id)));
            }

            let role: AgentRole = task
                .role
                .parse()
                .map_err(|e: String| Error::InvalidPlan(format!("task {}: {}", task_id, e)))?;
            if !role.is_worker() {
                return Err(Error::InvalidPlan(format!(
                    "task {} names role {}, only coder, reviewer and tester can be planned",
                    task_id, role
                )));
            }
            if task.description.trim().is_empty() {
                return Err(Error::InvalidPlan(format!("task {} has no description", task_id)));
            }

            let resources = task
                .resources
                .into_iter()
                .map(|resource| planned_resource(&task_id, resource, rules))
                .collect::<Result<Vec<_>>>()?;

            Ok(TaskDescriptor {
                task_id,
                role,
                description: task.description.trim().to_string(),
                resources,
            })
        })
        .collect()
}

fn planned_resource(task_id: &str, resource: PlannedResource, rules: &PlanRules) -> Result<ResourceRequest> {
    let invalid = |msg: String| Error::InvalidPlan(format!("task {}: {}", task_id, msg));

    let kind: ResourceKind = resource.kind.parse().map_err(|e| invalid(format!("{}", e)))?;
    if kind == ResourceKind::Feature {
        // The Orchestrator holds the feature record until its workers finish
        return Err(invalid("workers cannot lock feature records".to_string()));
    }
    if resource.name.trim().is_empty() {
        return Err(invalid("resource without a name".to_string()));
    }
    let mode = match resource.mode.as_deref() {
        None => LockMode::Exclusive,
        Some(mode) => mode.parse().map_err(|e| invalid(format!("{}", e)))?,
    };
    let project = resource
        .project
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| rules.project_id.clone());

    Ok(ResourceRequest {
        key: ResourceKey::new(project, kind, resource.name.trim()),
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> PlanRules {
        PlanRules {
            project_id: "proj".into(),
            max_workers: 16,
        }
    }

    #[test]
    fn test_orchestrator_brief_from_json() {
        let out = AgentRole::Orchestrator
            .interpret("Sure!\n```json\n{\"planner_brief\": \"split auth\"}\n```", &rules())
            .unwrap();
        assert_eq!(
            out,
            RoleOutput::Delegate {
                planner_brief: "split auth".into()
            }
        );
        assert_eq!(out.children(), 1);
    }

    #[test]
    fn test_orchestrator_falls_back_to_text() {
        let out = AgentRole::Orchestrator
            .interpret("  just build the thing  ", &rules())
            .unwrap();
        assert_eq!(
            out,
            RoleOutput::Delegate {
                planner_brief: "just build the thing".into()
            }
        );
    }

    #[test]
    fn test_planner_tasks_in_declared_order() {
        let content = r#"Here is the plan:
        {"tasks": [
            {"id": "a", "role": "coder", "description": "write", "resources": [{"kind": "file", "name": "src/x.rs"}]},
            {"agent_type": "tester", "description": "test", "resources": [{"kind": "file", "name": "src/x.rs", "mode": "shared"}]},
            {"id": "c", "role": "reviewer", "description": "review", "resources": [{"project": "other", "kind": "database", "name": "users", "mode": "shared"}]}
        ]}"#;
        let RoleOutput::Fanout { tasks } = AgentRole::Planner.interpret(content, &rules()).unwrap() else {
            panic!("expected fanout");
        };

        let ids: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, ["a", "task-2", "c"]);
        assert_eq!(tasks[0].resources[0], ResourceRequest::exclusive(ResourceKey::file("proj", "src/x.rs")));
        assert_eq!(tasks[1].role, AgentRole::Tester);
        assert_eq!(tasks[1].resources[0].mode, LockMode::Shared);
        assert_eq!(tasks[2].resources[0].key.project_id, "other");
    }

    #[test]
    fn test_invalid_plans() {
        let cases = [
            "no json here",
            r#"{"tasks": "nope"}"#,
            r#"{"tasks": []}"#,
            r#"{"tasks": [{"role": "planner", "description": "x"}]}"#,
            r#"{"tasks": [{"role": "janitor", "description": "x"}]}"#,
            r#"{"tasks": [{"role": "coder", "description": "  "}]}"#,
            r#"{"tasks": [{"id": "a", "role": "coder", "description": "x"}, {"id": "a", "role": "tester", "description": "y"}]}"#,
            r#"{"tasks": [{"role": "coder", "description": "x", "resources": [{"kind": "file", "name": "f", "mode": "sometimes"}]}]}"#,
            r#"{"tasks": [{"role": "coder", "description": "x", "resources": [{"kind": "feature", "name": "feat-1"}]}]}"#,
        ];
        for case in cases {
            let err = AgentRole::Planner.interpret(case, &rules()).unwrap_err();
            assert!(matches!(err, Error::InvalidPlan(_)), "{case}: {err}");
        }
    }

    #[test]
    fn test_worker_limit() {
        let tasks: Vec<String> = (0..3)
            .map(|i| format!(r#"{{"role": "coder", "description": "t{}"}}"#, i))
            .collect();
        let content = format!(r#"{{"tasks": [{}]}}"#, tasks.join(","));
        let tight = PlanRules {
            max_workers: 2,
            ..rules()
        };
        assert!(matches!(
            AgentRole::Planner.interpret(&content, &tight),
            Err(Error::InvalidPlan(_))
        ));
        assert!(AgentRole::Planner.interpret(&content, &rules()).is_ok());
    }

    #[test]
    fn test_worker_output_is_verbatim() {
        let out = AgentRole::Coder.interpret("fn main() {}", &rules()).unwrap();
        assert_eq!(
            out,
            RoleOutput::Completed {
                content: "fn main() {}".into()
            }
        );
    }
}
