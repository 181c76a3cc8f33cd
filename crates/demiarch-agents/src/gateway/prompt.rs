//! Per-role system prompts and message assembly

use crate::agents::TaskDescriptor;
use crate::domain::context::ContextBundle;
use crate::domain::execution::AgentRole;

use super::wire::Message;

const ORCHESTRATOR_PROMPT: &str = r#"You are the Orchestrator agent in a hierarchical code generation system.

Your role is to:
1. Understand the feature request and the project context provided
2. Write a focused brief for the Planner agent, who will split the work into tasks

Respond with JSON:
```json
{
  "planner_brief": "What the Planner should decompose, including constraints and affected areas"
}
```

Keep the brief self-contained. The Planner sees only the brief and its own context."#;

const PLANNER_PROMPT: &str = r#"You are the Planner agent in a hierarchical code generation system.

Your role is to break the brief into discrete tasks for worker agents:
- **coder**: generate or modify code
- **reviewer**: review code for bugs and quality
- **tester**: write unit and integration tests

Every task must declare the resources it touches. Resource kinds are
file, database, model_api, feature and config; modes are exclusive (writes)
and shared (reads).

Respond with JSON:
```json
{
  "tasks": [
    {
      "id": "task-1",
      "role": "coder",
      "description": "What needs to be done",
      "resources": [{"kind": "file", "name": "src/auth.rs", "mode": "exclusive"}]
    }
  ]
}
```

Don't over-decompose simple features."#;

const CODER_PROMPT: &str = r#"You are a Coder agent. Implement the task below using the project context.
Only touch the resources declared for the task. Return the changed code and a short summary."#;

const REVIEWER_PROMPT: &str = r#"You are a Reviewer agent. Review the code named by the task for correctness,
bugs and maintainability. Return concrete findings, most severe first."#;

const TESTER_PROMPT: &str = r#"You are a Tester agent. Write tests that cover the behaviour named by the task,
including edge cases. Return the test code and what it covers."#;

/// System prompt for a role
pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Orchestrator => ORCHESTRATOR_PROMPT,
        AgentRole::Planner => PLANNER_PROMPT,
        AgentRole::Coder => CODER_PROMPT,
        AgentRole::Reviewer => REVIEWER_PROMPT,
        AgentRole::Tester => TESTER_PROMPT,
    }
}

/// Message sequence for one model call: system prompt, then context and task
pub fn build_messages(bundle: &ContextBundle, task: &TaskDescriptor) -> Vec<Message> {
    let mut messages = vec![Message::system(system_prompt(task.role))];

    if !bundle.is_empty() {
        messages.push(Message::user(bundle.render()));
    }

    let mut request = format!("Task {}: {}", task.task_id, task.description);
    let plan = task.lock_plan();
    if !plan.is_empty() {
        request.push_str("\n\nDeclared resources:");
        for resource in plan {
            request.push_str(&format!("\n- {} ({})", resource.key, resource.mode));
        }
    }
    messages.push(Message::user(request));

    messages
}
