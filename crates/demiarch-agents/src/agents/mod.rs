//! Agent hierarchy: task descriptors, role outputs, the executor and the scheduler
//!
//! Three levels, each a closed role:
//! - Orchestrator (level 1): one per feature, briefs a single Planner
//! - Planner (level 2): decomposes the brief into worker tasks
//! - Coder / Reviewer / Tester (level 3): run concurrently, one per task

pub mod executor;
pub mod output;
pub mod result;
pub mod scheduler;
pub mod task;

pub use executor::{AgentExecutor, ExecutorConfig, StepOutput};
pub use output::{PlanRules, RoleOutput};
pub use result::AgentResult;
pub use scheduler::{AgentScheduler, FeatureHandle, SchedulerConfig};
pub use task::{FeatureInput, ResourceRequest, TaskDescriptor, TaskInput};
