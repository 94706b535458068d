// Workflow Automation Engine
//
// Event-driven automation: triggers select workflows, compiled programs run
// their actions, and approval steps park an execution until a human decides.

pub mod actions;
pub mod approvals;
pub mod assignment;
pub mod conditions;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod pg_store;
pub mod store;
pub mod triggers;

pub use actions::{ActionKind, ActionOutcome};
pub use approvals::ApprovalGate;
pub use assignment::{AssignmentError, AssignmentOutcome, AssignmentRuleEngine};
pub use conditions::{Condition, ConditionOperator, ConditionSet};
pub use engine::{EngineError, EngineResult, SaveWorkflow, WorkflowEngine};
pub use executor::{ActionExecutor, ExecutionContext};
pub use graph::{BranchEvaluator, CompiledWorkflow, GraphError, Instruction, WorkflowGraph};
pub use pg_store::PgWorkflowStore;
pub use store::{AssignmentRuleStore, ExecutionPatch, InMemoryStore, StoreError, WorkflowStore};
pub use triggers::{ContextResolver, EventRouter};
