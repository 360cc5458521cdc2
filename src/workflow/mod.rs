//! Workflow orchestration: definitions, executions, the step state machine
//! and its OTP sub-engine.

pub mod api;
pub mod engine;
pub mod otp;
pub mod store;
pub mod template;
pub mod types;

pub use api::{ApiDispatcher, HttpApiDispatcher, MockApiDispatcher};
pub use engine::WorkflowEngine;
pub use otp::{OtpEngine, OtpVerdict};
pub use store::{MemoryWorkflowStore, PgWorkflowStore, WorkflowStore};
pub use types::{
    ExecutionId, ExecutionMode, ExecutionStatus, FinalizationConfig, RetryPolicy, StepConfig,
    StepId, StepOutcome, StepType, TriggerPhase, TriggerTiming, WorkflowDefinition,
    WorkflowExecution, WorkflowId, WorkflowStep,
};
