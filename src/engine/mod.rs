//! The orchestration engine and the pieces it drives.

pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod repair;
pub mod runtime;
pub mod supervisor;

pub use events::{EventSink, EventStream, StudioEvent};
pub use executor::{ExecutionReport, StepExecutor, StepResult};
pub use orchestrator::{Engine, EngineParts, PlanResponse};
pub use plan::PlanDraft;
pub use repair::{RepairLoop, RepairOutcome};
pub use runtime::Runtime;
pub use supervisor::TaskSupervisor;
