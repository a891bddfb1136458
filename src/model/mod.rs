mod block;
mod job;
mod project;
mod run;
mod schedule;

pub use block::{BlockCategory, BlockDefinition, ErrorCodeDef, InternalStep};
pub use job::{ExecutionMode, Job, JobPriority, JobStatus};
pub use project::{
    BlockGroup, Edge, ForeachConfig, GroupType, ParallelConfig, Project, ProjectDefinition,
    ProjectStatus, ProjectVersion, Step, StepType, TriggerType, TryCatchConfig, WhileConfig,
};
pub use run::{Run, RunStatus, StepLogEntry, StepRun, StepRunStatus, TriggeredBy};
pub use schedule::Schedule;
