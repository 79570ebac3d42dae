//! Core orchestration logic.
//!
//! This module contains:
//! - Resolver: Input parameters to paths, values or sentinels
//! - Samples: Read files grouped per metagenomic sample
//! - Graph: Stages, bindings and the dependency graph
//! - Materialize: Stage templates to concrete commands
//! - Pipeline: The rnadeseq stage definitions and planning
//! - Scheduler: Concurrent, budget-bounded graph execution
//! - Limits: Resource limits and run budget
//! - EventStore: Append-only event logging
//! - Completion: Run summary and notification

pub mod completion;
pub mod event_store;
pub mod graph;
pub mod limits;
pub mod materialize;
pub mod pipeline;
pub mod resolver;
pub mod samples;
pub mod scheduler;

// Re-export commonly used types
pub use completion::{CompletionReporter, NotifyOn, RunContext, RunSummary};
pub use event_store::{cache_key, hash_input, EventStore};
pub use graph::{BindingSource, Branch, GraphError, InputBinding, OutputDecl, Stage, StageGraph};
pub use limits::{LimitViolation, ResourceLimits, RunTracker};
pub use materialize::{CommandSpec, Materializer, MaterializeError, ResolvedInputs};
pub use pipeline::{plan, RetryPolicy};
pub use resolver::{
    resolve_all, resolve_with_samples, InputError, InputValidationError, ResolvedParams,
    SuppliedParams,
};
pub use samples::{group_samples, Sample};
pub use scheduler::{RunLock, RunOutcome, Scheduler, StageOutcome};
