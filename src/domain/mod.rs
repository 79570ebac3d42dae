//! Domain types for the rnadeseq pipeline engine.
//!
//! This module contains the core data structures:
//! - Params: Declared inputs, sentinels and resolutions
//! - Artifact: Stage outputs
//! - Failure: Stage failure causes
//! - Events: Immutable records of state changes
//! - Run: Run state rebuilt from events

pub mod artifact;
pub mod events;
pub mod failure;
pub mod params;
pub mod run;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactKind};
pub use events::{Event, EventType, StageStatus};
pub use failure::{FailureCause, StageFailure};
pub use params::{
    ParamKind, ParamName, Requirement, Resolution, ResolvedParameter, Sentinel, DEFAULT, NO_FILE,
};
pub use run::{Run, RunState};
