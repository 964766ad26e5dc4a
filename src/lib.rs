//! Purpose: Library crate behind the `stageload` CLI.
//! Exports: `core` (artifact stores, staging, launching, errors) and the re-exports below.
//! Role: Host applications call `activate` (or `stage` then `launch`) on demand.
//! Invariants: A staged target is only ever replaced by an atomic rename.
//! Invariants: Launching never waits on or supervises the child.
//! Invariants: Core modules take explicit inputs; there is no hidden shared state.
pub mod core;

pub use crate::core::activate::{Activation, ActivationRequest, activate};
pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::launch::{LaunchOutput, LaunchSpec, ProcessHandle, launch};
pub use crate::core::stage::{StageOptions, StagedArtifact, stage, staging_target};
pub use crate::core::store::{ArtifactStore, DirStore, MemoryStore, validate_artifact_name};
