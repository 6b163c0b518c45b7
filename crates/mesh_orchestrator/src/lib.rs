//! PhotoMesh build orchestration.
//!
//! Enforces the Wizard's install and per-user configuration, drives the
//! two-phase Wizard launch or the Project Queue, and hands finished builds
//! to the Reality Mesh post-processor.

pub mod cancel;
pub mod config;
pub mod elevation;
pub mod error;
pub mod fsutil;
pub mod metrics;
pub mod netcheck;
pub mod orchestrator;
pub mod paths;
pub mod postprocess;
pub mod preset;
pub mod queue;
pub mod share;
pub mod wizard;
pub mod xml;

pub use cancel::Cancellation;
pub use config::ConfigStore;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use metrics::Metrics;
pub use orchestrator::{Orchestrator, QueueBuildRequest};
pub use paths::PhotoMeshPaths;
pub use preset::{PresetManager, CANONICAL_PRESET_NAME};
pub use wizard::{WizardDriver, WizardRequest};
