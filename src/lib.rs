//! featureloop: a feature orchestrator that drives a coding agent through
//! planning, approval, task execution, verification and pipeline steps.
//!
//! The [`Orchestrator`] owns the running-feature registry and the
//! auto-loop; everything it knows about a feature lives in the
//! [`feature::FeatureStore`] under `.featureloop/` so that a crashed
//! process can pick up where it left off.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod feature;
pub mod metrics;
pub mod orchestrator;
pub mod parallel;
pub mod persist;
pub mod plan;
pub mod quality;
pub mod state;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use orchestrator::{FeatureOutcome, Orchestrator};
