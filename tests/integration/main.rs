//! End-to-end tests for the orchestrator and the `featureloop` binary.

mod approval;
mod breaker;
mod cli;
mod common;
mod lifecycle;
mod recovery;
