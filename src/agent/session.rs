//! Agent calls bound to one feature run.
//!
//! A session carries everything a feature's agent calls share: the client,
//! the working directory, the model and the run's cancellation token. Each
//! call forwards progress to the event bus, streams assistant text into the
//! feature's saved output and records token estimates against the run.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{run_agent, AgentClient, AgentEvent, AgentOutput, AgentRequest};
use crate::error::Result;
use crate::events::{EventBus, OrchestratorEvent};
use crate::feature::FeatureStore;
use crate::metrics::tokens::TokenEstimator;
use crate::metrics::MetricsCollector;

/// Shared context for every agent call of one feature run.
#[derive(Clone)]
pub struct AgentSession {
    agent: Arc<dyn AgentClient>,
    store: FeatureStore,
    events: EventBus,
    metrics: MetricsCollector,
    estimator: TokenEstimator,
    feature_id: String,
    run_id: String,
    working_dir: PathBuf,
    model: Option<String>,
    cancel: CancellationToken,
    /// Serializes output appends from concurrent task calls.
    output_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("feature_id", &self.feature_id)
            .field("run_id", &self.run_id)
            .field("working_dir", &self.working_dir)
            .field("model", &self.model)
            .finish()
    }
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<dyn AgentClient>,
        store: FeatureStore,
        events: EventBus,
        metrics: MetricsCollector,
        feature_id: impl Into<String>,
        run_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        model: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            store,
            events,
            metrics,
            estimator: TokenEstimator::default(),
            feature_id: feature_id.into(),
            run_id: run_id.into(),
            working_dir: working_dir.into(),
            model,
            cancel,
            output_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Emit a progress message for this feature.
    pub fn progress(&self, message: impl Into<String>) {
        self.events.emit(OrchestratorEvent::FeatureProgress {
            feature_id: self.feature_id.clone(),
            message: message.into(),
        });
    }

    /// Run a call whose text becomes part of the feature's saved output.
    pub async fn run(&self, prompt: String, system_prompt: Option<&str>) -> Result<AgentOutput> {
        self.call(prompt, system_prompt, false).await
    }

    /// Run a read-only call (judge); its text is not saved as output.
    pub async fn run_read_only(
        &self,
        prompt: String,
        system_prompt: Option<&str>,
    ) -> Result<AgentOutput> {
        self.call(prompt, system_prompt, true).await
    }

    async fn call(
        &self,
        prompt: String,
        system_prompt: Option<&str>,
        read_only: bool,
    ) -> Result<AgentOutput> {
        let mut request = AgentRequest::new(prompt.clone(), self.working_dir.clone())
            .with_model(self.model.clone())
            .with_cancel(self.cancel.clone());
        if let Some(system_prompt) = system_prompt {
            request = request.with_system_prompt(system_prompt);
        }
        if read_only {
            request = request.read_only();
        }

        debug!(
            feature_id = %self.feature_id,
            read_only,
            prompt_chars = prompt.len(),
            "Starting agent call"
        );
        let mut transcript = String::new();
        let result = run_agent(self.agent.as_ref(), request, |event| match event {
            AgentEvent::Text { text } => {
                if !read_only {
                    self.save_chunk(text, transcript.is_empty());
                }
                transcript.push_str(text);
            }
            AgentEvent::ToolUse { name, .. } => {
                self.events.emit(OrchestratorEvent::FeatureToolUse {
                    feature_id: self.feature_id.clone(),
                    tool: name.clone(),
                });
            }
            _ => {}
        })
        .await;

        let tokens = self.estimator.estimate_interaction(&prompt, &transcript);
        self.metrics.record_tokens(&self.run_id, tokens);

        result
    }

    /// Write streamed text to the saved output as soon as it arrives, so
    /// a crash mid-call leaves it on disk. The first chunk of a call
    /// starts on a new line.
    fn save_chunk(&self, text: &str, first: bool) {
        if text.is_empty() {
            return;
        }
        let _guard = self
            .output_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved = if first {
            self.store.append_agent_output(&self.feature_id, text)
        } else {
            self.store.append_agent_chunk(&self.feature_id, text)
        };
        if let Err(err) = saved {
            warn!(feature_id = %self.feature_id, error = %err, "Failed to save agent output");
        }
    }
}
