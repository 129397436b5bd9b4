//! Agent client contract.
//!
//! An agent takes a prompt and streams back text, tool use, thinking and
//! a final result. Streams are finite and not restartable; revisions are
//! new calls. Every call carries a cancellation token the client must
//! honor by ending the stream promptly.

pub mod command;
pub mod session;

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

pub use command::CommandAgentClient;
pub use session::AgentSession;

/// Stream of events produced by one agent call.
pub type AgentStream = BoxStream<'static, AgentEvent>;

/// An event emitted by an agent while it works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant text.
    Text { text: String },
    /// The agent invoked a tool.
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Reasoning text; not part of the output.
    Thinking { text: String },
    /// Final result of the call.
    Result { success: bool, text: String },
    /// Transport or provider error.
    Error { message: String },
}

impl AgentEvent {
    pub fn text(text: impl Into<String>) -> Self {
        AgentEvent::Text { text: text.into() }
    }

    pub fn success(text: impl Into<String>) -> Self {
        AgentEvent::Result {
            success: true,
            text: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentEvent::Error {
            message: message.into(),
        }
    }
}

/// Parameters for one agent call.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub working_dir: PathBuf,
    pub system_prompt: Option<String>,
    pub cancel: CancellationToken,
    /// MCP server names made available to the agent.
    pub mcp_servers: Vec<String>,
    /// The agent must not modify files (judge calls).
    pub read_only: bool,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            working_dir: working_dir.into(),
            system_prompt: None,
            cancel: CancellationToken::new(),
            mcp_servers: Vec::new(),
            read_only: false,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_mcp_servers(mut self, servers: Vec<String>) -> Self {
        self.mcp_servers = servers;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// A code-generation backend.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Start a call and return its event stream.
    async fn execute(&self, request: AgentRequest) -> Result<AgentStream>;
}

/// Everything collected from a drained agent stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    /// Concatenated assistant text.
    pub text: String,
    pub tool_uses: u32,
    /// Text of the final result event, if any.
    pub result_text: Option<String>,
}

impl AgentOutput {
    /// Assistant text, falling back to the result text when the agent
    /// streamed nothing else.
    pub fn best_text(&self) -> &str {
        if self.text.trim().is_empty() {
            self.result_text.as_deref().unwrap_or("")
        } else {
            &self.text
        }
    }
}

/// Drain an agent stream under a cancellation token.
///
/// `on_event` sees every event as it arrives. An error event or a failed
/// result ends the call with a classified agent error; cancellation wins
/// over anything still pending in the stream.
pub async fn drain_agent_stream<F>(
    mut stream: AgentStream,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<AgentOutput>
where
    F: FnMut(&AgentEvent),
{
    let mut output = AgentOutput::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            next = stream.next() => next,
        };
        let Some(event) = next else {
            break;
        };
        on_event(&event);
        match event {
            AgentEvent::Text { text } => {
                output.text.push_str(&text);
            }
            AgentEvent::ToolUse { name, .. } => {
                debug!(tool = %name, "Agent tool use");
                output.tool_uses += 1;
            }
            AgentEvent::Thinking { .. } => {}
            AgentEvent::Result { success, text } => {
                if !success {
                    let message = if text.trim().is_empty() {
                        "Agent reported a failed result".to_string()
                    } else {
                        text
                    };
                    return Err(OrchestratorError::agent(message));
                }
                output.result_text = Some(text);
            }
            AgentEvent::Error { message } => {
                return Err(OrchestratorError::agent(message));
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled);
    }
    Ok(output)
}

/// Start a call and drain it with the request's own cancellation token.
pub async fn run_agent<F>(
    client: &dyn AgentClient,
    request: AgentRequest,
    on_event: F,
) -> Result<AgentOutput>
where
    F: FnMut(&AgentEvent),
{
    let cancel = request.cancel.clone();
    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled);
    }
    let stream = client.execute(request).await?;
    drain_agent_stream(stream, &cancel, on_event).await
}
