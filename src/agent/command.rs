//! Subprocess-backed agent client.
//!
//! Spawns a CLI agent per call and maps its line-delimited stream-json
//! output onto [`AgentEvent`]s. Lines that are not JSON pass through as
//! plain text.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentClient, AgentEvent, AgentRequest, AgentStream};
use crate::config::AgentCommandConfig;
use crate::error::{OrchestratorError, Result};

/// Environment variable listing MCP servers for the child process.
pub const MCP_SERVERS_ENV: &str = "FEATURELOOP_MCP_SERVERS";

/// Runs the configured agent program once per call.
#[derive(Debug, Clone)]
pub struct CommandAgentClient {
    config: AgentCommandConfig,
}

impl CommandAgentClient {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }

    /// Argument list for one call, with the prompt placed right after
    /// `-p`/`--print` when present and appended otherwise.
    pub fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = self.config.args.clone();
        let print_flag = args.iter().position(|arg| arg == "-p" || arg == "--print");
        match print_flag {
            Some(index) => args.insert(index + 1, request.prompt.clone()),
            None => args.push(request.prompt.clone()),
        }
        if let (Some(flag), Some(model)) = (&self.config.model_flag, &request.model) {
            args.push(flag.clone());
            args.push(model.clone());
        }
        if let (Some(flag), Some(system_prompt)) =
            (&self.config.system_prompt_flag, &request.system_prompt)
        {
            args.push(flag.clone());
            args.push(system_prompt.clone());
        }
        if request.read_only {
            args.extend(self.config.read_only_args.iter().cloned());
        }
        args
    }
}

#[async_trait]
impl AgentClient for CommandAgentClient {
    async fn execute(&self, request: AgentRequest) -> Result<AgentStream> {
        let args = self.build_args(&request);
        info!(
            program = %self.config.program,
            workdir = %request.working_dir.display(),
            model = ?request.model,
            read_only = request.read_only,
            "Spawning agent process"
        );

        let mut command = Command::new(&self.config.program);
        command
            .current_dir(&request.working_dir)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !request.mcp_servers.is_empty() {
            command.env(MCP_SERVERS_ENV, request.mcp_servers.join(","));
        }

        let mut child = command.spawn().map_err(|err| {
            OrchestratorError::agent(format!(
                "failed to spawn agent '{}': {}",
                self.config.program, err
            ))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::agent("agent stdout unavailable"))?;
        let stderr = child.stderr.take();

        let state = ProcessStream {
            child,
            lines: BufReader::new(stdout).lines(),
            stderr,
            cancel: request.cancel.clone(),
            pending: VecDeque::new(),
            saw_result: false,
            finished: false,
        };
        Ok(stream::unfold(state, next_event).boxed())
    }
}

struct ProcessStream {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<ChildStderr>,
    cancel: CancellationToken,
    pending: VecDeque<AgentEvent>,
    saw_result: bool,
    finished: bool,
}

enum Step {
    Cancelled,
    Line(String),
    Eof,
    ReadError(std::io::Error),
}

async fn next_event(mut state: ProcessStream) -> Option<(AgentEvent, ProcessStream)> {
    loop {
        if let Some(event) = state.pending.pop_front() {
            return Some((event, state));
        }
        if state.finished {
            return None;
        }

        let step = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => Step::Cancelled,
            line = state.lines.next_line() => match line {
                Ok(Some(line)) => Step::Line(line),
                Ok(None) => Step::Eof,
                Err(err) => Step::ReadError(err),
            },
        };

        match step {
            Step::Cancelled => {
                debug!("Agent call cancelled, killing process");
                if let Err(err) = state.child.start_kill() {
                    warn!(error = %err, "Failed to kill agent process");
                }
                state.finished = true;
            }
            Step::Line(line) => {
                let events = parse_stream_line(&line);
                if events
                    .iter()
                    .any(|event| matches!(event, AgentEvent::Result { .. }))
                {
                    state.saw_result = true;
                }
                state.pending.extend(events);
            }
            Step::Eof => {
                state.finished = true;
                if let Some(event) = exit_event(&mut state).await {
                    state.pending.push_back(event);
                }
            }
            Step::ReadError(err) => {
                state.finished = true;
                state
                    .pending
                    .push_back(AgentEvent::error(format!("failed to read agent output: {}", err)));
            }
        }
    }
}

async fn exit_event(state: &mut ProcessStream) -> Option<AgentEvent> {
    let status = match state.child.wait().await {
        Ok(status) => status,
        Err(err) => return Some(AgentEvent::error(format!("agent wait failed: {}", err))),
    };
    if status.success() || state.saw_result {
        return None;
    }

    let mut stderr_text = String::new();
    if let Some(mut stderr) = state.stderr.take() {
        if let Err(err) = stderr.read_to_string(&mut stderr_text).await {
            debug!(error = %err, "Could not read agent stderr");
        }
    }
    let stderr_text = stderr_text.trim();
    let message = if stderr_text.is_empty() {
        format!("agent process exited with {}", status)
    } else {
        format!("agent process exited with {}: {}", status, stderr_text)
    };
    Some(AgentEvent::error(message))
}

/// Map one stdout line to zero or more agent events.
pub fn parse_stream_line(line: &str) -> Vec<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => value,
        _ => return vec![AgentEvent::text(format!("{}\n", line))],
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => value
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(|blocks| blocks.iter().filter_map(content_block_event).collect())
            .unwrap_or_default(),
        Some("result") => {
            let text = value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let subtype_ok = value
                .get("subtype")
                .and_then(Value::as_str)
                .map_or(true, |subtype| subtype == "success");
            let success = !is_error && subtype_ok;
            let text = if !success && text.is_empty() {
                value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or("error")
                    .to_string()
            } else {
                text
            };
            vec![AgentEvent::Result { success, text }]
        }
        Some("error") => {
            let message = value
                .get("message")
                .or_else(|| value.pointer("/error/message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown agent error");
            vec![AgentEvent::error(message)]
        }
        _ => Vec::new(),
    }
}

fn content_block_event(block: &Value) -> Option<AgentEvent> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => block
            .get("text")
            .and_then(Value::as_str)
            .map(AgentEvent::text),
        "tool_use" => Some(AgentEvent::ToolUse {
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        "thinking" => block
            .get("thinking")
            .and_then(Value::as_str)
            .map(|text| AgentEvent::Thinking {
                text: text.to_string(),
            }),
        _ => None,
    }
}
