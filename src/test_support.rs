//! Scripted agent client and plan fixtures for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::agent::{AgentClient, AgentEvent, AgentRequest, AgentStream};
use crate::config::DEFAULT_PLAN_MARKER;
use crate::error::Result;

/// What the scripted agent answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream the text, then a successful result.
    Text(String),
    /// Stream exactly these events.
    Events(Vec<AgentEvent>),
    /// Emit an error event with this message.
    Fail(String),
    /// Never finish; only cancellation ends the call.
    Hang,
    /// Stream the text, then hang.
    Stall(String),
    /// Wait, then answer.
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Reply::Fail(message.into())
    }

    pub fn stall(text: impl Into<String>) -> Self {
        Reply::Stall(text.into())
    }

    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }

    fn into_stream(self) -> AgentStream {
        match self {
            Reply::Text(text) => {
                stream::iter(vec![AgentEvent::text(text), AgentEvent::success("")]).boxed()
            }
            Reply::Events(events) => stream::iter(events).boxed(),
            Reply::Fail(message) => stream::iter(vec![AgentEvent::error(message)]).boxed(),
            Reply::Hang => stream::pending().boxed(),
            Reply::Stall(text) => stream::iter(vec![AgentEvent::text(text)])
                .chain(stream::pending())
                .boxed(),
            Reply::Delayed(delay, reply) => stream::once(tokio::time::sleep(delay))
                .filter_map(|_| async { None::<AgentEvent> })
                .chain(reply.into_stream())
                .boxed(),
        }
    }
}

#[derive(Debug)]
struct Rule {
    needle: String,
    replies: Vec<Reply>,
    served: usize,
}

impl Rule {
    /// Next reply; the last one repeats.
    fn next(&mut self) -> Option<Reply> {
        let index = self.served.min(self.replies.len().checked_sub(1)?);
        self.served += 1;
        self.replies.get(index).cloned()
    }
}

/// Agent whose answers are chosen by prompt substring.
///
/// Rules are checked in the order they were added; the first whose needle
/// occurs in the prompt answers. Unmatched prompts get the default reply.
#[derive(Debug)]
pub struct ScriptedAgent {
    rules: Mutex<Vec<Rule>>,
    default_reply: Reply,
    requests: Mutex<Vec<AgentRequest>>,
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default_reply: Reply::text("Done."),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Answer prompts containing `needle` with `reply`.
    pub fn on(self, needle: impl Into<String>, reply: Reply) -> Self {
        self.on_sequence(needle, vec![reply])
    }

    /// Answer successive matching prompts with `replies` in order.
    pub fn on_sequence(self, needle: impl Into<String>, replies: Vec<Reply>) -> Self {
        lock(&self.rules).push(Rule {
            needle: needle.into(),
            replies,
            served: 0,
        });
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<AgentRequest> {
        lock(&self.requests).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|request| request.prompt.clone())
            .collect()
    }

    /// Number of requests whose prompt contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.prompt.contains(needle))
            .count()
    }

    fn reply_for(&self, prompt: &str) -> Reply {
        let mut rules = lock(&self.rules);
        rules
            .iter_mut()
            .find(|rule| prompt.contains(&rule.needle))
            .and_then(Rule::next)
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn execute(&self, request: AgentRequest) -> Result<AgentStream> {
        let reply = self.reply_for(&request.prompt);
        lock(&self.requests).push(request);
        Ok(reply.into_stream())
    }
}

/// A lite-mode plan with every required section, ending with the marker.
pub fn lite_plan(task_lines: &str) -> String {
    format!(
        "## Goal\nShip the feature.\n\n## Approach\nSmall steps.\n\n## Files to Touch\n- src/lib.rs\n\n## Tasks\n```tasks\n{}\n```\n\n## Risks\nNone known.\n\n{}\n",
        task_lines, DEFAULT_PLAN_MARKER
    )
}

/// A spec-mode plan with every required section, ending with the marker.
pub fn spec_plan(task_lines: &str) -> String {
    format!(
        "## Goal\nShip the feature.\n\n## Acceptance Criteria\n- works\n\n## Data/Contract\nNo changes.\n\n## UX States\nLoading, error, done.\n\n## Security\nNo new surface.\n\n## Performance\nNegligible.\n\n## Verification\nUnit tests.\n\n## Tasks\n```tasks\n{}\n```\n\n{}\n",
        task_lines, DEFAULT_PLAN_MARKER
    )
}
