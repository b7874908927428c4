// ABOUTME: The agent seam - histories, the AgentBackend trait, and descriptors.
// ABOUTME: The scheduler never inspects agent internals; backends are opaque async functions.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MailError;
use crate::tools::AgentToolCall;

/// Role of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// One entry in a per-agent, per-task history.
///
/// The head of a history is the envelope that woke the agent (rendered as
/// XML); later entries record the agent's own output and tool results so the
/// next invocation reproduces its reasoning context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_name: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_name: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_name: Some(tool_name.into()),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Hint passed to backends about whether a tool call is mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Required,
    Auto,
}

/// What an agent produced for one invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub text: Option<String>,
    pub calls: Vec<AgentToolCall>,
}

impl AgentOutput {
    pub fn call(call: AgentToolCall) -> Self {
        Self {
            text: None,
            calls: vec![call],
        }
    }

    pub fn calls(calls: Vec<AgentToolCall>) -> Self {
        Self { text: None, calls }
    }
}

/// An agent: an opaque async function from history to text and tool calls.
///
/// Implementations may be adapters over LM backends, deterministic mocks for
/// tests, or programmable stubs.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn respond(
        &self,
        history: &[HistoryEntry],
        tool_choice: ToolChoice,
    ) -> Result<AgentOutput, MailError>;
}

/// Dialect used when rendering tool schemas for an agent's LM backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFormat {
    /// Nested `{"type": "function", "function": {...}}` shape.
    #[default]
    Completions,
    /// Flat `{"type": "function", "name": ..., ...}` shape.
    Responses,
}

/// Static description of an agent within a swarm.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub name: String,
    /// The only recipients this agent may address. Sole authority for
    /// outbound validation.
    pub comm_targets: Vec<String>,
    /// Whether this agent may emit `task_complete` (a supervisor).
    pub can_complete_tasks: bool,
    /// Whether this agent receives user submissions by default.
    pub enable_entrypoint: bool,
    pub tool_format: ToolFormat,
    /// Names of the actions this agent may invoke.
    pub actions: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comm_targets: Vec::new(),
            can_complete_tasks: false,
            enable_entrypoint: false,
            tool_format: ToolFormat::default(),
            actions: Vec::new(),
        }
    }

    pub fn targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.comm_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn supervisor(mut self) -> Self {
        self.can_complete_tasks = true;
        self
    }

    pub fn entrypoint(mut self) -> Self {
        self.enable_entrypoint = true;
        self
    }

    pub fn tool_format(mut self, format: ToolFormat) -> Self {
        self.tool_format = format;
        self
    }

    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }
}

/// Deterministic agent for tests and demos: replays a fixed script of
/// outputs, one per invocation, then idles with `await_message`.
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Result<AgentOutput, String>>>,
}

impl ScriptedAgent {
    pub fn new<I>(outputs: I) -> Self
    where
        I: IntoIterator<Item = AgentOutput>,
    {
        Self {
            script: Mutex::new(outputs.into_iter().map(Ok).collect()),
        }
    }

    /// A script that may also fail on selected turns.
    pub fn with_results<I>(outputs: I) -> Self
    where
        I: IntoIterator<Item = Result<AgentOutput, String>>,
    {
        Self {
            script: Mutex::new(outputs.into_iter().collect()),
        }
    }
}

#[async_trait]
impl AgentBackend for ScriptedAgent {
    async fn respond(
        &self,
        _history: &[HistoryEntry],
        _tool_choice: ToolChoice,
    ) -> Result<AgentOutput, MailError> {
        let next = self.script.lock().expect("script lock poisoned").pop_front();
        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(reason)) => Err(MailError::Agent {
                agent: "scripted".to_string(),
                reason,
            }),
            // Script exhausted: idle until a new envelope arrives.
            None => Ok(AgentOutput::call(AgentToolCall::new(
                crate::tools::AWAIT_MESSAGE,
                serde_json::json!({ "reason": "script exhausted" }),
            ))),
        }
    }
}
