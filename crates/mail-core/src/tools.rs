// ABOUTME: Built-in MAIL tool catalog and tool-call-to-envelope conversion.
// ABOUTME: Tool names are part of the protocol; schemas are parameterized by comm targets.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::{AgentDescriptor, ToolFormat};
use crate::error::MailError;
use crate::message::{Address, Envelope, ALL_AGENTS};

pub const SEND_REQUEST: &str = "send_request";
pub const SEND_RESPONSE: &str = "send_response";
pub const SEND_INTERRUPT: &str = "send_interrupt";
pub const SEND_BROADCAST: &str = "send_broadcast";
pub const TASK_COMPLETE: &str = "task_complete";
pub const ACKNOWLEDGE_BROADCAST: &str = "acknowledge_broadcast";
pub const IGNORE_BROADCAST: &str = "ignore_broadcast";
pub const AWAIT_MESSAGE: &str = "await_message";
pub const SEND_INTERSWARM_BROADCAST: &str = "send_interswarm_broadcast";
pub const DISCOVER_SWARMS: &str = "discover_swarms";

/// Every built-in MAIL tool name. Calls outside this list dispatch to the
/// action executor.
pub const MAIL_TOOL_NAMES: [&str; 10] = [
    SEND_REQUEST,
    SEND_RESPONSE,
    SEND_INTERRUPT,
    SEND_BROADCAST,
    TASK_COMPLETE,
    ACKNOWLEDGE_BROADCAST,
    IGNORE_BROADCAST,
    AWAIT_MESSAGE,
    SEND_INTERSWARM_BROADCAST,
    DISCOVER_SWARMS,
];

/// A tool definition handed to an agent's LM backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Render this spec in the requested schema dialect.
    pub fn render(&self, format: ToolFormat) -> Value {
        match format {
            ToolFormat::Completions => json!({
                "type": "function",
                "function": {
                    "name": self.name,
                    "description": self.description,
                    "parameters": self.parameters,
                },
            }),
            ToolFormat::Responses => json!({
                "type": "function",
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }),
        }
    }
}

/// One tool invocation returned by an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentToolCall {
    pub call_id: String,
    pub name: String,
    pub args: Value,
}

impl AgentToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            name: name.into(),
            args,
        }
    }

    pub fn is_mail_tool(&self) -> bool {
        MAIL_TOOL_NAMES.contains(&self.name.as_str())
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn arg_str_list(&self, key: &str) -> Option<Vec<String>> {
        self.args.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    fn require_str(&self, key: &str) -> Result<&str, MailError> {
        self.arg_str(key).ok_or_else(|| {
            MailError::ToolCall(format!(
                "tool '{}' requires string argument '{}'",
                self.name, key
            ))
        })
    }
}

fn target_parameter(targets: &[String], interswarm: bool) -> Value {
    let mut description = format!(
        "The target recipient agent. Must be one of: {}.",
        targets.join(", ")
    );
    if interswarm {
        description.push_str(" Remote agents use the 'agent-name@swarm-name' form.");
        json!({ "type": "string", "description": description })
    } else {
        json!({ "type": "string", "description": description, "enum": targets })
    }
}

fn message_schema(targets: &[String], interswarm: bool) -> Value {
    json!({
        "type": "object",
        "properties": {
            "target": target_parameter(targets, interswarm),
            "subject": { "type": "string", "description": "The subject of the message." },
            "body": { "type": "string", "description": "The message content to send." },
        },
        "required": ["target", "subject", "body"],
    })
}

/// The built-in tool set for an agent, parameterized by its descriptor.
///
/// Every agent gets the request/response/acknowledge/ignore/await tools;
/// supervisors also get interrupt, broadcast, and (when allowed)
/// `task_complete`; the interswarm tools appear only when federation is
/// enabled.
pub fn tool_catalog(descriptor: &AgentDescriptor, interswarm: bool) -> Vec<ToolSpec> {
    let targets = &descriptor.comm_targets;
    let mut specs = vec![
        ToolSpec::new(
            SEND_REQUEST,
            "Send a request to a specific target recipient agent.",
            message_schema(targets, interswarm),
        ),
        ToolSpec::new(
            SEND_RESPONSE,
            "Send a response to a specific target recipient agent.",
            message_schema(targets, interswarm),
        ),
        ToolSpec::new(
            ACKNOWLEDGE_BROADCAST,
            "Store the received broadcast in memory, do not respond.",
            json!({
                "type": "object",
                "properties": {
                    "note": { "type": "string", "description": "Optional note kept in internal memory only." },
                },
            }),
        ),
        ToolSpec::new(
            IGNORE_BROADCAST,
            "Ignore the received broadcast. No memory, no response.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Optional internal reason for ignoring." },
                },
            }),
        ),
        ToolSpec::new(
            AWAIT_MESSAGE,
            "Go idle until a new message arrives for you.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Optional reason for waiting." },
                },
            }),
        ),
    ];

    if descriptor.can_complete_tasks {
        specs.push(ToolSpec::new(
            SEND_INTERRUPT,
            "Interrupt a specific target recipient agent. Interrupts preempt queued requests and broadcasts.",
            message_schema(targets, interswarm),
        ));
        specs.push(ToolSpec::new(
            SEND_BROADCAST,
            "Broadcast a message to all local agents.",
            json!({
                "type": "object",
                "properties": {
                    "subject": { "type": "string", "description": "The subject of the broadcast." },
                    "body": { "type": "string", "description": "The message content to send." },
                },
                "required": ["subject", "body"],
            }),
        ));
        specs.push(ToolSpec::new(
            TASK_COMPLETE,
            "Declare the current task complete. This should always be the last tool called.",
            json!({
                "type": "object",
                "properties": {
                    "finish_message": { "type": "string", "description": "The final message delivered to the task submitter." },
                },
                "required": ["finish_message"],
            }),
        ));
    }

    if interswarm {
        specs.push(ToolSpec::new(
            SEND_INTERSWARM_BROADCAST,
            "Broadcast a message across the named remote swarms.",
            json!({
                "type": "object",
                "properties": {
                    "subject": { "type": "string", "description": "The subject of the broadcast." },
                    "body": { "type": "string", "description": "The message content to send." },
                    "target_swarms": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Names of the remote swarms to broadcast to.",
                    },
                },
                "required": ["subject", "body", "target_swarms"],
            }),
        ));
        specs.push(ToolSpec::new(
            DISCOVER_SWARMS,
            "Discover and register new swarms from discovery endpoints.",
            json!({
                "type": "object",
                "properties": {
                    "discovery_urls": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "URLs to discover swarms from.",
                    },
                },
                "required": ["discovery_urls"],
            }),
        ));
    }

    specs
}

fn check_target(sender: &str, target: &str, comm_targets: &[String]) -> Result<(), MailError> {
    if comm_targets.iter().any(|t| t == target) {
        Ok(())
    } else {
        Err(MailError::TargetForbidden {
            agent: sender.to_string(),
            target: target.to_string(),
        })
    }
}

/// Convert a MAIL tool call into an envelope, enforcing the caller's comm
/// targets. Calls that fail validation never leave the runtime; the caller
/// receives a `::tool_call_error::` system response instead.
pub fn call_to_envelope(
    call: &AgentToolCall,
    sender: &str,
    comm_targets: &[String],
    task_id: Uuid,
) -> Result<Envelope, MailError> {
    let sender_address = Address::agent(sender);
    match call.name.as_str() {
        SEND_REQUEST => {
            let target = call.require_str("target")?;
            check_target(sender, target, comm_targets)?;
            Ok(Envelope::request(
                task_id,
                sender_address,
                Address::agent(target),
                call.require_str("subject")?,
                call.require_str("body")?,
            ))
        }
        SEND_RESPONSE => {
            let target = call.require_str("target")?;
            check_target(sender, target, comm_targets)?;
            Ok(Envelope::response(
                task_id,
                sender_address,
                Address::agent(target),
                call.require_str("subject")?,
                call.require_str("body")?,
                Uuid::new_v4(),
            ))
        }
        SEND_INTERRUPT => {
            let target = call.require_str("target")?;
            check_target(sender, target, comm_targets)?;
            Envelope::interrupt(
                task_id,
                sender_address,
                vec![Address::agent(target)],
                call.require_str("subject")?,
                call.require_str("body")?,
            )
        }
        SEND_BROADCAST => Envelope::broadcast(
            task_id,
            sender_address,
            vec![Address::agent(ALL_AGENTS)],
            call.require_str("subject")?,
            call.require_str("body")?,
        ),
        SEND_INTERSWARM_BROADCAST => {
            let swarms = call.arg_str_list("target_swarms").ok_or_else(|| {
                MailError::ToolCall(format!(
                    "tool '{}' requires array argument 'target_swarms'",
                    call.name
                ))
            })?;
            if swarms.is_empty() {
                return Err(MailError::ToolCall(
                    "send_interswarm_broadcast requires at least one target swarm".to_string(),
                ));
            }
            let recipients = swarms
                .iter()
                .map(|swarm| Address::agent(format!("{ALL_AGENTS}@{swarm}")))
                .collect();
            let mut envelope = Envelope::broadcast(
                task_id,
                sender_address,
                recipients,
                call.require_str("subject")?,
                call.require_str("body")?,
            )?;
            envelope.recipient_swarms = Some(swarms);
            Ok(envelope)
        }
        TASK_COMPLETE => Ok(Envelope::task_complete(
            task_id,
            sender_address,
            call.require_str("finish_message")?,
        )),
        other => Err(MailError::ToolCall(format!("unknown MAIL tool: '{other}'"))),
    }
}
