// ABOUTME: MAIL message model - addresses, validated envelopes, and agent-facing rendering.
// ABOUTME: Envelopes are the currency of the scheduler; the kind discriminator is the only polymorphism.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MailError;

/// Reserved agent name that fans out to every local agent.
pub const ALL_AGENTS: &str = "all";

/// Subjects used by system-originated envelopes. The double-colon markers
/// keep them visually distinct from agent-chosen subjects.
pub mod subjects {
    pub const TASK_ERROR: &str = "::task_error::";
    pub const TOOL_CALL_ERROR: &str = "::tool_call_error::";
    pub const AGENT_ERROR: &str = "::agent_error::";
    pub const ROUTER_ERROR: &str = "::router_error::";
    pub const RUNTIME_ERROR: &str = "::runtime_error::";
    pub const ACTION_COMPLETE: &str = "::action_complete::";
}

/// Kind of a sender or recipient address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Agent,
    User,
    System,
    Admin,
}

impl AddressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressKind::Agent => "agent",
            AddressKind::User => "user",
            AddressKind::System => "system",
            AddressKind::Admin => "admin",
        }
    }
}

/// The sender or recipient of an envelope.
///
/// Agent names may be bare (`weather`) or interswarm-qualified
/// (`weather@other-swarm`). Names are unique within a kind within a swarm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub kind: AddressKind,
    pub name: String,
}

impl Address {
    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::Agent,
            name: name.into(),
        }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::User,
            name: name.into(),
        }
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::System,
            name: name.into(),
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::Admin,
            name: name.into(),
        }
    }

    /// True for the reserved fanout address `all`.
    pub fn is_all(&self) -> bool {
        self.kind == AddressKind::Agent && self.name == ALL_AGENTS
    }

    /// Split a possibly interswarm-qualified name into (local, swarm).
    pub fn split_swarm(&self) -> (&str, Option<&str>) {
        match self.name.split_once('@') {
            Some((local, swarm)) => (local.trim(), Some(swarm.trim())),
            None => (self.name.trim(), None),
        }
    }

    /// The bare local part of the name, without any `@swarm` suffix.
    pub fn local_name(&self) -> &str {
        self.split_swarm().0
    }

    /// The swarm qualifier, if any.
    pub fn swarm(&self) -> Option<&str> {
        self.split_swarm().1
    }

    /// A copy of this address qualified with the given swarm name.
    pub fn qualified(&self, swarm: &str) -> Address {
        Address {
            kind: self.kind,
            name: format!("{}@{}", self.local_name(), swarm),
        }
    }

    /// A copy of this address with any swarm qualifier stripped.
    pub fn bare(&self) -> Address {
        Address {
            kind: self.kind,
            name: self.local_name().to_string(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

/// Discriminator for the five envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
    Broadcast,
    Interrupt,
    TaskComplete,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Broadcast => "broadcast",
            EnvelopeKind::Interrupt => "interrupt",
            EnvelopeKind::TaskComplete => "task_complete",
        }
    }
}

/// Payload of an envelope, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Request {
        sender: Address,
        recipient: Address,
        subject: String,
        body: String,
        request_id: Uuid,
    },
    Response {
        sender: Address,
        recipient: Address,
        subject: String,
        body: String,
        request_id: Uuid,
    },
    Broadcast {
        sender: Address,
        recipients: Vec<Address>,
        subject: String,
        body: String,
        broadcast_id: Uuid,
    },
    Interrupt {
        sender: Address,
        recipients: Vec<Address>,
        subject: String,
        body: String,
        interrupt_id: Uuid,
    },
    /// Shaped like a broadcast, but terminal: recipients must be `[all]`.
    TaskComplete {
        sender: Address,
        recipients: Vec<Address>,
        subject: String,
        body: String,
        broadcast_id: Uuid,
    },
}

/// A validated unit of communication.
///
/// Envelopes are immutable after construction; the runtime folds them into
/// agent histories and the event log, then discards them. The optional
/// routing fields are used only by the federation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub task_id: Uuid,
    #[serde(flatten)]
    pub body: EnvelopeBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_swarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_swarms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub routing_info: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    fn new(task_id: Uuid, body: EnvelopeBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            task_id,
            body,
            sender_swarm: None,
            recipient_swarms: None,
            routing_info: serde_json::Map::new(),
        }
    }

    pub fn request(
        task_id: Uuid,
        sender: Address,
        recipient: Address,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::Request {
                sender,
                recipient,
                subject: subject.into(),
                body: body.into(),
                request_id: Uuid::new_v4(),
            },
        )
    }

    pub fn response(
        task_id: Uuid,
        sender: Address,
        recipient: Address,
        subject: impl Into<String>,
        body: impl Into<String>,
        request_id: Uuid,
    ) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::Response {
                sender,
                recipient,
                subject: subject.into(),
                body: body.into(),
                request_id,
            },
        )
    }

    /// Construct a broadcast. Fails with a schema error on an empty
    /// recipient list.
    pub fn broadcast(
        task_id: Uuid,
        sender: Address,
        recipients: Vec<Address>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, MailError> {
        if recipients.is_empty() {
            return Err(MailError::Schema(
                "broadcast requires at least one recipient".to_string(),
            ));
        }
        Ok(Self::new(
            task_id,
            EnvelopeBody::Broadcast {
                sender,
                recipients,
                subject: subject.into(),
                body: body.into(),
                broadcast_id: Uuid::new_v4(),
            },
        ))
    }

    /// Construct an interrupt. Fails with a schema error on an empty
    /// recipient list.
    pub fn interrupt(
        task_id: Uuid,
        sender: Address,
        recipients: Vec<Address>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, MailError> {
        if recipients.is_empty() {
            return Err(MailError::Schema(
                "interrupt requires at least one recipient".to_string(),
            ));
        }
        Ok(Self::new(
            task_id,
            EnvelopeBody::Interrupt {
                sender,
                recipients,
                subject: subject.into(),
                body: body.into(),
                interrupt_id: Uuid::new_v4(),
            },
        ))
    }

    /// Construct the terminal completion broadcast for a task. Recipients
    /// are always `[all]`.
    pub fn task_complete(task_id: Uuid, sender: Address, body: impl Into<String>) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::TaskComplete {
                sender,
                recipients: vec![Address::agent(ALL_AGENTS)],
                subject: "Task complete".to_string(),
                body: body.into(),
                broadcast_id: Uuid::new_v4(),
            },
        )
    }

    /// Construct a system response directed at one recipient, with a
    /// `::marker::` subject.
    pub fn system_response(
        task_id: Uuid,
        swarm_name: &str,
        recipient: Address,
        subject: &str,
        body: impl Into<String>,
    ) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::Response {
                sender: Address::system(swarm_name),
                recipient,
                subject: subject.to_string(),
                body: body.into(),
                request_id: Uuid::new_v4(),
            },
        )
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.body {
            EnvelopeBody::Request { .. } => EnvelopeKind::Request,
            EnvelopeBody::Response { .. } => EnvelopeKind::Response,
            EnvelopeBody::Broadcast { .. } => EnvelopeKind::Broadcast,
            EnvelopeBody::Interrupt { .. } => EnvelopeKind::Interrupt,
            EnvelopeBody::TaskComplete { .. } => EnvelopeKind::TaskComplete,
        }
    }

    pub fn sender(&self) -> &Address {
        match &self.body {
            EnvelopeBody::Request { sender, .. }
            | EnvelopeBody::Response { sender, .. }
            | EnvelopeBody::Broadcast { sender, .. }
            | EnvelopeBody::Interrupt { sender, .. }
            | EnvelopeBody::TaskComplete { sender, .. } => sender,
        }
    }

    pub fn recipients(&self) -> Vec<&Address> {
        match &self.body {
            EnvelopeBody::Request { recipient, .. } | EnvelopeBody::Response { recipient, .. } => {
                vec![recipient]
            }
            EnvelopeBody::Broadcast { recipients, .. }
            | EnvelopeBody::Interrupt { recipients, .. }
            | EnvelopeBody::TaskComplete { recipients, .. } => recipients.iter().collect(),
        }
    }

    pub fn subject(&self) -> &str {
        match &self.body {
            EnvelopeBody::Request { subject, .. }
            | EnvelopeBody::Response { subject, .. }
            | EnvelopeBody::Broadcast { subject, .. }
            | EnvelopeBody::Interrupt { subject, .. }
            | EnvelopeBody::TaskComplete { subject, .. } => subject,
        }
    }

    pub fn body_text(&self) -> &str {
        match &self.body {
            EnvelopeBody::Request { body, .. }
            | EnvelopeBody::Response { body, .. }
            | EnvelopeBody::Broadcast { body, .. }
            | EnvelopeBody::Interrupt { body, .. }
            | EnvelopeBody::TaskComplete { body, .. } => body,
        }
    }

    /// Replace the recipient set. Used by the router when splitting an
    /// envelope into per-swarm legs.
    pub fn with_recipients(mut self, new_recipients: Vec<Address>) -> Self {
        match &mut self.body {
            EnvelopeBody::Request { recipient, .. } | EnvelopeBody::Response { recipient, .. } => {
                if let Some(first) = new_recipients.into_iter().next() {
                    *recipient = first;
                }
            }
            EnvelopeBody::Broadcast { recipients, .. }
            | EnvelopeBody::Interrupt { recipients, .. }
            | EnvelopeBody::TaskComplete { recipients, .. } => {
                *recipients = new_recipients;
            }
        }
        self
    }

    /// Replace the sender address. Used by the router to rewrite the sender
    /// into `name@swarm` form before an envelope leaves the swarm.
    pub fn with_sender(mut self, new_sender: Address) -> Self {
        match &mut self.body {
            EnvelopeBody::Request { sender, .. }
            | EnvelopeBody::Response { sender, .. }
            | EnvelopeBody::Broadcast { sender, .. }
            | EnvelopeBody::Interrupt { sender, .. }
            | EnvelopeBody::TaskComplete { sender, .. } => {
                *sender = new_sender;
            }
        }
        self
    }

    /// Validate schema invariants on ingress. Constructors uphold these for
    /// locally built envelopes; deserialized envelopes go through here.
    pub fn validate(&self) -> Result<(), MailError> {
        if self.sender().name.trim().is_empty() {
            return Err(MailError::Schema("sender name must not be empty".to_string()));
        }
        let recipients = self.recipients();
        if recipients.is_empty() {
            return Err(MailError::Schema(format!(
                "{} requires at least one recipient",
                self.kind().as_str()
            )));
        }
        if recipients.iter().any(|r| r.name.trim().is_empty()) {
            return Err(MailError::Schema(
                "recipient names must not be empty".to_string(),
            ));
        }
        if self.kind() == EnvelopeKind::TaskComplete
            && !(recipients.len() == 1 && recipients[0].is_all())
        {
            return Err(MailError::Schema(
                "task_complete recipients must be exactly [all]".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the envelope as the XML block that seeds agent histories.
    ///
    /// The rendering is deterministic for identical inputs (including `id`
    /// and `timestamp`) so replays reproduce prompts byte for byte.
    pub fn render_for_agent(&self) -> String {
        let recipients = self.recipients();
        let to_kind = recipients
            .first()
            .map(|r| r.kind.as_str())
            .unwrap_or("agent");
        let to_names = recipients
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "<incoming_message>\n<timestamp>{}</timestamp>\n<from kind=\"{}\">{}</from>\n<to kind=\"{}\">{}</to>\n<subject>{}</subject>\n<body>{}</body>\n</incoming_message>",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.sender().kind.as_str(),
            self.sender().name,
            to_kind,
            to_names,
            self.subject(),
            self.body_text(),
        )
    }
}
