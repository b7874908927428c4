// ABOUTME: mail-core - message model, tool catalog, action executor, and the MAIL runtime.
// ABOUTME: The federation layer plugs in through the SwarmTransport trait.

//! The in-process core of MAIL (Multi-Agent Interface Layer): typed message
//! envelopes, the built-in tool catalog, an executor for third-party
//! actions, and a priority-scheduled runtime that drives agents, enforces
//! the task lifecycle, and produces an observable event stream.
//!
//! Federation is out of this crate: the runtime hands remote-addressed
//! envelopes to an injected [`SwarmTransport`], implemented by `mail-net`.

pub mod action;
pub mod agent;
pub mod error;
pub mod message;
pub mod runtime;
pub mod swarm;
pub mod tools;
pub mod transport;

pub use action::{Action, ActionExecutor, ActionHandler, FnAction};
pub use agent::{
    AgentBackend, AgentDescriptor, AgentOutput, HistoryEntry, Role, ScriptedAgent, ToolChoice,
    ToolFormat,
};
pub use error::MailError;
pub use message::{subjects, Address, AddressKind, Envelope, EnvelopeBody, EnvelopeKind, ALL_AGENTS};
pub use runtime::events::{Event, EventKind, EVENT_RING_CAPACITY};
pub use runtime::task::{PrincipalRole, TaskPrincipal, TaskSnapshot, TaskStatus};
pub use runtime::{Resume, Runtime, RuntimeConfig};
pub use swarm::{Swarm, SwarmBuilder};
pub use tools::{call_to_envelope, tool_catalog, AgentToolCall, ToolSpec, MAIL_TOOL_NAMES};
pub use transport::{SwarmTransport, TaskMeta};
