// ABOUTME: Task records - ownership, contributors, status, breakpoint stash, pending future.
// ABOUTME: Principals use the wire form role:id@swarm; owner is always a contributor.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::MailError;
use crate::message::Envelope;
use crate::tools::AgentToolCall;

/// Role component of a task principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrincipalRole {
    Admin,
    User,
    Swarm,
}

impl PrincipalRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalRole::Admin => "admin",
            PrincipalRole::User => "user",
            PrincipalRole::Swarm => "swarm",
        }
    }
}

impl FromStr for PrincipalRole {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(PrincipalRole::Admin),
            "user" => Ok(PrincipalRole::User),
            "swarm" => Ok(PrincipalRole::Swarm),
            other => Err(MailError::Schema(format!(
                "invalid principal role: '{other}'"
            ))),
        }
    }
}

/// Identity of a task owner or contributor, in `role:id@swarm` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskPrincipal {
    pub role: PrincipalRole,
    pub id: String,
    pub swarm: String,
}

impl TaskPrincipal {
    pub fn user(id: impl Into<String>, swarm: impl Into<String>) -> Self {
        Self {
            role: PrincipalRole::User,
            id: id.into(),
            swarm: swarm.into(),
        }
    }

    pub fn admin(id: impl Into<String>, swarm: impl Into<String>) -> Self {
        Self {
            role: PrincipalRole::Admin,
            id: id.into(),
            swarm: swarm.into(),
        }
    }

    /// The principal representing a swarm instance itself.
    pub fn swarm_instance(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            role: PrincipalRole::Swarm,
            id: name.clone(),
            swarm: name,
        }
    }
}

impl fmt::Display for TaskPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.role.as_str(), self.id, self.swarm)
    }
}

impl FromStr for TaskPrincipal {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, rest) = s
            .split_once(':')
            .ok_or_else(|| MailError::Schema(format!("invalid task principal: '{s}'")))?;
        let (id, swarm) = rest
            .split_once('@')
            .ok_or_else(|| MailError::Schema(format!("invalid task principal: '{s}'")))?;
        if id.is_empty() || swarm.is_empty() {
            return Err(MailError::Schema(format!("invalid task principal: '{s}'")));
        }
        Ok(Self {
            role: role.parse()?,
            id: id.to_string(),
            swarm: swarm.to_string(),
        })
    }
}

impl Serialize for TaskPrincipal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskPrincipal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Paused,
    Completed,
    Errored,
}

/// Queue state and call details stashed when a breakpoint action fires.
#[derive(Debug)]
pub struct BreakpointStash {
    /// The agent whose tool calls are paused.
    pub caller: String,
    /// The breakpoint calls awaiting externally supplied results, in the
    /// order the agent issued them.
    pub calls: Vec<AgentToolCall>,
    /// Queue entries for the task evicted at pause time, in dequeue order.
    pub queued: Vec<Envelope>,
}

pub(crate) type CompletionSender = oneshot::Sender<Result<String, MailError>>;

/// Mutable per-task record owned by the scheduler.
pub(crate) struct TaskRecord {
    pub task_id: Uuid,
    pub owner: TaskPrincipal,
    pub contributors: BTreeSet<TaskPrincipal>,
    pub status: TaskStatus,
    pub completion: Option<CompletionSender>,
    pub breakpoint: Option<BreakpointStash>,
    /// Set once the first task_complete for this task is honored; later
    /// completions in the same instance are discarded.
    pub completed_once: bool,
}

impl TaskRecord {
    pub fn new(task_id: Uuid, owner: TaskPrincipal) -> Self {
        let mut contributors = BTreeSet::new();
        contributors.insert(owner.clone());
        Self {
            task_id,
            owner,
            contributors,
            status: TaskStatus::Running,
            completion: None,
            breakpoint: None,
            completed_once: false,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id,
            owner: self.owner.clone(),
            contributors: self.contributors.iter().cloned().collect(),
            status: self.status,
        }
    }
}

/// Read-only view of a task record for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub owner: TaskPrincipal,
    pub contributors: Vec<TaskPrincipal>,
    pub status: TaskStatus,
}
