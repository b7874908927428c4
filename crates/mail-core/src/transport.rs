// ABOUTME: The seam between the runtime and the federation layer.
// ABOUTME: The runtime hands remote-addressed envelopes to an injected SwarmTransport.

use async_trait::async_trait;

use crate::error::MailError;
use crate::message::Envelope;
use crate::runtime::task::TaskPrincipal;

/// Task identity that travels with every interswarm envelope.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    /// The instance where the task was created. Immutable after creation.
    pub owner: TaskPrincipal,
    /// Every instance that has handled messages for the task. Always
    /// includes the owner.
    pub contributors: Vec<TaskPrincipal>,
}

/// Outbound bridge to peer swarms.
///
/// Implementations wrap envelopes for HTTP transport, correlate remote
/// responses with local tasks, and translate transport failures into MAIL
/// errors injected back into the runtime. The runtime never inspects
/// transport internals; failures on the remote path must not kill the local
/// task.
#[async_trait]
pub trait SwarmTransport: Send + Sync {
    /// Name of the local swarm this transport sends on behalf of.
    fn local_swarm(&self) -> &str;

    /// Route an envelope whose recipients resolve outside the local swarm.
    /// The recipient list contains only remote addresses.
    async fn route_remote(&self, envelope: Envelope, task: TaskMeta) -> Result<(), MailError>;

    /// Propagate a locally honored `task_complete` across swarms: to the
    /// owner when the task is owned elsewhere, or best-effort to remote
    /// contributors when the local instance is the owner.
    async fn notify_completion(&self, envelope: Envelope, task: TaskMeta)
        -> Result<(), MailError>;

    /// Register peers advertised by the given discovery URLs. Returns how
    /// many peers were registered.
    async fn discover(&self, urls: Vec<String>) -> Result<usize, MailError>;

    /// Release transport resources (HTTP pool, health checks, persistence).
    async fn shutdown(&self);
}
