// ABOUTME: The swarm container - wires agents, actions, and transport into a live runtime.
// ABOUTME: Validation happens at build time; post_message is the synchronous convenience surface.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::action::{Action, ActionExecutor};
use crate::agent::{AgentBackend, AgentDescriptor};
use crate::error::MailError;
use crate::message::{Address, Envelope, ALL_AGENTS};
use crate::runtime::events::Event;
use crate::runtime::{Runtime, RuntimeConfig};
use crate::tools::tool_catalog;
use crate::transport::SwarmTransport;

/// Assembles a swarm template: agents, actions, entrypoint, federation.
pub struct SwarmBuilder {
    name: String,
    user_id: String,
    agents: Vec<(AgentDescriptor, Arc<dyn AgentBackend>)>,
    actions: Vec<Action>,
    interswarm: bool,
    ping_interval: Duration,
    default_timeout: Duration,
}

impl SwarmBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_id: "local".to_string(),
            agents: Vec::new(),
            actions: Vec::new(),
            interswarm: false,
            ping_interval: Duration::from_secs(15),
            default_timeout: Duration::from_secs(3600),
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn agent(
        mut self,
        descriptor: AgentDescriptor,
        backend: impl AgentBackend + 'static,
    ) -> Self {
        self.agents.push((descriptor, Arc::new(backend)));
        self
    }

    pub fn agent_arc(
        mut self,
        descriptor: AgentDescriptor,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        self.agents.push((descriptor, backend));
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Allow `name@swarm` comm targets and expose the interswarm tools.
    pub fn interswarm(mut self, enabled: bool) -> Self {
        self.interswarm = enabled;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Validate the template and instantiate the runtime.
    pub fn build(self) -> Result<Swarm, MailError> {
        if self.agents.is_empty() {
            return Err(MailError::Config(
                "a swarm requires at least one agent".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for (descriptor, _) in &self.agents {
            if descriptor.name == ALL_AGENTS {
                return Err(MailError::Config(format!(
                    "'{ALL_AGENTS}' is reserved and may not be used as an agent name"
                )));
            }
            if !names.insert(descriptor.name.clone()) {
                return Err(MailError::Config(format!(
                    "duplicate agent name: '{}'",
                    descriptor.name
                )));
            }
        }

        let entrypoints: Vec<&str> = self
            .agents
            .iter()
            .filter(|(d, _)| d.enable_entrypoint)
            .map(|(d, _)| d.name.as_str())
            .collect();
        let entrypoint = match entrypoints.as_slice() {
            [single] => single.to_string(),
            [] => {
                return Err(MailError::Config(
                    "exactly one agent must enable the entrypoint; none do".to_string(),
                ))
            }
            many => {
                return Err(MailError::Config(format!(
                    "exactly one agent must enable the entrypoint; got {}",
                    many.len()
                )))
            }
        };

        if !self.agents.iter().any(|(d, _)| d.can_complete_tasks) {
            return Err(MailError::Config(
                "at least one agent must be able to complete tasks".to_string(),
            ));
        }

        let action_names: HashSet<&str> =
            self.actions.iter().map(|a| a.name.as_str()).collect();
        for (descriptor, _) in &self.agents {
            for target in &descriptor.comm_targets {
                let is_remote = target.contains('@');
                if is_remote && !self.interswarm {
                    return Err(MailError::Config(format!(
                        "agent '{}' has interswarm target '{}' but federation is disabled",
                        descriptor.name, target
                    )));
                }
                if !is_remote && !names.contains(target) {
                    return Err(MailError::Config(format!(
                        "agent '{}' has unknown comm target '{}'",
                        descriptor.name, target
                    )));
                }
            }
            for action in &descriptor.actions {
                if !action_names.contains(action.as_str()) {
                    return Err(MailError::Config(format!(
                        "agent '{}' references undeclared action '{}'",
                        descriptor.name, action
                    )));
                }
            }
        }

        let descriptors: HashMap<String, AgentDescriptor> = self
            .agents
            .iter()
            .map(|(d, _)| (d.name.clone(), d.clone()))
            .collect();
        let actions: HashMap<String, Action> = self
            .actions
            .iter()
            .map(|a| (a.name.clone(), a.clone()))
            .collect();

        let config = RuntimeConfig::new(&self.name, &entrypoint)
            .user(&self.user_id)
            .ping_interval(self.ping_interval)
            .default_timeout(self.default_timeout);
        let runtime = Runtime::new(self.agents, ActionExecutor::new(self.actions), config);

        info!(
            swarm = %self.name,
            agents = descriptors.len(),
            entrypoint = %entrypoint,
            interswarm = self.interswarm,
            "swarm built"
        );
        Ok(Swarm {
            name: self.name,
            entrypoint,
            interswarm: self.interswarm,
            descriptors,
            actions,
            runtime,
            dispatch: Mutex::new(None),
        })
    }
}

/// A named set of agents with a directed communication graph and exactly one
/// declared entrypoint, bound to a live runtime.
pub struct Swarm {
    name: String,
    entrypoint: String,
    interswarm: bool,
    descriptors: HashMap<String, AgentDescriptor>,
    actions: HashMap<String, Action>,
    runtime: Runtime,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Swarm {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn agent_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.descriptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A clone of the shared runtime, for embedding layers that call the
    /// submission API directly.
    pub fn runtime(&self) -> Runtime {
        self.runtime.clone()
    }

    /// Inject the interswarm transport. May be called at most once.
    pub fn attach_transport(&self, transport: Arc<dyn SwarmTransport>) -> Result<(), MailError> {
        self.runtime.set_transport(transport)
    }

    /// The full tool list (built-ins plus declared actions) for one agent,
    /// rendered in its schema dialect.
    pub fn tools_for(&self, agent: &str) -> Result<Vec<Value>, MailError> {
        let descriptor = self
            .descriptors
            .get(agent)
            .ok_or_else(|| MailError::UnknownRecipient(agent.to_string()))?;
        let mut specs = tool_catalog(descriptor, self.interswarm);
        for action_name in &descriptor.actions {
            if let Some(action) = self.actions.get(action_name) {
                specs.push(action.spec());
            }
        }
        Ok(specs
            .into_iter()
            .map(|spec| spec.render(descriptor.tool_format))
            .collect())
    }

    /// Spawn the dispatch loop if it is not already running. Idempotent.
    pub fn start(&self) {
        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        if dispatch.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let runtime = self.runtime.clone();
        *dispatch = Some(tokio::spawn(async move { runtime.run().await }));
    }

    /// Drive the dispatch loop on the caller's task until shutdown. For
    /// server embedding.
    pub async fn run_continuous(&self) {
        self.runtime.run().await;
    }

    fn user_envelope(&self, task_id: Uuid, subject: &str, body: &str) -> Envelope {
        Envelope::request(
            task_id,
            Address::user(self.runtime.user_id()),
            Address::agent(&self.entrypoint),
            subject,
            body,
        )
    }

    /// Submit a user message on a fresh task and wait for the finish body.
    pub async fn post_message(&self, subject: &str, body: &str) -> Result<String, MailError> {
        self.start();
        let task_id = Uuid::new_v4();
        let envelope = self.user_envelope(task_id, subject, body);
        self.runtime.submit_and_wait(envelope, None).await
    }

    /// As [`Swarm::post_message`] with an explicit task and timeout.
    pub async fn post_message_task(
        &self,
        task_id: Uuid,
        subject: &str,
        body: &str,
        timeout: Option<Duration>,
    ) -> Result<String, MailError> {
        self.start();
        let envelope = self.user_envelope(task_id, subject, body);
        self.runtime.submit_and_wait(envelope, timeout).await
    }

    /// Submit a user message on a fresh task and stream its events.
    pub async fn post_message_stream(
        &self,
        subject: &str,
        body: &str,
        timeout: Option<Duration>,
    ) -> Result<BoxStream<'static, Event>, MailError> {
        self.start();
        let task_id = Uuid::new_v4();
        let envelope = self.user_envelope(task_id, subject, body);
        self.runtime.submit_and_stream(envelope, timeout).await
    }

    /// Drain pending tasks (bounded by `grace`), stop the transport, and
    /// cancel the dispatch loop.
    pub async fn shutdown(&self, grace: Duration) {
        self.runtime.shutdown(grace).await;
        let handle = self
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                tracing::warn!(swarm = %self.name, "dispatch loop did not stop in time");
            }
        }
    }
}
