// ABOUTME: The MAIL runtime scheduler - priority dispatch, histories, futures, breakpoints.
// ABOUTME: Single dispatch loop owns the queue; agent turns run as spawned tasks that interleave.

pub mod events;
pub mod queue;
pub mod task;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::ActionExecutor;
use crate::agent::{AgentBackend, AgentDescriptor, HistoryEntry, ToolChoice};
use crate::error::MailError;
use crate::message::{subjects, Address, AddressKind, Envelope, EnvelopeKind};
use crate::tools::{self, AgentToolCall};
use crate::transport::{SwarmTransport, TaskMeta};

use events::{Event, EventKind, EventLog};
use queue::MessageQueue;
use task::{BreakpointStash, TaskPrincipal, TaskRecord, TaskSnapshot, TaskStatus};

/// Runtime construction parameters.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub swarm_name: String,
    /// The agent that receives user submissions by default.
    pub entrypoint: String,
    /// Identity of the user this runtime instance belongs to.
    pub user_id: String,
    /// Heartbeat interval for event streams.
    pub ping_interval: Duration,
    /// Default wall-clock bound for submit_and_wait / submit_and_stream.
    pub default_timeout: Duration,
}

impl RuntimeConfig {
    pub fn new(swarm_name: impl Into<String>, entrypoint: impl Into<String>) -> Self {
        Self {
            swarm_name: swarm_name.into(),
            entrypoint: entrypoint.into(),
            user_id: "local".to_string(),
            ping_interval: Duration::from_secs(15),
            default_timeout: Duration::from_secs(3600),
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
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
}

/// How a submission against an existing task resumes it.
#[derive(Debug, Clone)]
pub enum Resume {
    /// Treat the payload as a user message to the entrypoint.
    UserResponse { subject: String, body: String },
    /// Supply the result of a stashed breakpoint call and resume dispatch.
    /// `result` is a JSON-encoded string; an array resolves multiple
    /// parallel breakpoints in stash order.
    BreakpointToolCall { caller: String, result: String },
}

struct AgentEntry {
    descriptor: AgentDescriptor,
    backend: Arc<dyn AgentBackend>,
}

struct SchedulerState {
    queue: MessageQueue,
    histories: HashMap<(String, Uuid), Vec<HistoryEntry>>,
    tasks: HashMap<Uuid, TaskRecord>,
    idle: HashSet<(String, Uuid)>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    agents: HashMap<String, AgentEntry>,
    executor: ActionExecutor,
    state: Mutex<SchedulerState>,
    events: EventLog,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    in_flight: AtomicUsize,
    transport: OnceLock<Arc<dyn SwarmTransport>>,
}

/// The in-process message-passing runtime.
///
/// Cheap to clone; all clones share one scheduler. The dispatch loop must be
/// driven via [`Runtime::run`] (the swarm container spawns it).
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(
        agents: Vec<(AgentDescriptor, Arc<dyn AgentBackend>)>,
        executor: ActionExecutor,
        config: RuntimeConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let agents = agents
            .into_iter()
            .map(|(descriptor, backend)| {
                (
                    descriptor.name.clone(),
                    AgentEntry {
                        descriptor,
                        backend,
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                agents,
                executor,
                state: Mutex::new(SchedulerState {
                    queue: MessageQueue::new(),
                    histories: HashMap::new(),
                    tasks: HashMap::new(),
                    idle: HashSet::new(),
                }),
                events: EventLog::new(),
                notify: Notify::new(),
                shutdown_tx,
                shutdown_rx,
                in_flight: AtomicUsize::new(0),
                transport: OnceLock::new(),
            }),
        }
    }

    pub fn swarm_name(&self) -> &str {
        &self.inner.config.swarm_name
    }

    pub fn entrypoint(&self) -> &str {
        &self.inner.config.entrypoint
    }

    pub fn user_id(&self) -> &str {
        &self.inner.config.user_id
    }

    /// Inject the interswarm transport. May be called at most once.
    pub fn set_transport(&self, transport: Arc<dyn SwarmTransport>) -> Result<(), MailError> {
        self.inner
            .transport
            .set(transport)
            .map_err(|_| MailError::Config("transport already set".to_string()))
    }

    fn transport(&self) -> Option<&Arc<dyn SwarmTransport>> {
        self.inner.transport.get()
    }

    /// All recorded events for a task, oldest first.
    pub fn events_for(&self, task_id: Uuid) -> Vec<Event> {
        self.inner.events.for_task(task_id)
    }

    /// How many events have been discarded from a task's ring.
    pub fn events_dropped(&self, task_id: Uuid) -> u64 {
        self.inner.events.dropped(task_id)
    }

    /// Snapshots of every task that has not reached a terminal state.
    pub async fn pending_requests(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock().await;
        let mut snapshots: Vec<TaskSnapshot> = state
            .tasks
            .values()
            .filter(|record| {
                matches!(record.status, TaskStatus::Running | TaskStatus::Paused)
            })
            .map(TaskRecord::snapshot)
            .collect();
        snapshots.sort_by_key(|s| s.task_id);
        snapshots
    }

    pub async fn task_snapshot(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        let state = self.inner.state.lock().await;
        state.tasks.get(&task_id).map(TaskRecord::snapshot)
    }

    pub async fn knows_task(&self, task_id: Uuid) -> bool {
        self.inner.state.lock().await.tasks.contains_key(&task_id)
    }

    /// Owner and contributors for a task, for the federation layer.
    pub async fn task_meta(&self, task_id: Uuid) -> Option<TaskMeta> {
        let state = self.inner.state.lock().await;
        state.tasks.get(&task_id).map(|record| TaskMeta {
            owner: record.owner.clone(),
            contributors: record.contributors.iter().cloned().collect(),
        })
    }

    /// History of one agent for one task.
    pub async fn history(&self, agent: &str, task_id: Uuid) -> Vec<HistoryEntry> {
        let state = self.inner.state.lock().await;
        state
            .histories
            .get(&(agent.to_string(), task_id))
            .cloned()
            .unwrap_or_default()
    }

    fn derive_owner(&self, envelope: &Envelope) -> TaskPrincipal {
        let sender = envelope.sender();
        match sender.kind {
            AddressKind::User => TaskPrincipal::user(&sender.name, self.swarm_name()),
            AddressKind::Admin => TaskPrincipal::admin(&sender.name, self.swarm_name()),
            AddressKind::Agent | AddressKind::System => {
                TaskPrincipal::swarm_instance(self.swarm_name())
            }
        }
    }

    fn ensure_task<'a>(
        &self,
        state: &'a mut SchedulerState,
        envelope: &Envelope,
    ) -> &'a mut TaskRecord {
        let owner = self.derive_owner(envelope);
        state
            .tasks
            .entry(envelope.task_id)
            .or_insert_with(|| TaskRecord::new(envelope.task_id, owner))
    }

    /// Enqueue an envelope and return immediately.
    pub async fn submit(&self, envelope: Envelope) -> Result<(), MailError> {
        if *self.inner.shutdown_rx.borrow() {
            return Err(MailError::Runtime(
                "runtime is shutting down; submission rejected".to_string(),
            ));
        }
        envelope.validate()?;
        {
            let mut state = self.inner.state.lock().await;
            self.ensure_task(&mut state, &envelope);
            state.queue.push(envelope);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Enqueue an envelope for a task owned elsewhere, merging the supplied
    /// contributor set. Used by the federation layer for inbound messages.
    pub async fn submit_remote(
        &self,
        envelope: Envelope,
        owner: TaskPrincipal,
        contributors: Vec<TaskPrincipal>,
    ) -> Result<(), MailError> {
        if *self.inner.shutdown_rx.borrow() {
            return Err(MailError::Runtime(
                "runtime is shutting down; submission rejected".to_string(),
            ));
        }
        envelope.validate()?;
        {
            let mut state = self.inner.state.lock().await;
            let record = state
                .tasks
                .entry(envelope.task_id)
                .or_insert_with(|| TaskRecord::new(envelope.task_id, owner));
            record.contributors.extend(contributors);
            let local = TaskPrincipal::swarm_instance(self.swarm_name());
            record.contributors.insert(local);
            state.queue.push(envelope);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Internal enqueue for runtime-originated envelopes (system responses,
    /// action results). Skips the shutdown gate so in-flight tasks can
    /// finish draining.
    async fn enqueue_internal(&self, envelope: Envelope) {
        let mut state = self.inner.state.lock().await;
        self.ensure_task(&mut state, &envelope);
        state.queue.push(envelope);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue and wait for the task's terminal completion body.
    pub async fn submit_and_wait(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<String, MailError> {
        let task_id = envelope.task_id;
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        envelope.validate()?;

        let rx = {
            if *self.inner.shutdown_rx.borrow() {
                return Err(MailError::Runtime(
                    "runtime is shutting down; submission rejected".to_string(),
                ));
            }
            let mut state = self.inner.state.lock().await;
            let record = self.ensure_task(&mut state, &envelope);
            if record.completion.is_some() {
                warn!(task_id = %task_id, "replacing existing pending future");
            }
            // A resubmission against a completed task resumes the
            // conversation; the resumed run may complete again.
            if record.status == TaskStatus::Completed {
                record.completed_once = false;
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            record.completion = Some(tx);
            record.status = TaskStatus::Running;
            state.queue.push(envelope);
            rx
        };
        self.inner.notify.notify_one();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MailError::Cancelled(task_id)),
            Err(_) => {
                warn!(task_id = %task_id, timeout_secs = timeout.as_secs(), "task timed out");
                let _ = self
                    .cancel_with(task_id, "task timed out", MailError::TaskTimeout(task_id))
                    .await;
                Err(MailError::TaskTimeout(task_id))
            }
        }
    }

    /// Enqueue and stream the task's events: the recorded ring is replayed,
    /// then live events follow, with ping heartbeats in between. The stream
    /// ends after a terminal `task_complete` or `task_error` event.
    pub async fn submit_and_stream(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<BoxStream<'static, Event>, MailError> {
        let task_id = envelope.task_id;
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        self.submit(envelope).await?;
        Ok(self.stream_task(task_id, timeout))
    }

    /// Stream events for an existing task. Restartable for the lifetime of
    /// the task: recorded events are re-emitted from the ring.
    pub fn stream_task(&self, task_id: Uuid, timeout: Duration) -> BoxStream<'static, Event> {
        let runtime = self.clone();
        let ping_interval = self.inner.config.ping_interval;
        let (tx, rx) = mpsc::channel::<Event>(64);

        tokio::spawn(async move {
            let mut live = runtime.inner.events.subscribe();
            let replay = runtime.inner.events.for_task(task_id);
            let mut seen: HashSet<Uuid> = HashSet::new();
            let mut terminal = false;
            for event in replay {
                seen.insert(event.id);
                terminal |= matches!(event.kind, EventKind::TaskComplete | EventKind::TaskError);
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if terminal {
                return;
            }

            let deadline = tokio::time::Instant::now() + timeout;
            let mut cancelled = false;
            loop {
                let ping = tokio::time::sleep(ping_interval);
                tokio::select! {
                    received = live.recv() => match received {
                        Ok(event) if event.task_id == task_id && !seen.contains(&event.id) => {
                            let terminal = matches!(
                                event.kind,
                                EventKind::TaskComplete | EventKind::TaskError
                            );
                            if tx.send(event).await.is_err() || terminal {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(task_id = %task_id, lagged = n, "event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = ping => {
                        let ping_event = Event::new(EventKind::Ping, task_id, "heartbeat");
                        if tx.send(ping_event).await.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline), if !cancelled => {
                        cancelled = true;
                        let _ = runtime
                            .cancel_with(task_id, "task timed out", MailError::TaskTimeout(task_id))
                            .await;
                        // The task_error event arrives through the live feed
                        // and terminates the stream.
                    }
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }

    /// Resume an existing task.
    pub async fn resume(&self, task_id: Uuid, resume: Resume) -> Result<(), MailError> {
        match resume {
            Resume::UserResponse { subject, body } => {
                {
                    let mut state = self.inner.state.lock().await;
                    let record = state
                        .tasks
                        .get_mut(&task_id)
                        .ok_or(MailError::UnknownTask(task_id))?;
                    // Completed state is preserved; the conversation picks
                    // back up with its histories intact and may complete
                    // again.
                    if record.status == TaskStatus::Completed {
                        record.completed_once = false;
                    }
                    record.status = TaskStatus::Running;
                }
                let envelope = Envelope::request(
                    task_id,
                    Address::user(&self.inner.config.user_id),
                    Address::agent(&self.inner.config.entrypoint),
                    subject,
                    body,
                );
                self.submit(envelope).await
            }
            Resume::BreakpointToolCall { caller, result } => {
                self.resume_breakpoint(task_id, &caller, &result).await
            }
        }
    }

    async fn resume_breakpoint(
        &self,
        task_id: Uuid,
        caller: &str,
        result: &str,
    ) -> Result<(), MailError> {
        {
            let mut state = self.inner.state.lock().await;
            let record = state
                .tasks
                .get_mut(&task_id)
                .ok_or(MailError::UnknownTask(task_id))?;
            let stash = record
                .breakpoint
                .take()
                .ok_or_else(|| MailError::Config(format!("task '{task_id}' is not paused")))?;
            if stash.caller != caller {
                let expected = stash.caller.clone();
                record.breakpoint = Some(stash);
                return Err(MailError::Config(format!(
                    "breakpoint caller mismatch: expected '{expected}', got '{caller}'"
                )));
            }

            // One result entry per stashed call; an array payload resolves
            // parallel breakpoints in stash order.
            let results: Vec<String> = if stash.calls.len() > 1 {
                match serde_json::from_str::<serde_json::Value>(result) {
                    Ok(serde_json::Value::Array(items)) if items.len() == stash.calls.len() => {
                        items.iter().map(|item| item.to_string()).collect()
                    }
                    _ => {
                        return Err(MailError::Config(format!(
                            "expected a JSON array of {} breakpoint results",
                            stash.calls.len()
                        )));
                    }
                }
            } else {
                vec![result.to_string()]
            };

            let history = state
                .histories
                .entry((caller.to_string(), task_id))
                .or_default();
            for (call, call_result) in stash.calls.iter().zip(results) {
                history.push(HistoryEntry::tool_result(
                    call.name.as_str(),
                    call.call_id.as_str(),
                    call_result,
                ));
            }

            let record = state
                .tasks
                .get_mut(&task_id)
                .expect("record disappeared while resuming");
            record.status = TaskStatus::Running;
            for envelope in stash.queued {
                state.queue.push(envelope);
            }
        }
        self.inner.notify.notify_one();
        info!(task_id = %task_id, caller = %caller, "breakpoint resumed");

        // Re-invoke the caller so it can act on the supplied result.
        let runtime = self.clone();
        let caller = caller.to_string();
        runtime.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            runtime.agent_turn(&caller, task_id).await;
            runtime.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Cancel a task: evict its queued envelopes, reject its pending future,
    /// and close its streams with a `task_error` event. Idempotent.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), MailError> {
        self.cancel_with(task_id, "task cancelled", MailError::Cancelled(task_id))
            .await
    }

    async fn cancel_with(
        &self,
        task_id: Uuid,
        reason: &str,
        err: MailError,
    ) -> Result<(), MailError> {
        let completion = {
            let mut state = self.inner.state.lock().await;
            let record = state
                .tasks
                .get_mut(&task_id)
                .ok_or(MailError::UnknownTask(task_id))?;
            if matches!(record.status, TaskStatus::Completed | TaskStatus::Errored) {
                return Ok(());
            }
            record.status = TaskStatus::Errored;
            record.breakpoint = None;
            let completion = record.completion.take();
            let dropped = state.queue.drain_task(task_id);
            if !dropped.is_empty() {
                debug!(task_id = %task_id, dropped = dropped.len(), "evicted queued envelopes");
            }
            completion
        };
        if let Some(sender) = completion {
            let _ = sender.send(Err(err));
        }
        self.inner
            .events
            .record(Event::new(EventKind::TaskError, task_id, reason));
        Ok(())
    }

    /// Handle an inbound response from a remote swarm: it becomes ordinary
    /// input to the local supervisor rather than a direct completion.
    pub async fn handle_interswarm_response(&self, envelope: Envelope) -> Result<(), MailError> {
        if !self.knows_task(envelope.task_id).await {
            return Err(MailError::UnknownTask(envelope.task_id));
        }
        self.submit(envelope).await
    }

    /// Stop accepting submissions, wait up to `grace` for running tasks,
    /// then cancel the remainder and release the transport.
    pub async fn shutdown(&self, grace: Duration) {
        info!(swarm = %self.swarm_name(), grace_secs = grace.as_secs(), "runtime shutting down");
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.notify.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let drained = {
                let state = self.inner.state.lock().await;
                let all_terminal = state.tasks.values().all(|record| {
                    matches!(record.status, TaskStatus::Completed | TaskStatus::Errored)
                });
                all_terminal
                    && state.queue.is_empty()
                    && self.inner.in_flight.load(Ordering::SeqCst) == 0
            };
            if drained || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let remaining: Vec<Uuid> = {
            let state = self.inner.state.lock().await;
            state
                .tasks
                .values()
                .filter(|record| {
                    matches!(record.status, TaskStatus::Running | TaskStatus::Paused)
                })
                .map(|record| record.task_id)
                .collect()
        };
        for task_id in remaining {
            warn!(task_id = %task_id, "cancelling task at shutdown");
            let _ = self
                .cancel_with(task_id, "runtime shut down", MailError::Cancelled(task_id))
                .await;
        }

        if let Some(transport) = self.transport() {
            transport.shutdown().await;
        }
        self.inner.notify.notify_waiters();
    }

    /// The dispatch loop. Runs until shutdown; the swarm container spawns
    /// this on construction.
    pub async fn run(&self) {
        let mut shutdown = self.inner.shutdown_rx.clone();
        info!(swarm = %self.swarm_name(), "dispatch loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = {
                let mut state = self.inner.state.lock().await;
                self.next_dispatchable(&mut state)
            };
            match next {
                Some(envelope) => {
                    let runtime = self.clone();
                    self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let task_id = envelope.task_id;
                        if let Err(err) = runtime.process_envelope(envelope).await {
                            runtime.handle_runtime_error(task_id, err).await;
                        }
                        runtime.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                None => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!(swarm = %self.swarm_name(), "dispatch loop stopped");
    }

    /// Pop the highest-priority envelope whose task is not paused. Envelopes
    /// for paused tasks move into the task's breakpoint stash.
    fn next_dispatchable(&self, state: &mut SchedulerState) -> Option<Envelope> {
        loop {
            let envelope = state.queue.pop()?;
            let paused = state
                .tasks
                .get(&envelope.task_id)
                .is_some_and(|record| record.status == TaskStatus::Paused);
            if !paused {
                return Some(envelope);
            }
            if let Some(record) = state.tasks.get_mut(&envelope.task_id) {
                if let Some(stash) = record.breakpoint.as_mut() {
                    stash.queued.push(envelope);
                } else {
                    // Paused without a stash cannot happen through the
                    // breakpoint path; drop rather than spin.
                    warn!(task_id = %envelope.task_id, "dropping envelope for paused task without stash");
                }
            }
        }
    }

    /// An unhandled failure while processing one envelope. The loop itself
    /// keeps running; agents observe a `::runtime_error::` broadcast.
    async fn handle_runtime_error(&self, task_id: Uuid, err: MailError) {
        error!(task_id = %task_id, error = %err, "unhandled error in dispatch");
        if let Ok(envelope) = Envelope::broadcast(
            task_id,
            Address::system(self.swarm_name()),
            vec![Address::agent("all")],
            subjects::RUNTIME_ERROR,
            err.to_string(),
        ) {
            self.enqueue_internal(envelope).await;
        }
    }

    async fn process_envelope(&self, envelope: Envelope) -> Result<(), MailError> {
        let local_swarm = self.swarm_name().to_string();

        // Split remote legs off before local delivery.
        let (remote, local): (Vec<Address>, Vec<Address>) = envelope
            .recipients()
            .into_iter()
            .cloned()
            .partition(|address| {
                address
                    .swarm()
                    .is_some_and(|swarm| swarm != local_swarm)
            });

        if !remote.is_empty() {
            match self.transport() {
                Some(transport) => {
                    let meta = self
                        .task_meta(envelope.task_id)
                        .await
                        .unwrap_or_else(|| TaskMeta {
                            owner: TaskPrincipal::swarm_instance(&local_swarm),
                            contributors: vec![TaskPrincipal::swarm_instance(&local_swarm)],
                        });
                    let leg = envelope.clone().with_recipients(remote);
                    if let Err(err) = transport.route_remote(leg, meta).await {
                        // The router injects ::router_error:: responses on
                        // its own; this is only for unexpected failures.
                        warn!(task_id = %envelope.task_id, error = %err, "interswarm routing failed");
                    }
                }
                None => {
                    warn!(task_id = %envelope.task_id, "remote recipients with no transport");
                    if envelope.sender().kind == AddressKind::Agent {
                        let reply = Envelope::system_response(
                            envelope.task_id,
                            &local_swarm,
                            envelope.sender().clone(),
                            subjects::ROUTER_ERROR,
                            "interswarm messaging is not enabled on this swarm",
                        );
                        self.enqueue_internal(reply).await;
                    }
                }
            }
            if local.is_empty() {
                return Ok(());
            }
        }

        if envelope.kind() == EnvelopeKind::TaskComplete {
            return self.complete_task(&envelope).await;
        }

        let recipients = self.resolve_local_recipients(&envelope, &local).await;
        for name in recipients {
            self.deliver_to_agent(&name, &envelope).await;
        }
        Ok(())
    }

    /// Expand `all` fanout and drop unknown recipients (notifying senders).
    async fn resolve_local_recipients(
        &self,
        envelope: &Envelope,
        local: &[Address],
    ) -> Vec<String> {
        let sender = envelope.sender();
        if local.iter().any(Address::is_all) {
            let mut names: Vec<String> = self
                .inner
                .agents
                .keys()
                .filter(|name| {
                    !(sender.kind == AddressKind::Agent && sender.local_name() == name.as_str())
                })
                .cloned()
                .collect();
            names.sort();
            return names;
        }

        let mut names = Vec::new();
        for address in local {
            let name = address.local_name();
            if self.inner.agents.contains_key(name) {
                names.push(name.to_string());
            } else {
                warn!(recipient = %name, "unknown local recipient; dropping");
                if sender.kind == AddressKind::Agent {
                    let reply = Envelope::system_response(
                        envelope.task_id,
                        self.swarm_name(),
                        sender.clone(),
                        subjects::ROUTER_ERROR,
                        format!("unknown recipient: '{name}'"),
                    );
                    self.enqueue_internal(reply).await;
                }
            }
        }
        names
    }

    /// Honor a `task_complete` envelope: resolve the pending future once,
    /// mark the task completed (retaining histories), and propagate across
    /// swarms when contributors are remote.
    async fn complete_task(&self, envelope: &Envelope) -> Result<(), MailError> {
        let body = envelope.body_text().to_string();
        let meta = {
            let mut state = self.inner.state.lock().await;
            let Some(record) = state.tasks.get_mut(&envelope.task_id) else {
                warn!(task_id = %envelope.task_id, "task_complete for unknown task; dropping");
                return Ok(());
            };
            if record.completed_once {
                warn!(task_id = %envelope.task_id, "duplicate task_complete; discarding");
                return Ok(());
            }
            record.completed_once = true;
            record.status = TaskStatus::Completed;
            if let Some(sender) = record.completion.take() {
                let _ = sender.send(Ok(body.clone()));
            }
            TaskMeta {
                owner: record.owner.clone(),
                contributors: record.contributors.iter().cloned().collect(),
            }
        };

        info!(task_id = %envelope.task_id, "task complete");
        self.inner.events.record(
            Event::new(
                EventKind::TaskComplete,
                envelope.task_id,
                body.clone(),
            )
            .with_extra(json!({ "response": body })),
        );

        // Propagate locally honored completions to remote participants.
        let locally_originated = envelope
            .sender_swarm
            .as_deref()
            .map_or(true, |swarm| swarm == self.swarm_name());
        if locally_originated {
            let has_remote_leg = meta.owner.swarm != self.swarm_name()
                || meta
                    .contributors
                    .iter()
                    .any(|principal| principal.swarm != self.swarm_name());
            if has_remote_leg {
                if let Some(transport) = self.transport() {
                    if let Err(err) = transport
                        .notify_completion(envelope.clone(), meta)
                        .await
                    {
                        warn!(task_id = %envelope.task_id, error = %err, "completion propagation failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Deliver one envelope to one local agent and process its output.
    async fn deliver_to_agent(&self, name: &str, envelope: &Envelope) {
        let Some(entry) = self.inner.agents.get(name) else {
            return;
        };
        let rendered = envelope.render_for_agent();
        let history = {
            let mut state = self.inner.state.lock().await;
            state.idle.remove(&(name.to_string(), envelope.task_id));
            let history = state
                .histories
                .entry((name.to_string(), envelope.task_id))
                .or_default();
            history.push(HistoryEntry::user(rendered));
            history.clone()
        };
        self.inner.events.record(
            Event::new(
                EventKind::NewMessage,
                envelope.task_id,
                format!(
                    "{} '{}' delivered to '{}'",
                    envelope.kind().as_str(),
                    envelope.subject(),
                    name
                ),
            )
            .with_extra(json!({ "full_message": envelope })),
        );

        let output = entry
            .backend
            .respond(&history, ToolChoice::Required)
            .await;
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                error!(agent = %name, task_id = %envelope.task_id, error = %err, "agent failed");
                self.inner.events.record(Event::new(
                    EventKind::AgentError,
                    envelope.task_id,
                    format!("agent '{name}' failed: {err}"),
                ));
                let reply = Envelope::system_response(
                    envelope.task_id,
                    self.swarm_name(),
                    Address::agent(name),
                    subjects::AGENT_ERROR,
                    format!("your last invocation failed: {err}"),
                );
                self.enqueue_internal(reply).await;
                return;
            }
        };

        {
            let mut state = self.inner.state.lock().await;
            let history = state
                .histories
                .entry((name.to_string(), envelope.task_id))
                .or_default();
            history.push(HistoryEntry::assistant(
                output.text.clone().unwrap_or_default(),
            ));
        }

        self.process_tool_calls(name, &entry.descriptor, envelope, output.calls)
            .await;
    }

    /// Invoke an agent on its existing history, without a new incoming
    /// envelope. Used after breakpoint resumption.
    async fn agent_turn(&self, name: &str, task_id: Uuid) {
        let Some(entry) = self.inner.agents.get(name) else {
            return;
        };
        let history = {
            let state = self.inner.state.lock().await;
            state
                .histories
                .get(&(name.to_string(), task_id))
                .cloned()
                .unwrap_or_default()
        };
        let output = match entry.backend.respond(&history, ToolChoice::Required).await {
            Ok(output) => output,
            Err(err) => {
                error!(agent = %name, task_id = %task_id, error = %err, "agent failed");
                self.inner.events.record(Event::new(
                    EventKind::AgentError,
                    task_id,
                    format!("agent '{name}' failed: {err}"),
                ));
                return;
            }
        };
        {
            let mut state = self.inner.state.lock().await;
            let history = state
                .histories
                .entry((name.to_string(), task_id))
                .or_default();
            history.push(HistoryEntry::assistant(
                output.text.clone().unwrap_or_default(),
            ));
        }
        // Synthesize the envelope context for call processing: the last
        // incoming message for this agent drives broadcast bookkeeping.
        let descriptor = entry.descriptor.clone();
        let placeholder = Envelope::request(
            task_id,
            Address::system(self.swarm_name()),
            Address::agent(name),
            "resume",
            "",
        );
        self.process_tool_calls(name, &descriptor, &placeholder, output.calls)
            .await;
    }

    async fn push_tool_result(&self, name: &str, task_id: Uuid, call: &AgentToolCall, content: &str) {
        let mut state = self.inner.state.lock().await;
        let history = state
            .histories
            .entry((name.to_string(), task_id))
            .or_default();
        history.push(HistoryEntry::tool_result(
            call.name.as_str(),
            call.call_id.as_str(),
            content,
        ));
    }

    async fn process_tool_calls(
        &self,
        name: &str,
        descriptor: &AgentDescriptor,
        envelope: &Envelope,
        calls: Vec<AgentToolCall>,
    ) {
        let task_id = envelope.task_id;
        let mut breakpoint_calls: Vec<AgentToolCall> = Vec::new();

        for call in calls {
            match call.name.as_str() {
                tools::ACKNOWLEDGE_BROADCAST => {
                    if envelope.kind() == EnvelopeKind::Broadcast {
                        let note = call.arg_str("note").unwrap_or_default();
                        let memory = if note.is_empty() {
                            "<acknowledged_broadcast/>".to_string()
                        } else {
                            format!("<acknowledged_broadcast/>\n{note}")
                        };
                        let mut state = self.inner.state.lock().await;
                        let history = state
                            .histories
                            .entry((name.to_string(), task_id))
                            .or_default();
                        history.push(HistoryEntry::system(memory));
                    } else {
                        debug!(agent = %name, "acknowledge_broadcast outside a broadcast; ignoring");
                    }
                    self.push_tool_result(name, task_id, &call, "broadcast acknowledged")
                        .await;
                }
                tools::IGNORE_BROADCAST => {
                    self.push_tool_result(name, task_id, &call, "broadcast ignored")
                        .await;
                }
                tools::AWAIT_MESSAGE => {
                    let mut state = self.inner.state.lock().await;
                    state.idle.insert((name.to_string(), task_id));
                    drop(state);
                    self.push_tool_result(name, task_id, &call, "awaiting new messages")
                        .await;
                }
                tools::DISCOVER_SWARMS => {
                    let urls = call.arg_str_list("discovery_urls").unwrap_or_default();
                    self.inner.events.record(Event::new(
                        EventKind::ToolCall,
                        task_id,
                        format!("'{name}' discovering swarms from {} urls", urls.len()),
                    ));
                    match self.transport() {
                        Some(transport) => match transport.discover(urls).await {
                            Ok(count) => {
                                self.push_tool_result(
                                    name,
                                    task_id,
                                    &call,
                                    &format!("registered {count} swarms"),
                                )
                                .await;
                            }
                            Err(err) => {
                                self.push_tool_result(
                                    name,
                                    task_id,
                                    &call,
                                    &format!("discovery failed: {err}"),
                                )
                                .await;
                            }
                        },
                        None => {
                            self.tool_call_error(name, task_id, &call, "interswarm messaging is not enabled on this swarm")
                                .await;
                        }
                    }
                }
                tools::TASK_COMPLETE if !descriptor.can_complete_tasks => {
                    self.tool_call_error(
                        name,
                        task_id,
                        &call,
                        "only supervisors may complete tasks",
                    )
                    .await;
                }
                mail_tool if call.is_mail_tool() => {
                    self.inner.events.record(Event::new(
                        EventKind::ToolCall,
                        task_id,
                        format!("'{name}' called '{mail_tool}'"),
                    ));
                    match tools::call_to_envelope(
                        &call,
                        name,
                        &descriptor.comm_targets,
                        task_id,
                    ) {
                        Ok(outbound) => {
                            self.push_tool_result(
                                name,
                                task_id,
                                &call,
                                "Message sent. The response, if any, will arrive in a later message.",
                            )
                            .await;
                            self.enqueue_internal(outbound).await;
                        }
                        Err(err) => {
                            self.tool_call_error(name, task_id, &call, &err.to_string())
                                .await;
                        }
                    }
                }
                _ if self.inner.executor.is_breakpoint(&call.name) => {
                    breakpoint_calls.push(call);
                }
                _ => {
                    self.inner.events.record(
                        Event::new(
                            EventKind::ActionCall,
                            task_id,
                            format!("'{name}' invoked action '{}'", call.name),
                        )
                        .with_extra(json!({ "args": call.args })),
                    );
                    let outcome = self
                        .inner
                        .executor
                        .execute(&call, name, task_id, self.swarm_name())
                        .await;
                    self.push_tool_result(name, task_id, &call, &outcome.tool_result)
                        .await;
                    self.inner.events.record(Event::new(
                        EventKind::ActionComplete,
                        task_id,
                        format!(
                            "action '{}' {} for '{name}'",
                            call.name,
                            if outcome.failed { "failed" } else { "completed" }
                        ),
                    ));
                    self.enqueue_internal(outcome.response).await;
                }
            }
        }

        if !breakpoint_calls.is_empty() {
            self.pause_at_breakpoint(name, task_id, breakpoint_calls).await;
        }
    }

    /// Stash the task's queue state and pause it until an external caller
    /// supplies the breakpoint result.
    async fn pause_at_breakpoint(&self, name: &str, task_id: Uuid, calls: Vec<AgentToolCall>) {
        let described: Vec<serde_json::Value> = calls
            .iter()
            .map(|call| json!({ "tool_name": call.name, "tool_args": call.args }))
            .collect();
        {
            let mut state = self.inner.state.lock().await;
            let queued = state.queue.drain_task(task_id);
            let Some(record) = state.tasks.get_mut(&task_id) else {
                warn!(task_id = %task_id, "breakpoint for unknown task");
                return;
            };
            record.status = TaskStatus::Paused;
            record.breakpoint = Some(BreakpointStash {
                caller: name.to_string(),
                calls,
                queued,
            });
        }
        info!(task_id = %task_id, caller = %name, "task paused at breakpoint");
        self.inner.events.record(
            Event::new(
                EventKind::BreakpointToolCall,
                task_id,
                format!("'{name}' paused at a breakpoint tool call"),
            )
            .with_extra(json!({ "caller": name, "calls": described })),
        );
    }

    async fn tool_call_error(
        &self,
        name: &str,
        task_id: Uuid,
        call: &AgentToolCall,
        reason: &str,
    ) {
        warn!(agent = %name, tool = %call.name, reason = %reason, "tool call rejected");
        self.push_tool_result(name, task_id, call, reason).await;
        let reply = Envelope::system_response(
            task_id,
            self.swarm_name(),
            Address::agent(name),
            subjects::TOOL_CALL_ERROR,
            format!("tool call '{}' failed: {reason}", call.name),
        );
        self.enqueue_internal(reply).await;
    }
}
