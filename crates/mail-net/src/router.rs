// ABOUTME: The interswarm router - wraps outbound envelopes, POSTs to peers, injects inbound.
// ABOUTME: Transport failures never kill local tasks; they become ::router_error:: responses.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mail_core::{
    subjects, Address, Envelope, EnvelopeKind, MailError, Runtime, SwarmTransport, TaskMeta,
    TaskPrincipal,
};

use crate::error::NetError;
use crate::registry::SwarmRegistry;
use crate::wire::{ForwardBody, InterswarmEnvelope};

/// Recent inbound message ids kept for duplicate suppression.
const SEEN_CAPACITY: usize = 1024;

/// Router construction parameters.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Per-request transport timeout.
    pub request_timeout: Duration,
    /// Propagate `routing_info.stream = true` on outbound legs.
    pub streaming: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            streaming: false,
        }
    }
}

/// Point-in-time routing statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub local_swarm: String,
    pub known_swarms: usize,
    pub active_swarms: usize,
    pub forwarded: u64,
    pub received: u64,
    pub duplicates_dropped: u64,
    pub errors: u64,
}

struct SeenIds {
    set: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenIds {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the id was already seen.
    fn note(&mut self, id: Uuid) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct RouterInner {
    registry: SwarmRegistry,
    runtime: Runtime,
    local_swarm: String,
    client: reqwest::Client,
    config: RouterConfig,
    seen: Mutex<SeenIds>,
    forwarded: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    errors: AtomicU64,
}

/// Bridges the local runtime with peer swarms over HTTP.
///
/// Implements [`SwarmTransport`]; the swarm container injects it into the
/// runtime. One router (and its HTTP pool) serves one runtime instance.
#[derive(Clone)]
pub struct InterswarmRouter {
    inner: Arc<RouterInner>,
}

impl InterswarmRouter {
    pub fn new(
        registry: SwarmRegistry,
        runtime: Runtime,
        config: RouterConfig,
    ) -> Result<Self, NetError> {
        let local_swarm = registry.local_swarm_name().to_string();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("mail-interswarm-router/{local_swarm}"))
            .build()
            .map_err(|err| NetError::Http(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(RouterInner {
                registry,
                runtime,
                local_swarm,
                client,
                config,
                seen: Mutex::new(SeenIds::new()),
                forwarded: AtomicU64::new(0),
                received: AtomicU64::new(0),
                duplicates: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        })
    }

    pub fn registry(&self) -> &SwarmRegistry {
        &self.inner.registry
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            local_swarm: self.inner.local_swarm.clone(),
            known_swarms: self.inner.registry.list().await.len(),
            active_swarms: self.inner.registry.active().await.len(),
            forwarded: self.inner.forwarded.load(Ordering::Relaxed),
            received: self.inner.received.load(Ordering::Relaxed),
            duplicates_dropped: self.inner.duplicates.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }

    /// Inbound `POST /interswarm/forward`: a peer is initiating or
    /// continuing a task on this swarm.
    pub async fn receive_forward(&self, wrapped: InterswarmEnvelope) -> Result<(), NetError> {
        self.receive(wrapped, false).await
    }

    /// Inbound `POST /interswarm/back`: a peer is returning a response or
    /// completion for a task owned on this side (or resuming one it owns).
    pub async fn receive_back(&self, wrapped: InterswarmEnvelope) -> Result<(), NetError> {
        self.receive(wrapped, true).await
    }

    async fn receive(&self, wrapped: InterswarmEnvelope, back: bool) -> Result<(), NetError> {
        wrapped.validate()?;
        if wrapped.target_swarm != self.inner.local_swarm {
            return Err(NetError::WrongSwarm {
                expected: self.inner.local_swarm.clone(),
                got: wrapped.target_swarm,
            });
        }
        if !self.inner.seen.lock().await.note(wrapped.message_id) {
            self.inner.duplicates.fetch_add(1, Ordering::Relaxed);
            warn!(message_id = %wrapped.message_id, "duplicate interswarm message dropped");
            return Ok(());
        }

        let correlates = matches!(
            wrapped.payload.kind(),
            EnvelopeKind::Response | EnvelopeKind::TaskComplete
        );
        if back && correlates && !self.inner.runtime.knows_task(wrapped.payload.task_id).await {
            let task_id = wrapped.payload.task_id;
            if wrapped.task_owner.swarm == self.inner.local_swarm {
                // We are the owner but have no record (e.g. restarted):
                // reply with a router error and drop the payload.
                warn!(task_id = %task_id, "response for unknown owned task; dropping");
                self.reply_unknown_task(&wrapped).await;
                return Err(NetError::UnknownTask(task_id));
            }
            warn!(task_id = %task_id, "response for unknown task; dropping");
            return Ok(());
        }

        let mut payload = wrapped.payload.clone();
        let recipients = payload
            .recipients()
            .into_iter()
            .map(|address| {
                if address.swarm() == Some(self.inner.local_swarm.as_str()) {
                    address.bare()
                } else {
                    address.clone()
                }
            })
            .collect();
        payload = payload.with_recipients(recipients);
        if payload.sender_swarm.is_none() {
            payload.sender_swarm = Some(wrapped.source_swarm.clone());
        }

        self.inner
            .runtime
            .submit_remote(payload, wrapped.task_owner, wrapped.task_contributors)
            .await
            .map_err(|err| NetError::Rejected(err.to_string()))?;
        self.inner.received.fetch_add(1, Ordering::Relaxed);
        debug!(source = %wrapped.source_swarm, back = back, "interswarm message accepted");
        Ok(())
    }

    /// Best-effort router error back to the source swarm for a task this
    /// instance no longer knows.
    async fn reply_unknown_task(&self, wrapped: &InterswarmEnvelope) {
        let payload = Envelope::system_response(
            wrapped.payload.task_id,
            &self.inner.local_swarm,
            wrapped.payload.sender().clone(),
            subjects::ROUTER_ERROR,
            format!(
                "task '{}' is not known to swarm '{}'",
                wrapped.payload.task_id, self.inner.local_swarm
            ),
        );
        let reply = InterswarmEnvelope::wrap(
            payload,
            self.inner.local_swarm.clone(),
            wrapped.source_swarm.clone(),
            wrapped.task_owner.clone(),
            wrapped.task_contributors.clone(),
        );
        if let Err(err) = self
            .post_wrapped(&wrapped.source_swarm, "back", &reply)
            .await
        {
            warn!(peer = %wrapped.source_swarm, error = %err, "unknown-task reply failed");
        }
    }

    fn contributors_with_local(&self, meta: &TaskMeta) -> Vec<TaskPrincipal> {
        let local = TaskPrincipal::swarm_instance(&self.inner.local_swarm);
        let mut contributors = meta.contributors.clone();
        if !contributors.contains(&local) {
            contributors.push(local);
        }
        if !contributors.contains(&meta.owner) {
            contributors.push(meta.owner.clone());
        }
        contributors
    }

    /// POST one wrapped envelope to a peer. Fails without network I/O when
    /// the peer is unknown, inactive, or its token env var is unset.
    async fn post_wrapped(
        &self,
        target: &str,
        path: &str,
        wrapped: &InterswarmEnvelope,
    ) -> Result<(), NetError> {
        let endpoint = self
            .inner
            .registry
            .get(target)
            .await
            .ok_or_else(|| NetError::UnknownSwarm(target.to_string()))?;
        if !endpoint.active {
            return Err(NetError::InactiveSwarm(target.to_string()));
        }
        let token = self.inner.registry.resolve_token(target).await?;

        let url = format!("{}/interswarm/{}", endpoint.base_url, path);
        let mut request = self.inner.client.post(&url).json(&ForwardBody {
            message: wrapped.clone(),
        });
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| NetError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(NetError::Http(format!(
                "peer '{target}' returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Deliver a `::router_error::` response to the local sender so the
    /// task can observe and react to the failure.
    async fn inject_router_error(&self, original: &Envelope, reason: String) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        warn!(task_id = %original.task_id, reason = %reason, "interswarm send failed");
        let reply = Envelope::system_response(
            original.task_id,
            &self.inner.local_swarm,
            original.sender().clone(),
            subjects::ROUTER_ERROR,
            reason,
        );
        if let Err(err) = self.inner.runtime.submit(reply).await {
            warn!(task_id = %original.task_id, error = %err, "router error injection failed");
        }
    }
}

/// Rewrite one outbound leg for a target swarm: recipients become bare local
/// names on that swarm, the sender gains the local qualifier, and the
/// federation fields are set.
fn make_leg(
    envelope: &Envelope,
    local_swarm: &str,
    target_swarm: &str,
    addresses: Vec<Address>,
    streaming: bool,
) -> Envelope {
    let recipients = addresses.iter().map(Address::bare).collect();
    let sender = envelope.sender().clone();
    let sender = if sender.swarm().is_none() {
        sender.qualified(local_swarm)
    } else {
        sender
    };
    let mut leg = envelope.clone().with_recipients(recipients).with_sender(sender);
    leg.sender_swarm = Some(local_swarm.to_string());
    leg.recipient_swarms = Some(vec![target_swarm.to_string()]);
    if streaming {
        leg.routing_info
            .insert("stream".to_string(), serde_json::Value::Bool(true));
    }
    leg
}

#[async_trait]
impl SwarmTransport for InterswarmRouter {
    fn local_swarm(&self) -> &str {
        &self.inner.local_swarm
    }

    async fn route_remote(&self, envelope: Envelope, task: TaskMeta) -> Result<(), MailError> {
        // Group remote recipients into one leg per target swarm.
        let mut legs: BTreeMap<String, Vec<Address>> = BTreeMap::new();
        for address in envelope.recipients() {
            match address.swarm() {
                Some(swarm) if swarm != self.inner.local_swarm => {
                    legs.entry(swarm.to_string()).or_default().push(address.clone());
                }
                _ => {}
            }
        }

        let contributors = self.contributors_with_local(&task);
        for (target_swarm, addresses) in legs {
            let leg = make_leg(
                &envelope,
                &self.inner.local_swarm,
                &target_swarm,
                addresses,
                self.inner.config.streaming,
            );
            let wrapped = InterswarmEnvelope::wrap(
                leg,
                self.inner.local_swarm.clone(),
                target_swarm.clone(),
                task.owner.clone(),
                contributors.clone(),
            );
            // Continuations of a task owned by the target go to /back; new
            // work goes to /forward.
            let path = if task.owner.swarm == target_swarm {
                "back"
            } else {
                "forward"
            };
            match self.post_wrapped(&target_swarm, path, &wrapped).await {
                Ok(()) => {
                    self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
                    info!(peer = %target_swarm, path = path, "interswarm message sent");
                }
                Err(err) => {
                    self.inject_router_error(
                        &envelope,
                        format!("could not reach swarm '{target_swarm}': {err}"),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    async fn notify_completion(
        &self,
        envelope: Envelope,
        task: TaskMeta,
    ) -> Result<(), MailError> {
        let targets: Vec<String> = if task.owner.swarm != self.inner.local_swarm {
            vec![task.owner.swarm.clone()]
        } else {
            let mut swarms: Vec<String> = task
                .contributors
                .iter()
                .map(|principal| principal.swarm.clone())
                .filter(|swarm| swarm != &self.inner.local_swarm)
                .collect();
            swarms.sort();
            swarms.dedup();
            swarms
        };

        let contributors = self.contributors_with_local(&task);
        for target_swarm in targets {
            let leg = make_leg(
                &envelope,
                &self.inner.local_swarm,
                &target_swarm,
                envelope.recipients().into_iter().cloned().collect(),
                false,
            );
            let wrapped = InterswarmEnvelope::wrap(
                leg,
                self.inner.local_swarm.clone(),
                target_swarm.clone(),
                task.owner.clone(),
                contributors.clone(),
            );
            // Completion propagation is best-effort; failures are logged and
            // never block local completion.
            if let Err(err) = self.post_wrapped(&target_swarm, "back", &wrapped).await {
                self.inner.errors.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %target_swarm, error = %err, "completion propagation failed");
            } else {
                self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn discover(&self, urls: Vec<String>) -> Result<usize, MailError> {
        self.inner
            .registry
            .discover(&urls)
            .await
            .map_err(MailError::from)
    }

    async fn shutdown(&self) {
        self.inner.registry.stop_health().await;
        if let Err(err) = self.inner.registry.save().await {
            warn!(error = %err, "registry flush failed at shutdown");
        }
        info!(swarm = %self.inner.local_swarm, "interswarm router stopped");
    }
}
