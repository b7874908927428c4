// ABOUTME: The swarm registry - peer directory with persistence, liveness, and secret handling.
// ABOUTME: Persistent entries store ${VAR} token references only; literals never reach disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NetError;

/// A known peer swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEndpoint {
    pub swarm_name: String,
    pub base_url: String,
    pub health_url: String,
    /// Either a literal token (volatile entries only) or a `${VAR}`
    /// environment reference resolved at dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Volatile entries live only in memory and are dropped on save.
    pub volatile: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    local_swarm_name: String,
    local_base_url: String,
    endpoints: HashMap<String, SwarmEndpoint>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDoc {
    #[serde(default)]
    swarms: Vec<DiscoveredSwarm>,
}

#[derive(Debug, Deserialize)]
struct DiscoveredSwarm {
    swarm_name: String,
    base_url: String,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Registry construction parameters.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub local_swarm_name: String,
    pub local_base_url: String,
    /// Persistence file for non-volatile entries. In-memory only when None.
    pub persistence_path: Option<PathBuf>,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// Consecutive failures before a peer is marked inactive.
    pub failure_threshold: u32,
}

impl RegistryConfig {
    pub fn new(local_swarm_name: impl Into<String>, local_base_url: impl Into<String>) -> Self {
        Self {
            local_swarm_name: local_swarm_name.into(),
            local_base_url: local_base_url.into(),
            persistence_path: None,
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }

    pub fn persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = Some(path.into());
        self
    }

    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

struct EndpointState {
    endpoint: SwarmEndpoint,
    consecutive_failures: u32,
}

struct RegistryInner {
    config: RegistryConfig,
    endpoints: RwLock<HashMap<String, EndpointState>>,
    client: reqwest::Client,
    health: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

/// Local directory of known peer swarms.
///
/// Cheap to clone; clones share state. The router reads it concurrently;
/// mutations go through the inner lock.
#[derive(Clone)]
pub struct SwarmRegistry {
    inner: Arc<RegistryInner>,
}

impl SwarmRegistry {
    /// Create a registry, reloading persistent endpoints if the persistence
    /// file exists.
    pub fn new(config: RegistryConfig) -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .timeout(config.health_timeout)
            .user_agent(format!(
                "mail-swarm-registry/{}",
                config.local_swarm_name
            ))
            .build()
            .map_err(|err| NetError::Http(err.to_string()))?;
        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                endpoints: RwLock::new(HashMap::new()),
                client,
                health: Mutex::new(None),
            }),
        };
        registry.load()?;
        Ok(registry)
    }

    pub fn local_swarm_name(&self) -> &str {
        &self.inner.config.local_swarm_name
    }

    pub fn local_base_url(&self) -> &str {
        &self.inner.config.local_base_url
    }

    /// The deterministic env var name carrying the bearer token for a peer.
    pub fn token_env_var(peer: &str) -> String {
        format!(
            "SWARM_AUTH_TOKEN_{}",
            peer.to_uppercase().replace('-', "_")
        )
    }

    fn to_token_ref(peer: &str, token: &str) -> String {
        if token.starts_with("${") && token.ends_with('}') {
            token.to_string()
        } else {
            let var = Self::token_env_var(peer);
            info!(peer = %peer, var = %var, "storing auth token as environment reference");
            format!("${{{var}}}")
        }
    }

    /// Register a peer. Persistent (`volatile = false`) entries are written
    /// to the persistence file immediately, with any literal token replaced
    /// by its `${VAR}` reference.
    pub async fn register(
        &self,
        swarm_name: &str,
        base_url: &str,
        auth_token: Option<String>,
        metadata: Option<Value>,
        volatile: bool,
    ) -> Result<(), NetError> {
        if swarm_name == self.local_swarm_name() {
            warn!(swarm = %swarm_name, "refusing to register the local swarm as a peer");
            return Ok(());
        }
        let auth_token_ref = auth_token.map(|token| {
            if volatile {
                token
            } else {
                Self::to_token_ref(swarm_name, &token)
            }
        });
        let base_url = base_url.trim_end_matches('/').to_string();
        let endpoint = SwarmEndpoint {
            swarm_name: swarm_name.to_string(),
            health_url: format!("{base_url}/health"),
            base_url,
            auth_token_ref,
            last_seen: Some(Utc::now()),
            active: true,
            metadata,
            volatile,
        };
        {
            let mut endpoints = self.inner.endpoints.write().await;
            endpoints.insert(
                swarm_name.to_string(),
                EndpointState {
                    endpoint,
                    consecutive_failures: 0,
                },
            );
        }
        info!(swarm = %swarm_name, volatile = volatile, "registered peer swarm");
        if !volatile {
            self.save().await?;
        }
        Ok(())
    }

    pub async fn unregister(&self, swarm_name: &str) -> Result<(), NetError> {
        let was_persistent = {
            let mut endpoints = self.inner.endpoints.write().await;
            endpoints
                .remove(swarm_name)
                .map(|state| !state.endpoint.volatile)
        };
        match was_persistent {
            Some(true) => self.save().await,
            Some(false) => Ok(()),
            None => Ok(()),
        }
    }

    pub async fn get(&self, swarm_name: &str) -> Option<SwarmEndpoint> {
        self.inner
            .endpoints
            .read()
            .await
            .get(swarm_name)
            .map(|state| state.endpoint.clone())
    }

    /// All registered endpoints, keyed by swarm name.
    pub async fn list(&self) -> HashMap<String, SwarmEndpoint> {
        self.inner
            .endpoints
            .read()
            .await
            .iter()
            .map(|(name, state)| (name.clone(), state.endpoint.clone()))
            .collect()
    }

    pub async fn active(&self) -> HashMap<String, SwarmEndpoint> {
        self.inner
            .endpoints
            .read()
            .await
            .iter()
            .filter(|(_, state)| state.endpoint.active)
            .map(|(name, state)| (name.clone(), state.endpoint.clone()))
            .collect()
    }

    /// Resolve the bearer token for a peer. `${VAR}` references are read
    /// from the environment at call time; an unset variable is an error so
    /// the router can reject the send without network I/O.
    pub async fn resolve_token(&self, swarm_name: &str) -> Result<Option<String>, NetError> {
        let endpoint = self
            .get(swarm_name)
            .await
            .ok_or_else(|| NetError::UnknownSwarm(swarm_name.to_string()))?;
        match endpoint.auth_token_ref {
            None => Ok(None),
            Some(token_ref) => {
                if let Some(var) = token_ref
                    .strip_prefix("${")
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    match std::env::var(var) {
                        Ok(token) => Ok(Some(token)),
                        Err(_) => Err(NetError::TokenUnset(var.to_string())),
                    }
                } else {
                    Ok(Some(token_ref))
                }
            }
        }
    }

    /// Report which `${VAR}` token references are currently resolvable.
    pub async fn validate_env_tokens(&self) -> Vec<(String, bool)> {
        let endpoints = self.inner.endpoints.read().await;
        let mut results = Vec::new();
        for state in endpoints.values() {
            if let Some(var) = state
                .endpoint
                .auth_token_ref
                .as_deref()
                .and_then(|r| r.strip_prefix("${"))
                .and_then(|r| r.strip_suffix('}'))
            {
                results.push((var.to_string(), std::env::var(var).is_ok()));
            }
        }
        results.sort();
        results
    }

    /// Write non-volatile endpoints to the persistence file.
    pub async fn save(&self) -> Result<(), NetError> {
        let Some(path) = self.inner.config.persistence_path.as_ref() else {
            return Ok(());
        };
        let endpoints: HashMap<String, SwarmEndpoint> = self
            .inner
            .endpoints
            .read()
            .await
            .iter()
            .filter(|(_, state)| !state.endpoint.volatile)
            .map(|(name, state)| (name.clone(), state.endpoint.clone()))
            .collect();
        let file = RegistryFile {
            local_swarm_name: self.local_swarm_name().to_string(),
            local_base_url: self.local_base_url().to_string(),
            endpoints,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| NetError::Persistence(err.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&file)
            .map_err(|err| NetError::Persistence(err.to_string()))?;
        std::fs::write(path, json).map_err(|err| NetError::Persistence(err.to_string()))?;
        debug!(path = %path.display(), count = file.endpoints.len(), "registry persisted");
        Ok(())
    }

    fn load(&self) -> Result<(), NetError> {
        let Some(path) = self.inner.config.persistence_path.as_ref() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw =
            std::fs::read_to_string(path).map_err(|err| NetError::Persistence(err.to_string()))?;
        let file: RegistryFile =
            serde_json::from_str(&raw).map_err(|err| NetError::Persistence(err.to_string()))?;
        let mut endpoints = self
            .inner
            .endpoints
            .try_write()
            .expect("registry lock free during construction");
        let mut loaded = 0usize;
        for (name, mut endpoint) in file.endpoints {
            if name == self.local_swarm_name() {
                continue;
            }
            endpoint.volatile = false;
            endpoints.insert(
                name,
                EndpointState {
                    endpoint,
                    consecutive_failures: 0,
                },
            );
            loaded += 1;
        }
        info!(path = %path.display(), count = loaded, "registry loaded");
        Ok(())
    }

    /// Poll advertised catalog URLs and register the peers they list as
    /// volatile entries. Discovery never overwrites persistent entries.
    /// Returns how many peers were registered.
    pub async fn discover(&self, urls: &[String]) -> Result<usize, NetError> {
        let mut registered = 0usize;
        for url in urls {
            let url = format!("{}/swarms", url.trim_end_matches('/'));
            let doc: DiscoveryDoc = match self.inner.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json().await {
                        Ok(doc) => doc,
                        Err(err) => {
                            warn!(url = %url, error = %err, "malformed discovery document");
                            continue;
                        }
                    }
                }
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), "discovery endpoint refused");
                    continue;
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "discovery endpoint unreachable");
                    continue;
                }
            };
            for swarm in doc.swarms {
                if swarm.swarm_name == self.local_swarm_name() {
                    continue;
                }
                let persistent_exists = {
                    let endpoints = self.inner.endpoints.read().await;
                    endpoints
                        .get(&swarm.swarm_name)
                        .is_some_and(|state| !state.endpoint.volatile)
                };
                if persistent_exists {
                    debug!(swarm = %swarm.swarm_name, "discovery skipped persistent entry");
                    continue;
                }
                self.register(
                    &swarm.swarm_name,
                    &swarm.base_url,
                    swarm.auth_token,
                    swarm.metadata,
                    true,
                )
                .await?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Start the periodic health loop. Idempotent.
    pub async fn start_health(&self) {
        let mut health = self.inner.health.lock().await;
        if health.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = self.clone();
        let interval = self.inner.config.health_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => registry.check_all().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *health = Some((stop_tx, handle));
        info!(swarm = %self.local_swarm_name(), "health checks started");
    }

    /// Stop the health loop. Idempotent.
    pub async fn stop_health(&self) {
        let taken = self.inner.health.lock().await.take();
        if let Some((stop_tx, handle)) = taken {
            let _ = stop_tx.send(true);
            let _ = handle.await;
            info!(swarm = %self.local_swarm_name(), "health checks stopped");
        }
    }

    async fn check_all(&self) {
        let targets: Vec<(String, String)> = {
            let endpoints = self.inner.endpoints.read().await;
            endpoints
                .values()
                .map(|state| {
                    (
                        state.endpoint.swarm_name.clone(),
                        state.endpoint.health_url.clone(),
                    )
                })
                .collect()
        };
        for (name, health_url) in targets {
            let healthy = match self.inner.client.get(&health_url).send().await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            };
            let mut endpoints = self.inner.endpoints.write().await;
            let Some(state) = endpoints.get_mut(&name) else {
                continue;
            };
            if healthy {
                state.consecutive_failures = 0;
                state.endpoint.last_seen = Some(Utc::now());
                if !state.endpoint.active {
                    state.endpoint.active = true;
                    info!(swarm = %name, "peer is active again");
                }
            } else {
                state.consecutive_failures += 1;
                if state.endpoint.active
                    && state.consecutive_failures >= self.inner.config.failure_threshold
                {
                    state.endpoint.active = false;
                    warn!(
                        swarm = %name,
                        failures = state.consecutive_failures,
                        "peer marked inactive"
                    );
                }
            }
        }
    }

    /// One health sweep, for tests and manual probes.
    pub async fn check_now(&self) {
        self.check_all().await;
    }
}
