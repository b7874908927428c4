// ABOUTME: The interswarm wire format - the JSON document exchanged between peer swarms.
// ABOUTME: Task ownership travels with every envelope; contributors must include the owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use mail_core::{Envelope, EnvelopeKind, TaskPrincipal};

use crate::error::NetError;

/// Metadata key hinting that a synchronous response is desired.
pub const EXPECT_RESPONSE: &str = "expect_response";

/// An envelope wrapped for HTTP transport between swarms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterswarmEnvelope {
    pub message_id: Uuid,
    pub source_swarm: String,
    pub target_swarm: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Envelope,
    /// The instance where the task was created, `role:id@swarm`. Immutable
    /// after creation.
    pub task_owner: TaskPrincipal,
    /// Set semantics; must include `task_owner`. Receivers may only add.
    pub task_contributors: Vec<TaskPrincipal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl InterswarmEnvelope {
    /// Wrap a payload for transport. Sets `expect_response` for requests.
    pub fn wrap(
        payload: Envelope,
        source_swarm: impl Into<String>,
        target_swarm: impl Into<String>,
        task_owner: TaskPrincipal,
        task_contributors: Vec<TaskPrincipal>,
    ) -> Self {
        let mut metadata = Map::new();
        if payload.kind() == EnvelopeKind::Request {
            metadata.insert(EXPECT_RESPONSE.to_string(), Value::Bool(true));
        }
        Self {
            message_id: payload.id,
            source_swarm: source_swarm.into(),
            target_swarm: target_swarm.into(),
            timestamp: payload.timestamp,
            payload,
            task_owner,
            task_contributors,
            auth_token: None,
            metadata,
        }
    }

    pub fn expects_response(&self) -> bool {
        self.metadata
            .get(EXPECT_RESPONSE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Validate the wire invariants on ingress.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.source_swarm.trim().is_empty() || self.target_swarm.trim().is_empty() {
            return Err(NetError::Malformed(
                "source and target swarm names must not be empty".to_string(),
            ));
        }
        if !self.task_contributors.contains(&self.task_owner) {
            return Err(NetError::Malformed(
                "task_contributors must include task_owner".to_string(),
            ));
        }
        self.payload
            .validate()
            .map_err(|err| NetError::Malformed(err.to_string()))
    }
}

/// Body of `POST /interswarm/forward` and `POST /interswarm/back`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardBody {
    pub message: InterswarmEnvelope,
}

/// Body of `GET /health` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub swarm_name: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_core::Address;

    fn request_payload() -> Envelope {
        Envelope::request(
            Uuid::new_v4(),
            Address::agent("supervisor@alpha"),
            Address::agent("consultant"),
            "q",
            "help?",
        )
    }

    #[test]
    fn test_wrap_sets_expect_response_for_requests() {
        let owner = TaskPrincipal::user("alice", "alpha");
        let wrapped = InterswarmEnvelope::wrap(
            request_payload(),
            "alpha",
            "beta",
            owner.clone(),
            vec![owner],
        );
        assert!(wrapped.expects_response());
        assert_eq!(wrapped.message_id, wrapped.payload.id);
        assert_eq!(wrapped.timestamp, wrapped.payload.timestamp);

        let completion = Envelope::task_complete(
            Uuid::new_v4(),
            Address::agent("supervisor@beta"),
            "done",
        );
        let owner = TaskPrincipal::user("alice", "alpha");
        let wrapped =
            InterswarmEnvelope::wrap(completion, "beta", "alpha", owner.clone(), vec![owner]);
        assert!(!wrapped.expects_response());
    }

    #[test]
    fn test_validate_requires_owner_in_contributors() {
        let owner = TaskPrincipal::user("alice", "alpha");
        let mut wrapped = InterswarmEnvelope::wrap(
            request_payload(),
            "alpha",
            "beta",
            owner,
            vec![TaskPrincipal::swarm_instance("beta")],
        );
        let err = wrapped.validate().unwrap_err();
        assert!(matches!(err, NetError::Malformed(_)));

        wrapped.task_contributors.push(wrapped.task_owner.clone());
        wrapped.validate().unwrap();
    }

    #[test]
    fn test_wire_serde_round_trip() {
        let owner = TaskPrincipal::user("alice", "alpha");
        let wrapped = InterswarmEnvelope::wrap(
            request_payload(),
            "alpha",
            "beta",
            owner.clone(),
            vec![owner, TaskPrincipal::swarm_instance("beta")],
        );
        let json = serde_json::to_string(&ForwardBody {
            message: wrapped.clone(),
        })
        .unwrap();
        assert!(json.contains("\"task_owner\":\"user:alice@alpha\""));
        let back: ForwardBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message.message_id, wrapped.message_id);
        assert_eq!(back.message.task_owner, wrapped.task_owner);
        assert_eq!(back.message.payload, wrapped.payload);
    }
}
