// ABOUTME: mail-net - the federation layer: registry, wire format, and interswarm router.
// ABOUTME: Implements mail-core's SwarmTransport over HTTP with bearer-token auth.

//! Interswarm federation for MAIL: a peer directory with liveness and
//! env-referenced credentials ([`SwarmRegistry`]), the JSON wire format
//! exchanged between swarms ([`InterswarmEnvelope`]), and the HTTP router
//! ([`InterswarmRouter`]) that the swarm container injects into the runtime
//! as its [`mail_core::SwarmTransport`].

pub mod error;
pub mod registry;
pub mod router;
pub mod wire;

pub use error::NetError;
pub use registry::{RegistryConfig, SwarmEndpoint, SwarmRegistry};
pub use router::{InterswarmRouter, RouterConfig, RouterStats};
pub use wire::{ForwardBody, HealthResponse, InterswarmEnvelope, EXPECT_RESPONSE};
