// ABOUTME: Error types for the federation layer.
// ABOUTME: Router failures are normally translated into ::router_error:: responses, not surfaced.

use thiserror::Error;
use uuid::Uuid;

use mail_core::MailError;

/// Errors produced by the registry and interswarm router.
#[derive(Error, Debug)]
pub enum NetError {
    /// No endpoint is registered under this swarm name.
    #[error("unknown swarm: '{0}'")]
    UnknownSwarm(String),

    /// The peer is registered but currently marked inactive.
    #[error("swarm '{0}' is inactive")]
    InactiveSwarm(String),

    /// A `${VAR}` auth token reference could not be resolved.
    #[error("environment variable '{0}' is not set")]
    TokenUnset(String),

    /// Transport failed or the peer returned a non-success status.
    #[error("http error: {0}")]
    Http(String),

    /// An inbound interswarm message was addressed to a different swarm.
    #[error("message for wrong swarm: expected '{expected}', got '{got}'")]
    WrongSwarm { expected: String, got: String },

    /// An inbound interswarm message violated the wire schema.
    #[error("malformed interswarm message: {0}")]
    Malformed(String),

    /// A response or completion referenced a task this instance does not
    /// know (e.g. the owner restarted).
    #[error("unknown task: '{0}'")]
    UnknownTask(Uuid),

    /// The local runtime refused an inbound message.
    #[error("local runtime rejected the message: {0}")]
    Rejected(String),

    /// Reading or writing the registry persistence file failed.
    #[error("registry persistence failed: {0}")]
    Persistence(String),
}

impl From<NetError> for MailError {
    fn from(err: NetError) -> Self {
        MailError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_conversion() {
        let err = NetError::TokenUnset("SWARM_AUTH_TOKEN_BETA".to_string());
        assert!(err.to_string().contains("SWARM_AUTH_TOKEN_BETA"));

        let mail: MailError = NetError::UnknownSwarm("beta".to_string()).into();
        assert!(matches!(mail, MailError::Transport(_)));
        assert!(mail.to_string().contains("beta"));
    }
}
