// ABOUTME: Error types for mail-core.
// ABOUTME: One variant per failure kind in the MAIL error taxonomy.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the message model, tool catalog, and runtime.
///
/// Recoverable kinds (schema, forbidden target, unknown recipient, action,
/// agent) are normally folded back into the task as system messages; only
/// timeout, cancellation, and runtime failures surface to callers.
#[derive(Error, Debug)]
pub enum MailError {
    /// An envelope failed schema validation at ingress.
    #[error("malformed envelope: {0}")]
    Schema(String),

    /// An agent addressed a recipient outside its comm targets.
    #[error("agent '{agent}' may not address '{target}'")]
    TargetForbidden { agent: String, target: String },

    /// A local recipient name does not exist in this swarm.
    #[error("unknown recipient: '{0}'")]
    UnknownRecipient(String),

    /// A tool call was malformed (unknown tool, missing or mistyped args).
    #[error("tool call error: {0}")]
    ToolCall(String),

    /// A third-party action failed or returned an invalid shape.
    #[error("action '{action}' failed: {reason}")]
    Action { action: String, reason: String },

    /// An agent function raised.
    #[error("agent '{agent}' failed: {reason}")]
    Agent { agent: String, reason: String },

    /// The pending future for a task was not resolved within the deadline.
    #[error("task '{0}' timed out")]
    TaskTimeout(Uuid),

    /// The task was cancelled before completion.
    #[error("task '{0}' was cancelled")]
    Cancelled(Uuid),

    /// No record exists for the given task.
    #[error("unknown task: '{0}'")]
    UnknownTask(Uuid),

    /// Swarm construction or resumption was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The interswarm transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unhandled failure inside the scheduler.
    #[error("runtime error: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MailError::TargetForbidden {
            agent: "weather".to_string(),
            target: "analyst".to_string(),
        };
        assert!(err.to_string().contains("weather"));
        assert!(err.to_string().contains("analyst"));

        let err = MailError::Schema("recipients must not be empty".to_string());
        assert!(err.to_string().contains("malformed envelope"));

        let task = Uuid::new_v4();
        let err = MailError::TaskTimeout(task);
        assert!(err.to_string().contains(&task.to_string()));
    }
}
