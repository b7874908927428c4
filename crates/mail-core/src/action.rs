// ABOUTME: Executor for non-MAIL (third-party) tool calls declared as agent actions.
// ABOUTME: Validates arguments against the action schema; breakpoint actions are not run here.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::MailError;
use crate::message::{subjects, Address, Envelope};
use crate::tools::{AgentToolCall, ToolSpec};

type ActionFuture = Pin<Box<dyn Future<Output = Result<String, MailError>> + Send>>;

/// Side-effecting function behind an action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, args: Value) -> Result<String, MailError>;
}

/// Adapter turning an async closure into an [`ActionHandler`].
pub struct FnAction {
    f: Box<dyn Fn(Value) -> ActionFuture + Send + Sync>,
}

impl FnAction {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, MailError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |args| Box::pin(f(args))),
        }
    }
}

#[async_trait]
impl ActionHandler for FnAction {
    async fn run(&self, args: Value) -> Result<String, MailError> {
        (self.f)(args).await
    }
}

/// A third-party tool an agent may invoke.
#[derive(Clone)]
pub struct Action {
    pub name: String,
    pub description: String,
    /// JSON schema for the action's arguments.
    pub parameters: Value,
    /// Breakpoint actions pause the task instead of running; the stashed
    /// call resumes only when an external caller supplies the result.
    pub breakpoint: bool,
    handler: Arc<dyn ActionHandler>,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: impl ActionHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            breakpoint: false,
            handler: Arc::new(handler),
        }
    }

    pub fn breakpoint(mut self) -> Self {
        self.breakpoint = true;
        self
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec::new(&self.name, &self.description, self.parameters.clone())
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("breakpoint", &self.breakpoint)
            .finish()
    }
}

/// Outcome of an action invocation: the response envelope re-enqueued to the
/// caller, plus the raw text recorded as the tool result in its history.
pub struct ActionOutcome {
    pub response: Envelope,
    pub tool_result: String,
    pub failed: bool,
}

/// Runs the non-MAIL tools declared in agent `actions` lists.
pub struct ActionExecutor {
    actions: HashMap<String, Action>,
}

impl ActionExecutor {
    pub fn new<I>(actions: I) -> Self
    where
        I: IntoIterator<Item = Action>,
    {
        Self {
            actions: actions
                .into_iter()
                .map(|action| (action.name.clone(), action))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn is_breakpoint(&self, name: &str) -> bool {
        self.actions.get(name).is_some_and(|a| a.breakpoint)
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Execute one action call and format the result for the caller.
    ///
    /// Lookup and validation failures come back as `::tool_call_error::`
    /// responses; the task continues either way.
    pub async fn execute(
        &self,
        call: &AgentToolCall,
        caller: &str,
        task_id: Uuid,
        swarm_name: &str,
    ) -> ActionOutcome {
        let action = match self.actions.get(&call.name) {
            Some(action) => action,
            None => {
                let reason = format!("unknown action: '{}'", call.name);
                return Self::failure(task_id, swarm_name, caller, reason);
            }
        };

        if let Err(reason) = validate_args(&action.parameters, &call.args) {
            let reason = format!("invalid arguments for action '{}': {}", call.name, reason);
            return Self::failure(task_id, swarm_name, caller, reason);
        }

        match action.handler.run(call.args.clone()).await {
            Ok(output) => {
                let body = format!(
                    "The action '{}' has completed. The result is as follows:\n\n<output>\n{}\n</output>",
                    call.name, output
                );
                ActionOutcome {
                    response: Envelope::system_response(
                        task_id,
                        swarm_name,
                        Address::agent(caller),
                        subjects::ACTION_COMPLETE,
                        body,
                    ),
                    tool_result: output,
                    failed: false,
                }
            }
            Err(err) => {
                let reason = format!("action '{}' failed: {}", call.name, err);
                Self::failure(task_id, swarm_name, caller, reason)
            }
        }
    }

    fn failure(task_id: Uuid, swarm_name: &str, caller: &str, reason: String) -> ActionOutcome {
        ActionOutcome {
            response: Envelope::system_response(
                task_id,
                swarm_name,
                Address::agent(caller),
                subjects::TOOL_CALL_ERROR,
                reason.clone(),
            ),
            tool_result: reason,
            failed: true,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Validate `args` against a parameter schema. Reports the offending path on
/// the first mismatch.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let empty = serde_json::Map::new();
    let args_object = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(format!(
                "arguments must be an object, got {}",
                json_type_name(other)
            ))
        }
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_object.contains_key(key) {
                return Err(format!("missing required argument '{key}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, property) in properties {
            let Some(value) = args_object.get(key) else {
                continue;
            };
            let Some(expected) = property.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "{key}: expected {expected}, got {}",
                    json_type_name(value)
                ));
            }
            // One level of array item checking covers the catalog's shapes.
            if expected == "array" {
                if let (Some(item_type), Some(items)) = (
                    property
                        .get("items")
                        .and_then(|i| i.get("type"))
                        .and_then(Value::as_str),
                    value.as_array(),
                ) {
                    for (index, item) in items.iter().enumerate() {
                        if !type_matches(item_type, item) {
                            return Err(format!(
                                "{key}[{index}]: expected {item_type}, got {}",
                                json_type_name(item)
                            ));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
