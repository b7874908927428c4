// ABOUTME: Two-agent demo swarm: a supervisor delegating to a weather agent with one action.
// ABOUTME: Run with: cargo run --example weather_swarm

use std::time::Duration;

use serde_json::json;

use mail_core::{
    Action, AgentDescriptor, AgentOutput, AgentToolCall, FnAction, ScriptedAgent, SwarmBuilder,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    mail_log::init();

    let swarm = SwarmBuilder::new("demo")
        .user("demo-user")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["weather"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                AgentOutput::call(AgentToolCall::new(
                    "send_request",
                    json!({
                        "target": "weather",
                        "subject": "forecast",
                        "body": "What is the weather in New York today?",
                    }),
                )),
                AgentOutput::call(AgentToolCall::new(
                    "task_complete",
                    json!({ "finish_message": "It will be sunny in New York." }),
                )),
            ]),
        )
        .agent(
            AgentDescriptor::new("weather")
                .targets(["supervisor"])
                .actions(["fetch_forecast"]),
            ScriptedAgent::new([
                AgentOutput::call(AgentToolCall::new(
                    "fetch_forecast",
                    json!({ "location": "New York" }),
                )),
                AgentOutput::call(AgentToolCall::new(
                    "send_response",
                    json!({
                        "target": "supervisor",
                        "subject": "re: forecast",
                        "body": "Sunny, 75F in New York.",
                    }),
                )),
            ]),
        )
        .action(Action::new(
            "fetch_forecast",
            "Fetch the forecast for a location.",
            json!({
                "type": "object",
                "properties": {
                    "location": { "type": "string", "description": "City name." },
                },
                "required": ["location"],
            }),
            FnAction::new(|args| async move {
                let location = args["location"].as_str().unwrap_or("somewhere").to_string();
                Ok(format!("Sunny, 75F in {location}."))
            }),
        ))
        .build()?;

    println!("Posting message to swarm '{}'...", swarm.name());
    let answer = swarm.post_message("forecast", "weather in NYC?").await?;
    println!("Supervisor says: {answer}");

    swarm.shutdown(Duration::from_secs(1)).await;
    Ok(())
}
