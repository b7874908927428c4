// ABOUTME: End-to-end scenarios for the MAIL runtime with scripted agents.
// ABOUTME: Covers request/response, broadcast handling, priority, breakpoints, and failure paths.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use uuid::Uuid;

use mail_core::{
    Action, ActionExecutor, Address, AgentBackend, AgentDescriptor, AgentOutput, AgentToolCall,
    Envelope, EventKind, FnAction, MailError, Resume, Role, Runtime, RuntimeConfig, ScriptedAgent,
    SwarmBuilder, TaskStatus,
};

fn call(name: &str, args: serde_json::Value) -> AgentToolCall {
    AgentToolCall::new(name, args)
}

fn send_request(target: &str, subject: &str, body: &str) -> AgentOutput {
    AgentOutput::call(call(
        "send_request",
        json!({ "target": target, "subject": subject, "body": body }),
    ))
}

fn send_response(target: &str, subject: &str, body: &str) -> AgentOutput {
    AgentOutput::call(call(
        "send_response",
        json!({ "target": target, "subject": subject, "body": body }),
    ))
}

fn task_complete(finish_message: &str) -> AgentOutput {
    AgentOutput::call(call(
        "task_complete",
        json!({ "finish_message": finish_message }),
    ))
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

// ============================================================================
// Scenario: single-swarm request/response
// ============================================================================

#[tokio::test]
async fn test_request_response_round_trip() {
    let swarm = SwarmBuilder::new("alpha")
        .user("alice")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["weather"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                send_request("weather", "q", "forecast?"),
                task_complete("It will be sunny."),
            ]),
        )
        .agent(
            AgentDescriptor::new("weather").targets(["supervisor"]),
            ScriptedAgent::new([send_response("supervisor", "re: q", "sunny")]),
        )
        .build()
        .unwrap();

    let answer = swarm.post_message("q", "forecast?").await.unwrap();
    assert_eq!(answer, "It will be sunny.");

    swarm.shutdown(Duration::from_millis(200)).await;
}

// ============================================================================
// Scenario: broadcast with acknowledge / ignore / reply
// ============================================================================

#[tokio::test]
async fn test_broadcast_acknowledge_ignore_reply() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["a", "b", "c"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                AgentOutput::call(call(
                    "send_broadcast",
                    json!({ "subject": "fyi", "body": "deployment at 5pm" }),
                )),
                task_complete("noted"),
            ]),
        )
        .agent(
            AgentDescriptor::new("a").targets(["supervisor"]),
            ScriptedAgent::new([AgentOutput::call(call(
                "acknowledge_broadcast",
                json!({ "note": "saved" }),
            ))]),
        )
        .agent(
            AgentDescriptor::new("b").targets(["supervisor"]),
            ScriptedAgent::new([AgentOutput::call(call("ignore_broadcast", json!({})))]),
        )
        .agent(
            AgentDescriptor::new("c").targets(["supervisor"]),
            ScriptedAgent::new([send_response("supervisor", "ack", "ok")]),
        )
        .build()
        .unwrap();

    let task_id = Uuid::new_v4();
    let answer = swarm
        .post_message_task(task_id, "fyi", "deploy", None)
        .await
        .unwrap();
    assert_eq!(answer, "noted");

    let runtime = swarm.runtime();

    // `a` acknowledged: its history gains a memory record.
    let a_history = runtime.history("a", task_id).await;
    assert!(a_history.iter().any(|entry| entry.role == Role::System
        && entry.content.contains("<acknowledged_broadcast/>")
        && entry.content.contains("saved")));

    // `b` ignored: no memory record.
    let b_history = runtime.history("b", task_id).await;
    assert!(!b_history
        .iter()
        .any(|entry| entry.content.contains("<acknowledged_broadcast/>")));

    // Only `c` replied: the supervisor saw exactly one incoming agent
    // message, and it came from `c`.
    let supervisor_history = runtime.history("supervisor", task_id).await;
    let incoming_from_agents: Vec<_> = supervisor_history
        .iter()
        .filter(|entry| entry.role == Role::User && entry.content.contains("<from kind=\"agent\">"))
        .collect();
    assert_eq!(incoming_from_agents.len(), 1);
    assert!(incoming_from_agents[0]
        .content
        .contains("<from kind=\"agent\">c</from>"));

    swarm.shutdown(Duration::from_millis(200)).await;
}

// ============================================================================
// Scenario: priority preemption
// ============================================================================

#[tokio::test]
async fn test_interrupt_preempts_request_at_dispatch() {
    let runtime = Runtime::new(
        vec![(
            AgentDescriptor::new("weather").targets(["supervisor"]),
            Arc::new(ScriptedAgent::new([])) as Arc<dyn AgentBackend>,
        )],
        ActionExecutor::new([]),
        RuntimeConfig::new("alpha", "weather"),
    );

    let task_id = Uuid::new_v4();
    let request = Envelope::request(
        task_id,
        Address::agent("supervisor"),
        Address::agent("weather"),
        "routine",
        "status?",
    );
    let interrupt = Envelope::interrupt(
        task_id,
        Address::agent("supervisor"),
        vec![Address::agent("weather")],
        "urgent",
        "halt",
    )
    .unwrap();

    // Enqueue both before dispatch starts; the interrupt must be picked
    // first even though it was submitted second.
    runtime.submit(request).await.unwrap();
    runtime.submit(interrupt).await.unwrap();

    let loop_runtime = runtime.clone();
    let dispatch = tokio::spawn(async move { loop_runtime.run().await });

    let probe = runtime.clone();
    wait_until(move || {
        probe
            .events_for(task_id)
            .iter()
            .filter(|e| e.kind == EventKind::NewMessage)
            .count()
            >= 2
    })
    .await;

    let deliveries: Vec<String> = runtime
        .events_for(task_id)
        .into_iter()
        .filter(|e| e.kind == EventKind::NewMessage)
        .map(|e| e.description)
        .collect();
    assert!(deliveries[0].starts_with("interrupt"));
    assert!(deliveries[1].starts_with("request"));

    runtime.shutdown(Duration::from_millis(100)).await;
    dispatch.abort();
}

// ============================================================================
// Scenario: breakpoint pause and resume
// ============================================================================

#[tokio::test]
async fn test_breakpoint_pause_and_resume() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["weather"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                send_request("weather", "q", "forecast for NYC?"),
                task_complete("75F sunny"),
            ]),
        )
        .agent(
            AgentDescriptor::new("weather")
                .targets(["supervisor"])
                .actions(["fetch_forecast"]),
            ScriptedAgent::new([
                AgentOutput::call(call("fetch_forecast", json!({ "location": "NYC" }))),
                send_response("supervisor", "re: q", "75F sunny"),
            ]),
        )
        .action(
            Action::new(
                "fetch_forecast",
                "Fetch the forecast for a location.",
                json!({
                    "type": "object",
                    "properties": { "location": { "type": "string" } },
                    "required": ["location"],
                }),
                FnAction::new(|_| async {
                    Err(MailError::Action {
                        action: "fetch_forecast".to_string(),
                        reason: "breakpoint actions must not execute".to_string(),
                    })
                }),
            )
            .breakpoint(),
        )
        .build()
        .unwrap();

    let mut stream = swarm
        .post_message_stream("q", "forecast for NYC?", Some(Duration::from_secs(10)))
        .await
        .unwrap();

    // Drain events until the breakpoint pause is visible.
    let mut task_id = None;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed before breakpoint");
        task_id.get_or_insert(event.task_id);
        if event.kind == EventKind::BreakpointToolCall {
            assert_eq!(event.extra["calls"][0]["tool_name"], "fetch_forecast");
            break;
        }
    }
    let task_id = task_id.unwrap();

    let runtime = swarm.runtime();
    assert_eq!(
        runtime.task_snapshot(task_id).await.unwrap().status,
        TaskStatus::Paused
    );

    runtime
        .resume(
            task_id,
            Resume::BreakpointToolCall {
                caller: "weather".to_string(),
                result: "{\"content\":\"75F sunny\"}".to_string(),
            },
        )
        .await
        .unwrap();

    // The stream must now run through to completion.
    let mut completed = false;
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream stalled after resume")
    {
        if event.kind == EventKind::TaskComplete {
            assert!(event.description.contains("75F sunny"));
            completed = true;
            break;
        }
    }
    assert!(completed);

    // Exactly one breakpoint event, and exactly one tool-result entry with
    // the supplied payload in the caller's history.
    let breakpoints = runtime
        .events_for(task_id)
        .into_iter()
        .filter(|e| e.kind == EventKind::BreakpointToolCall)
        .count();
    assert_eq!(breakpoints, 1);

    let weather_history = runtime.history("weather", task_id).await;
    let results: Vec<_> = weather_history
        .iter()
        .filter(|entry| entry.role == Role::Tool && entry.content.contains("75F sunny"))
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool_name.as_deref(), Some("fetch_forecast"));

    swarm.shutdown(Duration::from_millis(200)).await;
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn test_timeout_cancels_task() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets([] as [&str; 0])
                .supervisor()
                .entrypoint(),
            // Never completes: idles on every turn.
            ScriptedAgent::new([]),
        )
        .build()
        .unwrap();

    let task_id = Uuid::new_v4();
    let err = swarm
        .post_message_task(task_id, "s", "b", Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, MailError::TaskTimeout(id) if id == task_id));

    let runtime = swarm.runtime();
    wait_until({
        let runtime = runtime.clone();
        move || {
            runtime
                .events_for(task_id)
                .iter()
                .any(|e| e.kind == EventKind::TaskError)
        }
    })
    .await;
    assert_eq!(
        runtime.task_snapshot(task_id).await.unwrap().status,
        TaskStatus::Errored
    );

    swarm.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_agent_error_recovers_in_task() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets([] as [&str; 0])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::with_results([
                Err("backend unreachable".to_string()),
                Ok(task_complete("recovered")),
            ]),
        )
        .build()
        .unwrap();

    let task_id = Uuid::new_v4();
    let answer = swarm
        .post_message_task(task_id, "s", "b", None)
        .await
        .unwrap();
    assert_eq!(answer, "recovered");

    let runtime = swarm.runtime();
    let events = runtime.events_for(task_id);
    assert!(events.iter().any(|e| e.kind == EventKind::AgentError));

    // The offending agent observed the ::agent_error:: system message.
    let history = runtime.history("supervisor", task_id).await;
    assert!(history
        .iter()
        .any(|entry| entry.content.contains("::agent_error::")));

    swarm.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_forbidden_target_yields_tool_call_error() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["weather"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                // `analyst` is not a comm target (and not an agent at all).
                send_request("analyst", "q", "b"),
                task_complete("gave up"),
            ]),
        )
        .agent(
            AgentDescriptor::new("weather").targets(["supervisor"]),
            ScriptedAgent::new([]),
        )
        .build()
        .unwrap();

    let task_id = Uuid::new_v4();
    let answer = swarm
        .post_message_task(task_id, "s", "b", None)
        .await
        .unwrap();
    assert_eq!(answer, "gave up");

    let runtime = swarm.runtime();
    let history = runtime.history("supervisor", task_id).await;
    assert!(history
        .iter()
        .any(|entry| entry.content.contains("::tool_call_error::")));

    swarm.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_non_supervisor_cannot_complete() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["worker"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                send_request("worker", "go", "do it"),
                task_complete("done by supervisor"),
            ]),
        )
        .agent(
            AgentDescriptor::new("worker").targets(["supervisor"]),
            ScriptedAgent::new([
                // Rejected: workers may not complete tasks.
                task_complete("done by worker"),
                send_response("supervisor", "re: go", "done"),
            ]),
        )
        .build()
        .unwrap();

    let task_id = Uuid::new_v4();
    let answer = swarm
        .post_message_task(task_id, "s", "b", None)
        .await
        .unwrap();
    assert_eq!(answer, "done by supervisor");

    let runtime = swarm.runtime();
    let history = runtime.history("worker", task_id).await;
    assert!(history
        .iter()
        .any(|entry| entry.content.contains("only supervisors may complete tasks")));

    swarm.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_duplicate_task_complete_is_discarded() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets([] as [&str; 0])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([AgentOutput::calls(vec![
                call("task_complete", json!({ "finish_message": "first" })),
                call("task_complete", json!({ "finish_message": "second" })),
            ])]),
        )
        .build()
        .unwrap();

    let task_id = Uuid::new_v4();
    let answer = swarm
        .post_message_task(task_id, "s", "b", None)
        .await
        .unwrap();
    assert_eq!(answer, "first");

    let runtime = swarm.runtime();
    // Give the duplicate a moment to be dispatched and discarded.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let completions = runtime
        .events_for(task_id)
        .into_iter()
        .filter(|e| e.kind == EventKind::TaskComplete)
        .count();
    assert_eq!(completions, 1);

    swarm.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_completed_task_resumes_with_preserved_history() {
    let task_id = Uuid::new_v4();
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets([] as [&str; 0])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([task_complete("first answer"), task_complete("second answer")]),
        )
        .build()
        .unwrap();

    let first = swarm
        .post_message_task(task_id, "s", "one", None)
        .await
        .unwrap();
    assert_eq!(first, "first answer");

    let runtime = swarm.runtime();
    let after_first = runtime.history("supervisor", task_id).await.len();
    assert!(after_first > 0);

    let second = swarm
        .post_message_task(task_id, "s", "two", None)
        .await
        .unwrap();
    assert_eq!(second, "second answer");

    let after_second = runtime.history("supervisor", task_id).await.len();
    assert!(after_second > after_first);

    swarm.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_resume_user_response_requires_known_task() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets([] as [&str; 0])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([]),
        )
        .build()
        .unwrap();

    let err = swarm
        .runtime()
        .resume(
            Uuid::new_v4(),
            Resume::UserResponse {
                subject: "s".to_string(),
                body: "b".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MailError::UnknownTask(_)));
}

#[tokio::test]
async fn test_action_result_returns_to_caller() {
    let swarm = SwarmBuilder::new("alpha")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["weather"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                send_request("weather", "q", "forecast?"),
                task_complete("sunny in NYC"),
            ]),
        )
        .agent(
            AgentDescriptor::new("weather")
                .targets(["supervisor"])
                .actions(["fetch_forecast"]),
            ScriptedAgent::new([
                AgentOutput::call(call("fetch_forecast", json!({ "location": "NYC" }))),
                send_response("supervisor", "re: q", "sunny in NYC"),
            ]),
        )
        .action(Action::new(
            "fetch_forecast",
            "Fetch the forecast for a location.",
            json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
                "required": ["location"],
            }),
            FnAction::new(|args| async move {
                let location = args["location"].as_str().unwrap_or("unknown").to_string();
                Ok(format!("sunny in {location}"))
            }),
        ))
        .build()
        .unwrap();

    let task_id = Uuid::new_v4();
    let answer = swarm
        .post_message_task(task_id, "q", "forecast?", None)
        .await
        .unwrap();
    assert_eq!(answer, "sunny in NYC");

    let runtime = swarm.runtime();
    let events = runtime.events_for(task_id);
    assert!(events.iter().any(|e| e.kind == EventKind::ActionCall));
    assert!(events.iter().any(|e| e.kind == EventKind::ActionComplete));

    // The caller's history carries the tool result and the
    // ::action_complete:: wake-up.
    let history = runtime.history("weather", task_id).await;
    assert!(history
        .iter()
        .any(|entry| entry.role == Role::Tool && entry.content == "sunny in NYC"));
    assert!(history
        .iter()
        .any(|entry| entry.content.contains("::action_complete::")));

    swarm.shutdown(Duration::from_millis(200)).await;
}
