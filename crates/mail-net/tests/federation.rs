// ABOUTME: Two-swarm federation scenarios over loopback HTTP stub peers.
// ABOUTME: Covers the interswarm round trip, transport-failure translation, and health probes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use mail_core::{
    AgentDescriptor, AgentOutput, AgentToolCall, Role, ScriptedAgent, SwarmBuilder, TaskPrincipal,
};
use mail_net::{
    ForwardBody, HealthResponse, InterswarmRouter, RegistryConfig, RouterConfig, SwarmRegistry,
};

fn send_request(target: &str, subject: &str, body: &str) -> AgentOutput {
    AgentOutput::call(AgentToolCall::new(
        "send_request",
        json!({ "target": target, "subject": subject, "body": body }),
    ))
}

fn task_complete(finish_message: &str) -> AgentOutput {
    AgentOutput::call(AgentToolCall::new(
        "task_complete",
        json!({ "finish_message": finish_message }),
    ))
}

// ============================================================================
// Loopback peer: a minimal HTTP front for a router, standing in for the
// out-of-scope server surface.
// ============================================================================

async fn serve_peer(listener: TcpListener, router: InterswarmRouter, swarm_name: String) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            break;
        };
        let router = router.clone();
        let swarm_name = swarm_name.clone();
        tokio::spawn(async move {
            let _ = handle_connection(stream, router, swarm_name).await;
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    router: InterswarmRouter,
    swarm_name: String,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let (head_end, head) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break (pos + 4, String::from_utf8_lossy(&buf[..pos]).to_string());
        }
    };

    let request_line = head.lines().next().unwrap_or_default().to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = &buf[head_end..head_end + content_length.min(buf.len() - head_end)];

    let (status, payload) = if request_line.starts_with("GET /health") {
        let health = HealthResponse {
            status: "ok".to_string(),
            swarm_name,
            timestamp: chrono::Utc::now(),
        };
        ("200 OK", serde_json::to_string(&health)?)
    } else {
        let outcome = match serde_json::from_slice::<ForwardBody>(body) {
            Ok(forward) if request_line.starts_with("POST /interswarm/forward") => {
                router.receive_forward(forward.message).await
            }
            Ok(forward) if request_line.starts_with("POST /interswarm/back") => {
                router.receive_back(forward.message).await
            }
            Ok(_) => {
                let reply = ("404 Not Found", "{\"error\":\"no such route\"}".to_string());
                respond(&mut stream, reply.0, &reply.1).await?;
                return Ok(());
            }
            Err(err) => {
                let reply = ("400 Bad Request", format!("{{\"error\":\"{err}\"}}"));
                respond(&mut stream, reply.0, &reply.1).await?;
                return Ok(());
            }
        };
        match outcome {
            Ok(()) => ("202 Accepted", "{\"status\":\"accepted\"}".to_string()),
            Err(err) => ("500 Internal Server Error", format!("{{\"error\":\"{err}\"}}")),
        }
    };

    respond(&mut stream, status, &payload).await
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> anyhow::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: inter-swarm round trip
// ============================================================================

#[tokio::test]
async fn test_interswarm_round_trip() {
    let swarm_a = SwarmBuilder::new("alpha")
        .user("alice")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["consultant@beta"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([send_request("consultant@beta", "q", "help?")]),
        )
        .interswarm(true)
        .build()
        .unwrap();

    let swarm_b = SwarmBuilder::new("beta")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["consultant"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([task_complete("done")]),
        )
        .agent(
            AgentDescriptor::new("consultant").targets(["supervisor"]),
            ScriptedAgent::new([send_request("supervisor", "done?", "work finished")]),
        )
        .build()
        .unwrap();

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    let addr_b = listener_b.local_addr().unwrap();

    let registry_a =
        SwarmRegistry::new(RegistryConfig::new("alpha", format!("http://{addr_a}"))).unwrap();
    registry_a
        .register("beta", &format!("http://{addr_b}"), None, None, true)
        .await
        .unwrap();
    let registry_b =
        SwarmRegistry::new(RegistryConfig::new("beta", format!("http://{addr_b}"))).unwrap();
    registry_b
        .register("alpha", &format!("http://{addr_a}"), None, None, true)
        .await
        .unwrap();

    let router_a =
        InterswarmRouter::new(registry_a, swarm_a.runtime(), RouterConfig::default()).unwrap();
    let router_b =
        InterswarmRouter::new(registry_b, swarm_b.runtime(), RouterConfig::default()).unwrap();
    swarm_a.attach_transport(Arc::new(router_a.clone())).unwrap();
    swarm_b.attach_transport(Arc::new(router_b.clone())).unwrap();

    tokio::spawn(serve_peer(listener_a, router_a.clone(), "alpha".to_string()));
    tokio::spawn(serve_peer(listener_b, router_b.clone(), "beta".to_string()));
    swarm_b.start();

    let task_id = Uuid::new_v4();
    let answer = tokio::time::timeout(
        Duration::from_secs(10),
        swarm_a.post_message_task(task_id, "q", "help?", None),
    )
    .await
    .expect("round trip timed out")
    .unwrap();
    assert_eq!(answer, "done");

    // Both sides agree on owner and contributors {alpha, beta}.
    let meta_a = swarm_a.runtime().task_meta(task_id).await.unwrap();
    assert_eq!(meta_a.owner, TaskPrincipal::user("alice", "alpha"));
    assert!(meta_a
        .contributors
        .contains(&TaskPrincipal::swarm_instance("beta")));
    assert!(meta_a.contributors.iter().any(|p| p.swarm == "alpha"));

    let meta_b = swarm_b.runtime().task_meta(task_id).await.unwrap();
    assert_eq!(meta_b.owner, TaskPrincipal::user("alice", "alpha"));
    assert!(meta_b
        .contributors
        .contains(&TaskPrincipal::swarm_instance("beta")));
    assert!(meta_b.contributors.iter().any(|p| p.swarm == "alpha"));

    let stats = router_a.stats().await;
    assert!(stats.forwarded >= 1);

    swarm_a.shutdown(Duration::from_millis(200)).await;
    swarm_b.shutdown(Duration::from_millis(200)).await;
}

// ============================================================================
// Scenario: transport failure translates to a MAIL error
// ============================================================================

#[tokio::test]
async fn test_missing_env_token_becomes_router_error() {
    let swarm = SwarmBuilder::new("alpha")
        .user("alice")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["consultant@offline"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                send_request("consultant@offline", "q", "b"),
                task_complete("peer unavailable"),
            ]),
        )
        .interswarm(true)
        .build()
        .unwrap();

    let registry =
        SwarmRegistry::new(RegistryConfig::new("alpha", "http://127.0.0.1:9")).unwrap();
    registry
        .register(
            "offline",
            "http://127.0.0.1:1",
            Some("${MAIL_TEST_OFFLINE_TOKEN}".to_string()),
            None,
            true,
        )
        .await
        .unwrap();
    std::env::remove_var("MAIL_TEST_OFFLINE_TOKEN");

    let router = InterswarmRouter::new(registry, swarm.runtime(), RouterConfig::default()).unwrap();
    swarm.attach_transport(Arc::new(router)).unwrap();

    // No exception surfaces: the task continues and completes locally.
    let task_id = Uuid::new_v4();
    let answer = tokio::time::timeout(
        Duration::from_secs(10),
        swarm.post_message_task(task_id, "q", "b", None),
    )
    .await
    .expect("task stalled")
    .unwrap();
    assert_eq!(answer, "peer unavailable");

    // The sending agent observed a ::router_error:: naming the env var.
    let history = swarm.runtime().history("supervisor", task_id).await;
    let router_errors: Vec<_> = history
        .iter()
        .filter(|entry| entry.role == Role::User && entry.content.contains("::router_error::"))
        .collect();
    assert_eq!(router_errors.len(), 1);
    assert!(router_errors[0].content.contains("MAIL_TEST_OFFLINE_TOKEN"));

    swarm.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_unknown_peer_becomes_router_error() {
    let swarm = SwarmBuilder::new("alpha")
        .user("alice")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets(["consultant@ghost"])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([
                send_request("consultant@ghost", "q", "b"),
                task_complete("no such peer"),
            ]),
        )
        .interswarm(true)
        .build()
        .unwrap();

    let registry =
        SwarmRegistry::new(RegistryConfig::new("alpha", "http://127.0.0.1:9")).unwrap();
    let router = InterswarmRouter::new(registry, swarm.runtime(), RouterConfig::default()).unwrap();
    swarm.attach_transport(Arc::new(router)).unwrap();

    let task_id = Uuid::new_v4();
    let answer = swarm
        .post_message_task(task_id, "q", "b", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(answer, "no such peer");

    let history = swarm.runtime().history("supervisor", task_id).await;
    assert!(history.iter().any(|entry| {
        entry.content.contains("::router_error::") && entry.content.contains("ghost")
    }));

    swarm.shutdown(Duration::from_millis(200)).await;
}

// ============================================================================
// Health probes against a live peer
// ============================================================================

#[tokio::test]
async fn test_health_probe_updates_last_seen() {
    let swarm = SwarmBuilder::new("beta")
        .agent(
            AgentDescriptor::new("supervisor")
                .targets([] as [&str; 0])
                .supervisor()
                .entrypoint(),
            ScriptedAgent::new([]),
        )
        .build()
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry =
        SwarmRegistry::new(RegistryConfig::new("beta", format!("http://{addr}"))).unwrap();
    let router =
        InterswarmRouter::new(registry.clone(), swarm.runtime(), RouterConfig::default()).unwrap();
    tokio::spawn(serve_peer(listener, router, "gamma".to_string()));

    // The prober's registry points at the stub as peer "gamma".
    let prober =
        SwarmRegistry::new(RegistryConfig::new("alpha", "http://127.0.0.1:9")).unwrap();
    prober
        .register("gamma", &format!("http://{addr}"), None, None, true)
        .await
        .unwrap();

    let before = prober.get("gamma").await.unwrap().last_seen;
    tokio::time::sleep(Duration::from_millis(10)).await;
    prober.check_now().await;
    let endpoint = prober.get("gamma").await.unwrap();
    assert!(endpoint.active);
    assert!(endpoint.last_seen > before);

    swarm.shutdown(Duration::from_millis(100)).await;
}
