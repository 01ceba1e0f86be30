//! Integration tests for the node exec agent
//!
//! Each test serves the full router on an ephemeral port, backed by a fake runtime.

use std::time::Duration;

use futures_util::SinkExt;
use integration_tests::*;
use node_exec_agent::domain::TerminalSize;
use node_exec_agent::infra::ResizeTarget;
use node_exec_agent::Config;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

const STDIN: u8 = 0;
const STDOUT: u8 = 1;
const ERROR: u8 = 3;
const RESIZE: u8 = 4;

fn status_of(channels: &std::collections::HashMap<u8, Vec<u8>>) -> Value {
    let raw = channels.get(&ERROR).expect("No status frame on the error channel");
    serde_json::from_slice(raw).expect("Failed to parse status")
}

// ============================================================================
// Health Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let agent = spawn_agent(test_agent_config()).await;

    let response = agent
        .config
        .client
        .get(agent.config.api_url("/health"))
        .send()
        .await
        .expect("Failed to send health request");

    assert!(
        response.status().is_success(),
        "Health check failed with status: {}",
        response.status()
    );

    let health: HealthResponse = response.json().await.expect("Failed to parse health response");
    assert_eq!(health.status, "healthy");
    assert!(!health.version.is_empty());
}

// ============================================================================
// Request Validation Tests
// ============================================================================

#[tokio::test]
async fn test_tty_with_stderr_is_rejected() {
    let agent = spawn_agent(test_agent_config()).await;

    let response = agent
        .config
        .client
        .get(agent.config.api_url(
            "/exec/serverexec?containerId=c1&command=sh&output=1&error=1&tty=1",
        ))
        .send()
        .await
        .expect("Failed to send exec request");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body = response.text().await.expect("Failed to read body");
    assert!(
        body.starts_with("valid request param err=tty and stderr cannot both be true,uid="),
        "unexpected body: {}",
        body
    );
}

#[tokio::test]
async fn test_missing_container_id_is_rejected() {
    let agent = spawn_agent(test_agent_config()).await;

    let response = agent
        .config
        .client
        .get(agent.config.api_url("/exec/serverexec?command=ls&output=1"))
        .send()
        .await
        .expect("Failed to send exec request");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_access_token_required_when_enabled() {
    let agent = spawn_agent(Config {
        access_token_enabled: true,
        ..test_agent_config()
    })
    .await;

    let response = agent
        .config
        .client
        .get(agent.config.api_url("/exec/serverexec?containerId=c1&command=ls&output=1"))
        .send()
        .await
        .expect("Failed to send exec request");

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.expect("Failed to parse error body");
    assert_eq!(body["code"], 2001);
}

#[tokio::test]
async fn test_unknown_websocket_protocol_is_rejected() {
    let agent = spawn_agent(test_agent_config()).await;

    let url = agent
        .config
        .api_ws_url("/exec/serverexec?containerId=c1&command=ls&output=1");
    let mut request = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
        url.as_str(),
    )
    .expect("Failed to build websocket request");
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "graphql-ws".parse().unwrap());

    let result = tokio_tungstenite::connect_async(request).await;
    assert!(result.is_err(), "handshake should have been refused");
}

// ============================================================================
// WebSocket Exec Tests
// ============================================================================

#[tokio::test]
async fn test_websocket_exec_success() {
    let agent = spawn_agent(test_agent_config()).await;

    let url = agent
        .config
        .api_ws_url("/exec/serverexec?containerId=c1&command=echo&command=hi&output=1");
    let mut ws = connect_ws(&url, Some("v4.channel.k8s.io")).await;

    let channels = collect_channels(&mut ws).await;
    assert_eq!(channels.get(&STDOUT).map(Vec::as_slice), Some(&b"hi\n"[..]));

    let status = status_of(&channels);
    assert_eq!(status["status"], "Success");
}

#[tokio::test]
async fn test_websocket_exec_non_zero_exit() {
    let agent = spawn_agent(test_agent_config()).await;

    let url = agent.config.api_ws_url(
        "/exec/serverexec?containerId=c1&command=sh&command=-c&command=exit%207&output=1",
    );
    let mut ws = connect_ws(&url, Some("v4.channel.k8s.io")).await;

    let status = status_of(&collect_channels(&mut ws).await);
    assert_eq!(status["status"], "Failure");
    assert_eq!(status["reason"], "NonZeroExitCode");
    assert_eq!(status["details"]["causes"][0]["reason"], "ExitCode");
    assert_eq!(status["details"]["causes"][0]["message"], "7");
}

#[tokio::test]
async fn test_websocket_exec_dispatch_failure() {
    let agent = spawn_agent(test_agent_config()).await;

    let url = agent
        .config
        .api_ws_url("/exec/serverexec?containerId=missing&command=ls&output=1");
    let mut ws = connect_ws(&url, Some("v4.channel.k8s.io")).await;

    let status = status_of(&collect_channels(&mut ws).await);
    assert_eq!(status["status"], "Failure");
    assert_eq!(status["reason"], "InternalError");
    assert_eq!(status["code"], 500);
}

#[tokio::test]
async fn test_websocket_exec_stdin_echo() {
    let agent = spawn_agent(test_agent_config()).await;

    let url = agent
        .config
        .api_ws_url("/exec/serverexec?containerId=c1&command=cat&input=1&output=1");
    let mut ws = connect_ws(&url, Some("v4.channel.k8s.io")).await;

    // Streams ready
    assert_eq!(next_frame(&mut ws).await, Some((STDOUT, Vec::new())));

    ws.send(binary_frame(STDIN, b"ping\n"))
        .await
        .expect("Failed to send stdin");

    let mut echoed = Vec::new();
    while echoed.len() < 5 {
        let (channel, payload) = next_frame(&mut ws).await.expect("Session ended early");
        assert_eq!(channel, STDOUT);
        echoed.extend(payload);
    }
    assert_eq!(echoed, b"ping\n");

    let _ = ws.close(None).await;
}

#[tokio::test]
async fn test_websocket_resize_reaches_runtime() {
    let agent = spawn_agent(test_agent_config()).await;

    let url = agent
        .config
        .api_ws_url("/exec/serverexec?containerId=c1&command=cat&input=1&output=1&tty=1");
    let mut ws = connect_ws(&url, Some("v4.channel.k8s.io")).await;
    assert_eq!(next_frame(&mut ws).await, Some((STDOUT, Vec::new())));

    ws.send(binary_frame(RESIZE, br#"{"Width":0,"Height":24}"#))
        .await
        .expect("Failed to send resize");
    ws.send(binary_frame(RESIZE, br#"{"Width":120,"Height":40}"#))
        .await
        .expect("Failed to send resize");

    let expected = TerminalSize {
        width: 120,
        height: 40,
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let resizes = agent.runtime.resizes();
        if !resizes.is_empty() {
            assert_eq!(resizes.len(), 1, "zero-sized resize must be skipped");
            assert!(matches!(&resizes[0].0, ResizeTarget::Exec(_)));
            assert_eq!(resizes[0].1, expected);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "resize never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = ws.close(None).await;
}

#[tokio::test]
async fn test_websocket_attach_echo() {
    let agent = spawn_agent(test_agent_config()).await;

    let url = agent
        .config
        .api_ws_url("/attach/serverattach?containerId=c1&input=1&output=1");
    let mut ws = connect_ws(&url, Some("channel.k8s.io")).await;
    assert_eq!(next_frame(&mut ws).await, Some((STDOUT, Vec::new())));

    ws.send(binary_frame(STDIN, b"attached"))
        .await
        .expect("Failed to send stdin");
    let mut echoed = Vec::new();
    while echoed.len() < 8 {
        let (_, payload) = next_frame(&mut ws).await.expect("Session ended early");
        echoed.extend(payload);
    }
    assert_eq!(echoed, b"attached");

    let _ = ws.close(None).await;
}

// ============================================================================
// Prepared Request Tests
// ============================================================================

#[tokio::test]
async fn test_prepared_exec_is_single_use() {
    let agent = spawn_agent(test_agent_config()).await;

    let prepared: PrepareResponse = agent
        .config
        .client
        .post(agent.config.api_url("/exec/prepare"))
        .json(&json!({
            "containerId": "c1",
            "command": ["echo", "prepared"],
            "output": true
        }))
        .send()
        .await
        .expect("Failed to prepare exec")
        .json()
        .await
        .expect("Failed to parse prepare response");
    assert!(prepared.url.starts_with("/dockin/opagent/exec/"));

    let mut ws = connect_ws(&agent.config.ws_url(&prepared.url), Some("v4.channel.k8s.io")).await;
    let channels = collect_channels(&mut ws).await;
    assert_eq!(channels.get(&STDOUT).map(Vec::as_slice), Some(&b"prepared\n"[..]));

    let again = agent
        .config
        .client
        .get(format!("{}{}", agent.config.base_url, prepared.url))
        .send()
        .await
        .expect("Failed to send second request");
    assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prepare_rejects_invalid_request() {
    let agent = spawn_agent(test_agent_config()).await;

    let response = agent
        .config
        .client
        .post(agent.config.api_url("/exec/prepare"))
        .json(&json!({
            "containerId": "c1",
            "command": ["ls"],
            "output": true,
            "error": true,
            "tty": true
        }))
        .send()
        .await
        .expect("Failed to send prepare request");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

// ============================================================================
// Legacy Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_common_exec_returns_stdout() {
    let agent = spawn_agent(test_agent_config()).await;

    let result: AgentResult = agent
        .config
        .client
        .post(agent.config.api_url("/exec/common"))
        .json(&json!({"podName": TEST_POD, "cmd": ["echo", "hello"]}))
        .send()
        .await
        .expect("Failed to send common exec")
        .json()
        .await
        .expect("Failed to parse common exec result");

    assert_eq!(result.code, 0);
    assert_eq!(result.message, "success");
    assert_eq!(result.data, json!("hello\n"));
}

#[tokio::test]
async fn test_common_exec_unknown_pod() {
    let agent = spawn_agent(test_agent_config()).await;

    let result: AgentResult = agent
        .config
        .client
        .post(agent.config.api_url("/exec/common"))
        .json(&json!({"podName": "ghost", "cmd": ["ls"]}))
        .send()
        .await
        .expect("Failed to send common exec")
        .json()
        .await
        .expect("Failed to parse common exec result");

    assert_eq!(result.code, -1);
    assert!(result.message.contains("ghost"));
    assert!(result.data.is_null());
}

#[tokio::test]
async fn test_ssh_session_round_trip() {
    let agent = spawn_agent(test_agent_config()).await;

    let mut ws = connect_ws(&agent.config.api_ws_url("/exec/ssh"), None).await;
    let start = json!({"messageType": 3, "data": {"podName": TEST_POD, "cmd": ["echo", "hey"]}});
    ws.send(Message::Text(start.to_string().into()))
        .await
        .expect("Failed to send start command");

    let mut envelopes = Vec::new();
    while let Some(msg) = futures_util::StreamExt::next(&mut ws).await {
        match msg.expect("Failed to read ssh frame") {
            Message::Text(text) => {
                let envelope: Value =
                    serde_json::from_str(text.as_str()).expect("Failed to parse envelope");
                let done = envelope["messageType"] == 4;
                envelopes.push(envelope);
                if done {
                    break;
                }
            }
            _ => continue,
        }
    }

    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0]["messageType"], 5);
    assert_eq!(envelopes[0]["data"], "hey\n");
    assert_eq!(envelopes[1]["messageType"], 4);

    let _ = ws.close(None).await;
}

// ============================================================================
// SPDY Exec Tests
// ============================================================================

const ECHO_HI: &str = "/exec/serverexec?containerId=c1&command=echo&command=hi&output=1";
const EXIT_7: &str = "/exec/serverexec?containerId=c1&command=sh&command=-c&command=exit%207&output=1";

async fn spdy_session(agent: &TestAgent, path: &str, protocol: &str) -> SpdyClient {
    let upgrade = spdy_upgrade(agent.config.addr, path, &[protocol]).await;
    assert_eq!(upgrade.status, 101);
    assert_eq!(upgrade.header("x-stream-protocol-version"), vec![protocol.to_string()]);
    SpdyClient::new(upgrade.stream)
}

#[tokio::test]
async fn test_spdy_v4_exec_success() {
    let agent = spawn_agent(test_agent_config()).await;
    let mut client = spdy_session(&agent, ECHO_HI, "v4.channel.k8s.io").await;

    let error = client.open("error").await;
    let stdout = client.open("stdout").await;
    let (data, replied) = client.collect().await;

    assert!(replied.contains(&error) && replied.contains(&stdout));
    assert_eq!(data.get(&stdout).map(Vec::as_slice), Some(&b"hi\n"[..]));
    let status: Value =
        serde_json::from_slice(data.get(&error).expect("No status on the error stream"))
            .expect("Failed to parse status");
    assert_eq!(status["status"], "Success");
}

#[tokio::test]
async fn test_spdy_v4_exec_non_zero_exit() {
    let agent = spawn_agent(test_agent_config()).await;
    let mut client = spdy_session(&agent, EXIT_7, "v4.channel.k8s.io").await;

    let error = client.open("error").await;
    client.open("stdout").await;
    let (data, _) = client.collect().await;

    let status: Value =
        serde_json::from_slice(data.get(&error).expect("No status on the error stream"))
            .expect("Failed to parse status");
    assert_eq!(status["status"], "Failure");
    assert_eq!(status["reason"], "NonZeroExitCode");
    assert_eq!(status["details"]["causes"][0]["message"], "7");
}

#[tokio::test]
async fn test_spdy_v3_reports_failure_as_text() {
    let agent = spawn_agent(test_agent_config()).await;
    let mut client = spdy_session(&agent, EXIT_7, "v3.channel.k8s.io").await;

    let error = client.open("error").await;
    client.open("stdout").await;
    let (data, _) = client.collect().await;

    let message = String::from_utf8(data.get(&error).cloned().unwrap_or_default())
        .expect("Error stream is not text");
    assert_eq!(
        message,
        "command terminated with non-zero exit code: command 'sh -c exit 7' exited with 7"
    );
}

#[tokio::test]
async fn test_spdy_v2_tty_ignores_resize_stream() {
    let agent = spawn_agent(test_agent_config()).await;
    let path = "/exec/serverexec?containerId=c1&command=echo&command=hi&output=1&tty=1";
    let mut client = spdy_session(&agent, path, "v2.channel.k8s.io").await;

    let resize = client.open("resize").await;
    client.send(resize, br#"{"Width":80,"Height":24}"#).await;
    let error = client.open("error").await;
    let stdout = client.open("stdout").await;
    let (data, _) = client.collect().await;

    assert_eq!(data.get(&stdout).map(Vec::as_slice), Some(&b"hi\n"[..]));
    assert!(data.get(&error).map_or(true, |e| e.is_empty()));
    assert!(agent.runtime.resizes().is_empty());
}

#[tokio::test]
async fn test_spdy_v4_stdin_echo() {
    let agent = spawn_agent(test_agent_config()).await;
    let path = "/exec/serverexec?containerId=c1&command=cat&input=1&output=1";
    let mut client = spdy_session(&agent, path, "v4.channel.k8s.io").await;

    client.open("error").await;
    let stdin = client.open("stdin").await;
    let stdout = client.open("stdout").await;
    client.send(stdin, b"ping\n").await;
    client.finish(stdin).await;
    let (data, _) = client.collect().await;

    assert_eq!(data.get(&stdout).map(Vec::as_slice), Some(&b"ping\n"[..]));
}

#[tokio::test]
async fn test_spdy_unknown_protocol_is_forbidden() {
    let agent = spawn_agent(test_agent_config()).await;
    let upgrade = spdy_upgrade(agent.config.addr, ECHO_HI, &["v9.channel.k8s.io"]).await;

    assert_eq!(upgrade.status, 403);
    assert_eq!(
        upgrade.header("x-accepted-stream-protocol-versions"),
        vec![
            "v4.channel.k8s.io".to_string(),
            "v3.channel.k8s.io".to_string(),
            "v2.channel.k8s.io".to_string(),
            "channel.k8s.io".to_string(),
        ]
    );
}

// ============================================================================
// Form Body And Pod Uid Tests
// ============================================================================

#[tokio::test]
async fn test_form_body_parameters_are_read() {
    let agent = spawn_agent(test_agent_config()).await;

    let response = agent
        .config
        .client
        .post(agent.config.api_url("/exec/serverexec"))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body("containerId=c1&command=ls&output=1&error=1&tty=1")
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains("tty and stderr cannot both be true"), "{}", body);
}

#[tokio::test]
async fn test_common_exec_by_pod_uid() {
    let agent = spawn_agent(test_agent_config()).await;

    let result: AgentResult = agent
        .config
        .client
        .post(agent.config.api_url("/exec/common"))
        .json(&json!({"podName": "uid-1", "cmd": ["echo", "by", "uid"]}))
        .send()
        .await
        .expect("Failed to send common exec")
        .json()
        .await
        .expect("Failed to parse common exec result");

    assert_eq!(result.code, 0);
    assert_eq!(result.data, json!("by uid\n"));
}
