mod common;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
};
use futures::StreamExt as _;
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    StatusCode,
};
use serde_json::{json, Value};

use mcp_http_transport::{
    model::JsonRpcMessage,
    transport::{
        Claim, Principal, SessionRegistry, StreamableHttpServer, StreamableHttpServerConfig,
    },
};

async fn start_server() -> anyhow::Result<(StreamableHttpServer, Arc<SessionRegistry>)> {
    common::init_tracing();
    let registry = SessionRegistry::new(common::echo_dispatcher());
    let server = StreamableHttpServer::serve_with_config(
        registry.clone(),
        StreamableHttpServerConfig {
            bind: "127.0.0.1:0".parse()?,
            sse_keep_alive: None,
        },
    )
    .await?;
    Ok((server, registry))
}

fn post(client: &reqwest::Client, url: &str, body: &'static str) -> reqwest::RequestBuilder {
    client
        .post(url)
        .header(ACCEPT, "application/json, text/event-stream")
        .header(CONTENT_TYPE, "application/json")
        .body(body)
}

const INITIALIZE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"test","version":"0"}}}"#;
const ECHO: &str = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"message":"Hello world!"}}}"#;

#[tokio::test]
async fn test_initialize_and_tool_call() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let response = post(&client, &base, INITIALIZE).send().await?;
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .expect("session header on create")
        .to_str()?
        .to_string();
    assert_eq!(session_id.len(), 22);
    assert!(response
        .headers()
        .get(CONTENT_TYPE)
        .unwrap()
        .to_str()?
        .starts_with("text/event-stream"));

    let frames = common::parse_sse_frames(&response.text().await?);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event.as_deref(), Some("message"));
    let message: Value = serde_json::from_str(&frames[0].data)?;
    assert_eq!(message["jsonrpc"], "2.0");
    assert_eq!(message["id"], 1);
    assert_eq!(message["result"]["serverInfo"]["name"], "TestServer");
    assert_eq!(message["result"]["serverInfo"]["version"], "73");

    let response = post(&client, &base, ECHO)
        .header("mcp-session-id", &session_id)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("mcp-session-id").unwrap().to_str()?,
        session_id
    );
    let frames = common::parse_sse_frames(&response.text().await?);
    assert_eq!(frames.len(), 1);
    let message: Value = serde_json::from_str(&frames[0].data)?;
    assert_eq!(message["id"], 2);
    assert_eq!(
        message["result"]["content"],
        json!([{"type": "text", "text": "Hello world!"}])
    );

    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_batched_post_streams_all_responses() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let body: &'static str = r#"[
        {"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"test","version":"0"}}},
        {"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"message":"batched"}}}
    ]"#;
    let response = post(&client, &base, body).send().await?;
    assert_eq!(response.status(), StatusCode::OK);

    // The stream must end by itself, exactly after both responses.
    let text = tokio::time::timeout(Duration::from_secs(5), response.text()).await??;
    let frames = common::parse_sse_frames(&text);
    assert_eq!(frames.len(), 2);
    let mut ids: Vec<i64> = frames
        .iter()
        .map(|frame| {
            let message: Value = serde_json::from_str(&frame.data).unwrap();
            message["id"].as_i64().unwrap()
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);

    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_notification_only_post_yields_202() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let response = post(
        &client,
        &base,
        r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
    )
    .send()
    .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().get(CONTENT_TYPE).is_none());
    assert!(response.headers().get("mcp-session-id").is_some());
    assert!(response.text().await?.is_empty());

    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_delete_removes_session() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let response = post(&client, &base, INITIALIZE).send().await?;
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()?
        .to_string();
    response.text().await?;
    assert_eq!(registry.len(), 1);

    let response = client
        .delete(&base)
        .header("mcp-session-id", &session_id)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(registry.is_empty());

    let response = post(&client, &base, ECHO)
        .header("mcp-session-id", &session_id)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await?;
    assert_eq!(
        body,
        json!({"jsonrpc": "2.0", "error": {"code": -32001, "message": "Session not found"}})
    );

    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_malformed_body_is_rejected_and_session_survives() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let response = post(&client, &base, INITIALIZE).send().await?;
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()?
        .to_string();
    response.text().await?;

    for body in ["null", "{not json"] {
        let response = client
            .post(&base)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .header("mcp-session-id", &session_id)
            .body(body)
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    // The session is still alive and serving.
    let response = post(&client, &base, ECHO)
        .header("mcp-session-id", &session_id)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_missing_content_type_is_415() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let response = client
        .post(&base)
        .header(ACCEPT, "application/json, text/event-stream")
        .body(INITIALIZE)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_get_streams_unsolicited_messages() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let response = post(&client, &base, INITIALIZE).send().await?;
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()?
        .to_string();
    response.text().await?;

    let response = client
        .get(&base)
        .header(ACCEPT, "text/event-stream")
        .header("mcp-session-id", &session_id)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let mut stream = response.bytes_stream();
    let mut buf = String::new();

    // Push a server-initiated notification through the session transport.
    let session = registry.find_session(&session_id, None).expect("session");
    session
        .transport()
        .send(
            JsonRpcMessage::notification("notifications/tools/list_changed", None),
            None,
        )
        .await?;

    let frame = common::read_frame(&mut stream, &mut buf).await?;
    assert_eq!(frame.event.as_deref(), Some("message"));
    let message: Value = serde_json::from_str(&frame.data)?;
    assert_eq!(message["method"], "notifications/tools/list_changed");

    registry.shutdown();
    Ok(())
}

async fn inject_principal(mut request: Request, next: Next) -> Response {
    if let Some(user) = request
        .headers()
        .get("x-test-user")
        .and_then(|value| value.to_str().ok())
    {
        let principal = Principal::new(vec![Claim::new("sub", user, "tests")]);
        request.extensions_mut().insert(principal);
    }
    next.run(request).await
}

#[tokio::test]
async fn test_session_is_bound_to_its_user() -> anyhow::Result<()> {
    common::init_tracing();
    let registry = SessionRegistry::new(common::echo_dispatcher());
    let (_server, router) = StreamableHttpServer::new(
        registry.clone(),
        StreamableHttpServerConfig {
            bind: "127.0.0.1:0".parse()?,
            sse_keep_alive: None,
        },
    );
    let router = router.layer(middleware::from_fn(inject_principal));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}/", listener.local_addr()?);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let client = reqwest::Client::new();
    let response = post(&client, &base, INITIALIZE)
        .header("x-test-user", "alice")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()?
        .to_string();
    response.text().await?;

    // Another authenticated user cannot take the session over.
    let response = post(&client, &base, ECHO)
        .header("mcp-session-id", &session_id)
        .header("x-test-user", "bob")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Nor can an anonymous caller.
    let response = post(&client, &base, ECHO)
        .header("mcp-session-id", &session_id)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = post(&client, &base, ECHO)
        .header("mcp-session-id", &session_id)
        .header("x-test-user", "alice")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    registry.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_shutdown_cancels_live_streams() -> anyhow::Result<()> {
    let (server, registry) = start_server().await?;
    let base = format!("http://{}/", server.config.bind);
    let client = reqwest::Client::new();

    let response = post(&client, &base, INITIALIZE).send().await?;
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()?
        .to_string();
    response.text().await?;

    let response = client
        .get(&base)
        .header(ACCEPT, "text/event-stream")
        .header("mcp-session-id", &session_id)
        .send()
        .await?;
    let mut stream = response.bytes_stream();

    registry.shutdown();

    // The long-poll GET ends instead of hanging on the grace period.
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            if chunk.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(end.is_ok(), "stream did not end after shutdown");
    Ok(())
}
