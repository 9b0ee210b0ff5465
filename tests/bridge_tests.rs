mod common;

use std::time::Duration;

use codepod::bridge::{LspCodec, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{FramedRead, FramedWrite};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Language server stand-in. Forwards every received body to the test and
/// answers each request with a diagnostics notification about `uri`.
async fn fake_language_server(uri: String) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, LspCodec::new());
        let mut writer = FramedWrite::new(write, LspCodec::new());
        while let Some(Ok(body)) = reader.next().await {
            let shutdown = body.contains("\"shutdown\"");
            let _ = tx.send(body);
            if shutdown {
                break;
            }
            let reply = json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {"uri": uri, "diagnostics": []}
            });
            writer.send(reply.to_string()).await.unwrap();
        }
    });

    (port, rx)
}

async fn connect_client(app: &common::TestApp, user: &str) -> Client {
    let mut request = app.ws_url("/lsp").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-user-id", user.parse().unwrap());
    let (client, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    client
}

async fn send(client: &mut Client, event: Value) {
    client.send(Message::Text(event.to_string())).await.unwrap();
}

async fn next_event(client: &mut Client) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for bridge event")
            .expect("bridge closed the socket")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn messages_are_relayed_with_paths_translated() {
    let sdk_uri = "file:///usr/lib/dart/lib/core/core.dart";
    let (port, mut received) = fake_language_server(sdk_uri.to_string()).await;
    let app = common::spawn_app(port).await;
    let session = app.sessions.create_session("alice").await.unwrap().session_id;
    app.provision(&session).await;

    let mut client = connect_client(&app, "alice").await;
    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert_eq!(
        next_event(&mut client).await,
        ServerEvent::Connected {
            session_id: session.clone()
        }
    );

    let did_open = json!({
        "jsonrpc": "2.0",
        "method": "textDocument/didOpen",
        "params": {"textDocument": {"uri": "file:///workspace/main.dart", "languageId": "dart", "version": 1, "text": "void main() {}"}}
    });
    send(&mut client, json!({"type": "message", "message": did_open.to_string()})).await;

    let upstream: Value =
        serde_json::from_str(&tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap())
        .unwrap();
    assert_eq!(
        upstream["params"]["textDocument"]["uri"],
        format!("file:///code-files/{}/main.dart", session)
    );
    assert_eq!(upstream["params"]["textDocument"]["text"], "void main() {}");

    match next_event(&mut client).await {
        ServerEvent::Message { message } => {
            let message: Value = serde_json::from_str(&message).unwrap();
            assert_eq!(message["method"], "textDocument/publishDiagnostics");
            // Outside the workspace root, so passed through untouched.
            assert_eq!(message["params"]["uri"], sdk_uri);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn container_paths_are_rewritten_for_the_client() {
    // Bind first so the session id can be baked into the server's reply.
    let app_port_holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = app_port_holder.local_addr().unwrap().port();
    drop(app_port_holder);

    let app = common::spawn_app(port).await;
    let session = app.sessions.create_session("alice").await.unwrap().session_id;
    app.provision(&session).await;

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let uri = format!("file:///code-files/{}/main.dart", session);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, LspCodec::new());
        let mut writer = FramedWrite::new(write, LspCodec::new());
        if let Some(Ok(_)) = reader.next().await {
            let reply = json!({"jsonrpc": "2.0", "id": 1, "result": {"uri": uri, "range": {"start": {"line": 0}}}});
            writer.send(reply.to_string()).await.unwrap();
        }
    });

    let mut client = connect_client(&app, "alice").await;
    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert!(matches!(next_event(&mut client).await, ServerEvent::Connected { .. }));

    let request = json!({"jsonrpc": "2.0", "id": 1, "method": "textDocument/definition", "params": {"textDocument": {"uri": "file:///workspace/main.dart"}}});
    send(&mut client, json!({"type": "message", "message": request.to_string()})).await;

    match next_event(&mut client).await {
        ServerEvent::Message { message } => {
            let message: Value = serde_json::from_str(&message).unwrap();
            assert_eq!(message["result"]["uri"], "file:///workspace/main.dart");
            assert_eq!(message["result"]["range"]["start"]["line"], 0);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn message_before_connect_is_rejected() {
    let app = common::spawn_app(9).await;
    let mut client = connect_client(&app, "alice").await;

    send(&mut client, json!({"type": "message", "message": "{}"})).await;
    assert_eq!(
        next_event(&mut client).await,
        ServerEvent::error(400, "Not connected")
    );

    client.send(Message::Text("not json".to_string())).await.unwrap();
    assert!(matches!(
        next_event(&mut client).await,
        ServerEvent::Error { code: 400, .. }
    ));
}

#[tokio::test]
async fn connect_refusals() {
    let app = common::spawn_app(9).await;
    let session = app.sessions.create_session("alice").await.unwrap().session_id;

    let mut client = connect_client(&app, "alice").await;
    send(&mut client, json!({"type": "connect", "sessionId": "missing"})).await;
    assert_eq!(next_event(&mut client).await, ServerEvent::error(404, "Session not found"));

    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert_eq!(next_event(&mut client).await, ServerEvent::error(404, "Container not ready"));

    app.provision(&session).await;
    app.runtime.set_address(None);
    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert_eq!(
        next_event(&mut client).await,
        ServerEvent::error(404, "Container network not ready")
    );

    let mut intruder = connect_client(&app, "mallory").await;
    send(&mut intruder, json!({"type": "connect", "sessionId": session})).await;
    assert_eq!(
        next_event(&mut intruder).await,
        ServerEvent::error(403, "Session does not belong to user")
    );
}

#[tokio::test]
async fn unreachable_language_server_reports_connection_failure() {
    // Grab a free port and release it so nothing listens there.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let app = common::spawn_app(port).await;
    let session = app.sessions.create_session("alice").await.unwrap().session_id;
    app.provision(&session).await;

    let mut client = connect_client(&app, "alice").await;
    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert_eq!(next_event(&mut client).await, ServerEvent::error(500, "Failed to connect"));
}

#[tokio::test]
async fn server_hangup_is_reported_as_disconnect() {
    let (port, mut received) = fake_language_server(String::new()).await;
    let app = common::spawn_app(port).await;
    let session = app.sessions.create_session("alice").await.unwrap().session_id;
    app.provision(&session).await;

    let mut client = connect_client(&app, "alice").await;
    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert!(matches!(next_event(&mut client).await, ServerEvent::Connected { .. }));

    let shutdown = json!({"jsonrpc": "2.0", "id": 9, "method": "shutdown"});
    send(&mut client, json!({"type": "message", "message": shutdown.to_string()})).await;
    assert!(received.recv().await.unwrap().contains("shutdown"));

    assert_eq!(
        next_event(&mut client).await,
        ServerEvent::Disconnected {
            reason: "Connection closed".to_string()
        }
    );
    send(&mut client, json!({"type": "message", "message": "{}"})).await;
    assert_eq!(next_event(&mut client).await, ServerEvent::error(400, "Not connected"));
}

#[tokio::test]
async fn closed_session_cannot_be_bridged() {
    let app = common::spawn_app(9).await;
    let session = app.sessions.create_session("alice").await.unwrap().session_id;
    app.provision(&session).await;
    app.sessions.close_session(&session, "alice").await.unwrap();

    let mut client = connect_client(&app, "alice").await;
    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert_eq!(next_event(&mut client).await, ServerEvent::error(404, "Session not found"));
}

#[tokio::test]
async fn large_messages_flow_both_ways_at_once() {
    const CHUNK: usize = 2 * 1024 * 1024;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Floods the bridge before reading anything, like a server publishing
    // diagnostics while the editor sends a big document.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, LspCodec::new());
        let mut writer = FramedWrite::new(write, LspCodec::new());
        for i in 0..4 {
            let note = json!({"jsonrpc": "2.0", "method": "note", "params": {"i": i, "text": "d".repeat(CHUNK)}});
            writer.send(note.to_string()).await.unwrap();
        }
        let body = reader.next().await.unwrap().unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": 1, "result": body.len()});
        writer.send(reply.to_string()).await.unwrap();
    });

    let app = common::spawn_app(port).await;
    let session = app.sessions.create_session("alice").await.unwrap().session_id;
    app.provision(&session).await;

    let mut client = connect_client(&app, "alice").await;
    send(&mut client, json!({"type": "connect", "sessionId": session})).await;
    assert!(matches!(next_event(&mut client).await, ServerEvent::Connected { .. }));

    let (mut sink, mut stream) = client.split();
    let events = tokio::spawn(async move {
        let mut notes = 0;
        loop {
            let Some(Ok(Message::Text(text))) = stream.next().await else {
                panic!("bridge closed the socket");
            };
            let ServerEvent::Message { message } = serde_json::from_str(&text).unwrap() else {
                continue;
            };
            let message: Value = serde_json::from_str(&message).unwrap();
            if message["method"] == "note" {
                notes += 1;
            } else {
                return (notes, message["result"].as_u64().unwrap());
            }
        }
    });

    let did_open = json!({"jsonrpc": "2.0", "id": 1, "method": "big", "params": {"text": "a".repeat(4 * CHUNK)}});
    let expected_len = did_open.to_string().len() as u64;
    let event = json!({"type": "message", "message": did_open.to_string()});
    sink.send(Message::Text(event.to_string())).await.unwrap();

    let (notes, received) = tokio::time::timeout(Duration::from_secs(20), events)
        .await
        .expect("bridge stalled")
        .unwrap();
    assert_eq!(notes, 4);
    assert_eq!(received, expected_len);
}
