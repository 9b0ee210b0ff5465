//! Per-connection bridge task.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use super::framer::{FrameError, LspCodec};
use super::rewrite::PathRewriter;
use super::{BridgeRegistry, ClientEvent, Registration, ServerEvent};
use crate::config::{BridgeConfig, LifecycleConfig};
use crate::container::{ContainerError, ContainerRuntime};
use crate::session::SessionService;

/// Connects client WebSockets to workspace containers.
pub struct LspBridge {
    sessions: Arc<SessionService>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: BridgeRegistry,
    network: String,
    lsp_port: u16,
    config: BridgeConfig,
}

/// Live container stream of one client connection. Writes go through a
/// separate task so a container that is busy writing to us never blocks
/// the read side.
struct Upstream {
    session_id: String,
    reader: FramedRead<OwnedReadHalf, LspCodec>,
    outbox: mpsc::UnboundedSender<String>,
    writer_task: JoinHandle<()>,
    to_container: PathRewriter,
    to_client: PathRewriter,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.writer_task.abort();
    }
}

async fn write_to_container(
    session_id: String,
    mut writer: FramedWrite<OwnedWriteHalf, LspCodec>,
    mut outbox: mpsc::UnboundedReceiver<String>,
) {
    while let Some(body) = outbox.recv().await {
        if let Err(e) = writer.send(body).await {
            error!(session_id = %session_id, error = %e, "Failed to send message to language server");
            break;
        }
    }
}

/// Connect failure reported to the client as an `error` event.
#[derive(Debug)]
struct Refusal {
    code: u16,
    message: &'static str,
}

impl Refusal {
    fn new(code: u16, message: &'static str) -> Self {
        Self { code, message }
    }
}

impl From<Refusal> for ServerEvent {
    fn from(r: Refusal) -> Self {
        ServerEvent::error(r.code, r.message)
    }
}

impl LspBridge {
    pub fn new(
        sessions: Arc<SessionService>,
        runtime: Arc<dyn ContainerRuntime>,
        lifecycle: &LifecycleConfig,
        config: BridgeConfig,
    ) -> Self {
        Self {
            sessions,
            runtime,
            registry: BridgeRegistry::new(),
            network: lifecycle.network.clone(),
            lsp_port: lifecycle.lsp_port,
            config,
        }
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    /// Serve one client until it disconnects.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, user_id: String) {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(connection_id = %connection_id, user_id = %user_id, "Bridge client connected");

        let (mut sender, mut receiver) = socket.split();
        let mut upstream: Option<Upstream> = None;

        loop {
            let outgoing: Vec<ServerEvent> = tokio::select! {
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.on_client_text(&connection_id, &user_id, &text, &mut upstream).await
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "Client socket error");
                        break;
                    }
                },
                frame = next_frame(&mut upstream) => self.on_container_frame(&connection_id, frame, &mut upstream),
            };

            let mut client_gone = false;
            for event in outgoing {
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("Failed to serialize bridge event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            if client_gone {
                break;
            }
        }

        // Dropping the upstream stops its writer and closes the container socket.
        drop(upstream);
        self.detach(&connection_id);
        info!(connection_id = %connection_id, "Bridge client disconnected");
    }

    fn detach(&self, connection_id: &str) {
        if let Some(registration) = self.registry.unregister(connection_id) {
            let seconds = (Utc::now() - registration.connected_at).num_seconds();
            info!(
                session_id = %registration.session_id,
                user_id = %registration.user_id,
                connected_secs = seconds,
                "Bridge detached from language server"
            );
        }
    }

    async fn on_client_text(
        &self,
        connection_id: &str,
        user_id: &str,
        text: &str,
        upstream: &mut Option<Upstream>,
    ) -> Vec<ServerEvent> {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Unreadable client event");
                return vec![ServerEvent::error(400, "Invalid message")];
            }
        };

        match event {
            ClientEvent::Connect { session_id } => {
                if upstream.take().is_some() {
                    self.detach(connection_id);
                }
                match self.connect(connection_id, user_id, &session_id).await {
                    Ok(stream) => {
                        *upstream = Some(stream);
                        vec![ServerEvent::Connected { session_id }]
                    }
                    Err(refusal) => vec![refusal.into()],
                }
            }
            ClientEvent::Message { message } => {
                let Some(up) = upstream.as_mut() else {
                    return vec![ServerEvent::error(400, "Not connected")];
                };
                let body = match client_body(&message) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(connection_id = %connection_id, error = %e, "Malformed client message");
                        return vec![ServerEvent::error(400, "Invalid message")];
                    }
                };
                let body = up.to_container.rewrite_message(&body).into_owned();
                if up.outbox.send(body).is_err() {
                    return vec![ServerEvent::error(500, "Failed to send message")];
                }
                if let Err(e) = self.sessions.touch(&up.session_id).await {
                    warn!(session_id = %up.session_id, error = %e, "Failed to refresh session");
                }
                Vec::new()
            }
        }
    }

    fn on_container_frame(
        &self,
        connection_id: &str,
        frame: Option<Result<String, FrameError>>,
        upstream: &mut Option<Upstream>,
    ) -> Vec<ServerEvent> {
        let Some(up) = upstream.as_ref() else {
            return Vec::new();
        };
        match frame {
            Some(Ok(body)) => {
                let message = up.to_client.rewrite_message(&body).into_owned();
                vec![ServerEvent::Message { message }]
            }
            Some(Err(e)) => {
                error!(session_id = %up.session_id, error = %e, "Language server connection error");
                *upstream = None;
                self.detach(connection_id);
                vec![
                    ServerEvent::error(500, "Connection error"),
                    ServerEvent::Disconnected {
                        reason: "Connection closed".to_string(),
                    },
                ]
            }
            None => {
                info!(session_id = %up.session_id, "Language server connection closed");
                *upstream = None;
                self.detach(connection_id);
                vec![ServerEvent::Disconnected {
                    reason: "Connection closed".to_string(),
                }]
            }
        }
    }

    async fn connect(
        &self,
        connection_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Upstream, Refusal> {
        if session_id.is_empty() {
            return Err(Refusal::new(400, "sessionId is required"));
        }
        let session = match self.sessions.get_active(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return Err(Refusal::new(404, "Session not found")),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to load session");
                return Err(Refusal::new(500, "Failed to connect"));
            }
        };
        if session.user_id != user_id {
            return Err(Refusal::new(403, "Session does not belong to user"));
        }
        let Some(container_id) = session.container_id.as_deref() else {
            return Err(Refusal::new(404, "Container not ready"));
        };

        let info = match self.runtime.inspect(container_id).await {
            Ok(info) => info,
            Err(ContainerError::NotFound(_)) => return Err(Refusal::new(404, "Container not ready")),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to inspect container");
                return Err(Refusal::new(500, "Failed to connect"));
            }
        };
        let Some(ip) = info.address_on(&self.network) else {
            return Err(Refusal::new(404, "Container network not ready"));
        };

        let addr = SocketAddr::new(ip, self.lsp_port);
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(session_id = %session_id, addr = %addr, error = %e, "Failed to connect to language server");
                return Err(Refusal::new(500, "Failed to connect"));
            }
            Err(_) => {
                error!(session_id = %session_id, addr = %addr, "Timed out connecting to language server");
                return Err(Refusal::new(500, "Failed to connect"));
            }
        };
        info!(session_id = %session_id, addr = %addr, "Connected to language server");

        let (read_half, write_half) = stream.into_split();
        let to_container = PathRewriter::new(&self.config.client_root, &session.workspace_root);
        let to_client = to_container.inverse();

        self.registry.register(
            connection_id,
            Registration {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                connected_at: Utc::now(),
            },
        );
        debug!(
            session_id = %session_id,
            clients = self.registry.connections_for(session_id),
            "Bridge attached"
        );
        if let Err(e) = self.sessions.touch(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to refresh session");
        }

        let (outbox, pending) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_to_container(
            session_id.to_string(),
            FramedWrite::new(write_half, LspCodec::new()),
            pending,
        ));

        Ok(Upstream {
            session_id: session_id.to_string(),
            reader: FramedRead::new(read_half, LspCodec::new()),
            outbox,
            writer_task,
            to_container,
            to_client,
        })
    }
}

/// Next frame from the container, or never while disconnected.
async fn next_frame(upstream: &mut Option<Upstream>) -> Option<Result<String, FrameError>> {
    match upstream {
        Some(up) => up.reader.next().await,
        None => std::future::pending().await,
    }
}

/// JSON-RPC body of a client message. Clients may send either the bare body
/// or a fully framed message; the header block of the latter is dropped.
fn client_body(message: &str) -> Result<String, FrameError> {
    let looks_framed = message
        .get(..b"content-length".len())
        .is_some_and(|head| head.eq_ignore_ascii_case("content-length"));
    if !looks_framed {
        return Ok(message.to_string());
    }
    let mut buf = BytesMut::from(message.as_bytes());
    LspCodec::new()
        .decode(&mut buf)?
        .ok_or(FrameError::MissingLength)
}
