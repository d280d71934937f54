#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

const RS: char = '\u{1e}';

/// How the mock answers new clients.
#[derive(Debug, Clone, Default)]
pub enum HandshakeMode {
    /// Accept the upgrade and answer the protocol handshake with `{}`.
    #[default]
    Accept,

    /// Accept the upgrade, then answer the protocol handshake with an error.
    RejectProtocol(String),

    /// Refuse the WebSocket upgrade with this HTTP status.
    RejectUpgrade(u16),
}

enum ConnectionCommand {
    SendFrame(String),
    SendClose,
    ForceClose,
}

pub struct MockConnection {
    index: usize,
    authorization: Option<String>,
    request_rx: mpsc::Receiver<Value>,
    command_tx: mpsc::Sender<ConnectionCommand>,
}

impl MockConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    /// `Authorization` header sent with the upgrade request.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    /// Next non-ping message from the client.
    pub async fn recv_message(&mut self) -> Value {
        timeout(STEP_TIMEOUT, self.request_rx.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("mock connection request channel closed")
    }

    /// Next non-ping message, if one arrives within `wait`.
    pub async fn try_recv_message(&mut self, wait: Duration) -> Option<Value> {
        timeout(wait, self.request_rx.recv()).await.ok().flatten()
    }

    /// Next invocation, asserting its target. Returns `(invocation_id, arguments)`.
    pub async fn recv_invocation(&mut self, expected_target: &str) -> (String, Vec<Value>) {
        let message = self.recv_message().await;
        assert_eq!(message["type"], 1, "expected an invocation, got {message}");
        assert_eq!(
            message["target"].as_str(),
            Some(expected_target),
            "unexpected invocation target"
        );
        let id = message["invocationId"]
            .as_str()
            .expect("invocation missing invocationId")
            .to_string();
        let arguments = message["arguments"].as_array().cloned().unwrap_or_default();
        (id, arguments)
    }

    /// Whether the client went away (socket closed) within `wait`.
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        matches!(timeout(wait, self.request_rx.recv()).await, Ok(None))
    }

    pub async fn send_json(&self, value: Value) {
        self.command_tx
            .send(ConnectionCommand::SendFrame(format!("{value}{RS}")))
            .await
            .expect("failed to send command to mock connection");
    }

    pub async fn complete(&self, invocation_id: &str) {
        self.send_json(json!({"type": 3, "invocationId": invocation_id}))
            .await;
    }

    pub async fn complete_with_error(&self, invocation_id: &str, error: &str) {
        self.send_json(json!({"type": 3, "invocationId": invocation_id, "error": error}))
            .await;
    }

    /// Answer the post-connect `Join`, `Join`, `Leave` sequence.
    pub async fn complete_group_handshake(&mut self, group: &str) {
        for target in ["Join", "Join", "Leave"] {
            let (id, arguments) = self.recv_invocation(target).await;
            assert_eq!(arguments, vec![json!(group)]);
            self.complete(&id).await;
        }
    }

    pub async fn push_event(&self, kind: &str, payload: Value) {
        self.send_json(json!({
            "type": 1,
            "target": "Event",
            "arguments": [{"type": kind, "payload": payload}],
        }))
        .await;
    }

    /// Send several records in a single WebSocket frame.
    pub async fn send_batch(&self, values: &[Value]) {
        let frame: String = values.iter().map(|v| format!("{v}{RS}")).collect();
        self.command_tx
            .send(ConnectionCommand::SendFrame(frame))
            .await
            .expect("failed to send command to mock connection");
    }

    /// Send a frame exactly as given, separators included.
    pub async fn send_raw(&self, frame: &str) {
        self.command_tx
            .send(ConnectionCommand::SendFrame(frame.to_string()))
            .await
            .expect("failed to send command to mock connection");
    }

    /// Hub-level close message (type 7).
    pub async fn send_hub_close(&self, error: Option<&str>) {
        self.send_json(json!({"type": 7, "error": error, "allowReconnect": true}))
            .await;
    }

    /// WebSocket close frame.
    pub async fn send_close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::SendClose).await;
    }

    /// Drop the socket without a close frame.
    pub async fn force_close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::ForceClose).await;
    }
}

pub struct MockHubServer {
    addr: SocketAddr,
    connection_rx: mpsc::Receiver<MockConnection>,
    server_task: JoinHandle<()>,
}

impl MockHubServer {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(HandshakeMode::Accept).await
    }

    pub async fn start_with(mode: HandshakeMode) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (connection_tx, connection_rx) = mpsc::channel(16);
        let next_connection_index = Arc::new(AtomicUsize::new(0));

        let server_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let connection_tx = connection_tx.clone();
                let connection_index = next_connection_index.fetch_add(1, Ordering::SeqCst);
                let mode = mode.clone();

                tokio::spawn(async move {
                    let authorization = Arc::new(Mutex::new(None));
                    let captured = Arc::clone(&authorization);
                    let reject = match &mode {
                        HandshakeMode::RejectUpgrade(status) => Some(*status),
                        _ => None,
                    };

                    let callback = move |request: &Request, response: Response| {
                        *captured.lock().unwrap() = request
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        match reject {
                            Some(status) => {
                                let mut error = ErrorResponse::new(None);
                                *error.status_mut() =
                                    StatusCode::from_u16(status).expect("valid status code");
                                Err(error)
                            }
                            None => Ok(response),
                        }
                    };

                    let Ok(ws_stream) = accept_hdr_async(stream, callback).await else {
                        return;
                    };

                    let (mut ws_sink, mut ws_source) = ws_stream.split();

                    // Protocol handshake
                    match ws_source.next().await {
                        Some(Ok(Message::Text(text))) if text.as_str().starts_with('{') => {}
                        _ => return,
                    }
                    let answer = match &mode {
                        HandshakeMode::RejectProtocol(reason) => json!({ "error": reason }),
                        _ => json!({}),
                    };
                    if ws_sink
                        .send(Message::Text(format!("{answer}{RS}").into()))
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let (request_tx, request_rx) = mpsc::channel(64);
                    let (command_tx, mut command_rx) = mpsc::channel(64);

                    let connection = MockConnection {
                        index: connection_index,
                        authorization: authorization.lock().unwrap().clone(),
                        request_rx,
                        command_tx,
                    };

                    if connection_tx.send(connection).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            maybe_command = command_rx.recv() => {
                                match maybe_command {
                                    Some(ConnectionCommand::SendFrame(frame)) => {
                                        if ws_sink.send(Message::Text(frame.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(ConnectionCommand::SendClose) => {
                                        let _ = ws_sink.close().await;
                                        break;
                                    }
                                    Some(ConnectionCommand::ForceClose) | None => break,
                                }
                            }
                            maybe_message = ws_source.next() => {
                                match maybe_message {
                                    Some(Ok(Message::Text(text))) => {
                                        for record in text.as_str().split(RS).filter(|r| !r.is_empty()) {
                                            let Ok(value) = serde_json::from_str::<Value>(record) else {
                                                continue;
                                            };
                                            // Keep-alive pings are not interesting to tests
                                            if value["type"] == 6 {
                                                continue;
                                            }
                                            let _ = request_tx.send(value).await;
                                        }
                                    }
                                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connection_rx,
            server_task,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/hub", self.addr)
    }

    pub async fn accept_connection(&mut self) -> MockConnection {
        timeout(STEP_TIMEOUT, self.connection_rx.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("mock server connection channel closed")
    }

    pub async fn try_accept_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        match timeout(wait, self.connection_rx.recv()).await {
            Ok(Some(connection)) => Some(connection),
            _ => None,
        }
    }
}

impl Drop for MockHubServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
