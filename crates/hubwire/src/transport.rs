//! # Hub Transport
//!
//! The supervisor talks to the hub through two traits:
//!
//! - [`Connector`] opens one authenticated session per call.
//! - [`HubConnection`] is a live session: outbound invocations, a close
//!   signal, and graceful close.
//!
//! [`WsConnector`] is the production implementation over
//! `tokio-tungstenite`. Tests substitute in-memory fakes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    WsConnection                       │
//! │                                                       │
//! │  writer: Mutex<SplitSink>   ◄── invoke() / close()    │
//! │                             ◄── keep-alive task (Ping)│
//! │                                                       │
//! │  reader loop (spawned task):                          │
//! │    SplitStream ─┬─► Completion → pending oneshot      │
//! │                 ├─► Event      → EventSink::enqueue   │
//! │                 └─► Close / EOF / silence → closed    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The reader awaits `enqueue`, so a full event queue stops socket reads.
//!
//! ## TLS Note
//!
//! Certificate validation is only skipped when
//! [`HubConfig::accept_invalid_certs`] is set.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector as NativeTlsConnector;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    Connector as TlsConnector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use tokio_util::sync::CancellationToken;

use crate::auth::Credential;
use crate::config::{HubConfig, TimeoutConfig};
use crate::error::{HubError, HubResult};
use crate::ingest::EventSink;
use crate::protocol::{EventMessage, HandshakeRequest, HubMessage, HubMethods, decode_handshake};

/// Opens hub sessions.
pub trait Connector: Send + Sync + 'static {
    type Connection: HubConnection;

    /// Open and handshake a new session authenticated by `credential`.
    /// Inbound events are pushed into `events`.
    fn connect(
        &self,
        credential: Credential,
        events: EventSink,
    ) -> impl Future<Output = HubResult<Self::Connection>> + Send;
}

/// A live hub session.
pub trait HubConnection: Send + Sync + 'static {
    /// Invoke a hub method with one string argument and wait for its completion.
    fn invoke(
        &self,
        target: &'static str,
        argument: &str,
    ) -> impl Future<Output = HubResult<()>> + Send;

    /// Token cancelled once the session is gone, for whatever reason.
    fn closed(&self) -> CancellationToken;

    /// Close the session gracefully. Closing twice is a no-op.
    fn close(&self) -> impl Future<Output = HubResult<()>> + Send;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the WebSocket.
type WsWriter = SplitSink<WsStream, Message>;

/// Read half of the WebSocket.
type WsReader = SplitStream<WsStream>;

/// An invocation awaiting its completion, keyed by invocation id.
type PendingCompletion = (&'static str, oneshot::Sender<HubResult<()>>);

/// WebSocket connector for the JSON hub protocol.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    accept_invalid_certs: bool,
    timeouts: TimeoutConfig,
}

impl WsConnector {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            url: config.realtime_url.clone(),
            accept_invalid_certs: config.accept_invalid_certs,
            timeouts: config.timeouts.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Connection = WsConnection;

    async fn connect(&self, credential: Credential, events: EventSink) -> HubResult<WsConnection> {
        let url = &self.url;

        let tls = NativeTlsConnector::builder()
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .danger_accept_invalid_hostnames(self.accept_invalid_certs)
            .build()?;

        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| HubError::ConnectionFailed {
                    url: url.clone(),
                    reason: format!("Invalid URL: {e}"),
                })?;
        let bearer = HeaderValue::from_str(&credential.bearer()).map_err(|_| HubError::TokenParse {
            reason: "token contains characters that are not valid in a header".into(),
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connect_timeout = self.timeouts.connect_timeout();
        let connect_fut =
            connect_async_tls_with_config(request, None, true, Some(TlsConnector::NativeTls(tls)));

        let (ws, response) = tokio::time::timeout(connect_timeout, connect_fut)
            .await
            .map_err(|_| HubError::Timeout {
                seconds: self.timeouts.connect_timeout_secs,
            })?
            .map_err(|e| match HubError::from(e) {
                auth @ HubError::AuthenticationFailed { .. } => auth,
                other => HubError::ConnectionFailed {
                    url: url.clone(),
                    reason: other.to_string(),
                },
            })?;

        tracing::info!(url = %url, status = %response.status(), "WebSocket connected");

        let (mut writer, mut reader) = ws.split();

        let initial = tokio::time::timeout(
            connect_timeout,
            perform_handshake(&mut writer, &mut reader),
        )
        .await
        .map_err(|_| HubError::Timeout {
            seconds: self.timeouts.connect_timeout_secs,
        })??;

        tracing::debug!("Hub protocol handshake complete");

        Ok(WsConnection::start(
            writer,
            reader,
            initial,
            events,
            &self.timeouts,
        ))
    }
}

/// Send the protocol handshake and wait for the hub's answer.
///
/// Returns any messages that arrived in the same frame as the answer.
async fn perform_handshake(
    writer: &mut WsWriter,
    reader: &mut WsReader,
) -> HubResult<Vec<HubMessage>> {
    let request = HandshakeRequest::default().encode()?;
    writer.send(Message::Text(request.into())).await?;

    loop {
        match reader.next().await {
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                let payload = message.to_text()?;
                let (response, rest) = decode_handshake(payload)?;
                if let Some(reason) = response.error {
                    return Err(HubError::HandshakeRejected { reason });
                }
                return Ok(HubMessage::decode_frames(rest));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(HubError::ConnectionLost {
                    reason: "socket closed during protocol handshake".into(),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// State shared between the connection handle and its background tasks.
struct Shared {
    writer: Mutex<WsWriter>,
    pending: Mutex<HashMap<String, PendingCompletion>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    invoke_timeout: Duration,
}

impl Shared {
    async fn send(&self, message: &HubMessage) -> HubResult<()> {
        let payload = message.encode()?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| HubError::WebSocket(format!("Send error: {e}")))
    }

    async fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, (_, tx)) in pending.drain() {
            let _ = tx.send(Err(HubError::ConnectionLost {
                reason: reason.to_string(),
            }));
        }
    }
}

/// A live WebSocket session with the hub.
pub struct WsConnection {
    shared: Arc<Shared>,
    reader_handle: JoinHandle<()>,
    keepalive_handle: Option<JoinHandle<()>>,
}

impl WsConnection {
    fn start(
        writer: WsWriter,
        reader: WsReader,
        initial: Vec<HubMessage>,
        events: EventSink,
        timeouts: &TimeoutConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            invoke_timeout: timeouts.invoke_timeout(),
        });

        let server_timeout = (timeouts.server_timeout_secs > 0).then(|| timeouts.server_timeout());
        let reader_handle = Self::spawn_reader_loop(
            reader,
            Arc::clone(&shared),
            initial,
            events,
            server_timeout,
        );

        let keepalive_handle = (timeouts.keep_alive_secs > 0)
            .then(|| Self::spawn_keepalive(Arc::clone(&shared), timeouts.keep_alive()));

        Self {
            shared,
            reader_handle,
            keepalive_handle,
        }
    }

    /// Spawn the background reader loop that dispatches hub messages.
    fn spawn_reader_loop(
        mut reader: WsReader,
        shared: Arc<Shared>,
        initial: Vec<HubMessage>,
        events: EventSink,
        server_timeout: Option<Duration>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reason = String::from("hub closed the connection");

            'read: {
                for message in initial {
                    if let Some(close) = dispatch(message, &shared, &events).await {
                        reason = close;
                        break 'read;
                    }
                }

                loop {
                    let frame = tokio::select! {
                        biased;
                        () = shared.closed.cancelled() => {
                            reason = String::from("connection closed locally");
                            break 'read;
                        }
                        frame = next_frame(&mut reader, server_timeout) => frame,
                    };

                    match frame {
                        Err(elapsed) => {
                            reason = format!("no message from hub within {}s", elapsed.as_secs());
                            tracing::warn!(reason = %reason, "Hub went silent");
                            break 'read;
                        }
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            reason = match frame {
                                Some(frame) => {
                                    format!("hub closed the socket (code {})", u16::from(frame.code))
                                }
                                None => String::from("hub closed the socket"),
                            };
                            tracing::info!(reason = %reason, "Hub WebSocket closed");
                            break 'read;
                        }
                        Ok(Some(Ok(message @ (Message::Text(_) | Message::Binary(_))))) => {
                            let messages = match message.to_text() {
                                Ok(payload) => HubMessage::decode_frames(payload),
                                Err(e) => {
                                    tracing::warn!(error = %e, "Ignoring frame that is not UTF-8");
                                    continue;
                                }
                            };
                            for message in messages {
                                if let Some(close) = dispatch(message, &shared, &events).await {
                                    reason = close;
                                    break 'read;
                                }
                            }
                        }
                        Ok(Some(Ok(_))) => {
                            // WebSocket-level ping/pong frames
                        }
                        Ok(Some(Err(e))) => {
                            reason = e.to_string();
                            tracing::warn!(error = %e, "WebSocket read error");
                            break 'read;
                        }
                        Ok(None) => {
                            reason = String::from("WebSocket stream ended");
                            tracing::info!("Hub WebSocket stream ended");
                            break 'read;
                        }
                    }
                }
            }

            shared.closed.cancel();
            shared.fail_pending(&reason).await;
            tracing::debug!(reason = %reason, "Reader loop exiting");
        })
    }

    /// Spawn the task that pings the hub so it does not time us out.
    fn spawn_keepalive(shared: Arc<Shared>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    () = shared.closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = shared.send(&HubMessage::Ping).await {
                    tracing::warn!(error = %e, "Keep-alive ping failed");
                    shared.closed.cancel();
                    break;
                }
            }
        })
    }
}

/// Next WebSocket frame, or `Err(limit)` when the hub stayed silent too long.
async fn next_frame(
    reader: &mut WsReader,
    limit: Option<Duration>,
) -> Result<Option<Result<Message, tungstenite::Error>>, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, reader.next())
            .await
            .map_err(|_| limit),
        None => Ok(reader.next().await),
    }
}

/// Route one decoded message. Returns `Some(reason)` when the hub asked to close.
async fn dispatch(message: HubMessage, shared: &Shared, events: &EventSink) -> Option<String> {
    match message {
        HubMessage::Invocation {
            target, arguments, ..
        } if target == HubMethods::EVENT => {
            for argument in arguments {
                match EventMessage::from_argument(argument) {
                    Ok(event) => {
                        if let Err(e) = events.enqueue(event).await {
                            tracing::debug!(error = %e, "Event queue no longer accepts events");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed event"),
                }
            }
        }
        HubMessage::Invocation { target, .. } => {
            tracing::debug!(method = %target, "Ignoring invocation of unknown client method");
        }
        HubMessage::Completion {
            invocation_id,
            error,
            ..
        } => {
            let waiter = shared.pending.lock().await.remove(&invocation_id);
            match waiter {
                Some((target, tx)) => {
                    let result = match error {
                        Some(message) => Err(HubError::Invocation {
                            target: target.to_string(),
                            message,
                        }),
                        None => Ok(()),
                    };
                    let _ = tx.send(result);
                }
                None => {
                    tracing::debug!(invocation_id = %invocation_id, "Completion for unknown invocation");
                }
            }
        }
        HubMessage::Ping => tracing::trace!("Ping from hub"),
        HubMessage::Close {
            error,
            allow_reconnect,
        } => {
            tracing::info!(error = ?error, allow_reconnect, "Hub requested close");
            return Some(error.unwrap_or_else(|| String::from("hub requested close")));
        }
    }
    None
}

impl HubConnection for WsConnection {
    async fn invoke(&self, target: &'static str, argument: &str) -> HubResult<()> {
        if self.shared.closed.is_cancelled() {
            return Err(HubError::NotConnected);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let key = id.to_string();
        let message = HubMessage::invocation(id, target, vec![Value::String(argument.to_string())]);

        // Register before sending so a fast completion is not missed.
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(key.clone(), (target, tx));

        tracing::debug!(method = target, id, argument, "Invoking hub method");

        if let Err(e) = self.shared.send(&message).await {
            self.shared.pending.lock().await.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.shared.invoke_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HubError::ConnectionLost {
                reason: "connection closed before the hub answered".into(),
            }),
            Err(_) => {
                self.shared.pending.lock().await.remove(&key);
                Err(HubError::Timeout {
                    seconds: self.shared.invoke_timeout.as_secs(),
                })
            }
        }
    }

    fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    async fn close(&self) -> HubResult<()> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }

        let result = {
            let mut writer = self.shared.writer.lock().await;
            writer.close().await
        };
        self.shared.closed.cancel();

        match result {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                tracing::debug!("Hub WebSocket closed gracefully");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        self.reader_handle.abort();
        if let Some(handle) = self.keepalive_handle.take() {
            handle.abort();
        }
    }
}
