//! # Connection Supervisor
//!
//! Owns the hub session and keeps it alive.
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected ◄──► Reconnecting
//!        ▲              │              │               │
//!        └── transient ─┘              │    schedule exhausted
//!            (retry delay)             │               │
//!        ▲                             │               ▼
//!        └─────────────────────────────┴──────── Disconnected
//!
//!  any state ──► Closed   (stop, or an unrecoverable connect failure)
//! ```
//!
//! ## Retry Loop
//!
//! While no session exists the loop fetches a fresh [`Credential`], opens
//! the transport and runs the group handshake (`Join`, `Join`, `Leave`).
//! Transient failures wait for the retry policy's delay and try again.
//! Cancellation ends the loop quietly. Anything else is logged at `error`
//! and leaves the supervisor `Closed`.
//!
//! ## Automatic Reconnect
//!
//! When a live session drops, the reconnect policy's schedule is walked
//! with a fresh credential per attempt. A reconnected session does **not**
//! repeat the group handshake. Once the schedule is exhausted the state
//! falls back to `Disconnected` and the retry loop takes over, handshake
//! included.
//!
//! ## Connection Events
//!
//! Lifecycle transitions are broadcast as [`ConnectionEvent`]s:
//!
//! ```no_run
//! # use hubwire::supervisor::ConnectionEvent;
//! # async fn demo(mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>) {
//! while let Ok(event) = events.recv().await {
//!     if let ConnectionEvent::Reconnecting { attempt } = event {
//!         println!("reconnect attempt {attempt}");
//!     }
//! }
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialSource;
use crate::config::{AuthFailurePolicy, HubConfig};
use crate::error::{HubError, HubResult};
use crate::ingest::EventSink;
use crate::protocol::HubMethods;
use crate::retry::{FixedDelay, ReconnectPolicy, ScheduledDelays};
use crate::transport::{Connector, HubConnection};

/// Capacity of the [`ConnectionEvent`] broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session. The retry loop will (re)connect.
    Disconnected,

    /// A connect attempt is in flight.
    Connecting,

    /// Session is up and the group handshake has completed.
    Connected,

    /// A live session dropped and automatic reconnect is running.
    Reconnecting,

    /// Terminal. Reached on stop or an unrecoverable failure.
    Closed,
}

/// Connection lifecycle events emitted by [`ConnectionSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected and the group handshake completed.
    Connected,

    /// A live session was lost.
    Disconnected { reason: String },

    /// Automatic reconnect attempt (1-based).
    Reconnecting { attempt: u32 },

    /// Automatic reconnect succeeded.
    Reconnected,

    /// Automatic reconnect schedule exhausted.
    ReconnectFailed { attempts: u32, last_error: String },

    /// The supervisor reached its terminal state.
    Closed { reason: String },
}

/// Tuning for the retry loop and automatic reconnect.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Group passed to the handshake invocations.
    pub group: String,

    /// How often the loop re-checks a live session.
    pub poll_interval: Duration,

    /// Delays between failed connect attempts.
    pub retry_policy: Arc<dyn ReconnectPolicy>,

    /// Automatic-reconnect schedule; `None` disables automatic reconnect.
    pub reconnect_policy: Option<Arc<dyn ReconnectPolicy>>,

    /// How token endpoint failures are classified.
    pub auth_failure: AuthFailurePolicy,

    /// Upper bound on closing the live session during `stop`.
    pub close_timeout: Duration,
}

impl SupervisorOptions {
    pub fn from_config(config: &HubConfig) -> Self {
        let reconnect = &config.reconnect;
        let reconnect_policy: Option<Arc<dyn ReconnectPolicy>> = if reconnect.enabled {
            Some(Arc::new(ScheduledDelays::new(reconnect.delays())))
        } else {
            None
        };

        Self {
            group: config.group.clone(),
            poll_interval: reconnect.poll_interval(),
            retry_policy: Arc::new(FixedDelay::forever(reconnect.retry_delay())),
            reconnect_policy,
            auth_failure: reconnect.auth_failure,
            close_timeout: config.timeouts.close_timeout(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

/// Runs the connect/retry/reconnect state machine for one hub session.
///
/// The transport handle is owned here and nowhere else.
pub struct ConnectionSupervisor<C: Connector, S> {
    inner: Arc<Inner<C, S>>,
}

struct Inner<C: Connector, S> {
    connector: C,
    credentials: S,
    events: EventSink,
    options: SupervisorOptions,
    state_tx: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    connection: Mutex<Option<C::Connection>>,
    shutdown: CancellationToken,
    scope: std::sync::Mutex<Option<CancellationToken>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<C: Connector, S: CredentialSource> ConnectionSupervisor<C, S> {
    /// Create an idle supervisor. Nothing happens until [`start`](Self::start).
    ///
    /// `shutdown` is the service-wide token; cancelling it stops the loop.
    pub fn new(
        connector: C,
        credentials: S,
        events: EventSink,
        options: SupervisorOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                connector,
                credentials,
                events,
                options,
                state_tx,
                event_tx,
                connection: Mutex::new(None),
                shutdown,
                scope: std::sync::Mutex::new(None),
                task: std::sync::Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the retry loop and return immediately.
    ///
    /// The loop observes both `base` and the service shutdown token.
    /// Failures only surface through logs, events and the state.
    pub fn start(&self, base: &CancellationToken) {
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.inner.stopped.load(Ordering::SeqCst) {
            tracing::warn!("Supervisor already started, ignoring start request");
            return;
        }

        let scope = link_scopes(base, &self.inner.shutdown);
        *self
            .inner
            .scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(scope.clone());

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.run(scope).await }));
        tracing::debug!("Connection supervisor started");
    }

    /// Stop the supervisor. Idempotent.
    ///
    /// Ends the retry loop, then closes a live session gracefully. The
    /// whole sequence is bounded by `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Supervisor already stopped");
            return;
        }
        let deadline = Instant::now() + timeout;

        let scope = self
            .inner
            .scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scope) = scope {
            scope.cancel();
        }

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("Retry loop did not exit in time, aborting it");
                task.abort();
            }
        }

        let connection = self.inner.connection.lock().await.take();
        if let Some(connection) = connection {
            let close_deadline = deadline.min(Instant::now() + self.inner.options.close_timeout);
            match tokio::time::timeout_at(close_deadline, connection.close()).await {
                Ok(Ok(())) => tracing::info!("Hub connection closed"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Hub connection close failed"),
                Err(_) => tracing::warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Hub connection close timed out"
                ),
            }
        }

        self.inner.close("supervisor stopped");
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to connection lifecycle events.
    pub fn event_receiver(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Whether the retry loop task is still running.
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl<C: Connector, S> Drop for ConnectionSupervisor<C, S> {
    fn drop(&mut self) {
        if let Some(scope) = self
            .inner
            .scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            scope.cancel();
        }
    }
}

impl<C: Connector, S: CredentialSource> Inner<C, S> {
    async fn run(&self, scope: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if scope.is_cancelled() {
                break;
            }

            if let Some(closed) = self.live_session().await {
                tokio::select! {
                    biased;
                    () = scope.cancelled() => break,
                    () = closed.cancelled() => {
                        if !self.recover(&scope).await {
                            break;
                        }
                    }
                    () = tokio::time::sleep(self.options.poll_interval) => {}
                }
                continue;
            }

            self.set_state(SessionState::Connecting);
            match self.establish(&scope).await {
                Ok(()) => attempt = 0,
                Err(e) if e.is_cancellation() => break,
                Err(e) if self.is_recoverable(&e) => {
                    self.set_state(SessionState::Disconnected);
                    let Some(delay) = self.options.retry_policy.next_delay(attempt) else {
                        tracing::error!(error = %e, attempts = attempt + 1, "Connect retries exhausted");
                        self.close(&e.to_string());
                        break;
                    };
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Connect attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = scope.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Unrecoverable connect failure, retry loop stopping");
                    self.close(&e.to_string());
                    break;
                }
            }
        }

        tracing::debug!("Retry loop exited");
    }

    /// Close token of the live session, if there is one.
    async fn live_session(&self) -> Option<CancellationToken> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(HubConnection::closed)
    }

    fn is_recoverable(&self, error: &HubError) -> bool {
        if error.is_auth_failure() {
            return self.options.auth_failure == AuthFailurePolicy::Retry;
        }
        error.is_transient()
    }

    /// Credential, transport, handshake. Stores the session on success.
    async fn establish(&self, scope: &CancellationToken) -> HubResult<()> {
        let connection = self.open(scope).await?;

        if let Err(e) = self.handshake(&connection, scope).await {
            if let Err(close_err) = connection.close().await {
                tracing::debug!(error = %close_err, "Close after failed handshake failed");
            }
            return Err(e);
        }

        *self.connection.lock().await = Some(connection);
        self.set_state(SessionState::Connected);
        tracing::info!(group = %self.options.group, "Hub session established");
        self.emit(ConnectionEvent::Connected);
        Ok(())
    }

    async fn open(&self, scope: &CancellationToken) -> HubResult<C::Connection> {
        let credential = cancellable(scope, self.credentials.acquire()).await?;
        cancellable(
            scope,
            self.connector.connect(credential, self.events.clone()),
        )
        .await
    }

    /// `Join`, `Join`, `Leave` on the configured group.
    async fn handshake(&self, connection: &C::Connection, scope: &CancellationToken) -> HubResult<()> {
        let group = self.options.group.as_str();
        for method in [HubMethods::JOIN, HubMethods::JOIN, HubMethods::LEAVE] {
            cancellable(scope, connection.invoke(method, group)).await?;
        }
        Ok(())
    }

    /// Walk the automatic-reconnect schedule after a live session dropped.
    ///
    /// Returns `false` when the retry loop must stop: on cancellation, or
    /// after a failure the retry loop would not recover from either.
    async fn recover(&self, scope: &CancellationToken) -> bool {
        let lost = self.connection.lock().await.take();
        drop(lost);

        let reason = String::from("hub connection lost");
        tracing::warn!("Hub connection lost");
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.clone(),
        });

        let Some(policy) = self.options.reconnect_policy.as_ref() else {
            self.set_state(SessionState::Disconnected);
            return true;
        };

        self.set_state(SessionState::Reconnecting);
        let mut attempt: u32 = 0;
        let mut last_error = reason;

        while let Some(delay) = policy.next_delay(attempt) {
            tokio::select! {
                biased;
                () = scope.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            tracing::info!(attempt, "Attempting reconnection");
            self.emit(ConnectionEvent::Reconnecting { attempt });

            match self.open(scope).await {
                Ok(connection) => {
                    *self.connection.lock().await = Some(connection);
                    self.set_state(SessionState::Connected);
                    tracing::info!(attempt, "Reconnected to hub");
                    self.emit(ConnectionEvent::Reconnected);
                    return true;
                }
                Err(e) if e.is_cancellation() => return false,
                Err(e) if !self.is_recoverable(&e) => {
                    tracing::error!(attempt, error = %e, "Unrecoverable reconnect failure, retry loop stopping");
                    self.close(&e.to_string());
                    return false;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnection attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        tracing::warn!(attempts = attempt, "Automatic reconnect exhausted, falling back to retry loop");
        self.set_state(SessionState::Disconnected);
        self.emit(ConnectionEvent::ReconnectFailed {
            attempts: attempt,
            last_error,
        });
        true
    }

    fn set_state(&self, next: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next || *current == SessionState::Closed {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?next, "Session state change");
            *current = next;
            true
        });
    }

    fn close(&self, reason: &str) {
        if *self.state_tx.borrow() == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closed);
        tracing::info!(reason, "Connection supervisor closed");
        self.emit(ConnectionEvent::Closed {
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Run `future` unless `scope` is cancelled first.
async fn cancellable<T>(
    scope: &CancellationToken,
    future: impl Future<Output = HubResult<T>>,
) -> HubResult<T> {
    tokio::select! {
        biased;
        () = scope.cancelled() => Err(HubError::Cancelled),
        result = future => result,
    }
}

/// A child of `shutdown` that is also cancelled when `base` is.
pub(crate) fn link_scopes(base: &CancellationToken, shutdown: &CancellationToken) -> CancellationToken {
    let scope = shutdown.child_token();
    let base = base.clone();
    let linked = scope.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = base.cancelled() => linked.cancel(),
            () = linked.cancelled() => {}
        }
    });
    scope
}
