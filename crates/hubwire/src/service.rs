//! # Service Lifecycle
//!
//! [`HubService`] wires the pieces together: the event queue and its
//! consumer, the connection supervisor, and one shutdown token shared by
//! both.
//!
//! ```no_run
//! use std::time::Duration;
//! use hubwire::{HubConfig, HubService};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> hubwire::HubResult<()> {
//! let service = HubService::new(HubConfig::discover(None)?)?;
//! service.start(&CancellationToken::new());
//!
//! tokio::signal::ctrl_c().await?;
//! service.stop(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{CredentialSource, TokenProvider};
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::ingest::{EventHandler, EventIngestor, EventSink, LoggingHandler};
use crate::supervisor::{
    ConnectionEvent, ConnectionSupervisor, SessionState, SupervisorOptions, link_scopes,
};
use crate::transport::{Connector, WsConnector};

/// A running (or runnable) hub client.
pub struct HubService<C: Connector = WsConnector, S = TokenProvider, H = LoggingHandler> {
    config: HubConfig,
    supervisor: ConnectionSupervisor<C, S>,
    sink: EventSink,
    ingestor: Mutex<Option<EventIngestor<H>>>,
    consumer: Mutex<Option<JoinHandle<u64>>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl HubService {
    /// Build the production service: WebSocket transport, HTTP token
    /// provider, logging event handler.
    ///
    /// # Errors
    /// Returns [`HubError::ConfigError`](crate::HubError::ConfigError) for an
    /// empty `realtime_url` or an underivable token endpoint.
    pub fn new(config: HubConfig) -> HubResult<Self> {
        config.validate()?;
        let connector = WsConnector::new(&config);
        let credentials = TokenProvider::new(&config)?;
        Self::with_parts(config, connector, credentials, LoggingHandler)
    }
}

impl<C: Connector, S: CredentialSource, H: EventHandler> HubService<C, S, H> {
    /// Build a service from explicit parts.
    ///
    /// # Errors
    /// Returns [`HubError::ConfigError`](crate::HubError::ConfigError) for an
    /// empty `realtime_url`.
    pub fn with_parts(config: HubConfig, connector: C, credentials: S, handler: H) -> HubResult<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (ingestor, sink) = EventIngestor::new(handler);
        let supervisor = ConnectionSupervisor::new(
            connector,
            credentials,
            sink.clone(),
            SupervisorOptions::from_config(&config),
            shutdown.clone(),
        );

        Ok(Self {
            config,
            supervisor,
            sink,
            ingestor: Mutex::new(Some(ingestor)),
            consumer: Mutex::new(None),
            shutdown,
            stopped: AtomicBool::new(false),
        })
    }

    /// Launch the event consumer and the retry loop, then return.
    ///
    /// Cancelling `base` stops both. Starting twice is ignored.
    pub fn start(&self, base: &CancellationToken) {
        let Some(ingestor) = self
            .ingestor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::warn!("Hub service already started");
            return;
        };

        let scope = link_scopes(base, &self.shutdown);
        let consumer = tokio::spawn(ingestor.run(scope));
        *self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(consumer);

        self.supervisor.start(base);
        tracing::info!(
            url = %self.config.realtime_url,
            group = %self.config.group,
            "Hub service started"
        );
    }

    /// Stop the service. Idempotent.
    ///
    /// Closes a live session, stops accepting events, and gives the
    /// consumer until `timeout` to drain what is queued before cancelling it.
    pub async fn stop(&self, timeout: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Hub service already stopped");
            return;
        }
        let deadline = Instant::now() + timeout;

        self.supervisor.stop(timeout).await;
        self.sink.complete();

        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut consumer) = consumer {
            match tokio::time::timeout_at(deadline, &mut consumer).await {
                Ok(Ok(processed)) => tracing::info!(processed, "Event queue drained"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Event consumer task failed"),
                Err(_) => {
                    tracing::warn!("Event queue did not drain in time, cancelling consumer");
                    self.shutdown.cancel();
                    if let Ok(processed) = consumer.await {
                        tracing::debug!(processed, "Event consumer cancelled");
                    }
                }
            }
        }

        self.shutdown.cancel();
        tracing::info!("Hub service stopped");
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<C, S> {
        &self.supervisor
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.supervisor.state()
    }

    /// Subscribe to connection lifecycle events.
    pub fn event_receiver(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.supervisor.event_receiver()
    }
}
