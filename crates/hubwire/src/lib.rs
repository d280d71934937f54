//! # hubwire
//!
//! A resilient client for real-time WebSocket event hubs.
//!
//! The client keeps one authenticated session alive, pushes every inbound
//! `Event` invocation into a bounded queue, and processes queued events one
//! at a time in arrival order.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use hubwire::{HubConfig, HubService};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hubwire::HubResult<()> {
//!     // Load config from environment or hubwire.toml
//!     let config = HubConfig::discover(None)?;
//!
//!     let service = HubService::new(config)?;
//!     service.start(&CancellationToken::new());
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.stop(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Components
//!
//! | Component | Type | Role |
//! |-----------|------|------|
//! | Credentials | [`TokenProvider`] | username/password → bearer token, once per connect |
//! | Transport | [`WsConnector`] | WebSocket + JSON hub protocol |
//! | Supervisor | [`ConnectionSupervisor`] | connect, retry, reconnect, close |
//! | Ingestion | [`EventIngestor`] | bounded FIFO queue with a single consumer |
//! | Lifecycle | [`HubService`] | start/stop orchestration |
//!
//! ## Configuration
//!
//! See [`HubConfig`] for the full configuration reference.
//! The simplest setup uses environment variables:
//!
//! ```bash
//! export HUBWIRE_REALTIME_URL="wss://hub.example.com/hub"
//! export HUBWIRE_USERNAME="svc-events"
//! export HUBWIRE_PASSWORD="secret"
//! ```
//!
//! Or a `hubwire.toml` file:
//!
//! ```toml
//! realtime_url = "wss://hub.example.com/hub"
//! username = "svc-events"
//! password = "secret"
//!
//! [reconnect]
//! auth_failure = "fatal"
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod ingest;
pub mod protocol;
pub mod retry;
pub mod service;
pub mod supervisor;
pub mod transport;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use auth::{Credential, CredentialSource, TokenProvider};
pub use config::{AuthFailurePolicy, HubConfig};
pub use error::{HubError, HubResult};
pub use ingest::{EventHandler, EventIngestor, EventSink, LoggingHandler};
pub use protocol::EventMessage;
pub use service::HubService;
pub use supervisor::{ConnectionEvent, ConnectionSupervisor, SessionState};
pub use transport::{Connector, HubConnection, WsConnector};
