//! # Event Ingestion
//!
//! Decouples "the hub delivered an event" from "the event was processed".
//!
//! ```text
//!  transport reader ──► EventSink::enqueue ──► [ bounded queue (10) ] ──► EventIngestor::run ──► EventHandler
//!        (producer, suspends while full)                                   (single consumer, FIFO)
//! ```
//!
//! A slow handler fills the queue, which suspends the transport reader,
//! which stops reading the socket. Nothing is buffered without bound and
//! nothing is dropped.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, HubResult};
use crate::protocol::EventMessage;

/// Number of events the queue holds before producers suspend.
pub const QUEUE_CAPACITY: usize = 10;

/// Processes dequeued events, one at a time, in arrival order.
pub trait EventHandler: Send + Sync + 'static {
    /// Errors are logged by the ingestor and never stop the loop.
    fn handle(&self, event: EventMessage) -> impl Future<Output = HubResult<()>> + Send;
}

/// Default handler: logs the event discriminant.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    async fn handle(&self, event: EventMessage) -> HubResult<()> {
        tracing::info!(kind = %event.kind, "Event received");
        Ok(())
    }
}

/// Producer side of the event queue.
///
/// Clones share the same queue. Once [`complete`](Self::complete) is
/// called every clone refuses new events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EventMessage>,
    completed: CancellationToken,
}

impl EventSink {
    /// Enqueue an event, suspending while the queue is full.
    ///
    /// # Errors
    /// Returns [`HubError::QueueClosed`] once the queue has been completed,
    /// including while this call is suspended.
    pub async fn enqueue(&self, event: EventMessage) -> HubResult<()> {
        if self.completed.is_cancelled() {
            return Err(HubError::QueueClosed);
        }
        tokio::select! {
            biased;
            () = self.completed.cancelled() => Err(HubError::QueueClosed),
            sent = self.tx.send(event) => sent.map_err(|_| HubError::QueueClosed),
        }
    }

    /// Signal that no more events will be written. Idempotent.
    pub fn complete(&self) {
        self.completed.cancel();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }
}

/// Single consumer of the event queue.
pub struct EventIngestor<H> {
    rx: mpsc::Receiver<EventMessage>,
    completed: CancellationToken,
    handler: H,
}

impl<H: EventHandler> EventIngestor<H> {
    /// Create the queue. Returns the consumer and its producer handle.
    pub fn new(handler: H) -> (Self, EventSink) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let completed = CancellationToken::new();
        let sink = EventSink {
            tx,
            completed: completed.clone(),
        };
        (
            Self {
                rx,
                completed,
                handler,
            },
            sink,
        )
    }

    /// Consume events until the queue is completed and drained, or until
    /// `cancel` fires. Returns the number of events handed to the handler.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        let mut processed: u64 = 0;
        let mut draining = false;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(processed, "Event ingestion cancelled");
                    break;
                }
                () = self.completed.cancelled(), if !draining => {
                    // Refuse new sends but keep what is already queued.
                    self.rx.close();
                    draining = true;
                    tracing::debug!("Event queue completed, draining");
                    continue;
                }
                event = self.rx.recv() => event,
            };

            let Some(event) = next else {
                tracing::debug!(processed, "Event queue drained");
                break;
            };

            let kind = event.kind.clone();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                outcome = self.handler.handle(event) => outcome,
            };
            processed += 1;

            if let Err(e) = outcome {
                tracing::warn!(kind = %kind, error = %e, "Event processing failed, continuing");
            }
        }

        processed
    }
}
