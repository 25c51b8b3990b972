//! Transport boundary between the codec core and the outside world.
//!
//! Adapters carry opaque byte buffers and know nothing about envelope
//! structure. A worker task owns the adapter and pumps an outbound and an
//! inbound queue, so network waits never happen inside codec or AEAD
//! calls.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{CourierError, Result};

/// One request/response exchange with the peer.
///
/// Implementations wrap whatever actually moves the bytes: an HTTP
/// client, a named pipe, a cloud-storage poll loop. The buffers are
/// opaque; framing and sealing happen above this trait.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `outbound` to the peer and return whatever bytes came
    /// back, possibly none.
    async fn exchange(&self, outbound: Vec<u8>) -> Result<Vec<u8>>;
}

// ============================================================================
// Loopback
// ============================================================================

/// In-memory transport joining an agent to a peer loop in the same
/// process.
///
/// [`exchange`](Transport::exchange) hands the buffer to the peer half
/// and waits for exactly one answer, which makes it a drop-in stand-in
/// for a request/response channel in tests and demos.
pub struct LoopbackTransport {
    requests: mpsc::Sender<Vec<u8>>,
    responses: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// The serving half of a [`LoopbackTransport`].
pub struct LoopbackPeer {
    /// Buffers the agent side sent.
    pub requests: mpsc::Receiver<Vec<u8>>,
    /// Channel for answers back to the agent side.
    pub responses: mpsc::Sender<Vec<u8>>,
}

impl LoopbackTransport {
    /// Creates a connected transport/peer pair.
    pub fn pair(capacity: usize) -> (Self, LoopbackPeer) {
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        (
            Self {
                requests: request_tx,
                responses: Mutex::new(response_rx),
            },
            LoopbackPeer {
                requests: request_rx,
                responses: response_tx,
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn exchange(&self, outbound: Vec<u8>) -> Result<Vec<u8>> {
        self.requests.send(outbound).await.map_err(|_| {
            CourierError::TransportFailed("loopback peer hung up".to_string())
        })?;

        let mut responses = self.responses.lock().await;
        responses.recv().await.ok_or_else(|| {
            CourierError::TransportFailed("loopback peer hung up".to_string())
        })
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Owns a transport on a spawned task and pumps its queues.
///
/// Callers push sealed buffers with [`send`](TransportWorker::send) and
/// take responses with [`recv`](TransportWorker::recv); the worker is the
/// only place an exchange ever awaits the network. A failed exchange is
/// logged and the buffer is lost, matching the drop-and-retry-later
/// posture of the rest of the stack. Dropping the worker (or calling
/// [`shutdown`](TransportWorker::shutdown)) closes the outbound queue and
/// lets the task drain out.
pub struct TransportWorker {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    handle: JoinHandle<()>,
}

impl TransportWorker {
    /// Spawns the pump task around `transport`.
    ///
    /// # Arguments
    /// * `transport` - Adapter the worker owns from now on
    /// * `queue_depth` - Capacity of each direction's queue
    pub fn spawn(transport: Arc<dyn Transport>, queue_depth: usize) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(queue_depth);

        let handle = tokio::spawn(async move {
            while let Some(buffer) = outbound_rx.recv().await {
                match transport.exchange(buffer).await {
                    Ok(response) => {
                        // An empty response means the peer had nothing
                        // queued for us
                        if response.is_empty() {
                            continue;
                        }
                        if inbound_tx.send(response).await.is_err() {
                            debug!("inbound consumer gone, transport worker exiting");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "transport exchange failed, buffer dropped");
                    }
                }
            }
            debug!("transport worker drained");
        });

        Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            handle,
        }
    }

    /// Queue a sealed buffer for transmission.
    pub async fn send(&self, buffer: Vec<u8>) -> Result<()> {
        self.outbound.send(buffer).await.map_err(|_| {
            CourierError::TransportFailed("transport worker stopped".to_string())
        })
    }

    /// Next inbound buffer, or `None` once the worker has stopped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Stop accepting traffic and wait for the pump task to finish.
    pub async fn shutdown(self) {
        drop(self.outbound);
        drop(self.inbound);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "transport worker task panicked");
        }
    }
}
