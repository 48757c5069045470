//! Long-lived, auto-reconnecting duplex connection to the operator
//! for operator connectivity.
//!
//! A background task owns the socket; a cheap-to-clone handle talks to it
//! over channels. The protocol is kind-addressed envelope pub/sub rather
//! than a command/response RPC, so the handle exposes `send`/`state`
//! instead of a per-command call.

mod error;
mod registration;
mod transport;

pub use error::ConnectionError;
pub use registration::build_registration_payload;
pub use transport::{spawn_connection, ConnectionConfig};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};

use crate::wire::Envelope;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Cheap-to-clone handle to the background connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound_tx: mpsc::Sender<Envelope>,
    state_rx: watch::Receiver<ConnectionState>,
    connected: Arc<AtomicBool>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ConnectionHandle {
    /// Enqueue an envelope for sending. Non-blocking; fails with
    /// `QueueFull` if the bounded outbound queue is saturated
    /// (back-pressure instead of unbounded buffering).
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::QueueFull` if the outbound queue is full,
    /// or `ConnectionError::Closed` if the background task has exited.
    pub fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        self.outbound_tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// A receiver that resolves on every state transition; callers that
    /// want to observe `CONNECTED -> DISCONNECTED -> ... -> CONNECTED`
    /// cycles (e.g. tests for S6) should clone this and `changed().await`.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Request a graceful shutdown. Idempotent; returns once the request
    /// has been accepted (not once the task has fully exited).
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Registered subscription: every inbound envelope whose `kind` matches
/// (or the wildcard `"*"`) is forwarded here, in registration order.
pub struct Subscription {
    pub kind: String,
    pub tx: mpsc::Sender<Envelope>,
}
