use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use super::error::ConnectionError;
use super::registration::build_registration_payload;
use super::{ConnectionHandle, ConnectionState, Subscription};
use crate::config::ResolvedAgent;
use crate::wire::Envelope;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the connection supervisor, resolved from
/// `ResolvedConfig::operator` plus the agent identity needed for
/// registration and `pong` replies.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub agent: ResolvedAgent,
    pub connect_timeout: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    /// 0 means retry forever.
    pub reconnect_max_attempts: u32,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub queue_capacity: usize,
}

/// Spawn the connection supervisor and return a handle immediately; the
/// first connect attempt happens inside the spawned task, not before
/// this function returns.
#[must_use]
pub fn spawn_connection(
    config: ConnectionConfig,
    subscriptions: Vec<Subscription>,
) -> ConnectionHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let connected = Arc::new(AtomicBool::new(false));

    let handle = ConnectionHandle {
        outbound_tx,
        state_rx,
        connected: Arc::clone(&connected),
        shutdown_tx,
    };

    let supervisor = Supervisor {
        config,
        subscriptions,
        outbound_rx,
        shutdown_rx,
        state_tx,
        connected,
        attempts: 0,
    };

    tokio::spawn(supervisor.run());

    handle
}

async fn connect_ws(url: &str, timeout: Duration) -> Result<WsStream, ConnectionError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(ConnectionError::Connect(e.to_string())),
        Err(_) => Err(ConnectionError::ConnectTimeout),
    }
}

struct Supervisor {
    config: ConnectionConfig,
    subscriptions: Vec<Subscription>,
    outbound_rx: mpsc::Receiver<Envelope>,
    shutdown_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<ConnectionState>,
    connected: Arc<AtomicBool>,
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let _ = self.state_tx.send(ConnectionState::Connecting);

            tokio::select! {
                result = connect_ws(&self.config.url, self.config.connect_timeout) => {
                    match result {
                        Ok(stream) => {
                            self.attempts = 0;
                            self.connected.store(true, Ordering::Relaxed);
                            let _ = self.state_tx.send(ConnectionState::Connected);
                            if self.run_session(stream).await.is_shutdown() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "operator connect attempt failed");
                        }
                    }
                }
                Some(()) = self.shutdown_rx.recv() => {
                    self.connected.store(false, Ordering::Relaxed);
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return;
                }
            }

            self.connected.store(false, Ordering::Relaxed);
            let _ = self.state_tx.send(ConnectionState::Disconnected);

            self.attempts += 1;
            if self.config.reconnect_max_attempts > 0
                && self.attempts >= self.config.reconnect_max_attempts
            {
                warn!(
                    attempts = self.attempts,
                    "reconnection attempts exhausted, giving up"
                );
                return;
            }

            let _ = self.state_tx.send(ConnectionState::Reconnecting);
            let delay = reconnect_delay(
                self.config.reconnect_initial_backoff,
                self.config.reconnect_max_backoff,
                self.attempts,
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                Some(()) = self.shutdown_rx.recv() => {
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Run one connected session: send registration, then the receive/send
    /// loops, until the socket closes or a shutdown is requested.
    async fn run_session(&mut self, mut ws_stream: WsStream) -> SessionOutcome {
        let registration = Envelope::new(
            "register",
            build_registration_payload(&self.config.agent),
        );
        if let Err(e) = ws_stream.send(Message::Text(registration.encode().into())).await {
            warn!(error = %e, "failed to send registration envelope");
            return SessionOutcome::Disconnected;
        }
        info!(agent_id = %self.config.agent.id, "registered with operator");

        let mut last_pong = Instant::now();
        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_inbound_text(&text, &mut ws_stream).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws_stream.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("operator connection closed");
                            return SessionOutcome::Disconnected;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "operator connection read error");
                            return SessionOutcome::Disconnected;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(envelope) => {
                            if let Err(e) = ws_stream.send(Message::Text(envelope.encode().into())).await {
                                warn!(error = %e, "failed to write envelope, disconnecting");
                                return SessionOutcome::Disconnected;
                            }
                        }
                        None => {
                            // All handles dropped; nothing left to send, but keep
                            // the session (and its receive loop) alive.
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    if last_pong.elapsed() > self.config.ping_timeout {
                        warn!("liveness ping timed out, disconnecting");
                        return SessionOutcome::Disconnected;
                    }
                    let _ = ws_stream.send(Message::Ping(Vec::new().into())).await;
                }

                Some(()) = self.shutdown_rx.recv() => {
                    let _ = ws_stream.close(None).await;
                    self.connected.store(false, Ordering::Relaxed);
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return SessionOutcome::Shutdown;
                }
            }
        }
    }

    async fn handle_inbound_text(&mut self, text: &str, ws_stream: &mut WsStream) {
        let envelope = match Envelope::decode(text) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };

        if envelope.kind == "ping" {
            let pong = Envelope::new(
                "pong",
                serde_json::json!({
                    "timestamp": envelope.timestamp,
                    "agent_id": self.config.agent.id,
                }),
            );
            if let Err(e) = ws_stream.send(Message::Text(pong.encode().into())).await {
                warn!(error = %e, "failed to send pong");
            }
        }

        self.dispatch(envelope);
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let mut any_handler = false;
        self.subscriptions.retain_mut(|sub| {
            if sub.kind == envelope.kind || sub.kind == "*" {
                any_handler = true;
                match sub.tx.try_send(envelope.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            } else {
                true
            }
        });

        if !any_handler {
            warn!(kind = %envelope.kind, "no handler registered for inbound envelope kind");
        }
    }
}

enum SessionOutcome {
    Disconnected,
    Shutdown,
}

impl SessionOutcome {
    fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// `delay = min(base * 2^min(attempts-1, 5), 60s) * (0.5 + rand[0,1))`. The
/// cap applies only to the unjittered term; jitter (in `[0.5, 1.5)`) is
/// applied after, so the jittered result may exceed `max` by up to 50%,
/// matching `connection.py`'s `delay *= 0.5 + random.random()`.
fn reconnect_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(5);
    let unjittered = base.saturating_mul(1 << exponent).min(max);
    let jitter = 0.5 + rand::rng().random::<f64>();
    unjittered.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_grows_exponentially_then_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        for attempts in 1..=10 {
            let delay = reconnect_delay(base, max, attempts);
            assert!(delay <= max.mul_f64(1.5));
            assert!(delay >= base.mul_f64(0.5));
        }
    }

    #[test]
    fn reconnect_delay_is_jittered_within_bounds() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        let unjittered = base.saturating_mul(1 << 2); // attempts=3 -> exponent 2
        let delay = reconnect_delay(base, max, 3);
        assert!(delay >= unjittered.mul_f64(0.5));
        assert!(delay <= unjittered.mul_f64(1.5));
    }
}
