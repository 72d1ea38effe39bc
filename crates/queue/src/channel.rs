//! Long-lived push channel to the server's queue endpoint.
//!
//! [`TransportChannel::run`] drives the connect -> session -> reconnect
//! loop until cancelled. While a session is open it sends a liveness ping
//! every 30 seconds and forwards parsed inbound messages to the consumer.
//! A session that ends with the normal close code (1000) stops the loop;
//! any other close (or a transport error) schedules one reconnect attempt
//! after a fixed 5 second delay.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::messages::{parse_message, ServerMessage, OUTBOUND_GET_STATUS, OUTBOUND_PING};

/// WebSocket close code for normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Outbound frames accepted by the channel while a session is open.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A text frame, already serialized.
    Text(String),
    /// Close the connection with an explicit code and reason.
    ///
    /// Closing with [`CLOSE_NORMAL`] suppresses the automatic reconnect;
    /// the owner must call [`TransportChannel::run`] again to resume.
    Close { code: u16, reason: String },
}

/// Lifecycle notifications delivered to the channel consumer.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A session opened; `outbound` accepts frames for its lifetime.
    Connected { outbound: mpsc::Sender<Outbound> },
    /// A parsed inbound message.
    Message(ServerMessage),
    /// The session ended. `reconnecting` is true when the channel will try
    /// again after the fixed delay.
    Disconnected { reconnecting: bool },
}

/// How a session ended; decides whether to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed with the normal code (explicitly requested).
    NormalClose,
    /// Closed with any other code.
    AbnormalClose(u16),
    /// Receive error or the stream ended without a close frame.
    TransportError,
    /// The owning cancellation token fired.
    Cancelled,
}

/// Whether the channel should schedule a reconnect for this session end.
pub fn should_reconnect(end: SessionEnd) -> bool {
    matches!(end, SessionEnd::AbnormalClose(_) | SessionEnd::TransportError)
}

/// Map an observed close frame to a session end.
fn end_for_close(code: Option<u16>) -> SessionEnd {
    match code {
        Some(CLOSE_NORMAL) => SessionEnd::NormalClose,
        Some(code) => SessionEnd::AbnormalClose(code),
        // A close frame with no code carries no normal-closure guarantee.
        None => SessionEnd::AbnormalClose(1005),
    }
}

/// Tunable parameters for the channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint, e.g. `ws://host:9999/queue/ws`.
    pub ws_url: String,
    /// Liveness ping cadence while a session is open.
    pub ping_interval: Duration,
    /// Fixed delay before a reconnect attempt.
    pub reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Owns the socket and the reconnect policy for the queue endpoint.
pub struct TransportChannel {
    config: ChannelConfig,
}

impl TransportChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }

    /// Drive the connect -> session -> reconnect loop.
    ///
    /// Returns when the consumer goes away, a session ends with the normal
    /// close code, or `cancel` fires. Each abnormal session end is followed
    /// by exactly one reconnect attempt after the fixed delay; a failed
    /// attempt waits the same delay again.
    pub async fn run(&self, events_tx: mpsc::Sender<ChannelEvent>, cancel: CancellationToken) {
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect_async(&self.config.ws_url) => result,
            };

            match connected {
                Ok((ws_stream, _response)) => {
                    tracing::info!(url = %self.config.ws_url, "Queue channel connected");

                    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
                    if events_tx
                        .send(ChannelEvent::Connected {
                            outbound: outbound_tx,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let end = run_session(
                        ws_stream,
                        outbound_rx,
                        &events_tx,
                        self.config.ping_interval,
                        &cancel,
                    )
                    .await;

                    let reconnecting = should_reconnect(end) && !cancel.is_cancelled();
                    tracing::info!(?end, reconnecting, "Queue channel session ended");

                    if events_tx
                        .send(ChannelEvent::Disconnected { reconnecting })
                        .await
                        .is_err()
                        || !reconnecting
                    {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.config.ws_url, error = %e, "Queue channel connection failed");
                    if events_tx
                        .send(ChannelEvent::Disconnected { reconnecting: true })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }
}

/// Drive one WebSocket session until it ends.
///
/// Requests a full snapshot immediately on open, then multiplexes the ping
/// ticker, outbound frames, and inbound traffic with `tokio::select!`.
async fn run_session(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    events_tx: &mpsc::Sender<ChannelEvent>,
    ping_interval: Duration,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut stream) = ws_stream.split();

    // Ask for the authoritative snapshot before anything else.
    if let Err(e) = sink.send(Message::Text(OUTBOUND_GET_STATUS.into())).await {
        tracing::warn!(error = %e, "Failed to request initial status");
        return SessionEnd::TransportError;
    }

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );
    let mut outbound_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Shutdown path: close normally so the server does not wait
                // for a dead peer, and skip the reconnect.
                let _ = sink
                    .send(close_frame(CLOSE_NORMAL, "shutting down"))
                    .await;
                return SessionEnd::Cancelled;
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Text(OUTBOUND_PING.into())).await {
                    tracing::warn!(error = %e, "Liveness ping failed");
                    return SessionEnd::TransportError;
                }
            }
            frame = outbound_rx.recv(), if outbound_open => {
                match frame {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "Failed to send outbound frame");
                            return SessionEnd::TransportError;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sink.send(close_frame(code, &reason)).await;
                        return end_for_close(Some(code));
                    }
                    None => {
                        // Every sender dropped; keep the session alive for
                        // inbound traffic but stop polling this queue.
                        outbound_open = false;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, events_tx).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        tracing::info!(?code, "Server closed queue channel");
                        return end_for_close(code);
                    }
                    Some(Ok(_)) => {
                        // Binary / raw frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Queue channel receive error");
                        return SessionEnd::TransportError;
                    }
                    None => {
                        tracing::info!("Queue channel stream exhausted");
                        return SessionEnd::TransportError;
                    }
                }
            }
        }
    }
}

/// Parse and forward one inbound text frame.
///
/// Malformed payloads are logged and dropped; they never end the session.
async fn handle_text(text: &str, events_tx: &mpsc::Sender<ChannelEvent>) {
    match parse_message(text) {
        Ok(message) => {
            let _ = events_tx.send(ChannelEvent::Message(message)).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Malformed queue message");
        }
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}
