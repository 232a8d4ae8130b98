//! Reconnecting signaling transport
//!
//! A [`Signal`] keeps one authenticated WebSocket to the signaling server
//! alive for as long as it exists. Callers see a bounded outgoing queue and
//! one inbound stream; reconnects happen underneath both.
//!
//! The connection task cycles `Disconnected -> Connecting -> Connected`.
//! A failed dial, a read or write error, a close from the server, or no
//! inbound traffic for two ping intervals all end the current connection;
//! the task then waits `reconnect_interval` and dials again, forever.
//!
//! `wss://` URLs are verified against the bundled web PKI roots unless
//! [`SignalConfig::tls`] supplies a client configuration.

use crate::error::SignalError;
use async_trait::async_trait;
use devnet_protocol::{Envelope, basic_auth};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Connection state of a [`Signal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalState::Disconnected => f.write_str("disconnected"),
            SignalState::Connecting => f.write_str("connecting"),
            SignalState::Connected => f.write_str("connected"),
        }
    }
}

/// Callback told about every state change
pub type StateHandler = Box<dyn Fn(SignalState) + Send + Sync>;

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// WebSocket URL of the server endpoint, e.g. `ws://host:8080/ws`
    pub url: String,
    pub name: String,
    pub secret: String,
    /// Envelopes that may wait for the connection
    pub queue_capacity: usize,
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    /// How long `close` waits for the server to acknowledge
    pub close_grace: Duration,
    /// Client TLS settings for `wss://`, e.g. to trust a private root
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl SignalConfig {
    pub fn new(url: impl Into<String>, name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            secret: secret.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            tls: None,
        }
    }
}

/// Transport used by a [`Session`](crate::Session)
#[async_trait]
pub trait Signaler: Send {
    /// Queue an envelope without waiting
    fn send(&self, envelope: Envelope) -> Result<(), SignalError>;

    /// Next inbound envelope; `None` once the transport is closed for good
    async fn recv(&mut self) -> Option<Envelope>;

    fn state(&self) -> SignalState;

    /// Register a callback, called right away with the current state and
    /// again on every change
    fn handle_state_change(&self, handler: StateHandler);

    async fn close(&mut self);
}

#[derive(Default)]
struct Shared {
    state: Mutex<Option<SignalState>>,
    handlers: Mutex<Vec<Arc<dyn Fn(SignalState) + Send + Sync>>>,
}

impl Shared {
    fn state(&self) -> SignalState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(SignalState::Disconnected)
    }

    fn set(&self, next: SignalState) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == Some(next) {
                return;
            }
            *state = Some(next);
        }
        debug!(state = %next, "signal state");

        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            handler(next);
        }
    }

    fn subscribe(&self, handler: StateHandler) {
        let handler: Arc<dyn Fn(SignalState) + Send + Sync> = Arc::from(handler);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler.clone());
        handler(self.state());
    }
}

/// Client end of the signaling server
pub struct Signal {
    outgoing: mpsc::Sender<Envelope>,
    incoming: mpsc::Receiver<Envelope>,
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Signal {
    /// Start connecting in the background and return right away
    pub fn dial(config: SignalConfig) -> Result<Signal, SignalError> {
        // Reject a URL that could never connect instead of retrying it forever.
        config.url.as_str().into_client_request()?;
        HeaderValue::from_str(&basic_auth::encode(&config.name, &config.secret))
            .map_err(|_| SignalError::InvalidCredentials)?;
        if config.ping_interval.is_zero() {
            return Err(SignalError::InvalidConfig("ping_interval must be non-zero"));
        }
        if config.reconnect_interval.is_zero() {
            return Err(SignalError::InvalidConfig("reconnect_interval must be non-zero"));
        }
        if config.handshake_timeout.is_zero() {
            return Err(SignalError::InvalidConfig("handshake_timeout must be non-zero"));
        }

        install_crypto_provider();

        let capacity = config.queue_capacity.max(1);
        let (outgoing, outgoing_rx) = mpsc::channel(capacity);
        let (incoming_tx, incoming) = mpsc::channel(capacity);
        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared::default());
        shared.set(SignalState::Disconnected);

        let task = tokio::spawn(run(config, outgoing_rx, incoming_tx, shared.clone(), stop_rx));

        Ok(Signal {
            outgoing,
            incoming,
            shared,
            stop,
            task: Some(task),
        })
    }
}

#[async_trait]
impl Signaler for Signal {
    fn send(&self, envelope: Envelope) -> Result<(), SignalError> {
        if *self.stop.borrow() {
            return Err(SignalError::Closed);
        }
        self.outgoing.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => SignalError::QueueFull,
            TrySendError::Closed(_) => SignalError::Closed,
        })
    }

    async fn recv(&mut self) -> Option<Envelope> {
        self.incoming.recv().await
    }

    fn state(&self) -> SignalState {
        self.shared.state()
    }

    fn handle_state_change(&self, handler: StateHandler) {
        self.shared.subscribe(handler);
    }

    async fn close(&mut self) {
        self.stop.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "signal task failed");
            }
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

/// Why a connection ended
enum Ending {
    /// Reconnect after the interval
    Lost,
    /// Closed on request, or nobody is left to talk to
    Stopped,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a stop request.
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn run(
    config: SignalConfig,
    mut outgoing: mpsc::Receiver<Envelope>,
    incoming: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        shared.set(SignalState::Connecting);
        let dialed = tokio::select! {
            dialed = connect(&config) => dialed,
            _ = stopped(&mut stop) => break,
        };

        match dialed {
            Ok(socket) => {
                info!(url = %config.url, user = %config.name, "signal connected");
                shared.set(SignalState::Connected);
                let ending = serve(socket, &config, &mut outgoing, &incoming, &mut stop).await;
                shared.set(SignalState::Disconnected);
                if let Ending::Stopped = ending {
                    break;
                }
                info!(url = %config.url, "signal connection lost");
            }
            Err(err) => {
                warn!(url = %config.url, error = %err, "dial failed");
                shared.set(SignalState::Disconnected);
            }
        }

        tokio::select! {
            _ = sleep(config.reconnect_interval) => {}
            _ = stopped(&mut stop) => break,
        }
    }

    shared.set(SignalState::Disconnected);
    let mut dropped = 0;
    while outgoing.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(url = %config.url, dropped, "signal stopped with unsent envelopes");
    }
    debug!(url = %config.url, "signal stopped");
}

async fn connect(config: &SignalConfig) -> Result<Socket, SignalError> {
    let mut request = config.url.as_str().into_client_request()?;
    let authorization = HeaderValue::from_str(&basic_auth::encode(&config.name, &config.secret))
        .map_err(|_| SignalError::InvalidCredentials)?;
    request.headers_mut().insert(AUTHORIZATION, authorization);

    let connector = config.tls.clone().map(Connector::Rustls);
    let dial = tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
    let (socket, _) = timeout(config.handshake_timeout, dial)
        .await
        .map_err(|_| SignalError::HandshakeTimeout)??;
    Ok(socket)
}

/// The default `wss` connector needs a process-wide rustls provider
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Pump one connection until it ends
async fn serve(
    socket: Socket,
    config: &SignalConfig,
    outgoing: &mut mpsc::Receiver<Envelope>,
    incoming: &mpsc::Sender<Envelope>,
    stop: &mut watch::Receiver<bool>,
) -> Ending {
    let (sink, mut stream) = socket.split();
    // Shared by the write path and the keepalive.
    let sink = AsyncMutex::new(sink);

    let ending = tokio::select! {
        ending = read_loop(&mut stream, incoming, config.ping_interval * 2) => ending,
        ending = write_loop(&sink, outgoing) => ending,
        ending = keepalive(&sink, config.ping_interval) => ending,
        _ = stopped(stop) => Ending::Stopped,
    };

    if let Ending::Stopped = ending {
        flush_queued(&sink, outgoing).await;
        close_gracefully(&sink, &mut stream, config.close_grace).await;
    }
    ending
}

async fn read_loop(
    stream: &mut SplitStream<Socket>,
    incoming: &mpsc::Sender<Envelope>,
    liveness: Duration,
) -> Ending {
    loop {
        let message = match timeout(liveness, stream.next()).await {
            Err(_) => {
                warn!(timeout = ?liveness, "no traffic from server");
                return Ending::Lost;
            }
            Ok(None) => return Ending::Lost,
            Ok(Some(Err(err))) => {
                warn!(error = %err, "read message");
                return Ending::Lost;
            }
            Ok(Some(Ok(message))) => message,
        };

        let decoded = match message {
            Message::Text(text) => Envelope::from_str(text.as_str()),
            Message::Binary(data) => Envelope::from_slice(&data),
            Message::Close(frame) => {
                debug!(?frame, "server closed connection");
                return Ending::Lost;
            }
            _ => continue,
        };

        match decoded {
            Ok(envelope) => {
                trace!(src = %envelope.src, payload = envelope.payload.kind(), "received");
                if incoming.send(envelope).await.is_err() {
                    return Ending::Stopped;
                }
            }
            Err(err) => warn!(error = %err, "dropping malformed frame"),
        }
    }
}

async fn write_loop(
    sink: &AsyncMutex<SplitSink<Socket, Message>>,
    outgoing: &mut mpsc::Receiver<Envelope>,
) -> Ending {
    while let Some(envelope) = outgoing.recv().await {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "encode message");
                continue;
            }
        };
        trace!(dst = %envelope.dst, payload = envelope.payload.kind(), "sending");
        if let Err(err) = sink.lock().await.send(Message::text(text)).await {
            warn!(dst = %envelope.dst, error = %err, "write message");
            return Ending::Lost;
        }
    }
    Ending::Stopped
}

async fn keepalive(sink: &AsyncMutex<SplitSink<Socket, Message>>, every: Duration) -> Ending {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        if let Err(err) = sink.lock().await.send(Message::Ping(Default::default())).await {
            warn!(error = %err, "write ping");
            return Ending::Lost;
        }
    }
}

/// Write whatever is still queued so a close does not lose it
async fn flush_queued(sink: &AsyncMutex<SplitSink<Socket, Message>>, outgoing: &mut mpsc::Receiver<Envelope>) {
    let mut sink = sink.lock().await;
    while let Ok(envelope) = outgoing.try_recv() {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "encode message");
                continue;
            }
        };
        if let Err(err) = sink.feed(Message::text(text)).await {
            warn!(dst = %envelope.dst, error = %err, "write queued message");
            return;
        }
    }
    if let Err(err) = sink.flush().await {
        warn!(error = %err, "flush queued messages");
    }
}

async fn close_gracefully(
    sink: &AsyncMutex<SplitSink<Socket, Message>>,
    stream: &mut SplitStream<Socket>,
    grace: Duration,
) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(err) = sink.lock().await.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "write close");
        return;
    }

    let acknowledged = timeout(grace, async {
        while let Some(Ok(message)) = stream.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if acknowledged.is_err() {
        debug!("close not acknowledged, dropping connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SignalConfig::new("ws://127.0.0.1:8080/ws", "alice", "secret");
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.reconnect_interval, Duration::from_secs(10));
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.close_grace, Duration::from_millis(500));
    }

    #[test]
    fn state_handlers_see_current_state_then_changes() {
        let shared = Shared::default();
        shared.set(SignalState::Disconnected);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            shared.subscribe(Box::new(move |state| seen.lock().unwrap().push(state)));
        }

        shared.set(SignalState::Connecting);
        shared.set(SignalState::Connecting);
        shared.set(SignalState::Connected);

        use SignalState::*;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Disconnected, Disconnected, Connecting, Connecting, Connected, Connected]
        );
    }

    #[tokio::test]
    async fn dial_rejects_invalid_url() {
        let err = Signal::dial(SignalConfig::new("not a url", "alice", "secret")).err();
        assert!(matches!(err, Some(SignalError::WebSocket(_))));
    }

    #[tokio::test]
    async fn dial_rejects_zero_intervals() {
        let base = SignalConfig::new("ws://127.0.0.1:9/ws", "alice", "secret");

        let mut config = base.clone();
        config.ping_interval = Duration::ZERO;
        let err = Signal::dial(config).err();
        assert!(matches!(err, Some(SignalError::InvalidConfig(_))));

        let mut config = base.clone();
        config.reconnect_interval = Duration::ZERO;
        let err = Signal::dial(config).err();
        assert!(matches!(err, Some(SignalError::InvalidConfig(_))));

        let mut config = base;
        config.handshake_timeout = Duration::ZERO;
        let err = Signal::dial(config).err();
        assert!(matches!(err, Some(SignalError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn queue_full_and_closed() {
        // Nothing listens on port 9; the queue is never drained.
        let mut config = SignalConfig::new("ws://127.0.0.1:9/ws", "alice", "secret");
        config.queue_capacity = 1;
        config.reconnect_interval = Duration::from_secs(60);
        let mut signal = Signal::dial(config).unwrap();

        let ping = || Envelope::new("alice", "bob", devnet_protocol::Control::new("ping"));
        signal.send(ping()).unwrap();
        assert!(matches!(signal.send(ping()), Err(SignalError::QueueFull)));

        signal.close().await;
        assert!(matches!(signal.send(ping()), Err(SignalError::Closed)));
        assert_eq!(signal.state(), SignalState::Disconnected);
        assert!(signal.recv().await.is_none());
    }
}
