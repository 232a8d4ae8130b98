//! In-memory doubles for the transport and the connectivity layer
//!
//! [`MemorySignal::pair`] wires two sessions back to back without a server.
//! [`MockBackend`] stands in for the connectivity layer: its links record
//! every call in a shared [`MockLog`], announce one local candidate per
//! description, and with [`MockBackend::auto_connect`] report connectivity
//! as soon as both descriptions are applied.

use crate::error::{MediaError, NegotiationError, SignalError};
use crate::link::{Backend, Link, LinkEvent, LinkNotifier};
use crate::media::{Direction, MediaStream, OutputTarget, SampleHandler, StreamKind};
use crate::signal::{SignalState, Signaler, StateHandler};
use async_trait::async_trait;
use devnet_protocol::{Candidate, Envelope, IceServer, SessionDescription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// One end of an in-memory signaling wire
///
/// Everything sent on one end is received on the other, whatever its `dst`.
/// Closing one end ends the other end's receive stream.
pub struct MemorySignal {
    outgoing: Option<mpsc::UnboundedSender<Envelope>>,
    incoming: mpsc::UnboundedReceiver<Envelope>,
}

impl MemorySignal {
    pub fn pair() -> (MemorySignal, MemorySignal) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemorySignal {
                outgoing: Some(b_tx),
                incoming: a_rx,
            },
            MemorySignal {
                outgoing: Some(a_tx),
                incoming: b_rx,
            },
        )
    }
}

#[async_trait]
impl Signaler for MemorySignal {
    fn send(&self, envelope: Envelope) -> Result<(), SignalError> {
        match &self.outgoing {
            Some(outgoing) => outgoing.send(envelope).map_err(|_| SignalError::Closed),
            None => Err(SignalError::Closed),
        }
    }

    async fn recv(&mut self) -> Option<Envelope> {
        self.incoming.recv().await
    }

    fn state(&self) -> SignalState {
        match self.outgoing {
            Some(_) => SignalState::Connected,
            None => SignalState::Disconnected,
        }
    }

    fn handle_state_change(&self, handler: StateHandler) {
        handler(self.state());
    }

    async fn close(&mut self) {
        self.outgoing = None;
    }
}

/// Calls recorded by mock links and streams, as `"<remote>: <call>"`
#[derive(Clone, Default)]
pub struct MockLog {
    entries: Arc<Mutex<Vec<String>>>,
    notifiers: Arc<Mutex<HashMap<String, LinkNotifier>>>,
}

impl MockLog {
    fn record(&self, remote: &str, call: impl AsRef<str>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{remote}: {}", call.as_ref()));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| *e == entry)
            .count()
    }

    /// Notifier of the latest link created for `remote`, to inject events
    pub fn notifier(&self, remote: &str) -> Option<LinkNotifier> {
        self.notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote)
            .cloned()
    }
}

/// A connectivity layer that never touches the network
#[derive(Clone, Default)]
pub struct MockBackend {
    log: MockLog,
    auto_connect: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Connected` once a link has both descriptions applied
    pub fn auto_connect(mut self) -> Self {
        self.auto_connect = true;
        self
    }

    pub fn log(&self) -> MockLog {
        self.log.clone()
    }
}

impl Backend for MockBackend {
    fn create_link(
        &mut self,
        remote: &str,
        ice_servers: &[IceServer],
        notifier: LinkNotifier,
    ) -> Result<Box<dyn Link>, NegotiationError> {
        self.log.record(remote, format!("create_link {}", ice_servers.len()));
        self.log
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote.to_string(), notifier.clone());

        Ok(Box::new(MockLink {
            remote: remote.to_string(),
            log: self.log.clone(),
            notifier,
            auto_connect: self.auto_connect,
            local_applied: false,
            remote_applied: false,
            connected: false,
            closed: false,
            candidates: 0,
        }))
    }

    fn create_stream(
        &mut self,
        remote: &str,
        kind: StreamKind,
        direction: Direction,
    ) -> Result<Box<dyn MediaStream>, MediaError> {
        self.log.record(remote, format!("create_stream {kind} {direction}"));
        Ok(Box::new(MockStream {
            remote: remote.to_string(),
            kind,
            direction,
            log: self.log.clone(),
        }))
    }
}

struct MockLink {
    remote: String,
    log: MockLog,
    notifier: LinkNotifier,
    auto_connect: bool,
    local_applied: bool,
    remote_applied: bool,
    connected: bool,
    closed: bool,
    candidates: u16,
}

impl MockLink {
    fn check_open(&self) -> Result<(), NegotiationError> {
        if self.closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    fn announce_candidate(&mut self) {
        self.candidates += 1;
        let candidate = Candidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.candidates,
                50000 + self.candidates
            ),
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            username_fragment: "mock".to_string(),
        };
        self.notifier.notify(LinkEvent::LocalCandidate(candidate));
    }

    fn maybe_connect(&mut self) {
        if self.auto_connect && self.local_applied && self.remote_applied && !self.connected {
            self.connected = true;
            self.notifier.notify(LinkEvent::Connected);
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.check_open()?;
        self.log.record(&self.remote, "create_offer");
        self.local_applied = true;
        self.announce_candidate();
        Ok(SessionDescription::offer(format!("v=0 offer for {}", self.remote)))
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, NegotiationError> {
        self.check_open()?;
        if !offer.sdp.starts_with("v=0") {
            return Err(NegotiationError::Link("malformed offer".to_string()));
        }
        self.log.record(&self.remote, "accept_offer");
        self.remote_applied = true;
        self.local_applied = true;
        self.announce_candidate();
        self.maybe_connect();
        Ok(SessionDescription::answer(format!("v=0 answer for {}", self.remote)))
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.check_open()?;
        if !self.local_applied || !answer.sdp.starts_with("v=0") {
            return Err(NegotiationError::Link("no pending offer".to_string()));
        }
        self.log.record(&self.remote, "apply_answer");
        self.remote_applied = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_candidate(&mut self, _candidate: Candidate) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.log.record(&self.remote, "add_candidate");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.log.record(&self.remote, "rollback");
        self.local_applied = false;
        Ok(())
    }

    fn configure(&mut self, ice_servers: &[IceServer]) {
        self.log.record(&self.remote, format!("configure {}", ice_servers.len()));
    }

    fn send_control(&mut self, data: &str) -> Result<(), NegotiationError> {
        self.check_open()?;
        self.log.record(&self.remote, format!("send_control {data}"));
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.record(&self.remote, "close");
        }
    }
}

/// A media binding that only records what it is asked to do
pub struct MockStream {
    remote: String,
    kind: StreamKind,
    direction: Direction,
    log: MockLog,
}

impl MediaStream for MockStream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn start(&mut self) -> Result<(), MediaError> {
        self.log
            .record(&self.remote, format!("start {} {}", self.kind, self.direction));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MediaError> {
        self.log
            .record(&self.remote, format!("stop {} {}", self.kind, self.direction));
        Ok(())
    }

    fn set_output_target(&mut self, target: OutputTarget) -> Result<(), MediaError> {
        self.log
            .record(&self.remote, format!("target {} {}", self.kind, target.0));
        Ok(())
    }

    fn on_sample(&mut self, _handler: SampleHandler) {
        self.log
            .record(&self.remote, format!("on_sample {} {}", self.kind, self.direction));
    }
}
