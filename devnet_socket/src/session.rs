//! Per-identity negotiation loop
//!
//! A [`Session`] owns every [`Peer`] of one local name. It runs as a single
//! task selecting over inbound envelopes, envelopes produced by peers, link
//! events, transport state changes and commands from [`SessionHandle`]s, so
//! the peer table needs no locks. Peers hold no reference back to the
//! session; their links report through a [`LinkNotifier`] carrying the
//! remote name and a generation, which the session resolves in its table.

use crate::error::{NegotiationError, SessionError};
use crate::events::SessionEvent;
use crate::link::{Backend, LinkEvent, LinkNotifier, PeerHandle};
use crate::media::{Direction, OutputTarget, SampleHandler, StreamKind};
use crate::peer::{Peer, PeerState};
use crate::signal::{SignalState, Signaler};
use devnet_protocol::{Config, Envelope, Payload, SdpKind, SessionDescription};
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Connect {
        remote: String,
        reply: Reply<()>,
    },
    Hangup {
        remote: String,
        reply: Reply<()>,
    },
    SendControl {
        remote: String,
        data: String,
        reply: Reply<()>,
    },
    StartStream {
        remote: String,
        kind: StreamKind,
        reply: Reply<()>,
    },
    StopStream {
        remote: String,
        kind: StreamKind,
        reply: Reply<()>,
    },
    SetOutputTarget {
        remote: String,
        kind: StreamKind,
        target: OutputTarget,
        reply: Reply<()>,
    },
    OnSample {
        remote: String,
        kind: StreamKind,
        handler: SampleHandler,
        reply: Reply<()>,
    },
    PeerState {
        remote: String,
        reply: oneshot::Sender<Option<PeerState>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Input {
    Inbound(Option<Envelope>),
    Outbound(Envelope),
    Link(PeerHandle, LinkEvent),
    Signal(SignalState),
    Command(Option<Command>),
}

/// The negotiation loop for one local name
pub struct Session {
    name: String,
    signal: Box<dyn Signaler>,
    backend: Box<dyn Backend>,
    peers: HashMap<String, Peer>,
    config: Config,
    generation: u64,
    signal_connected: bool,
    outbox_tx: mpsc::UnboundedSender<Envelope>,
    outbox: mpsc::UnboundedReceiver<Envelope>,
    links_tx: mpsc::UnboundedSender<(PeerHandle, LinkEvent)>,
    links: mpsc::UnboundedReceiver<(PeerHandle, LinkEvent)>,
    states: mpsc::UnboundedReceiver<SignalState>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SessionEvent>,
}

/// Entry point into a running [`Session`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl Session {
    /// Create a session for `name`, plus its handle and event stream
    ///
    /// Nothing happens until [`Session::run`] is polled.
    pub fn new<S, B>(name: impl Into<String>, signal: S, backend: B) -> (Session, SessionHandle, mpsc::Receiver<SessionEvent>)
    where
        S: Signaler + 'static,
        B: Backend + 'static,
    {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let (links_tx, links) = mpsc::unbounded_channel();
        let (states_tx, states) = mpsc::unbounded_channel();

        signal.handle_state_change(Box::new(move |state| {
            let _ = states_tx.send(state);
        }));

        let session = Session {
            name: name.into(),
            signal: Box::new(signal),
            backend: Box::new(backend),
            peers: HashMap::new(),
            config: Config::default(),
            generation: 0,
            signal_connected: false,
            outbox_tx,
            outbox,
            links_tx,
            links,
            states,
            commands,
            events: events_tx,
        };
        (session, SessionHandle { commands: commands_tx }, events)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until closed through a handle, until every handle is dropped, or
    /// until the transport closes for good
    pub async fn run(mut self) {
        info!(user = %self.name, "session started");
        loop {
            let input = tokio::select! {
                envelope = self.signal.recv() => Input::Inbound(envelope),
                Some(envelope) = self.outbox.recv() => Input::Outbound(envelope),
                Some((handle, event)) = self.links.recv() => Input::Link(handle, event),
                Some(state) = self.states.recv() => Input::Signal(state),
                command = self.commands.recv() => Input::Command(command),
            };

            match input {
                Input::Inbound(Some(envelope)) => self.dispatch(envelope).await,
                Input::Outbound(envelope) => self.transmit(envelope),
                Input::Link(handle, event) => self.handle_link_event(handle, event).await,
                Input::Signal(state) => self.handle_signal_state(state),
                Input::Command(Some(Command::Close { reply })) => {
                    self.teardown().await;
                    let _ = reply.send(());
                    return;
                }
                Input::Command(Some(command)) => self.execute(command).await,
                Input::Inbound(None) => {
                    debug!(user = %self.name, "transport closed");
                    break;
                }
                Input::Command(None) => {
                    debug!(user = %self.name, "all handles dropped");
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        if !envelope.is_server_directed() && envelope.dst != self.name {
            debug!(src = %envelope.src, dst = %envelope.dst, "envelope not addressed to us");
            return;
        }

        let Envelope { src, payload, .. } = envelope;
        match payload {
            Payload::Config(config) => {
                info!(user = %self.name, ice_servers = config.ice_servers.len(), "received config");
                for peer in self.peers.values_mut() {
                    peer.configure(&config.ice_servers);
                }
                self.config = config;
            }
            Payload::SessionDescription(description) => self.handle_description(src, description).await,
            Payload::Candidate(candidate) => {
                let Some(peer) = self.inbound_peer(&src) else {
                    return;
                };
                if let Err(err) = peer.handle_candidate(candidate).await {
                    self.fail_peer(&src, err).await;
                }
            }
            Payload::Control(control) => self.emit(SessionEvent::Control {
                remote: src,
                data: control.data,
            }),
        }
    }

    async fn handle_description(&mut self, src: String, description: SessionDescription) {
        if description.kind == SdpKind::Answer && !self.peers.contains_key(&src) {
            debug!(%src, "answer without negotiation, dropping");
            return;
        }
        let Some(peer) = self.inbound_peer(&src) else {
            return;
        };
        trace!(%src, kind = %description.kind, state = %peer.state(), "description");
        if let Err(err) = peer.handle_description(description).await {
            self.fail_peer(&src, err).await;
        }
    }

    /// The peer for an inbound negotiation message, created if needed
    fn inbound_peer(&mut self, src: &str) -> Option<&mut Peer> {
        if src.is_empty() || src == self.name {
            warn!(%src, "negotiation message with invalid sender");
            return None;
        }
        if !self.peers.contains_key(src) {
            match self.create_peer(src) {
                Ok(peer) => {
                    self.peers.insert(src.to_string(), peer);
                }
                Err(err) => {
                    warn!(%src, error = %err, "cannot create peer");
                    return None;
                }
            }
        }
        self.peers.get_mut(src)
    }

    fn create_peer(&mut self, remote: &str) -> Result<Peer, SessionError> {
        self.generation += 1;
        let handle = PeerHandle {
            remote: remote.to_string(),
            generation: self.generation,
        };
        let notifier = LinkNotifier::new(handle.clone(), self.links_tx.clone());
        let link = self
            .backend
            .create_link(remote, &self.config.ice_servers, notifier)?;
        debug!(user = %self.name, %remote, generation = handle.generation, "created peer");
        Ok(Peer::new(self.name.as_str(), handle, link, self.outbox_tx.clone()))
    }

    async fn fail_peer(&mut self, remote: &str, error: NegotiationError) {
        if let Some(mut peer) = self.peers.remove(remote) {
            let events = peer.fail(&error).await;
            self.emit_all(events);
        }
    }

    async fn remove_peer(&mut self, remote: &str) -> bool {
        match self.peers.remove(remote) {
            Some(mut peer) => {
                let events = peer.close().await;
                self.emit_all(events);
                true
            }
            None => false,
        }
    }

    fn transmit(&mut self, mut envelope: Envelope) {
        envelope.src = self.name.clone();
        trace!(dst = %envelope.dst, payload = envelope.payload.kind(), "outbound");
        if let Err(err) = self.signal.send(envelope) {
            warn!(user = %self.name, error = %err, "dropping outbound envelope");
        }
    }

    async fn handle_link_event(&mut self, handle: PeerHandle, event: LinkEvent) {
        let Some(peer) = self
            .peers
            .get_mut(&handle.remote)
            .filter(|peer| peer.handle().generation == handle.generation)
        else {
            trace!(remote = %handle.remote, generation = handle.generation, "event for replaced peer");
            return;
        };

        if let LinkEvent::TrackStarted(kind) = &event {
            match self.backend.create_stream(&handle.remote, *kind, Direction::Inbound) {
                Ok(stream) => {
                    if let Err(err) = peer.add_stream(stream) {
                        warn!(remote = %handle.remote, %kind, error = %err, "attach inbound stream");
                    }
                }
                Err(err) => warn!(remote = %handle.remote, %kind, error = %err, "create inbound stream"),
            }
        }

        let events = peer.handle_link_event(event).await;
        if peer.state().is_terminal() {
            self.peers.remove(&handle.remote);
        }
        self.emit_all(events);
    }

    fn handle_signal_state(&mut self, state: SignalState) {
        match (state, self.signal_connected) {
            (SignalState::Connected, false) => {
                self.signal_connected = true;
                self.emit(SessionEvent::Connected);
            }
            (SignalState::Disconnected | SignalState::Connecting, true) => {
                self.signal_connected = false;
                self.emit(SessionEvent::Disconnected);
            }
            _ => {}
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { remote, reply } => {
                let _ = reply.send(self.connect(remote).await);
            }
            Command::Hangup { remote, reply } => {
                let result = if self.remove_peer(&remote).await {
                    Ok(())
                } else {
                    Err(SessionError::UnknownPeer(remote))
                };
                let _ = reply.send(result);
            }
            Command::SendControl { remote, data, reply } => {
                let result = match self.peers.get_mut(&remote) {
                    Some(peer) => peer.send_control(&data).map_err(SessionError::from),
                    None => Err(SessionError::UnknownPeer(remote)),
                };
                let _ = reply.send(result);
            }
            Command::StartStream { remote, kind, reply } => {
                let _ = reply.send(self.start_stream(&remote, kind));
            }
            Command::StopStream { remote, kind, reply } => {
                let result = match self.peers.get_mut(&remote) {
                    Some(peer) => peer.stop_stream(kind).map_err(SessionError::from),
                    None => Err(SessionError::UnknownPeer(remote)),
                };
                let _ = reply.send(result);
            }
            Command::SetOutputTarget {
                remote,
                kind,
                target,
                reply,
            } => {
                let result = match self.peers.get_mut(&remote) {
                    Some(peer) => peer.set_output_target(kind, target).map_err(SessionError::from),
                    None => Err(SessionError::UnknownPeer(remote)),
                };
                let _ = reply.send(result);
            }
            Command::OnSample {
                remote,
                kind,
                handler,
                reply,
            } => {
                let result = match self.peers.get_mut(&remote) {
                    Some(peer) => {
                        peer.on_sample(kind, handler);
                        Ok(())
                    }
                    None => Err(SessionError::UnknownPeer(remote)),
                };
                let _ = reply.send(result);
            }
            Command::PeerState { remote, reply } => {
                let _ = reply.send(self.peers.get(&remote).map(Peer::state));
            }
            Command::Close { reply } => {
                // Handled by the loop.
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self, remote: String) -> Result<(), SessionError> {
        if remote.is_empty() {
            return Err(SessionError::InvalidName);
        }
        if remote == self.name {
            return Err(SessionError::SelfConnect);
        }
        if self.remove_peer(&remote).await {
            info!(%remote, "replacing existing negotiation");
        }

        let mut peer = self.create_peer(&remote)?;
        if let Err(err) = peer.connect().await {
            let events = peer.fail(&err).await;
            self.emit_all(events);
            return Err(err.into());
        }
        info!(user = %self.name, %remote, "sent offer");
        self.peers.insert(remote, peer);
        Ok(())
    }

    fn start_stream(&mut self, remote: &str, kind: StreamKind) -> Result<(), SessionError> {
        let Some(peer) = self.peers.get_mut(remote) else {
            return Err(SessionError::UnknownPeer(remote.to_string()));
        };
        let stream = self.backend.create_stream(remote, kind, Direction::Outbound)?;
        peer.add_stream(stream)?;
        Ok(())
    }

    async fn teardown(&mut self) {
        info!(user = %self.name, peers = self.peers.len(), "closing session");
        let peers: Vec<String> = self.peers.keys().cloned().collect();
        for remote in peers {
            self.remove_peer(&remote).await;
        }
        // Flush what the peers queued before closing the transport.
        while let Ok(envelope) = self.outbox.try_recv() {
            self.transmit(envelope);
        }
        self.signal.close().await;
        if self.signal_connected {
            self.signal_connected = false;
            self.emit(SessionEvent::Disconnected);
        }
    }

    fn emit_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(user = %self.name, kind = ?event.kind(), "event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl SessionHandle {
    /// Start negotiating with `remote`, replacing any negotiation in progress
    pub async fn connect(&self, remote: impl Into<String>) -> Result<(), SessionError> {
        let remote = remote.into();
        self.request(|reply| Command::Connect { remote, reply }).await
    }

    /// Close the negotiation with `remote`
    pub async fn hangup(&self, remote: impl Into<String>) -> Result<(), SessionError> {
        let remote = remote.into();
        self.request(|reply| Command::Hangup { remote, reply }).await
    }

    /// Send application data over the established link with `remote`
    pub async fn send_control(&self, remote: impl Into<String>, data: impl Into<String>) -> Result<(), SessionError> {
        let (remote, data) = (remote.into(), data.into());
        self.request(|reply| Command::SendControl { remote, data, reply })
            .await
    }

    /// Attach an outbound stream; it starts once `remote` is connected
    pub async fn start_stream(&self, remote: impl Into<String>, kind: StreamKind) -> Result<(), SessionError> {
        let remote = remote.into();
        self.request(|reply| Command::StartStream { remote, kind, reply })
            .await
    }

    pub async fn stop_stream(&self, remote: impl Into<String>, kind: StreamKind) -> Result<(), SessionError> {
        let remote = remote.into();
        self.request(|reply| Command::StopStream { remote, kind, reply })
            .await
    }

    pub async fn set_output_target(
        &self,
        remote: impl Into<String>,
        kind: StreamKind,
        target: OutputTarget,
    ) -> Result<(), SessionError> {
        let remote = remote.into();
        self.request(|reply| Command::SetOutputTarget {
            remote,
            kind,
            target,
            reply,
        })
        .await
    }

    pub async fn on_sample(
        &self,
        remote: impl Into<String>,
        kind: StreamKind,
        handler: SampleHandler,
    ) -> Result<(), SessionError> {
        let remote = remote.into();
        self.request(|reply| Command::OnSample {
            remote,
            kind,
            handler,
            reply,
        })
        .await
    }

    /// State of the negotiation with `remote`, if there is one
    pub async fn peer_state(&self, remote: impl Into<String>) -> Result<Option<PeerState>, SessionError> {
        let remote = remote.into();
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::PeerState { remote, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Close every peer and the transport, then stop the loop
    pub async fn close(&self) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Close { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemorySignal, MockBackend};
    use devnet_protocol::{Candidate, Control, IceServer};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    async fn next_sent(wire: &mut MemorySignal) -> Envelope {
        timeout(WAIT, wire.recv()).await.unwrap().unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn connect_sends_stamped_offer() {
        let (signal, mut wire) = MemorySignal::pair();
        let (session, handle, mut events) = Session::new("alice", signal, MockBackend::new());
        tokio::spawn(session.run());

        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
        handle.connect("bob").await.unwrap();

        let offer = next_sent(&mut wire).await;
        assert_eq!((offer.src.as_str(), offer.dst.as_str()), ("alice", "bob"));
        assert!(matches!(
            offer.payload,
            Payload::SessionDescription(SessionDescription { kind: SdpKind::Offer, .. })
        ));
        assert_eq!(handle.peer_state("bob").await.unwrap(), Some(PeerState::OfferSent));
    }

    #[tokio::test]
    async fn rejects_self_and_empty_names() {
        let (signal, _wire) = MemorySignal::pair();
        let (session, handle, _events) = Session::new("alice", signal, MockBackend::new());
        tokio::spawn(session.run());

        assert!(matches!(handle.connect("alice").await, Err(SessionError::SelfConnect)));
        assert!(matches!(handle.connect("").await, Err(SessionError::InvalidName)));
        assert!(matches!(handle.hangup("bob").await, Err(SessionError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn config_reaches_existing_and_new_peers() {
        let (signal, wire) = MemorySignal::pair();
        let backend = MockBackend::new();
        let log = backend.log();
        let (session, handle, _events) = Session::new("alice", signal, backend);
        tokio::spawn(session.run());

        handle.connect("bob").await.unwrap();
        wire.send(Envelope::new(
            "",
            "",
            Config {
                ice_servers: vec![IceServer::open("stun:stun.devnet.test:3478")],
            },
        ))
        .unwrap();
        eventually(|| log.contains("bob: configure 1")).await;

        handle.connect("carol").await.unwrap();
        assert!(log.contains("carol: create_link 1"));
    }

    #[tokio::test]
    async fn inbound_candidate_creates_peer() {
        let (signal, wire) = MemorySignal::pair();
        let backend = MockBackend::new();
        let log = backend.log();
        let (session, handle, _events) = Session::new("alice", signal, backend);
        tokio::spawn(session.run());

        wire.send(Envelope::new("bob", "alice", Candidate::default())).unwrap();
        eventually(|| log.contains("bob: add_candidate")).await;
        assert_eq!(handle.peer_state("bob").await.unwrap(), Some(PeerState::New));
    }

    #[tokio::test]
    async fn ignores_envelopes_for_other_names() {
        let (signal, wire) = MemorySignal::pair();
        let (session, handle, mut events) = Session::new("alice", signal, MockBackend::new());
        tokio::spawn(session.run());
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

        wire.send(Envelope::new("bob", "carol", SessionDescription::offer("v=0")))
            .unwrap();
        wire.send(Envelope::new("bob", "alice", SessionDescription::answer("v=0")))
            .unwrap();
        wire.send(Envelope::new("bob", "alice", Control::new("done"))).unwrap();

        // Inbound envelopes are handled in order, so both were dropped by now.
        assert!(matches!(next_event(&mut events).await, SessionEvent::Control { .. }));
        assert_eq!(handle.peer_state("bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn relayed_control_becomes_event() {
        let (signal, wire) = MemorySignal::pair();
        let (session, _handle, mut events) = Session::new("alice", signal, MockBackend::new());
        tokio::spawn(session.run());
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

        wire.send(Envelope::new("bob", "alice", Control::new("hello"))).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Control {
                remote: "bob".into(),
                data: "hello".into(),
            }
        );
    }

    #[tokio::test]
    async fn reconnect_replaces_peer_and_ignores_stale_events() {
        let (signal, _wire) = MemorySignal::pair();
        let backend = MockBackend::new();
        let log = backend.log();
        let (session, handle, mut events) = Session::new("alice", signal, backend);
        tokio::spawn(session.run());
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

        handle.connect("bob").await.unwrap();
        let stale = log.notifier("bob").unwrap();
        handle.connect("bob").await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::PeerDisconnected { remote: "bob".into() }
        );

        stale.notify(LinkEvent::Disconnected);
        assert_eq!(handle.peer_state("bob").await.unwrap(), Some(PeerState::OfferSent));
        assert_eq!(log.count("bob: create_offer"), 2);
    }

    #[tokio::test]
    async fn close_tears_down_and_ends_events() {
        let (signal, mut wire) = MemorySignal::pair();
        let backend = MockBackend::new();
        let log = backend.log();
        let (session, handle, mut events) = Session::new("alice", signal, backend);
        let task = tokio::spawn(session.run());
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

        handle.connect("bob").await.unwrap();
        handle.close().await.unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();

        assert!(log.contains("bob: close"));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::PeerDisconnected { remote: "bob".into() }
        );
        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
        assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());

        // The offer went out before the transport closed.
        assert!(matches!(next_sent(&mut wire).await.payload, Payload::SessionDescription(_)));
        assert!(matches!(handle.connect("bob").await, Err(SessionError::Closed)));
    }
}
