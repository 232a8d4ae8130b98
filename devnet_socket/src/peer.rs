//! Negotiation with one remote peer
//!
//! ```text
//! New --connect--> OfferSent --answer--> Answered --link up--> Connected
//! New --offer--> OfferReceived --answer sent--> Answered
//! any --link down / hangup--> Closed
//! any --negotiation error / link failure--> Failed
//! ```
//!
//! Every transition happens in this module. Signaling messages drive all of
//! them except `Connected`, which only the connectivity layer reports.
//!
//! When both sides send an offer at once, the side whose own name sorts
//! lower keeps its offer and ignores the inbound one. The other side rolls
//! its offer back and answers.

use crate::error::{MediaError, NegotiationError};
use crate::events::SessionEvent;
use crate::link::{Link, LinkEvent, PeerHandle};
use crate::media::{Direction, MediaStream, OutputTarget, SampleHandler, StreamKind};
use devnet_protocol::{Candidate, Envelope, IceServer, Payload, SdpKind, SessionDescription};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Where a negotiation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    New,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    /// True for the states a peer never leaves
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::OfferSent => "offer-sent",
            PeerState::OfferReceived => "offer-received",
            PeerState::Answered => "answered",
            PeerState::Connected => "connected",
            PeerState::Closed => "closed",
            PeerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Negotiation state, link and media bindings for one remote name
pub struct Peer {
    local: String,
    handle: PeerHandle,
    state: PeerState,
    link: Box<dyn Link>,
    streams: Vec<Box<dyn MediaStream>>,
    targets: HashMap<StreamKind, OutputTarget>,
    sample_handlers: HashMap<StreamKind, Vec<SampleHandler>>,
    remote_tracks: Vec<StreamKind>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl Peer {
    /// Envelopes the peer produces are queued on `outbox`
    pub fn new(
        local: impl Into<String>,
        handle: PeerHandle,
        link: Box<dyn Link>,
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            local: local.into(),
            handle,
            state: PeerState::New,
            link,
            streams: Vec::new(),
            targets: HashMap::new(),
            sample_handlers: HashMap::new(),
            remote_tracks: Vec::new(),
            outbox,
        }
    }

    pub fn remote(&self) -> &str {
        &self.handle.remote
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Create an offer and send it
    pub async fn connect(&mut self) -> Result<(), NegotiationError> {
        match self.state {
            PeerState::New => {}
            state if state.is_terminal() => return Err(NegotiationError::Closed),
            state => return Err(NegotiationError::InProgress(state)),
        }

        let offer = self.link.create_offer().await?;
        self.transmit(offer);
        self.transition(PeerState::OfferSent);
        Ok(())
    }

    /// Apply an inbound offer or answer
    pub async fn handle_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        match (description.kind, self.state) {
            (_, state) if state.is_terminal() => Err(NegotiationError::Closed),
            (SdpKind::Offer, PeerState::OfferSent) if self.local < self.handle.remote => {
                debug!(remote = %self.handle.remote, "offer collision, keeping local offer");
                Ok(())
            }
            (SdpKind::Offer, PeerState::OfferSent) => {
                debug!(remote = %self.handle.remote, "offer collision, yielding to remote offer");
                self.link.rollback().await?;
                self.answer(description).await
            }
            (SdpKind::Offer, _) => self.answer(description).await,
            (SdpKind::Answer, PeerState::OfferSent) => {
                self.link.apply_answer(description).await?;
                self.transition(PeerState::Answered);
                Ok(())
            }
            (SdpKind::Answer, state) => Err(NegotiationError::UnexpectedDescription {
                kind: SdpKind::Answer,
                state,
            }),
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        // A connected peer renegotiates in place.
        let renegotiating = self.state == PeerState::Connected;
        if !renegotiating {
            self.transition(PeerState::OfferReceived);
        }
        let answer = self.link.accept_offer(offer).await?;
        self.transmit(answer);
        if !renegotiating {
            self.transition(PeerState::Answered);
        }
        Ok(())
    }

    /// Apply a remote candidate; ignored once the peer is closed
    pub async fn handle_candidate(&mut self, candidate: Candidate) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            trace!(remote = %self.handle.remote, "ignoring candidate for closed peer");
            return Ok(());
        }
        self.link.add_candidate(candidate).await
    }

    /// Servers for future connectivity checks
    pub fn configure(&mut self, ice_servers: &[IceServer]) {
        if !self.state.is_terminal() {
            self.link.configure(ice_servers);
        }
    }

    /// Apply a connectivity layer event, returning what the application
    /// should be told
    pub async fn handle_link_event(&mut self, event: LinkEvent) -> Vec<SessionEvent> {
        if self.state.is_terminal() {
            trace!(remote = %self.handle.remote, ?event, "ignoring link event for closed peer");
            return Vec::new();
        }

        let remote = self.handle.remote.clone();
        match event {
            LinkEvent::Connected => match self.state {
                PeerState::OfferReceived | PeerState::Answered => {
                    self.transition(PeerState::Connected);
                    self.start_outbound();
                    vec![SessionEvent::PeerConnected { remote }]
                }
                state => {
                    debug!(%remote, %state, "ignoring connectivity report");
                    Vec::new()
                }
            },
            LinkEvent::Disconnected => self.finish(PeerState::Closed).await,
            LinkEvent::Failed(reason) => {
                warn!(%remote, %reason, "link failed");
                self.finish(PeerState::Failed).await
            }
            LinkEvent::LocalCandidate(candidate) => {
                self.transmit(candidate);
                Vec::new()
            }
            LinkEvent::Control(data) => vec![SessionEvent::Control { remote, data }],
            LinkEvent::TrackStarted(kind) => {
                self.remote_tracks.push(kind);
                vec![SessionEvent::StreamStarted { remote, kind }]
            }
            LinkEvent::TrackEnded(kind) => match self.remote_tracks.iter().position(|k| *k == kind) {
                Some(index) => {
                    self.remote_tracks.remove(index);
                    self.stop_bindings(kind, Direction::Inbound);
                    vec![SessionEvent::StreamEnded { remote, kind }]
                }
                None => Vec::new(),
            },
        }
    }

    /// Send application data on the link's control channel
    pub fn send_control(&mut self, data: &str) -> Result<(), NegotiationError> {
        match self.state {
            PeerState::Connected => self.link.send_control(data),
            state if state.is_terminal() => Err(NegotiationError::Closed),
            _ => Err(NegotiationError::NotConnected),
        }
    }

    /// Attach a media binding
    ///
    /// Inbound bindings start immediately; outbound ones start now if the
    /// peer is connected, otherwise when it connects.
    pub fn add_stream(&mut self, mut stream: Box<dyn MediaStream>) -> Result<(), MediaError> {
        let kind = stream.kind();
        if stream.direction() == Direction::Inbound {
            if let Some(target) = self.targets.get(&kind) {
                stream.set_output_target(target.clone())?;
            }
        }
        for handler in self.sample_handlers.get(&kind).into_iter().flatten() {
            stream.on_sample(handler.clone());
        }

        let start_now = match stream.direction() {
            Direction::Inbound => true,
            Direction::Outbound => self.state == PeerState::Connected,
        };
        if start_now {
            stream.start()?;
        }
        self.streams.push(stream);
        Ok(())
    }

    /// Stop and detach the outbound bindings of `kind`
    pub fn stop_stream(&mut self, kind: StreamKind) -> Result<(), MediaError> {
        if self.stop_bindings(kind, Direction::Outbound) == 0 {
            return Err(MediaError::NoStream(kind));
        }
        Ok(())
    }

    /// Render inbound `kind` streams to `target`, now and when they appear
    pub fn set_output_target(&mut self, kind: StreamKind, target: OutputTarget) -> Result<(), MediaError> {
        for stream in self
            .streams
            .iter_mut()
            .filter(|s| s.kind() == kind && s.direction() == Direction::Inbound)
        {
            stream.set_output_target(target.clone())?;
        }
        self.targets.insert(kind, target);
        Ok(())
    }

    /// Observe samples of `kind`, now and on bindings attached later
    pub fn on_sample(&mut self, kind: StreamKind, handler: SampleHandler) {
        for stream in self.streams.iter_mut().filter(|s| s.kind() == kind) {
            stream.on_sample(handler.clone());
        }
        self.sample_handlers.entry(kind).or_default().push(handler);
    }

    /// Close the link and stop every binding
    pub async fn close(&mut self) -> Vec<SessionEvent> {
        self.finish(PeerState::Closed).await
    }

    /// Abandon the negotiation after an error
    pub async fn fail(&mut self, error: &NegotiationError) -> Vec<SessionEvent> {
        warn!(remote = %self.handle.remote, %error, "negotiation failed");
        self.finish(PeerState::Failed).await
    }

    async fn finish(&mut self, state: PeerState) -> Vec<SessionEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.transition(state);

        for stream in self.streams.iter_mut() {
            if let Err(err) = stream.stop() {
                warn!(remote = %self.handle.remote, kind = %stream.kind(), error = %err, "stop stream");
            }
        }
        self.streams.clear();
        self.link.close().await;

        let remote = self.handle.remote.clone();
        let mut events: Vec<SessionEvent> = self
            .remote_tracks
            .drain(..)
            .map(|kind| SessionEvent::StreamEnded {
                remote: remote.clone(),
                kind,
            })
            .collect();
        events.push(SessionEvent::PeerDisconnected { remote });
        events
    }

    fn start_outbound(&mut self) {
        for stream in self
            .streams
            .iter_mut()
            .filter(|s| s.direction() == Direction::Outbound)
        {
            if let Err(err) = stream.start() {
                warn!(remote = %self.handle.remote, kind = %stream.kind(), error = %err, "start stream");
            }
        }
    }

    fn stop_bindings(&mut self, kind: StreamKind, direction: Direction) -> usize {
        let remote = &self.handle.remote;
        let before = self.streams.len();
        self.streams.retain_mut(|stream| {
            if stream.kind() != kind || stream.direction() != direction {
                return true;
            }
            if let Err(err) = stream.stop() {
                warn!(%remote, %kind, error = %err, "stop stream");
            }
            false
        });
        before - self.streams.len()
    }

    fn transmit(&self, payload: impl Into<Payload>) {
        let envelope = Envelope::new(self.local.as_str(), self.handle.remote.as_str(), payload);
        if self.outbox.send(envelope).is_err() {
            debug!(remote = %self.handle.remote, "session gone, dropping message");
        }
    }

    fn transition(&mut self, next: PeerState) {
        debug!(remote = %self.handle.remote, from = %self.state, to = %next, "peer state");
        self.state = next;
    }
}
