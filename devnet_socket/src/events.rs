//! Session events and their subscribers
//!
//! The session reports everything an application observes as a
//! [`SessionEvent`]. Applications either read the event channel directly or
//! hand it to [`Subscribers`], which calls the callbacks registered for each
//! [`EventKind`] in registration order.

use crate::media::StreamKind;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Something the application should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The signaling transport is up
    Connected,
    /// The signaling transport went down
    Disconnected,
    PeerConnected { remote: String },
    PeerDisconnected { remote: String },
    StreamStarted { remote: String, kind: StreamKind },
    StreamEnded { remote: String, kind: StreamKind },
    /// Application data from a remote peer
    Control { remote: String, data: String },
}

/// Tag of a [`SessionEvent`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    PeerConnected,
    PeerDisconnected,
    StreamStarted,
    StreamEnded,
    Control,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Connected => EventKind::Connected,
            SessionEvent::Disconnected => EventKind::Disconnected,
            SessionEvent::PeerConnected { .. } => EventKind::PeerConnected,
            SessionEvent::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            SessionEvent::StreamStarted { .. } => EventKind::StreamStarted,
            SessionEvent::StreamEnded { .. } => EventKind::StreamEnded,
            SessionEvent::Control { .. } => EventKind::Control,
        }
    }

    /// The remote peer the event concerns, if any
    pub fn remote(&self) -> Option<&str> {
        match self {
            SessionEvent::Connected | SessionEvent::Disconnected => None,
            SessionEvent::PeerConnected { remote }
            | SessionEvent::PeerDisconnected { remote }
            | SessionEvent::StreamStarted { remote, .. }
            | SessionEvent::StreamEnded { remote, .. }
            | SessionEvent::Control { remote, .. } => Some(remote),
        }
    }
}

pub type Subscriber = Box<dyn FnMut(&SessionEvent) + Send>;

/// Callbacks keyed by event kind
#[derive(Default)]
pub struct Subscribers {
    handlers: HashMap<EventKind, Vec<Subscriber>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`, after any already registered
    pub fn subscribe(&mut self, kind: EventKind, handler: impl FnMut(&SessionEvent) + Send + 'static) {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Call every handler registered for the event's kind; returns how many
    /// were called
    pub fn dispatch(&mut self, event: &SessionEvent) -> usize {
        match self.handlers.get_mut(&event.kind()) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(event);
                }
                handlers.len()
            }
            None => 0,
        }
    }

    /// Dispatch events until the session closes its event channel
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dispatches_by_kind_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subscribers = Subscribers::new();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            subscribers.subscribe(EventKind::PeerConnected, move |event| {
                seen.lock().unwrap().push(format!("{tag} {}", event.remote().unwrap()));
            });
        }

        let called = subscribers.dispatch(&SessionEvent::PeerConnected { remote: "bob".into() });
        assert_eq!(called, 2);
        assert_eq!(subscribers.dispatch(&SessionEvent::Connected), 0);
        assert_eq!(*seen.lock().unwrap(), vec!["first bob", "second bob"]);
    }

    #[tokio::test]
    async fn run_stops_when_channel_closes() {
        let count = Arc::new(Mutex::new(0));
        let mut subscribers = Subscribers::new();
        let counter = count.clone();
        subscribers.subscribe(EventKind::StreamStarted, move |_| *counter.lock().unwrap() += 1);

        let (tx, rx) = mpsc::channel(4);
        tx.send(SessionEvent::StreamStarted {
            remote: "bob".into(),
            kind: StreamKind::Video,
        })
        .await
        .unwrap();
        tx.send(SessionEvent::Disconnected).await.unwrap();
        drop(tx);

        subscribers.run(rx).await;
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
