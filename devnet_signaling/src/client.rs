//! Per-connection actor
//!
//! A [`Client`] pairs one authenticated WebSocket with one mailbox in the
//! switch. The read pump decodes frames and hands envelopes to the switch;
//! the write pump drains the mailbox onto the socket.

use crate::switch::{ClientHandle, SwitchHandle};
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use devnet_protocol::{Config, Envelope};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Server side of one connection
pub struct Client {
    id: Uuid,
    name: String,
    sender: mpsc::Sender<Envelope>,
    mailbox: mpsc::Receiver<Envelope>,
}

impl Client {
    /// Create a client for the authenticated `name` with a mailbox holding
    /// up to `capacity` pending envelopes
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, mailbox) = mpsc::channel(capacity.max(1));
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            sender,
            mailbox,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write end of the mailbox
    pub fn send(&self) -> &mpsc::Sender<Envelope> {
        &self.sender
    }

    /// Register with the switch and pump messages until the connection ends
    ///
    /// The `config` envelope is queued before registration, so it is always
    /// the first thing the remote side receives.
    pub async fn attach(self, socket: WebSocket, switch: SwitchHandle, config: Config) {
        let Client {
            id,
            name,
            sender,
            mailbox,
        } = self;

        if sender.try_send(Envelope::new("", "", config)).is_err() {
            warn!(user = %name, "failed to queue config");
        }
        // The switch now holds the only sender.
        if switch.register(ClientHandle::new(id, name.clone(), sender)).await.is_err() {
            warn!(user = %name, "switch not running, dropping connection");
            return;
        }

        let (sink, stream) = socket.split();
        tokio::select! {
            _ = read_pump(stream, &switch, &name) => trace!(user = %name, "read pump stopped"),
            _ = write_pump(sink, mailbox, &name) => trace!(user = %name, "write pump stopped"),
        }

        switch.unregister(id, name.as_str()).await;
        info!(user = %name, "connection closed");
    }
}

/// Decode frames and forward them until the socket closes
///
/// A malformed frame is logged and skipped; it does not end the connection.
/// The sender name is always the authenticated one.
pub(crate) async fn read_pump<S, E>(mut stream: S, switch: &SwitchHandle, name: &str)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(user = %name, error = %err, "read message");
                break;
            }
        };

        let decoded = match frame {
            Message::Text(text) => Envelope::from_str(text.as_str()),
            Message::Binary(data) => Envelope::from_slice(&data),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        let mut envelope = match decoded {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(user = %name, error = %err, "dropping malformed frame");
                continue;
            }
        };

        if envelope.src != name {
            debug!(user = %name, claimed = %envelope.src, "rewriting sender");
            envelope.src = name.to_string();
        }
        if switch.forward(envelope).await.is_err() {
            break;
        }
    }
}

/// Write mailbox contents to the socket until the mailbox closes, then say
/// goodbye so the remote side reconnects
pub(crate) async fn write_pump<S>(mut sink: S, mut mailbox: mpsc::Receiver<Envelope>, name: &str)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(envelope) = mailbox.recv().await {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(user = %name, error = %err, "encode message");
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Text(text.into())).await {
            warn!(user = %name, error = %err, "write message");
            return;
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(""),
    }));
    if let Err(err) = sink.send(close).await {
        debug!(user = %name, error = %err, "write close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::Switch;
    use devnet_protocol::{Control, Payload};
    use futures::channel::mpsc as fmpsc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn text(envelope: &Envelope) -> Result<Message, axum::Error> {
        Ok(Message::Text(envelope.to_string().into()))
    }

    async fn listen(switch: &SwitchHandle, name: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(8);
        switch
            .register(ClientHandle::new(Uuid::new_v4(), name, tx))
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn read_pump_skips_malformed_frames_and_stamps_sender() {
        let (switch, handle) = Switch::new();
        tokio::spawn(switch.run());
        let mut bob = listen(&handle, "bob").await;

        let frames = futures::stream::iter(vec![
            Ok(Message::Text("not json".into())),
            Ok(Message::Text(r#"{"src":"alice","dst":"bob"}"#.into())),
            text(&Envelope::new("mallory", "bob", Control::new("one"))),
            Ok(Message::Binary(
                Envelope::new("alice", "bob", Control::new("two")).to_string().into_bytes().into(),
            )),
            Ok(Message::Close(None)),
            text(&Envelope::new("alice", "bob", Control::new("after close"))),
        ]);
        read_pump(frames, &handle, "alice").await;

        let first = timeout(WAIT, bob.recv()).await.unwrap().unwrap();
        assert_eq!(first.src, "alice");
        assert_eq!(first.payload, Payload::Control(Control::new("one")));
        let second = timeout(WAIT, bob.recv()).await.unwrap().unwrap();
        assert_eq!(second.payload, Payload::Control(Control::new("two")));
        assert!(timeout(Duration::from_millis(50), bob.recv()).await.is_err());
    }

    #[tokio::test]
    async fn write_pump_drains_mailbox_then_closes() {
        let (tx, rx) = mpsc::channel(4);
        let (sink, mut frames) = fmpsc::unbounded::<Message>();

        tx.send(Envelope::new("alice", "bob", Control::new("ping"))).await.unwrap();
        drop(tx);
        write_pump(sink, rx, "bob").await;

        match frames.next().await {
            Some(Message::Text(text)) => {
                assert_eq!(text.as_str(), r#"{"src":"alice","dst":"bob","control":{"data":"ping"}}"#)
            }
            other => panic!("expected text frame, got {other:?}"),
        }
        match frames.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn new_client_has_open_mailbox() {
        let client = Client::new("alice", 0);
        assert_eq!(client.name(), "alice");
        assert!(!client.send().is_closed());
        assert_eq!(client.send().max_capacity(), 1);
    }
}
