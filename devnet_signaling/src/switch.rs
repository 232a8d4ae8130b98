//! Name-keyed envelope routing
//!
//! The [`Switch`] owns the table of connected clients. It runs as a single
//! task and is the only code that reads or writes the table; connections talk
//! to it through a cloneable [`SwitchHandle`], so routing needs no locks.
//!
//! Delivery never waits on a client: each client has a bounded mailbox and a
//! client whose mailbox is full is dropped from the table instead.

use crate::error::SignalingError;
use devnet_protocol::Envelope;
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Capacity of the switch inbox shared by all connections
const COMMAND_CAPACITY: usize = 1024;

/// Connection record held by the switch
///
/// The switch keeps the only sender of the client's mailbox. Dropping the
/// record closes the mailbox, which ends the client's write pump.
#[derive(Debug)]
pub struct ClientHandle {
    id: Uuid,
    name: String,
    mailbox: mpsc::Sender<Envelope>,
}

impl ClientHandle {
    pub fn new(id: Uuid, name: impl Into<String>, mailbox: mpsc::Sender<Envelope>) -> Self {
        Self {
            id,
            name: name.into(),
            mailbox,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

enum Command {
    Register(ClientHandle),
    Unregister { id: Uuid, name: String },
    Forward(Envelope),
    Clients(oneshot::Sender<Vec<String>>),
    Shutdown,
}

/// The routing loop
pub struct Switch {
    clients: HashMap<String, ClientHandle>,
    commands: mpsc::Receiver<Command>,
}

/// Entry point into a running [`Switch`]
#[derive(Clone)]
pub struct SwitchHandle {
    commands: mpsc::Sender<Command>,
}

impl Switch {
    /// Create a switch and the handle used to reach it
    pub fn new() -> (Switch, SwitchHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let switch = Switch {
            clients: HashMap::new(),
            commands: rx,
        };
        (switch, SwitchHandle { commands: tx })
    }

    /// Process registrations, unregistrations and forwards until shut down
    /// or until every handle is gone
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register(client) => self.register(client),
                Command::Unregister { id, name } => self.unregister(id, &name),
                Command::Forward(envelope) => self.forward(envelope),
                Command::Clients(reply) => {
                    let mut names: Vec<String> = self.clients.keys().cloned().collect();
                    names.sort();
                    let _ = reply.send(names);
                }
                Command::Shutdown => {
                    self.shutdown();
                    break;
                }
            }
        }
        debug!("switch stopped");
    }

    fn register(&mut self, client: ClientHandle) {
        info!(user = %client.name, id = %client.id, "registering client");
        if let Some(previous) = self.clients.insert(client.name.clone(), client) {
            // Last writer wins; dropping the old record closes its mailbox.
            info!(user = %previous.name, id = %previous.id, "replaced existing connection");
        }
    }

    fn unregister(&mut self, id: Uuid, name: &str) {
        match self.clients.get(name) {
            Some(client) if client.id == id => {
                info!(user = %name, %id, "unregistering client");
                self.clients.remove(name);
            }
            Some(_) => {
                debug!(user = %name, %id, "connection already replaced, ignoring unregister");
            }
            None => {}
        }
    }

    fn forward(&mut self, envelope: Envelope) {
        let Some(client) = self.clients.get(&envelope.dst) else {
            trace!(src = %envelope.src, dst = %envelope.dst, "client absent, discarding message");
            return;
        };

        trace!(
            src = %envelope.src,
            dst = %envelope.dst,
            payload = envelope.payload.kind(),
            "forwarding message"
        );
        let (id, dst) = (client.id, envelope.dst.clone());
        match client.mailbox.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(user = %dst, "mailbox full, dropping slow client");
                self.unregister(id, &dst);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user = %dst, "mailbox closed");
                self.unregister(id, &dst);
            }
        }
    }

    fn shutdown(&mut self) {
        for (name, client) in self.clients.drain() {
            info!(user = %name, id = %client.id, "unregistering client");
        }
    }
}

impl SwitchHandle {
    /// Add a connection to the table, replacing any connection with the
    /// same name
    pub async fn register(&self, client: ClientHandle) -> Result<(), SignalingError> {
        self.send(Command::Register(client)).await
    }

    /// Remove the connection `id` registered as `name`
    ///
    /// Does nothing if a newer connection has taken over the name.
    pub async fn unregister(&self, id: Uuid, name: impl Into<String>) {
        let name = name.into();
        if self.send(Command::Unregister { id, name }).await.is_err() {
            debug!("switch gone, nothing to unregister");
        }
    }

    /// Hand an envelope to the switch for delivery to `envelope.dst`
    pub async fn forward(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.send(Command::Forward(envelope)).await
    }

    /// Names of the currently registered clients, sorted
    pub async fn clients(&self) -> Result<Vec<String>, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Clients(tx)).await?;
        rx.await.map_err(|_| SignalingError::SwitchClosed)
    }

    /// Unregister every client and stop the loop
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> Result<(), SignalingError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SignalingError::SwitchClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devnet_protocol::{Control, Payload};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn start() -> SwitchHandle {
        let (switch, handle) = Switch::new();
        tokio::spawn(switch.run());
        handle
    }

    async fn connect(
        handle: &SwitchHandle,
        name: &str,
        capacity: usize,
    ) -> (Uuid, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = Uuid::new_v4();
        handle.register(ClientHandle::new(id, name, tx)).await.unwrap();
        (id, rx)
    }

    fn control(src: &str, dst: &str, data: &str) -> Envelope {
        Envelope::new(src, dst, Control::new(data))
    }

    #[tokio::test]
    async fn delivers_to_registered_destination() {
        let switch = start();
        let (_, mut alice) = connect(&switch, "alice", 8).await;
        let (_, mut bob) = connect(&switch, "bob", 8).await;

        let envelope = control("alice", "bob", "ping");
        switch.forward(envelope.clone()).await.unwrap();

        let received = timeout(WAIT, bob.recv()).await.unwrap().unwrap();
        assert_eq!(received, envelope);
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn discards_messages_for_absent_clients() {
        let switch = start();
        let (_, mut bob) = connect(&switch, "bob", 8).await;

        switch.forward(control("alice", "carol", "lost")).await.unwrap();
        switch.forward(control("alice", "bob", "kept")).await.unwrap();

        let received = timeout(WAIT, bob.recv()).await.unwrap().unwrap();
        assert_eq!(received.payload, Payload::Control(Control::new("kept")));
        assert_eq!(switch.clients().await.unwrap(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn newer_connection_replaces_older() {
        let switch = start();
        let (_, mut first) = connect(&switch, "alice", 8).await;
        let (_, mut second) = connect(&switch, "alice", 8).await;

        // The replaced mailbox is closed.
        assert!(timeout(WAIT, first.recv()).await.unwrap().is_none());

        switch.forward(control("bob", "alice", "hi")).await.unwrap();
        let received = timeout(WAIT, second.recv()).await.unwrap().unwrap();
        assert_eq!(received.src, "bob");
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_connection() {
        let switch = start();
        let (old_id, _old) = connect(&switch, "alice", 8).await;
        let (_, mut current) = connect(&switch, "alice", 8).await;

        switch.unregister(old_id, "alice").await;
        switch.forward(control("bob", "alice", "still here")).await.unwrap();

        assert!(timeout(WAIT, current.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unregister_closes_mailbox() {
        let switch = start();
        let (id, mut alice) = connect(&switch, "alice", 8).await;

        switch.unregister(id, "alice").await;

        assert!(timeout(WAIT, alice.recv()).await.unwrap().is_none());
        assert!(switch.clients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_client_is_dropped_without_stalling_others() {
        let switch = start();
        let (_, mut slow) = connect(&switch, "slow", 1).await;
        let (_, mut fast) = connect(&switch, "fast", 16).await;

        for i in 0..4 {
            switch.forward(control("src", "slow", &format!("s{i}"))).await.unwrap();
            switch.forward(control("src", "fast", &format!("f{i}"))).await.unwrap();
        }

        for i in 0..4 {
            let received = timeout(WAIT, fast.recv()).await.unwrap().unwrap();
            assert_eq!(received.payload, Payload::Control(Control::new(format!("f{i}"))));
        }

        // The slow client got the message that fit, then its mailbox closed.
        let first = timeout(WAIT, slow.recv()).await.unwrap().unwrap();
        assert_eq!(first.payload, Payload::Control(Control::new("s0")));
        assert!(timeout(WAIT, slow.recv()).await.unwrap().is_none());
        assert_eq!(switch.clients().await.unwrap(), vec!["fast".to_string()]);
    }

    #[tokio::test]
    async fn preserves_order_per_source() {
        let switch = start();
        let (_, mut bob) = connect(&switch, "bob", 64).await;

        for i in 0..32 {
            switch.forward(control("alice", "bob", &i.to_string())).await.unwrap();
        }
        for i in 0..32 {
            let received = timeout(WAIT, bob.recv()).await.unwrap().unwrap();
            assert_eq!(received.payload, Payload::Control(Control::new(i.to_string())));
        }
    }

    #[tokio::test]
    async fn shutdown_closes_every_mailbox() {
        let switch = start();
        let (_, mut alice) = connect(&switch, "alice", 8).await;
        let (_, mut bob) = connect(&switch, "bob", 8).await;

        switch.shutdown().await;

        assert!(timeout(WAIT, alice.recv()).await.unwrap().is_none());
        assert!(timeout(WAIT, bob.recv()).await.unwrap().is_none());
        assert!(matches!(switch.clients().await, Err(SignalingError::SwitchClosed)));
    }
}
