use devnet_protocol::{Envelope, Payload, SdpKind};
use devnet_socket::testing::{MemorySignal, MockBackend, MockLog};
use devnet_socket::{LinkEvent, PeerState, Session, SessionEvent, SessionHandle, Signaler, StreamKind};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Side {
    handle: SessionHandle,
    events: mpsc::Receiver<SessionEvent>,
    log: MockLog,
    wire: MemorySignal,
}

fn side(name: &str) -> Side {
    let (signal, wire) = MemorySignal::pair();
    let backend = MockBackend::new().auto_connect();
    let log = backend.log();
    let (session, handle, events) = Session::new(name, signal, backend);
    tokio::spawn(session.run());
    Side {
        handle,
        events,
        log,
        wire,
    }
}

/// Forward everything between two wires, standing in for the server
fn relay(mut a: MemorySignal, mut b: MemorySignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(envelope) = a.recv() => { let _ = b.send(envelope); }
                Some(envelope) = b.recv() => { let _ = a.send(envelope); }
                else => break,
            }
        }
    })
}

async fn expect_event(events: &mut mpsc::Receiver<SessionEvent>, expected: SessionEvent) {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if event == expected => return,
                Some(_) => continue,
                None => panic!("event channel closed before {expected:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"));
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

/// Read envelopes off a wire until an offer shows up, keeping the rest
async fn take_offer(wire: &mut MemorySignal, held: &mut Vec<Envelope>) -> Envelope {
    timeout(WAIT, async {
        loop {
            let envelope = wire.recv().await.unwrap();
            match &envelope.payload {
                Payload::SessionDescription(d) if d.kind == SdpKind::Offer => return envelope,
                _ => held.push(envelope),
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn offer_answer_round_trip_connects_both_sides() {
    let Side {
        handle: alice,
        events: mut alice_events,
        log: alice_log,
        wire: alice_wire,
    } = side("alice");
    let Side {
        handle: bob,
        events: mut bob_events,
        log: bob_log,
        wire: bob_wire,
    } = side("bob");
    relay(alice_wire, bob_wire);

    alice.connect("bob").await.unwrap();

    expect_event(&mut alice_events, SessionEvent::PeerConnected { remote: "bob".into() }).await;
    expect_event(&mut bob_events, SessionEvent::PeerConnected { remote: "alice".into() }).await;
    assert_eq!(alice.peer_state("bob").await.unwrap(), Some(PeerState::Connected));
    assert_eq!(bob.peer_state("alice").await.unwrap(), Some(PeerState::Connected));

    // Each side applied the other's candidate.
    eventually(|| alice_log.contains("bob: add_candidate")).await;
    eventually(|| bob_log.contains("alice: add_candidate")).await;
    assert!(bob_log.contains("alice: accept_offer"));
    assert!(alice_log.contains("bob: apply_answer"));
}

#[tokio::test]
async fn simultaneous_offers_resolve_by_name() {
    let mut alice = side("alice");
    let mut bob = side("bob");

    alice.handle.connect("bob").await.unwrap();
    bob.handle.connect("alice").await.unwrap();

    // Both offers are in flight before either side sees the other's.
    let mut held = Vec::new();
    let alice_offer = take_offer(&mut alice.wire, &mut held).await;
    let bob_offer = take_offer(&mut bob.wire, &mut held).await;
    bob.wire.send(alice_offer).unwrap();
    alice.wire.send(bob_offer).unwrap();
    for envelope in held {
        let wire = if envelope.dst == "bob" { &bob.wire } else { &alice.wire };
        wire.send(envelope).unwrap();
    }
    relay(alice.wire, bob.wire);

    expect_event(&mut alice.events, SessionEvent::PeerConnected { remote: "bob".into() }).await;
    expect_event(&mut bob.events, SessionEvent::PeerConnected { remote: "alice".into() }).await;

    // "alice" sorts lower: her offer stands and bob yields.
    assert!(bob.log.contains("alice: rollback"));
    assert!(bob.log.contains("alice: accept_offer"));
    assert!(!alice.log.contains("bob: rollback"));
    assert!(!alice.log.contains("bob: accept_offer"));
    assert!(alice.log.contains("bob: apply_answer"));
}

#[tokio::test]
async fn control_and_streams_flow_once_connected() {
    let mut alice = side("alice");
    let mut bob = side("bob");
    relay(alice.wire, bob.wire);

    alice.handle.connect("bob").await.unwrap();
    alice.handle.start_stream("bob", StreamKind::Video).await.unwrap();
    assert!(!alice.log.contains("bob: start video outbound"));

    expect_event(&mut alice.events, SessionEvent::PeerConnected { remote: "bob".into() }).await;
    expect_event(&mut bob.events, SessionEvent::PeerConnected { remote: "alice".into() }).await;
    assert!(alice.log.contains("bob: start video outbound"));

    alice.handle.send_control("bob", "hello").await.unwrap();
    assert!(alice.log.contains("bob: send_control hello"));

    // The connectivity layer delivers the data and a remote track to bob.
    let link = bob.log.notifier("alice").unwrap();
    link.notify(LinkEvent::Control("hello".into()));
    link.notify(LinkEvent::TrackStarted(StreamKind::Video));
    expect_event(
        &mut bob.events,
        SessionEvent::Control {
            remote: "alice".into(),
            data: "hello".into(),
        },
    )
    .await;
    expect_event(
        &mut bob.events,
        SessionEvent::StreamStarted {
            remote: "alice".into(),
            kind: StreamKind::Video,
        },
    )
    .await;
    assert!(bob.log.contains("alice: start video inbound"));

    bob.handle.hangup("alice").await.unwrap();
    expect_event(
        &mut bob.events,
        SessionEvent::StreamEnded {
            remote: "alice".into(),
            kind: StreamKind::Video,
        },
    )
    .await;
    expect_event(&mut bob.events, SessionEvent::PeerDisconnected { remote: "alice".into() }).await;
    assert!(bob.log.contains("alice: stop video inbound"));
    assert_eq!(bob.handle.peer_state("alice").await.unwrap(), None);
}

#[tokio::test]
async fn lost_connectivity_removes_peer() {
    let mut alice = side("alice");
    let bob = side("bob");
    relay(alice.wire, bob.wire);

    alice.handle.connect("bob").await.unwrap();
    expect_event(&mut alice.events, SessionEvent::PeerConnected { remote: "bob".into() }).await;

    alice.log.notifier("bob").unwrap().notify(LinkEvent::Disconnected);
    expect_event(&mut alice.events, SessionEvent::PeerDisconnected { remote: "bob".into() }).await;
    assert_eq!(alice.handle.peer_state("bob").await.unwrap(), None);
    assert!(alice.log.contains("bob: close"));
}
