use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use arkdrop_core::{
    Coordinator, CoordinatorHandle, Decision, DropConfig, DropError,
    DropProgressEvent, DropState, DropStateEvent, DropSubscriber,
    FsFileStore, MemoryFileStore, MemoryNetwork, MemoryTransport,
    PeersChangedEvent, TcpTransport, Transport,
};
use arkdrop_entities::{DropId, FailureReason, ManifestEntry, PeerId, PeerMetadata};
use arkdropx_common::{DataFrame, DropMessage};
use rstest::rstest;
use tokio::time::{Instant, sleep};

#[derive(Default)]
struct TestSubscriber {
    states: Mutex<Vec<DropStateEvent>>,
    progress: Mutex<Vec<DropProgressEvent>>,
    peers: Mutex<Vec<PeersChangedEvent>>,
}

impl TestSubscriber {
    fn states_of(&self, id: DropId) -> Vec<DropState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.id == id)
            .map(|e| e.state)
            .collect()
    }

    fn progress_of(&self, id: DropId) -> Vec<u64> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.id == id)
            .map(|e| e.bytes_transferred)
            .collect()
    }

    fn peer_notifications(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

impl DropSubscriber for TestSubscriber {
    fn get_id(&self) -> String {
        "test-subscriber".to_string()
    }

    fn notify_state(&self, event: DropStateEvent) {
        self.states.lock().unwrap().push(event);
    }

    fn notify_progress(&self, event: DropProgressEvent) {
        self.progress.lock().unwrap().push(event);
    }

    fn notify_peers(&self, event: PeersChangedEvent) {
        self.peers.lock().unwrap().push(event);
    }
}

struct Node {
    id: PeerId,
    handle: CoordinatorHandle,
    store: MemoryFileStore,
    events: Arc<TestSubscriber>,
}

impl Node {
    fn start(network: &MemoryNetwork, name: &str, config: DropConfig) -> Self {
        let (transport, inbound) = network.join(name, 64);
        let store = MemoryFileStore::new();
        let handle =
            Coordinator::start(config, transport, inbound, Arc::new(store.clone()))
                .unwrap();
        let events = Arc::new(TestSubscriber::default());
        handle.subscribe(events.clone());
        Self {
            id: PeerId::from(name),
            handle,
            store,
            events,
        }
    }

    async fn knows(&self, other: &Node) {
        self.handle
            .upsert_peer(PeerMetadata::new(
                other.id.clone(),
                other.id.to_string(),
                vec![],
            ))
            .await
            .unwrap();
    }

    fn state(&self, id: DropId) -> Option<DropState> {
        self.handle.get(id).map(|r| r.state)
    }
}

fn config() -> DropConfig {
    DropConfig {
        chunk_size: 32,
        ..DropConfig::default()
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

fn assert_valid_path(states: &[DropState]) {
    assert!(
        matches!(states.first(), Some(DropState::Created | DropState::Pending)),
        "path starts at {:?}",
        states.first()
    );
    for pair in states.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "invalid step {:?} -> {:?} in {states:?}",
            pair[0],
            pair[1]
        );
    }
}

fn accept_into(dir: &str) -> Decision {
    Decision::Accept {
        destination: PathBuf::from(dir),
    }
}

/// Alice offers one file to Bob and waits until Bob has the request.
async fn offer(alice: &Node, bob: &Node, size: usize) -> DropId {
    alice.store.add_source("payload", vec![7u8; size]);
    alice.knows(bob).await;
    let id = alice
        .handle
        .initiate_drop(
            bob.id.clone(),
            vec![ManifestEntry::new("payload", "payload.bin", size as u64)],
        )
        .await
        .unwrap();
    eventually("bob to see the request", || {
        bob.state(id) == Some(DropState::Pending)
    })
    .await;
    id
}

#[tokio::test]
async fn a_100_byte_file_goes_from_alice_to_bob() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());

    let id = offer(&alice, &bob, 100).await;
    assert_eq!(alice.state(id), Some(DropState::Pending));

    bob.handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap();
    eventually("both sides to complete", || {
        alice.state(id) == Some(DropState::Completed)
            && bob.state(id) == Some(DropState::Completed)
    })
    .await;

    assert_eq!(
        bob.store.committed(Path::new("/inbox/payload.bin")),
        Some(vec![7u8; 100])
    );
    assert_eq!(
        bob.handle.get(id).unwrap().destination_path,
        Some(PathBuf::from("/inbox"))
    );
    assert_eq!(alice.handle.get(id).unwrap().bytes_transferred, 100);
    assert_eq!(bob.handle.get(id).unwrap().bytes_transferred, 100);

    let alice_path = alice.events.states_of(id);
    let bob_path = bob.events.states_of(id);
    assert_eq!(
        alice_path,
        vec![
            DropState::Created,
            DropState::Pending,
            DropState::Accepted,
            DropState::InProgress,
            DropState::Completed
        ]
    );
    assert_eq!(
        bob_path,
        vec![
            DropState::Pending,
            DropState::Accepted,
            DropState::InProgress,
            DropState::Completed
        ]
    );
    assert_valid_path(&alice_path);
    assert_valid_path(&bob_path);

    let progress = bob.events.progress_of(id);
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn several_files_arrive_in_manifest_order() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());
    alice.knows(&bob).await;
    alice.store.add_source("one", b"first file".to_vec());
    alice.store.add_source("two", Vec::new());
    alice.store.add_source("three", vec![3u8; 1000]);

    let id = alice
        .handle
        .initiate_drop(
            bob.id.clone(),
            vec![
                ManifestEntry::new("one", "docs/one.txt", 10),
                ManifestEntry::new("two", "empty", 0),
                ManifestEntry::new("three", "three.bin", 1000),
            ],
        )
        .await
        .unwrap();
    eventually("bob to see the request", || bob.state(id).is_some()).await;
    bob.handle.respond_to_drop(id, accept_into("/in")).await.unwrap();
    eventually("completion", || {
        alice.state(id) == Some(DropState::Completed)
            && bob.state(id) == Some(DropState::Completed)
    })
    .await;

    assert_eq!(
        bob.store.committed_paths(),
        vec![
            PathBuf::from("/in/docs/one.txt"),
            PathBuf::from("/in/empty"),
            PathBuf::from("/in/three.bin")
        ]
    );
    assert_eq!(
        bob.store.committed(Path::new("/in/three.bin")),
        Some(vec![3u8; 1000])
    );
}

#[tokio::test]
async fn unknown_peer_is_rejected_and_nothing_is_created() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());

    let result = alice
        .handle
        .initiate_drop(
            PeerId::from("nobody"),
            vec![ManifestEntry::new("x", "x", 1)],
        )
        .await;

    assert_eq!(result, Err(DropError::UnknownPeer(PeerId::from("nobody"))));
    assert!(alice.handle.list().is_empty());
    assert!(alice.events.states.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_manifest_is_rejected() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());
    alice.knows(&bob).await;

    let result = alice.handle.initiate_drop(bob.id.clone(), vec![]).await;

    assert_eq!(result, Err(DropError::EmptyManifest));
    assert!(alice.handle.list().is_empty());
}

#[tokio::test]
async fn unreachable_receiver_fails_the_request() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());
    alice.knows(&bob).await;
    network.set_reachable(&bob.id, false);

    let id = alice
        .handle
        .initiate_drop(bob.id.clone(), vec![ManifestEntry::new("x", "x", 1)])
        .await
        .unwrap();

    let request = alice.handle.get(id).unwrap();
    assert_eq!(request.state, DropState::Failed);
    assert_eq!(request.failure, Some(FailureReason::TransportUnavailable));
    assert_eq!(
        alice.events.states_of(id),
        vec![DropState::Created, DropState::Failed]
    );
}

#[tokio::test]
async fn decline_reaches_the_sender() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());

    let id = offer(&alice, &bob, 10).await;
    bob.handle.respond_to_drop(id, Decision::Decline).await.unwrap();

    eventually("alice to see the decline", || {
        alice.state(id) == Some(DropState::Declined)
    })
    .await;
    assert_eq!(bob.state(id), Some(DropState::Declined));
    assert_eq!(
        alice.handle.get(id).unwrap().status_message(),
        "The drop was declined"
    );
}

#[tokio::test]
async fn sender_can_decline_its_own_pending_drop() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());

    let id = offer(&alice, &bob, 10).await;
    alice.handle.respond_to_drop(id, Decision::Decline).await.unwrap();

    assert_eq!(alice.state(id), Some(DropState::Declined));
    eventually("bob to see the decline", || {
        bob.state(id) == Some(DropState::Declined)
    })
    .await;
    assert_eq!(
        bob.events.states_of(id),
        vec![DropState::Pending, DropState::Declined]
    );
    assert!(matches!(
        bob.handle.respond_to_drop(id, accept_into("/inbox")).await,
        Err(DropError::InvalidState { .. })
    ));
    assert!(bob.store.committed_paths().is_empty());
}

#[tokio::test]
async fn only_the_receiver_can_accept_and_only_once() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());

    let id = offer(&alice, &bob, 100).await;

    let err = alice
        .handle
        .respond_to_drop(id, accept_into("/tmp"))
        .await
        .unwrap_err();
    assert!(matches!(err, DropError::InvalidState { .. }));

    bob.handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap();
    let err = bob
        .handle
        .respond_to_drop(id, accept_into("/elsewhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, DropError::InvalidState { .. }));

    eventually("completion", || {
        alice.state(id) == Some(DropState::Completed)
            && bob.state(id) == Some(DropState::Completed)
    })
    .await;
    let accepted = |states: Vec<DropState>| {
        states.iter().filter(|s| **s == DropState::Accepted).count()
    };
    assert_eq!(accepted(alice.events.states_of(id)), 1);
    assert_eq!(accepted(bob.events.states_of(id)), 1);
    assert_eq!(bob.store.committed_paths(), vec![PathBuf::from("/inbox/payload.bin")]);

    let err = bob
        .handle
        .respond_to_drop(DropId::new(), Decision::Decline)
        .await
        .unwrap_err();
    assert!(matches!(err, DropError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_expires_on_both_sides() {
    let network = MemoryNetwork::new();
    let quick = DropConfig {
        pending_timeout_ms: 1_000,
        ..config()
    };
    let alice = Node::start(&network, "alice", quick.clone());
    let bob = Node::start(&network, "bob", quick);

    let id = offer(&alice, &bob, 10).await;
    sleep(Duration::from_millis(1_500)).await;

    assert_eq!(alice.state(id), Some(DropState::Expired));
    assert_eq!(bob.state(id), Some(DropState::Expired));
    assert_eq!(
        alice.handle.get(id).unwrap().status_message(),
        "Nobody answered in time"
    );

    let err = bob
        .handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DropError::InvalidState {
            state: DropState::Expired,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn late_acceptance_is_dropped_by_the_expired_sender() {
    let network = MemoryNetwork::new();
    let alice = Node::start(
        &network,
        "alice",
        DropConfig {
            pending_timeout_ms: 1_000,
            ..config()
        },
    );
    let bob = Node::start(
        &network,
        "bob",
        DropConfig {
            pending_timeout_ms: 60_000,
            ..config()
        },
    );

    let id = offer(&alice, &bob, 10).await;
    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(alice.state(id), Some(DropState::Expired));
    assert_eq!(bob.state(id), Some(DropState::Pending));

    bob.handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap();
    eventually("bob to give up", || bob.state(id) == Some(DropState::Cancelled))
        .await;

    assert_eq!(alice.state(id), Some(DropState::Expired));
    assert_eq!(
        alice.events.states_of(id),
        vec![DropState::Created, DropState::Pending, DropState::Expired]
    );
    assert!(bob.store.committed_paths().is_empty());
    assert_eq!(bob.store.partial_count(), 0);
}

#[rstest]
#[case(999)]
#[case(1_000)]
#[case(1_001)]
#[tokio::test(start_paused = true)]
async fn expiry_racing_acceptance_has_one_outcome(#[case] answer_after_ms: u64) {
    let network = MemoryNetwork::new();
    let quick = DropConfig {
        pending_timeout_ms: 1_000,
        ..config()
    };
    let alice = Node::start(&network, "alice", quick.clone());
    let bob = Node::start(&network, "bob", quick);
    let id = offer(&alice, &bob, 10).await;

    sleep(Duration::from_millis(answer_after_ms)).await;
    let answer = bob.handle.respond_to_drop(id, accept_into("/inbox")).await;

    eventually("bob to settle", || {
        bob.state(id).is_some_and(|s| s.is_terminal())
    })
    .await;
    let states = bob.events.states_of(id);
    assert_valid_path(&states);
    let terminal: Vec<&DropState> =
        states.iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(terminal.len(), 1, "{states:?}");
    match answer {
        Ok(()) => assert_ne!(bob.state(id), Some(DropState::Expired)),
        Err(e) => {
            assert!(matches!(e, DropError::InvalidState { .. }));
            assert_eq!(bob.state(id), Some(DropState::Expired));
        }
    }
}

#[tokio::test]
async fn receiver_cancel_mid_transfer_removes_partial_data() {
    let network = MemoryNetwork::new();
    let slow = DropConfig {
        chunk_size: 1024,
        ..config()
    };
    let alice = Node::start(&network, "alice", slow.clone());
    let bob = Node::start(&network, "bob", slow);

    let id = offer(&alice, &bob, 8 * 1024 * 1024).await;
    bob.handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap();
    eventually("bytes to flow", || {
        bob.handle.get(id).is_some_and(|r| r.bytes_transferred > 0)
    })
    .await;

    bob.handle.cancel_drop(id).await.unwrap();
    bob.handle.cancel_drop(id).await.unwrap();

    eventually("both sides to cancel", || {
        alice.state(id) == Some(DropState::Cancelled)
            && bob.state(id) == Some(DropState::Cancelled)
    })
    .await;
    assert_eq!(bob.store.partial_count(), 0);
    assert!(bob.store.committed_paths().is_empty());
    assert!(bob.handle.get(id).unwrap().bytes_transferred < 8 * 1024 * 1024);
    assert_valid_path(&alice.events.states_of(id));
    assert_valid_path(&bob.events.states_of(id));
}

#[tokio::test]
async fn sender_cancel_mid_transfer_stops_the_receiver() {
    let network = MemoryNetwork::new();
    let slow = DropConfig {
        chunk_size: 1024,
        ..config()
    };
    let alice = Node::start(&network, "alice", slow.clone());
    let bob = Node::start(&network, "bob", slow);

    let id = offer(&alice, &bob, 8 * 1024 * 1024).await;
    bob.handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap();
    eventually("bytes to flow", || {
        alice.handle.get(id).is_some_and(|r| r.bytes_transferred > 0)
    })
    .await;

    alice.handle.cancel_drop(id).await.unwrap();

    eventually("both sides to cancel", || {
        alice.state(id) == Some(DropState::Cancelled)
            && bob.state(id) == Some(DropState::Cancelled)
    })
    .await;
    assert_eq!(bob.store.partial_count(), 0);
    assert!(bob.store.committed_paths().is_empty());
}

#[tokio::test]
async fn receiver_write_failure_fails_both_sides() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());

    let id = offer(&alice, &bob, 100).await;
    bob.store.fail_writes(true);
    bob.handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap();

    eventually("both sides to fail", || {
        alice.state(id) == Some(DropState::Failed)
            && bob.state(id) == Some(DropState::Failed)
    })
    .await;
    assert!(matches!(
        bob.handle.get(id).unwrap().failure,
        Some(FailureReason::IoError(_))
    ));
    assert!(matches!(
        alice.handle.get(id).unwrap().failure,
        Some(FailureReason::IoError(_))
    ));
    assert_eq!(bob.store.partial_count(), 0);
}

#[tokio::test]
async fn cancel_is_idempotent_and_respects_terminal_states() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());

    let id = offer(&alice, &bob, 10).await;
    alice.handle.cancel_drop(id).await.unwrap();
    alice.handle.cancel_drop(id).await.unwrap();
    eventually("bob to see the cancel", || {
        bob.state(id) == Some(DropState::Cancelled)
    })
    .await;
    assert_eq!(
        alice.events.states_of(id),
        vec![DropState::Created, DropState::Pending, DropState::Cancelled]
    );

    let declined = offer(&alice, &bob, 10).await;
    bob.handle
        .respond_to_drop(declined, Decision::Decline)
        .await
        .unwrap();
    let err = bob.handle.cancel_drop(declined).await.unwrap_err();
    assert!(matches!(
        err,
        DropError::InvalidState {
            state: DropState::Declined,
            ..
        }
    ));

    let err = alice.handle.cancel_drop(DropId::new()).await.unwrap_err();
    assert!(matches!(err, DropError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn terminal_requests_are_evicted_after_the_grace_period() {
    let network = MemoryNetwork::new();
    let short = DropConfig {
        terminal_grace_ms: 500,
        ..config()
    };
    let alice = Node::start(&network, "alice", short.clone());
    let bob = Node::start(&network, "bob", short);

    let id = offer(&alice, &bob, 10).await;
    alice.handle.cancel_drop(id).await.unwrap();
    assert_eq!(alice.handle.list().len(), 1);

    sleep(Duration::from_secs(1)).await;
    assert!(alice.handle.get(id).is_none());
    assert!(alice.handle.list().is_empty());

    // Evicted but remembered.
    alice.handle.cancel_drop(id).await.unwrap();
}

#[tokio::test]
async fn messages_from_strangers_are_dropped() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());
    let (mallory, _mallory_in): (MemoryTransport, _) = network.join("mallory", 8);

    let id = offer(&alice, &bob, 10).await;
    mallory
        .send(
            &alice.id,
            &[],
            DropMessage::Accept {
                id,
                destination_ack: "/stolen".into(),
            },
        )
        .await
        .unwrap();
    mallory
        .send(
            &bob.id,
            &[],
            DropMessage::RequestDrop {
                id: DropId::new(),
                manifest: vec![ManifestEntry::new("x", "x", 1)],
                sender_peer_id: alice.id.clone(),
            },
        )
        .await
        .unwrap();

    sleep(Duration::from_millis(50)).await;
    alice.handle.cancel_drop(id).await.unwrap();
    eventually("bob to see the cancel", || {
        bob.state(id) == Some(DropState::Cancelled)
    })
    .await;
    assert_eq!(
        alice.events.states_of(id),
        vec![DropState::Created, DropState::Pending, DropState::Cancelled]
    );
    assert_eq!(bob.handle.list().len(), 1);
}

#[tokio::test]
async fn duplicate_requests_are_ignored() {
    let network = MemoryNetwork::new();
    let bob = Node::start(&network, "bob", config());
    let (mallory, _mallory_in) = network.join("mallory", 8);

    let id = DropId::new();
    let request = DropMessage::RequestDrop {
        id,
        manifest: vec![ManifestEntry::new("x", "x", 1)],
        sender_peer_id: PeerId::from("mallory"),
    };
    mallory.send(&bob.id, &[], request.clone()).await.unwrap();
    mallory.send(&bob.id, &[], request).await.unwrap();
    mallory
        .send(
            &bob.id,
            &[],
            DropMessage::RequestDrop {
                id: DropId::new(),
                manifest: vec![],
                sender_peer_id: PeerId::from("mallory"),
            },
        )
        .await
        .unwrap();

    eventually("bob to see the request", || bob.state(id).is_some()).await;
    bob.handle.cancel_drop(id).await.unwrap();
    assert_eq!(bob.handle.list().len(), 1);
    assert_eq!(bob.events.states_of(id), vec![DropState::Pending, DropState::Cancelled]);
}

#[tokio::test]
async fn repeated_control_messages_apply_once() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let (bob, _bob_in) = network.join("bob", 64);
    alice.store.add_source("payload", vec![5u8; 10]);
    alice
        .handle
        .upsert_peer(PeerMetadata::new(PeerId::from("bob"), "bob", vec![]))
        .await
        .unwrap();

    let id = alice
        .handle
        .initiate_drop(
            PeerId::from("bob"),
            vec![ManifestEntry::new("payload", "payload.bin", 10)],
        )
        .await
        .unwrap();
    let mut channel = bob.accept_data_channel(&alice.id, id).unwrap();
    let accept = DropMessage::Accept {
        id,
        destination_ack: "/inbox".into(),
    };
    bob.send(&alice.id, &[], accept.clone()).await.unwrap();
    bob.send(&alice.id, &[], accept).await.unwrap();

    let mut received = Vec::new();
    loop {
        match channel.recv().await {
            Some(DataFrame::Chunk { data, .. }) => received.extend(data),
            Some(DataFrame::FileEnd { .. }) => break,
            None => panic!("data channel closed early"),
        }
    }
    assert_eq!(received, vec![5u8; 10]);

    let progress = DropMessage::Progress {
        id,
        bytes_transferred: 10,
    };
    bob.send(&alice.id, &[], progress.clone()).await.unwrap();
    bob.send(&alice.id, &[], progress).await.unwrap();
    bob.send(&alice.id, &[], DropMessage::Complete { id }).await.unwrap();
    bob.send(&alice.id, &[], DropMessage::Complete { id }).await.unwrap();
    bob.send(
        &alice.id,
        &[],
        DropMessage::Fail {
            id,
            reason: FailureReason::NetworkError("late".into()),
        },
    )
    .await
    .unwrap();

    eventually("alice to complete", || {
        alice.state(id) == Some(DropState::Completed)
    })
    .await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        alice.events.states_of(id),
        vec![
            DropState::Created,
            DropState::Pending,
            DropState::Accepted,
            DropState::InProgress,
            DropState::Completed,
        ]
    );
    let request = alice.handle.get(id).unwrap();
    assert_eq!(request.failure, None);
    assert_eq!(request.bytes_transferred, 10);
    assert_eq!(alice.events.progress_of(id), vec![10]);
}

#[tokio::test]
async fn overflowing_manifest_is_dropped_and_the_node_keeps_working() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());
    let (mallory, _mallory_in) = network.join("mallory", 8);

    let bogus = DropId::new();
    mallory
        .send(
            &bob.id,
            &[],
            DropMessage::RequestDrop {
                id: bogus,
                manifest: vec![
                    ManifestEntry::new("a", "a", u64::MAX),
                    ManifestEntry::new("b", "b", 1),
                ],
                sender_peer_id: PeerId::from("mallory"),
            },
        )
        .await
        .unwrap();
    mallory
        .send(&bob.id, &[], DropMessage::Cancel { id: bogus })
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(bob.state(bogus).is_none());

    let id = offer(&alice, &bob, 10).await;
    assert_eq!(bob.handle.list().len(), 1);

    bob.handle
        .respond_to_drop(id, accept_into("/inbox"))
        .await
        .unwrap();
    eventually("both sides to complete", || {
        alice.state(id) == Some(DropState::Completed)
            && bob.state(id) == Some(DropState::Completed)
    })
    .await;
    assert_eq!(
        bob.handle.cancel_drop(bogus).await,
        Err(DropError::NotFound(bogus))
    );
}

#[tokio::test]
async fn registry_changes_in_one_tick_are_coalesced() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let peer = |id: &str| PeerMetadata::new(PeerId::from(id), id, vec![]);

    let (a, b, c) = tokio::join!(
        alice.handle.upsert_peer(peer("p1")),
        alice.handle.upsert_peer(peer("p2")),
        alice.handle.upsert_peer(peer("p3")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(alice.handle.peers().len(), 3);
    eventually("a registry notification", || {
        alice.events.peer_notifications() > 0
    })
    .await;
    assert_eq!(alice.events.peer_notifications(), 1);
    let last = alice.events.peers.lock().unwrap().last().unwrap().clone();
    assert_eq!(last.peers.len(), 3);

    // A refresh moves the peer to the front and is announced.
    alice.handle.upsert_peer(peer("p1")).await.unwrap();
    eventually("the refresh notification", || {
        alice.events.peer_notifications() == 2
    })
    .await;
    let last = alice.events.peers.lock().unwrap().last().unwrap().clone();
    assert_eq!(last.peers[0].peer_id, PeerId::from("p1"));

    assert!(alice.handle.remove_peer(&PeerId::from("p2")).await.unwrap().is_some());
    assert!(alice.handle.peer(&PeerId::from("p2")).is_none());
    eventually("the removal notification", || {
        alice.events.peer_notifications() == 3
    })
    .await;

    let evicted = alice
        .handle
        .evict_stale_peers(Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(evicted.is_empty());
}

#[tokio::test]
async fn shutdown_cancels_unfinished_drops() {
    let network = MemoryNetwork::new();
    let alice = Node::start(&network, "alice", config());
    let bob = Node::start(&network, "bob", config());

    let id = offer(&alice, &bob, 10).await;
    alice.handle.shutdown().await.unwrap();

    assert_eq!(alice.state(id), Some(DropState::Cancelled));
    eventually("bob to see the cancel", || {
        bob.state(id) == Some(DropState::Cancelled)
    })
    .await;
    assert_eq!(
        alice.handle.cancel_drop(id).await,
        Err(DropError::Shutdown)
    );
}

#[tokio::test]
async fn a_file_crosses_tcp_into_the_filesystem() {
    let source_dir = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("report.bin");
    let payload: Vec<u8> = (0..100u8).collect();
    std::fs::write(&source, &payload).unwrap();

    let (alice_net, alice_in) =
        TcpTransport::bind(PeerId::from("alice"), "Alice", "127.0.0.1:0", 64)
            .await
            .unwrap();
    let (bob_net, bob_in) =
        TcpTransport::bind(PeerId::from("bob"), "Bob", "127.0.0.1:0", 64)
            .await
            .unwrap();
    let bob_addr = bob_net.local_addr().to_string();

    let alice = Coordinator::start(config(), alice_net, alice_in, Arc::new(FsFileStore::new()))
        .unwrap();
    let bob = Coordinator::start(config(), bob_net, bob_in, Arc::new(FsFileStore::new()))
        .unwrap();

    alice
        .upsert_peer(PeerMetadata::new(PeerId::from("bob"), "Bob", vec![bob_addr]))
        .await
        .unwrap();
    let id = alice
        .initiate_drop(
            PeerId::from("bob"),
            vec![ManifestEntry::new(
                source.to_string_lossy(),
                "report.bin",
                payload.len() as u64,
            )],
        )
        .await
        .unwrap();

    eventually("bob to see the request", || bob.get(id).is_some()).await;
    bob.respond_to_drop(
        id,
        Decision::Accept {
            destination: inbox.path().to_path_buf(),
        },
    )
    .await
    .unwrap();

    eventually("completion", || {
        alice.get(id).map(|r| r.state) == Some(DropState::Completed)
            && bob.get(id).map(|r| r.state) == Some(DropState::Completed)
    })
    .await;
    assert_eq!(std::fs::read(inbox.path().join("report.bin")).unwrap(), payload);
    assert!(!inbox.path().join("report.bin.part").exists());

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}
