//! Relay server and client over real WebSockets

mod harness;

use cinesync_webrtc::clock::ManualClock;
use cinesync_webrtc::signaling::{
    ClientMessage, MovieAction, MovieState, PeerSignal, RelayClient, RelayOutbound,
    RelayServer, RelayServerConfig, RelayServerHandle, ServerMessage, SignalingChannel,
};
use cinesync_webrtc::sync::TimeSource;
use harness::init_test_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const RELAY_TIME_MS: f64 = 1_700_000_000_123.75;

async fn start_relay(clock: Arc<ManualClock>) -> RelayServerHandle {
    init_test_tracing();
    let config = RelayServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..RelayServerConfig::default()
    };
    RelayServer::with_clock(config, clock).start().await.unwrap()
}

async fn connect(relay: &RelayServerHandle) -> (RelayClient, UnboundedReceiver<ServerMessage>) {
    let client = RelayClient::connect(&relay.url()).await.unwrap();
    let inbound = client.take_inbound().unwrap();
    (client, inbound)
}

async fn next(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for relay message")
        .expect("relay connection closed")
}

async fn joined(
    relay: &RelayServerHandle,
    room: &str,
    user: &str,
) -> (RelayClient, UnboundedReceiver<ServerMessage>) {
    let (client, mut rx) = connect(relay).await;
    client.join(room, user).unwrap();
    match next(&mut rx).await {
        ServerMessage::Joined { user: u, .. } => assert_eq!(u, user),
        other => panic!("expected joined, got {:?}", other),
    }
    (client, rx)
}

fn movie_control(action: MovieAction, current_time: f64) -> ClientMessage {
    ClientMessage::MovieControl {
        action,
        movie_state: MovieState {
            is_playing: action == MovieAction::Play,
            current_time,
            duration: Some(5400.0),
            file_name: Some("movie.mkv".to_string()),
        },
    }
}

#[tokio::test]
async fn test_first_joiner_is_host() {
    let relay = start_relay(Arc::new(ManualClock::new(RELAY_TIME_MS))).await;

    let (alice, mut alice_rx) = connect(&relay).await;
    alice.join("movie-night", "alice").unwrap();
    assert_eq!(
        next(&mut alice_rx).await,
        ServerMessage::Joined {
            user: "alice".to_string(),
            host: "alice".to_string(),
            participants: vec!["alice".to_string()],
        }
    );

    let (bob, mut bob_rx) = connect(&relay).await;
    bob.join("movie-night", "bob").unwrap();
    assert_eq!(
        next(&mut bob_rx).await,
        ServerMessage::Joined {
            user: "bob".to_string(),
            host: "alice".to_string(),
            participants: vec!["alice".to_string(), "bob".to_string()],
        }
    );
    assert_eq!(
        next(&mut alice_rx).await,
        ServerMessage::ParticipantJoined {
            user: "bob".to_string()
        }
    );

    let room = relay.registry().room("movie-night").await.unwrap();
    assert_eq!(room.host.as_deref(), Some("alice"));
    relay.shutdown().await;
}

#[tokio::test]
async fn test_messages_before_join_are_rejected() {
    let relay = start_relay(Arc::new(ManualClock::new(RELAY_TIME_MS))).await;
    let (client, mut rx) = connect(&relay).await;

    client
        .sender()
        .send_message(ClientMessage::TimeSyncRequest { client_time: 1.0 })
        .unwrap();

    match next(&mut rx).await {
        ServerMessage::Error { message } => assert!(message.contains("join a room first")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(relay.registry().room_count().await, 0);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let relay = start_relay(Arc::new(ManualClock::new(RELAY_TIME_MS))).await;
    let (_alice, _alice_rx) = joined(&relay, "room", "alice").await;

    let (imposter, mut rx) = connect(&relay).await;
    imposter.join("room", "alice").unwrap();

    assert!(matches!(next(&mut rx).await, ServerMessage::Error { .. }));
    let room = relay.registry().room("room").await.unwrap();
    assert_eq!(room.participants, vec!["alice"]);
}

#[tokio::test]
async fn test_negotiation_payloads_are_routed_untouched() {
    let relay = start_relay(Arc::new(ManualClock::new(RELAY_TIME_MS))).await;
    let (_alice, mut alice_rx) = joined(&relay, "room", "alice").await;
    let (bob, _bob_rx) = joined(&relay, "room", "bob").await;
    // participant-joined for bob
    next(&mut alice_rx).await;

    let sender = bob.sender();
    sender
        .send("alice", PeerSignal::Offer("v=0\r\no=- 42 2 IN IP4 0.0.0.0".to_string()))
        .await
        .unwrap();
    sender
        .send("alice", PeerSignal::IceCandidate("{\"candidate\":\"c1\"}".to_string()))
        .await
        .unwrap();

    assert_eq!(
        next(&mut alice_rx).await,
        ServerMessage::Offer {
            sdp: "v=0\r\no=- 42 2 IN IP4 0.0.0.0".to_string(),
            from: "bob".to_string(),
        }
    );
    assert_eq!(
        next(&mut alice_rx).await,
        ServerMessage::IceCandidate {
            candidate: "{\"candidate\":\"c1\"}".to_string(),
            from: "bob".to_string(),
        }
    );
}

#[tokio::test]
async fn test_only_host_controls_playback_and_actions_are_stamped() {
    let relay = start_relay(Arc::new(ManualClock::new(RELAY_TIME_MS))).await;
    let (alice, mut alice_rx) = joined(&relay, "room", "alice").await;
    let (bob, mut bob_rx) = joined(&relay, "room", "bob").await;
    next(&mut alice_rx).await;

    bob.sender()
        .send_message(movie_control(MovieAction::Play, 12.0))
        .unwrap();
    match next(&mut bob_rx).await {
        ServerMessage::Error { message } => assert!(message.contains("only the host")),
        other => panic!("expected error, got {:?}", other),
    }

    alice
        .sender()
        .send_message(movie_control(MovieAction::Play, 12.0))
        .unwrap();
    for rx in [&mut alice_rx, &mut bob_rx] {
        match next(rx).await {
            ServerMessage::MovieSync {
                action,
                movie_state,
                timestamp,
                precision_timestamp,
            } => {
                assert_eq!(action, MovieAction::Play);
                assert_eq!(movie_state.current_time, 12.0);
                assert!(movie_state.is_playing);
                assert_eq!(timestamp, 1_700_000_000_123);
                assert_eq!(precision_timestamp, RELAY_TIME_MS);
            }
            other => panic!("expected movie-sync, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_clock_probe_is_answered_with_relay_time() {
    let clock = Arc::new(ManualClock::new(RELAY_TIME_MS));
    let relay = start_relay(Arc::clone(&clock)).await;
    let (alice, mut alice_rx) = joined(&relay, "room", "alice").await;

    let server_time = alice.probe(500.25).await.unwrap();
    assert_eq!(server_time, RELAY_TIME_MS);

    clock.advance(1000.0);
    let later = alice.probe(501.5).await.unwrap();
    assert_eq!(later, RELAY_TIME_MS + 1000.0);

    // Probe replies never reach the inbound stream
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_host_leaving_promotes_next_participant() {
    let relay = start_relay(Arc::new(ManualClock::new(RELAY_TIME_MS))).await;
    let (alice, mut alice_rx) = joined(&relay, "room", "alice").await;
    let (bob, mut bob_rx) = joined(&relay, "room", "bob").await;
    let (_carol, mut carol_rx) = joined(&relay, "room", "carol").await;
    next(&mut alice_rx).await;
    next(&mut alice_rx).await;
    next(&mut bob_rx).await;

    alice.close();

    let expected = ServerMessage::ParticipantLeft {
        user: "alice".to_string(),
        new_host: Some("bob".to_string()),
    };
    assert_eq!(next(&mut bob_rx).await, expected);
    assert_eq!(next(&mut carol_rx).await, expected);

    bob.sender()
        .send_message(movie_control(MovieAction::Pause, 30.0))
        .unwrap();
    assert!(matches!(
        next(&mut carol_rx).await,
        ServerMessage::MovieSync {
            action: MovieAction::Pause,
            ..
        }
    ));
    let room = relay.registry().room("room").await.unwrap();
    assert_eq!(room.host.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_oversized_frame_is_rejected_without_disconnect() {
    let relay = start_relay(Arc::new(ManualClock::new(RELAY_TIME_MS))).await;
    let (alice, mut alice_rx) = joined(&relay, "room", "alice").await;

    alice
        .sender()
        .send_message(ClientMessage::Offer {
            sdp: "x".repeat(128 * 1024),
            to: None,
        })
        .unwrap();
    match next(&mut alice_rx).await {
        ServerMessage::Error { message } => assert!(message.contains("exceeds")),
        other => panic!("expected error, got {:?}", other),
    }

    // Still connected
    assert_eq!(alice.probe(1.0).await.unwrap(), RELAY_TIME_MS);
}
