//! End-to-end tests over a real socket: REST surface plus two WebSocket
//! clients racing each other.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use typerace_server::{
    app, config::RaceTiming, passages::FixedPassage, registry::RoomRegistry,
    results::ResultsAdjudicator, room::RoomContext, spawn_ticker, store::MemoryResultStore,
    AppState,
};
use typerace_shared::{
    fsm::RoomStatus,
    passages::Passage,
    protocol::{ClientMsg, Envelope, ErrorCode, Keystroke, ServerMsg},
    types::{Difficulty, RaceResultSet, RaceStatus, RoomView},
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DRILL: &str = "go now";

async fn spawn_server() -> SocketAddr {
    let registry = Arc::new(RoomRegistry::new(RoomContext {
        passages: Arc::new(FixedPassage(Passage::new(
            "drill",
            DRILL,
            Difficulty::Easy,
            "common",
        ))),
        adjudicator: Arc::new(ResultsAdjudicator::new(
            Arc::new(MemoryResultStore::default()),
            1,
        )),
        timing: RaceTiming {
            countdown_tick: Duration::from_millis(50),
            progress_interval: Duration::from_millis(20),
            eviction_grace: Duration::from_secs(30),
        },
    }));
    spawn_ticker(registry.clone(), Duration::from_millis(10));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(AppState { registry }))
            .await
            .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send(client: &mut Client, msg: &ClientMsg) {
    let text = serde_json::to_string(msg).unwrap();
    client.send(Message::text(text)).await.unwrap();
}

/// Next event, whether broadcast in an envelope or sent directly.
async fn next_event(client: &mut Client) -> ServerMsg {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(text.as_str()) {
                return envelope.event;
            }
            return serde_json::from_str::<ServerMsg>(text.as_str()).unwrap();
        }
    }
}

async fn join(client: &mut Client, room: &str, user: &str) -> RoomView {
    send(
        client,
        &ClientMsg::Join {
            room: room.into(),
            user_id: user.into(),
            username: user.to_uppercase(),
        },
    )
    .await;
    loop {
        if let ServerMsg::RoomState { room } = next_event(client).await {
            return room;
        }
    }
}

/// Readies up, starts once everyone is ready (host only), types the passage
/// as soon as it is revealed and returns every event seen until the race ends.
async fn play(mut client: Client, user: &'static str, host: bool, players: usize) -> Vec<ServerMsg> {
    send(&mut client, &ClientMsg::Ready { ready: true }).await;
    let mut ready = HashSet::new();
    let mut started = false;
    let mut events = Vec::new();
    loop {
        let event = next_event(&mut client).await;
        events.push(event.clone());
        match event {
            ServerMsg::ReadyChanged { user_id, ready: true } => {
                ready.insert(user_id);
                if host && !started && ready.len() == players {
                    started = true;
                    send(&mut client, &ClientMsg::Start).await;
                }
            }
            ServerMsg::RaceStart { passage, .. } => {
                for ch in passage.text.chars() {
                    send(&mut client, &ClientMsg::Key { key: Keystroke::Char(ch) }).await;
                }
            }
            ServerMsg::RaceFinished { .. } => return events,
            ServerMsg::Rejected { code, message } => panic!("{user}: rejected {code:?}: {message}"),
            _ => {}
        }
    }
}

fn countdown(events: &[ServerMsg]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerMsg::CountdownTick { remaining } => Some(*remaining),
            _ => None,
        })
        .collect()
}

fn finished_sets(events: &[ServerMsg]) -> Vec<RaceResultSet> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerMsg::RaceFinished { results } => Some(results.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn two_players_race_to_a_single_ranked_result() {
    let addr = spawn_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let view = join(&mut alice, "abcd12", "alice").await;
    assert_eq!(view.code.as_str(), "ABCD12");
    assert_eq!(view.host_id.as_deref(), Some("alice"));
    let view = join(&mut bob, "ABCD12", "bob").await;
    assert_eq!(view.players.len(), 2);
    assert!(view.passage.is_none());

    let host = tokio::spawn(play(alice, "alice", true, 2));
    let guest = tokio::spawn(play(bob, "bob", false, 2));
    let alice_events = host.await.unwrap();
    let bob_events = guest.await.unwrap();

    for events in [&alice_events, &bob_events] {
        assert_eq!(countdown(events), vec![3, 2, 1]);
        let passage_ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ServerMsg::RaceStart { passage, .. } => Some(passage.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(passage_ids, vec!["drill"]);
        assert!(events.contains(&ServerMsg::StatusChanged {
            status: RoomStatus::InProgress
        }));
    }

    let from_alice = finished_sets(&alice_events);
    let from_bob = finished_sets(&bob_events);
    assert_eq!(from_alice.len(), 1);
    assert_eq!(from_alice, from_bob);

    let set = &from_alice[0];
    assert_eq!(set.passage_id, "drill");
    let ranks: Vec<u32> = set.results.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2]);
    assert!(set.results.iter().all(|r| r.status == RaceStatus::Finished));
    let users: HashSet<&str> = set.results.iter().map(|r| r.user_id.as_str()).collect();
    assert_eq!(users, HashSet::from(["alice", "bob"]));

    let polled: RaceResultSet = reqwest::get(format!("http://{addr}/rooms/ABCD12/results"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(&polled, set);
}

#[tokio::test]
async fn socket_errors_are_private_to_the_sender() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    send(&mut client, &ClientMsg::Start).await;
    assert_eq!(
        next_event(&mut client).await,
        ServerMsg::Rejected {
            code: ErrorCode::NotMember,
            message: "not a member of this room".into(),
        }
    );

    client
        .send(Message::text(r#"{"type":"dance"}"#.to_string()))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut client).await,
        ServerMsg::Rejected { code: ErrorCode::BadMessage, .. }
    ));

    send(
        &mut client,
        &ClientMsg::Join {
            room: "bad!".into(),
            user_id: "u".into(),
            username: "U".into(),
        },
    )
    .await;
    assert!(matches!(
        next_event(&mut client).await,
        ServerMsg::Rejected { code: ErrorCode::InvalidRoomCode, .. }
    ));
}

#[tokio::test]
async fn reconnecting_socket_replaces_the_old_one() {
    let addr = spawn_server().await;
    let mut first = connect(addr).await;
    join(&mut first, "RECON1", "carol").await;

    let mut second = connect(addr).await;
    let view = join(&mut second, "RECON1", "carol").await;
    assert_eq!(view.players.len(), 1);

    // Closing the replaced socket must not remove carol.
    first.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view: RoomView = reqwest::get(format!("http://{addr}/rooms/RECON1"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view.players.len(), 1);
    assert_eq!(view.players[0].user_id, "carol");
}

#[tokio::test]
async fn rejected_join_keeps_the_current_room() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let mut alice = connect(addr).await;
    join(&mut alice, "HOME02", "alice").await;

    for guest in ["f1", "f2", "f3", "f4"] {
        let resp = http
            .post(format!("http://{addr}/rooms/FULL02/join"))
            .json(&json!({ "user_id": guest, "username": guest }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    send(
        &mut alice,
        &ClientMsg::Join {
            room: "FULL02".into(),
            user_id: "alice".into(),
            username: "ALICE".into(),
        },
    )
    .await;
    loop {
        if let ServerMsg::Rejected { code, .. } = next_event(&mut alice).await {
            assert_eq!(code, ErrorCode::RoomFull);
            break;
        }
    }

    // Still subscribed to the old room and still its host.
    let resp = http
        .post(format!("http://{addr}/rooms/HOME02/join"))
        .json(&json!({ "user_id": "bob", "username": "BOB" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    loop {
        match next_event(&mut alice).await {
            ServerMsg::PlayerJoined { player } if player.user_id == "bob" => break,
            ServerMsg::PlayerLeft { user_id } => panic!("{user_id} left the old room"),
            _ => {}
        }
    }
    let view: RoomView = resp.json().await.unwrap();
    assert_eq!(view.host_id.as_deref(), Some("alice"));
    assert_eq!(view.players.len(), 2);
}

#[tokio::test]
async fn rest_room_lifecycle_and_error_mapping() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let resp = http
        .post(format!("{base}/rooms"))
        .json(&json!({
            "settings": { "difficulty": "hard", "duration": 30, "category": "programming" },
            "host": { "user_id": "h", "username": "Host" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let view: RoomView = resp.json().await.unwrap();
    assert_eq!(view.status, RoomStatus::Waiting);
    assert_eq!(view.settings.duration, 30);
    assert_eq!(view.host_id.as_deref(), Some("h"));
    let code = view.code.as_str().to_string();

    for guest in ["g1", "g2", "g3"] {
        let resp = http
            .post(format!("{base}/rooms/{code}/join"))
            .json(&json!({ "user_id": guest, "username": guest }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    let full = http
        .post(format!("{base}/rooms/{code}/join"))
        .json(&json!({ "user_id": "g4", "username": "g4" }))
        .send()
        .await
        .unwrap();
    assert_eq!(full.status(), 409);
    let body: Value = full.json().await.unwrap();
    assert_eq!(body["code"], "ROOM_FULL");

    let not_host = http
        .patch(format!("{base}/rooms/{code}/settings"))
        .json(&json!({
            "user_id": "g1",
            "settings": { "difficulty": "easy", "duration": 60, "category": "common" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(not_host.status(), 403);

    let invalid = http
        .patch(format!("{base}/rooms/{code}/settings"))
        .json(&json!({
            "user_id": "h",
            "settings": { "difficulty": "easy", "duration": 5, "category": "common" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 422);

    let left = http
        .post(format!("{base}/rooms/{code}/leave"))
        .json(&json!({ "user_id": "h" }))
        .send()
        .await
        .unwrap();
    assert_eq!(left.status(), 204);
    let view: RoomView = http
        .get(format!("{base}/rooms/{code}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view.host_id.as_deref(), Some("g1"));

    let missing = http.get(format!("{base}/rooms/ZZZZ99")).send().await.unwrap();
    assert_eq!(missing.status(), 404);
    let malformed = http.get(format!("{base}/rooms/nope")).send().await.unwrap();
    assert_eq!(malformed.status(), 422);
    let no_results = http
        .get(format!("{base}/rooms/{code}/results"))
        .send()
        .await
        .unwrap();
    assert_eq!(no_results.status(), 404);

    let passage: Passage = http
        .get(format!("{base}/passages?difficulty=hard&category=science"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(passage.id, "drill");
    let bad_category = http
        .get(format!("{base}/passages?category=poetry"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_category.status(), 422);
}
