use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use roomgate::clock::FixedClock;
use roomgate::config::EngineConfig;
use roomgate::engine::Engine;
use roomgate::limits::MAX_LINE_LEN;
use roomgate::notify::NotifyHub;
use roomgate::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roomgate_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = Arc::new(FixedClock::new("2026-10-14T08:00:00".parse().unwrap()));
    let engine = Arc::new(
        Engine::new(
            dir.join("roomgate.wal"),
            Arc::new(NotifyHub::new()),
            EngineConfig::default(),
            clock,
        )
        .unwrap(),
    );

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: String) -> Value {
        self.framed.send(line).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("response timed out")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(request.to_string()).await
    }

    /// Call and unwrap a successful result.
    async fn ok(&mut self, request: Value) -> Value {
        let resp = self.call(request).await;
        assert_eq!(resp["ok"], true, "request failed: {resp}");
        resp["result"].clone()
    }

    async fn create_room(&mut self, name: &str, extra: Value) -> String {
        let mut room = json!({ "name": name, "capacity": 8, "floor": 2 });
        if let (Some(room), Some(extra)) = (room.as_object_mut(), extra.as_object()) {
            room.extend(extra.clone());
        }
        let result = self.ok(json!({ "op": "create_room", "room": room })).await;
        result["room_id"].as_str().unwrap().to_string()
    }
}

fn candidate(room_id: &str, user: &str, date: &str, start: &str, end: &str) -> Value {
    json!({
        "room_id": room_id,
        "requester": { "id": user },
        "date": date,
        "start": start,
        "end": end,
    })
}

fn user_id() -> String {
    Ulid::new().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let (addr, engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let room = client.create_room("Atelier", json!({ "equipment": ["screen"] })).await;
    let alice = user_id();

    let resp = client
        .call(json!({
            "id": 7,
            "op": "commit",
            "candidate": candidate(&room, &alice, "2026-10-19", "10:00", "11:00"),
        }))
        .await;
    assert_eq!(resp["id"], 7);
    assert_eq!(resp["ok"], true);
    let booking_id = resp["result"]["booking_id"].as_str().unwrap().to_string();

    // Overlap is a conflict, with the holder attached.
    let resp = client
        .call(json!({
            "op": "commit",
            "candidate": candidate(&room, &user_id(), "2026-10-19", "10:30", "11:30"),
        }))
        .await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["kind"], "conflict");
    assert_eq!(resp["error"]["holders"][0]["id"], booking_id.as_str());

    let decision = client
        .ok(json!({
            "op": "evaluate",
            "candidate": candidate(&room, &user_id(), "2026-10-19", "10:30", "11:30"),
        }))
        .await;
    assert_eq!(decision["admitted"], false);
    assert_eq!(decision["violations"][0]["code"], "OVERLAP");

    let listing = client
        .ok(json!({
            "op": "list_bookings",
            "room_id": room,
            "date": "2026-10-19",
        }))
        .await;
    assert_eq!(listing.as_array().unwrap().len(), 1);

    let cancelled = client
        .ok(json!({
            "op": "cancel_booking",
            "booking_id": booking_id,
            "requester": { "id": alice },
        }))
        .await;
    assert_eq!(cancelled["id"], booking_id.as_str());
    assert_eq!(engine.booking_count(), 0);

    client
        .ok(json!({
            "op": "commit",
            "candidate": candidate(&room, &user_id(), "2026-10-19", "10:30", "11:30"),
        }))
        .await;
}

#[tokio::test]
async fn rejections_carry_every_violation() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let room = client
        .create_room("Studio", json!({ "constraints": { "time_period": "morning" } }))
        .await;

    client
        .ok(json!({
            "op": "set_setting",
            "key": "reservations.slot_duration",
            "value": { "integer": 60 },
        }))
        .await;
    let policy = client.ok(json!({ "op": "get_policy" })).await;
    assert_eq!(policy["slot_duration_minutes"], 60);

    let resp = client
        .call(json!({
            "op": "commit",
            "candidate": candidate(&room, &user_id(), "2026-10-19", "14:30", "15:30"),
        }))
        .await;
    assert_eq!(resp["error"]["kind"], "rejected");
    let codes: Vec<&str> = resp["error"]["violations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["SLOT_GRANULARITY", "TIME_PERIOD"]);

    let resp = client
        .call(json!({
            "op": "set_setting",
            "key": "reservations.slot_duration",
            "value": { "string": "hourly" },
        }))
        .await;
    assert_eq!(resp["error"]["kind"], "invalid_setting");
}

#[tokio::test]
async fn availability_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let big = client
        .create_room("Grande", json!({ "capacity": 40, "equipment": ["projector"] }))
        .await;
    client.create_room("Petite", json!({ "capacity": 3 })).await;
    let me = user_id();
    client
        .ok(json!({ "op": "add_favorite", "user_id": me, "room_id": big }))
        .await;

    let rooms = client
        .ok(json!({
            "op": "list_available",
            "requester": { "id": me },
            "date": "2026-10-20",
            "start": "09:00",
            "end": "10:00",
            "min_capacity": 10,
        }))
        .await;
    let rooms = rooms.as_array().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["room"]["name"], "Grande");
    assert_eq!(rooms[0]["is_available"], true);
    assert_eq!(rooms[0]["is_favorite"], true);

    let favorites = client.ok(json!({ "op": "list_favorites", "user_id": me })).await;
    assert_eq!(favorites, json!([big]));
}

#[tokio::test]
async fn bad_requests_keep_the_connection_open() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let resp = client.send_raw("{not json".to_string()).await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["kind"], "bad_request");

    let resp = client.call(json!({ "id": "x", "op": "no_such_op" })).await;
    assert_eq!(resp["error"]["kind"], "bad_request");

    // Malformed times are validation failures, not framing errors.
    let room = client.create_room("Salon", json!({})).await;
    let resp = client
        .call(json!({
            "op": "evaluate",
            "candidate": candidate(&room, &user_id(), "2026-10-19", "25:00", "26:00"),
        }))
        .await;
    assert_eq!(resp["error"]["kind"], "validation");

    let resp = client
        .call(json!({ "op": "get_room", "room_id": Ulid::new() }))
        .await;
    assert_eq!(resp["error"]["kind"], "not_found");

    let listed = client.ok(json!({ "op": "list_rooms" })).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn oversized_line_is_answered_then_closed() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let resp = client.send_raw("x".repeat(MAX_LINE_LEN + 10)).await;
    assert_eq!(resp["error"]["kind"], "bad_request");

    let next = tokio::time::timeout(Duration::from_secs(5), client.framed.next())
        .await
        .expect("close timed out");
    assert!(next.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_clients_get_one_booking() {
    let (addr, engine) = start_test_server().await;
    let mut setup = Client::connect(addr).await;
    let room = setup.create_room("Arena", json!({})).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let room = room.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(json!({
                    "op": "commit",
                    "candidate": candidate(&room, &user_id(), "2026-10-21", "15:00", "16:00"),
                }))
                .await
        }));
    }

    let mut admitted = 0;
    for h in handles {
        let resp = h.await.unwrap();
        if resp["ok"] == true {
            admitted += 1;
        } else {
            assert_eq!(resp["error"]["kind"], "conflict", "{resp}");
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(engine.booking_count(), 1);
}
