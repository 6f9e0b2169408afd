use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as Days, Local, NaiveDate};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

/// Half-hour slots from 08:00 to 20:00.
const SLOTS_PER_DAY: usize = 24;
const DAYS_AHEAD: usize = 28;

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(host: &str, port: u16) -> Self {
        let socket = TcpStream::connect((host, port)).await.expect("connect failed");
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        self.framed.send(request.to_string()).await.expect("send failed");
        let line = self
            .framed
            .next()
            .await
            .expect("connection closed")
            .expect("read failed");
        serde_json::from_str(&line).expect("bad response")
    }

    async fn create_room(&mut self, capacity: u32) -> String {
        let name = format!("bench-{}", Ulid::new());
        let resp = self
            .call(json!({ "op": "create_room", "room": { "name": name, "capacity": capacity } }))
            .await;
        assert_eq!(resp["ok"], true, "create_room failed: {resp}");
        resp["result"]["room_id"].as_str().unwrap().to_string()
    }
}

/// The i-th bookable half-hour, starting tomorrow.
fn slot(i: usize) -> (NaiveDate, String, String) {
    let day = Local::now().date_naive() + Days::days(1 + (i / SLOTS_PER_DAY % DAYS_AHEAD) as i64);
    let start = 8 * 60 + (i % SLOTS_PER_DAY) * 30;
    let end = start + 30;
    (
        day,
        format!("{:02}:{:02}", start / 60, start % 60),
        format!("{:02}:{:02}", end / 60, end % 60),
    )
}

fn commit_request(room_id: &str, user: &str, i: usize) -> Value {
    let (date, start, end) = slot(i);
    json!({
        "op": "commit",
        "candidate": {
            "room_id": room_id,
            "requester": { "id": user },
            "date": date,
            "start": start,
            "end": end,
        },
    })
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(host: &str, port: u16) {
    let mut client = Client::connect(host, port).await;
    let room = client.create_room(10).await;
    let user = Ulid::new().to_string();

    let n = SLOTS_PER_DAY * 20;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        let resp = client.call(commit_request(&room, &user, i)).await;
        latencies.push(t.elapsed());
        assert_eq!(resp["ok"], true, "commit failed: {resp}");
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} commits in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("commit latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = SLOTS_PER_DAY * 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let room = client.create_room(10).await;
            let user = Ulid::new().to_string();
            for i in 0..n_per_task {
                let resp = client.call(commit_request(&room, &user, i)).await;
                assert_eq!(resp["ok"], true, "commit failed: {resp}");
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} rooms x {n_per_task} commits = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Many clients race for the same slots; exactly one may win each.
async fn phase3_contention(host: &str, port: u16) {
    let n_clients = 20;
    let n_slots = 50;

    let mut setup = Client::connect(host, port).await;
    let room = setup.create_room(10).await;

    let admitted = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let host = host.to_string();
        let room = room.clone();
        let admitted = admitted.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let user = Ulid::new().to_string();
            for i in 0..n_slots {
                let resp = client.call(commit_request(&room, &user, i)).await;
                if resp["ok"] == true {
                    admitted.fetch_add(1, Ordering::Relaxed);
                } else if resp["error"]["kind"] == "conflict" {
                    conflicts.fetch_add(1, Ordering::Relaxed);
                } else {
                    panic!("unexpected response: {resp}");
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let won = admitted.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {n_slots} slots: {won} admitted, {} conflicts in {:.2}s",
        conflicts.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    assert_eq!(won, n_slots, "each slot must be won exactly once");
}

async fn phase4_availability_under_load(host: &str, port: u16) {
    let mut setup = Client::connect(host, port).await;
    for capacity in [2, 4, 8, 12, 20, 40] {
        setup.create_room(capacity).await;
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..4 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let room = client.create_room(10).await;
            let user = Ulid::new().to_string();
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) && i < SLOTS_PER_DAY * DAYS_AHEAD {
                let _ = client.call(commit_request(&room, &user, i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let user = Ulid::new().to_string();
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let (date, start, end) = slot(r * reads_per_reader + i);
                let t = Instant::now();
                let resp = client
                    .call(json!({
                        "op": "list_available",
                        "requester": { "id": user },
                        "date": date,
                        "start": start,
                        "end": end,
                        "min_capacity": 4,
                    }))
                    .await;
                latencies.push(t.elapsed());
                assert_eq!(resp["ok"], true, "list_available failed: {resp}");
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("list_available", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ROOMGATE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ROOMGATE_PORT")
        .unwrap_or_else(|_| "7433".into())
        .parse()
        .expect("invalid ROOMGATE_PORT");

    println!("=== roomgate stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential commit throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent commits, one room per client");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] contended commits on one room");
    phase3_contention(&host, port).await;

    println!("\n[phase 4] availability latency under write load");
    phase4_availability_under_load(&host, port).await;

    println!("\n=== done ===");
}
