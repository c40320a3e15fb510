use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

const DAY: &str = "2030-06-04";

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

    async fn run(&mut self, sql: &str) -> Value {
        self.framed.send(sql).await.expect("send failed");
        let line = self
            .framed
            .next()
            .await
            .expect("server closed connection")
            .expect("bad reply frame");
        serde_json::from_str(&line).expect("reply is not JSON")
    }

    async fn ok(&mut self, sql: &str) -> Value {
        let reply = self.run(sql).await;
        assert_eq!(reply["ok"], true, "{sql} -> {reply}");
        reply
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// A park open all day with one daily template of `tickets` capacity.
/// Returns the materialized instance id.
async fn setup_slot(client: &mut Client, tickets: u32) -> Ulid {
    let park = Ulid::new();
    client
        .ok(&format!(
            r#"INSERT INTO parks VALUES ('{park}', 'bench', '{{"default_hours":{{"open":"00:00","close":"00:00"}}}}')"#
        ))
        .await;
    let template = Ulid::new();
    client
        .ok(&format!(
            "INSERT INTO templates VALUES ('{template}', '{park}', '10:00', '12:00', '0,1,2,3,4,5,6', '2030-01-01', NULL, {tickets})"
        ))
        .await;
    let reply = client
        .ok(&format!("INSERT INTO materializations VALUES ('{park}', '{DAY}')"))
        .await;
    reply["rows"][0]["id"].as_str().unwrap().parse().unwrap()
}

async fn phase1_sequential(host: &str, port: u16) {
    let mut client = Client::connect(host, port).await;
    let slot = setup_slot(&mut client, 100_000).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let sql = if i % 2 == 0 {
            format!("INSERT INTO reservations VALUES ('{slot}', 2)")
        } else {
            format!("INSERT INTO releases VALUES ('{slot}', 1)")
        };
        let t = Instant::now();
        client.ok(&sql).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} ledger writes in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended_carts(host: &str, port: u16) {
    let tickets = 500;
    let n_tasks = 20;
    let n_per_task = 50;

    let mut setup = Client::connect(host, port).await;
    let slot = setup_slot(&mut setup, tickets).await;
    let pricing = Ulid::new();
    setup.ok(&format!("INSERT INTO prices VALUES ('{pricing}', 2500)")).await;

    let held = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let held = held.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let cart = Ulid::new();
            for _ in 0..n_per_task {
                let line = Ulid::new();
                let reply = client
                    .run(&format!(
                        "INSERT INTO cart_lines VALUES ('{line}', '{cart}', '{slot}', '{pricing}', 1)"
                    ))
                    .await;
                if reply["ok"] == true {
                    held.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let held = held.load(Ordering::Relaxed);
    let reply = setup
        .ok(&format!("SELECT * FROM availability WHERE instance_id = '{slot}'"))
        .await;
    let available = reply["rows"][0]["available_tickets"].as_u64().unwrap() as usize;
    println!(
        "  {n_tasks} tasks x {n_per_task} adds = {total} attempts in {:.2}s, {held} held, {available} left",
        elapsed.as_secs_f64()
    );
    assert!(held <= tickets as usize, "oversold: {held} > {tickets}");
    assert_eq!(held + available, tickets as usize, "ledger drift");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let mut setup = Client::connect(host, port).await;
    let slot = setup_slot(&mut setup, 100_000).await;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.run(&format!("INSERT INTO reservations VALUES ('{slot}', 1)")).await;
                let _ = client.run(&format!("INSERT INTO releases VALUES ('{slot}', 1)")).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .ok(&format!("SELECT * FROM availability WHERE instance_id = '{slot}'"))
                    .await;
                latencies.push(t.elapsed());
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

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let slot = setup_slot(&mut client, 100).await;
            for _ in 0..ops_per_conn {
                client
                    .ok(&format!("INSERT INTO reservations VALUES ('{slot}', 1)"))
                    .await;
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("PARKSLOT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PARKSLOT_PORT")
        .unwrap_or_else(|_| "7411".into())
        .parse()
        .expect("invalid PARKSLOT_PORT");

    println!("=== parkslot stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential ledger throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended cart holds");
    phase2_contended_carts(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
