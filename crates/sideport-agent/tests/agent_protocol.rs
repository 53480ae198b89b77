use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use sideport_agent::{
    AgentConfig, AgentServer, GestureBackend, LogBackend, Point, MAX_LINE_BYTES,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream},
};

#[derive(Default)]
struct RecordingBackend {
    gestures: Mutex<Vec<String>>,
}

#[async_trait]
impl GestureBackend for RecordingBackend {
    async fn tap(&self, at: Point, duration: Duration) -> bool {
        self.gestures
            .lock()
            .unwrap()
            .push(format!("tap {} {} {}", at.x, at.y, duration.as_millis()));
        true
    }

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> bool {
        self.gestures.lock().unwrap().push(format!(
            "swipe {} {} {} {} {}",
            from.x,
            from.y,
            to.x,
            to.y,
            duration.as_millis()
        ));
        true
    }

    async fn multi_touch(&self, points: &[Point], duration: Duration) -> bool {
        self.gestures
            .lock()
            .unwrap()
            .push(format!("multi {} {}", points.len(), duration.as_millis()));
        true
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(server: &AgentServer) -> (Self, Value) {
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        let welcome = client.recv().await.expect("welcome line");
        (client, welcome)
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("response timed out")
            .ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn request(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await;
        self.recv().await.expect("response")
    }
}

async fn start(backend: Arc<dyn GestureBackend>) -> AgentServer {
    AgentServer::start(
        AgentConfig {
            addr: "127.0.0.1:0".into(),
            read_timeout: Duration::from_millis(100),
        },
        backend,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn welcome_then_pong() {
    let server = start(Arc::new(LogBackend)).await;
    let (mut client, welcome) = Client::connect(&server).await;
    assert_eq!(welcome["type"], "welcome");
    assert!(welcome["version"].is_string());

    let pong = client.request(json!({"type": "ping"})).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].as_i64().unwrap() > 0);
    server.stop();
}

#[tokio::test]
async fn malformed_line_keeps_the_connection_open() {
    let server = start(Arc::new(LogBackend)).await;
    let (mut client, _) = Client::connect(&server).await;

    client.send_raw("not json").await;
    let error = client.recv().await.unwrap();
    assert_eq!(error["type"], "error");
    assert!(!error["message"].as_str().unwrap().is_empty());

    let pong = client.request(json!({"type": "ping"})).await;
    assert_eq!(pong["type"], "pong");
    server.stop();
}

#[tokio::test]
async fn endless_line_is_refused_and_the_server_keeps_serving() {
    let server = start(Arc::new(LogBackend)).await;
    let (mut client, _) = Client::connect(&server).await;

    // Spread over several read timeouts; partial input must not be lost or
    // allowed to grow past the limit.
    let chunk = vec![b'x'; MAX_LINE_BYTES / 4];
    for _ in 0..4 {
        client.writer.write_all(&chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    client.writer.write_all(b"x").await.unwrap();

    let error = client.recv().await.expect("error before close");
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("exceeds"));
    assert_eq!(client.recv().await, None);
    assert!(server.is_running());

    let (mut next, _) = Client::connect(&server).await;
    let pong = next.request(json!({"type": "ping"})).await;
    assert_eq!(pong["type"], "pong");
    server.stop();
}

#[tokio::test]
async fn line_split_across_read_timeouts_is_reassembled() {
    let server = start(Arc::new(LogBackend)).await;
    let (mut client, _) = Client::connect(&server).await;

    client.writer.write_all(br#"{"type":"#).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    client.writer.write_all(b"\"ping\"}\n").await.unwrap();

    let pong = client.recv().await.unwrap();
    assert_eq!(pong["type"], "pong");
    server.stop();
}

#[tokio::test]
async fn unknown_command_is_reported() {
    let server = start(Arc::new(LogBackend)).await;
    let (mut client, _) = Client::connect(&server).await;

    let error = client.request(json!({"type": "teleport"})).await;
    assert_eq!(
        error,
        json!({"type": "error", "message": "Unknown command type: teleport"})
    );
    server.stop();
}

#[tokio::test]
async fn gestures_use_default_durations() {
    let backend = Arc::new(RecordingBackend::default());
    let server = start(backend.clone()).await;
    let (mut client, _) = Client::connect(&server).await;

    let tap = client.request(json!({"type": "tap", "x": 100, "y": 200})).await;
    assert_eq!(
        tap,
        json!({"type": "tap_response", "success": true, "x": 100, "y": 200, "duration": 50})
    );

    let swipe = client
        .request(json!({"type": "swipe", "start_x": 1, "start_y": 2, "end_x": 3, "end_y": 4}))
        .await;
    assert_eq!(swipe["type"], "swipe_response");
    assert_eq!(swipe["duration"], 300);

    let multi = client
        .request(json!({"type": "multi_touch", "points": [{"x": 1, "y": 1}, {"x": 9, "y": 9}], "duration": 120}))
        .await;
    assert_eq!(multi["type"], "multi_touch_response");
    assert_eq!(multi["points"].as_array().unwrap().len(), 2);

    assert_eq!(
        *backend.gestures.lock().unwrap(),
        ["tap 100 200 50", "swipe 1 2 3 4 300", "multi 2 120"]
    );
    server.stop();
}

#[tokio::test]
async fn status_counts_open_connections() {
    let server = start(Arc::new(LogBackend)).await;
    let (mut first, _) = Client::connect(&server).await;
    let (_second, _) = Client::connect(&server).await;

    let status = first.request(json!({"type": "status"})).await;
    assert_eq!(status["type"], "status_response");
    assert_eq!(status["server_running"], true);
    assert_eq!(status["injection_ready"], true);
    assert_eq!(status["connections"], 2);
    assert_eq!(server.connection_count(), 2);
    server.stop();
}

#[tokio::test]
async fn closed_clients_leave_the_registry() {
    let server = start(Arc::new(LogBackend)).await;
    let (client, _) = Client::connect(&server).await;
    assert_eq!(server.connection_count(), 1);
    drop(client);

    for _ in 0..50 {
        if server.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.connection_count(), 0);
    server.stop();
}

#[tokio::test]
async fn stop_closes_every_connection() {
    let server = start(Arc::new(LogBackend)).await;
    let (mut client, _) = Client::connect(&server).await;
    assert!(server.is_running());

    server.stop();
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn in_process_dispatch_matches_the_wire() {
    let server = start(Arc::new(LogBackend)).await;
    let response = server.handle_line(r#"{"type":"tap","x":1}"#).await;
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["type"], "error");
    server.stop();
}
