#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use termbridge::{SpawnResolver, WebServer, WebServerConfig};
use termbridge_terminal::{ManagerConfig, SessionManager, SpawnSpec};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Picks the command from the session key prefix
struct TestResolver;

#[async_trait]
impl SpawnResolver for TestResolver {
    async fn resolve(&self, session_key: &str) -> Result<SpawnSpec> {
        if session_key.starts_with("lines") {
            let script =
                "sleep 0.5; for i in 1 2 3 4 5 6 7 8 9 10; do echo line$i; done; exec sleep 30";
            Ok(SpawnSpec::new("/bin/sh").args(["-c", script]))
        } else if session_key.starts_with("raw") {
            // Never reads its input.
            let script = "stty raw -echo; echo ready; exec sleep 30";
            Ok(SpawnSpec::new("/bin/sh").args(["-c", script]))
        } else if session_key.starts_with("bytes") {
            let script = "printf 'ok\\377\\376\\n'; exec sleep 30";
            Ok(SpawnSpec::new("/bin/sh").args(["-c", script]))
        } else if session_key.starts_with("missing") {
            Ok(SpawnSpec::new("termbridge-no-such-binary-xyz"))
        } else {
            Ok(SpawnSpec::new("cat"))
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    manager: SessionManager,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let manager = SessionManager::new(ManagerConfig::default()).unwrap();
        let server = WebServer::new(
            WebServerConfig {
                bind_addr: addr,
                sweep_interval: Duration::from_millis(200),
            },
            manager.clone(),
            Arc::new(TestResolver),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));
        Self {
            addr,
            manager,
            shutdown,
            handle,
        }
    }

    async fn connect(&self, path: &str) -> Client {
        let (client, _response) = connect_async(format!("ws://{}{}", self.addr, path))
            .await
            .expect("Failed to connect");
        client
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(FRAME_TIMEOUT, self.handle)
            .await
            .expect("Server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Next JSON frame, or None once the server closed the socket
async fn next_json(client: &mut Client) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(FRAME_TIMEOUT, client.next())
            .await
            .expect("Timed out waiting for frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Next frame of any kind, or None once the server closed the socket
async fn next_frame(client: &mut Client) -> Option<Message> {
    let frame = tokio::time::timeout(FRAME_TIMEOUT, client.next())
        .await
        .expect("Timed out waiting for frame");
    match frame {
        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => None,
        Some(Ok(frame)) => Some(frame),
    }
}

/// Collect output until it contains `needle`; other messages are returned too
async fn read_output_until(client: &mut Client, needle: &str) -> (String, Vec<Value>) {
    let mut output = String::new();
    let mut others = Vec::new();
    while !output.contains(needle) {
        let message = next_json(client)
            .await
            .unwrap_or_else(|| panic!("Socket closed before {:?}; got {:?}", needle, output));
        if message["type"] == "output" {
            output.push_str(message["data"].as_str().unwrap());
        } else {
            others.push(message);
        }
    }
    (output, others)
}

async fn send_json(client: &mut Client, message: Value) {
    client.send(Message::Text(message.to_string())).await.unwrap();
}

async fn expect_connected(client: &mut Client, key: &str) {
    let status = next_json(client).await.expect("Socket closed before status");
    assert_eq!(
        status,
        json!({ "type": "status", "connected": true, "sessionKey": key })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_input_round_trip() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/echo?rows=30&cols=100").await;
    expect_connected(&mut client, "echo").await;

    send_json(&mut client, json!({ "type": "input", "data": "hello\n" })).await;
    let (output, _) = read_output_until(&mut client, "hello").await;
    assert!(output.contains("hello"));

    let info = server.manager.session_info("echo").await.unwrap();
    assert_eq!((info.rows, info.cols), (30, 100));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_frames_are_input() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/binary").await;
    expect_connected(&mut client, "binary").await;

    client.send(Message::Binary(b"raw bytes\n".to_vec())).await.unwrap();
    read_output_until(&mut client, "raw bytes").await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_messages_get_protocol_errors() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/proto").await;
    expect_connected(&mut client, "proto").await;

    client.send(Message::Text("not json".into())).await.unwrap();
    let error = next_json(&mut client).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "protocol_error");

    send_json(&mut client, json!({ "type": "launch_missiles" })).await;
    let error = next_json(&mut client).await.unwrap();
    assert_eq!(error["code"], "protocol_error");
    assert!(error["message"].as_str().unwrap().contains("launch_missiles"));

    send_json(&mut client, json!({ "type": "resize", "rows": "many" })).await;
    let error = next_json(&mut client).await.unwrap();
    assert_eq!(error["code"], "protocol_error");

    // The connection and session survive.
    send_json(&mut client, json!({ "type": "input", "data": "still here\n" })).await;
    read_output_until(&mut client, "still here").await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dangerous_input_is_reported_and_dropped() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/guarded").await;
    expect_connected(&mut client, "guarded").await;

    send_json(
        &mut client,
        json!({ "type": "input", "data": "ok\u{1b}]52;c;cHduZWQ=\u{7}go\n" }),
    )
    .await;

    let mut output = String::new();
    let mut error = None;
    while !output.contains("okgo") || error.is_none() {
        let message = next_json(&mut client).await.expect("Socket closed early");
        match message["type"].as_str() {
            Some("output") => output.push_str(message["data"].as_str().unwrap()),
            Some("error") => error = Some(message),
            _ => {}
        }
    }
    assert!(!output.contains("cHduZWQ"));
    assert_eq!(error.unwrap()["code"], "invalid_input");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_replays_buffered_output() {
    let server = TestServer::start().await;
    let mut first = server.connect("/ws/lines-1").await;
    expect_connected(&mut first, "lines-1").await;
    first.close(None).await.unwrap();
    drop(first);

    // Output lands in the replay buffer while nobody is attached.
    let mut buffered = 0;
    for _ in 0..100 {
        buffered = server
            .manager
            .session_info("lines-1")
            .await
            .map(|info| info.buffered_bytes)
            .unwrap_or_default();
        if buffered >= "line1\r\n".len() * 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(buffered >= 70, "only {} bytes buffered", buffered);
    assert_eq!(
        server.manager.state("lines-1").await,
        Some(termbridge_types::SessionState::Detached)
    );

    let mut second = server.connect("/ws/lines-1").await;
    expect_connected(&mut second, "lines-1").await;
    let (output, _) = read_output_until(&mut second, "line10").await;
    assert!(output.starts_with("line1\r\n"), "unexpected replay: {:?}", output);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_connection_supersedes_old() {
    let server = TestServer::start().await;
    let mut first = server.connect("/ws/twice").await;
    expect_connected(&mut first, "twice").await;

    let mut second = server.connect("/ws/twice").await;
    expect_connected(&mut second, "twice").await;

    assert_eq!(
        next_json(&mut first).await,
        Some(json!({ "type": "status", "connected": false, "sessionKey": "twice" }))
    );
    assert_eq!(next_json(&mut first).await, None);

    send_json(&mut second, json!({ "type": "input", "data": "second\n" })).await;
    read_output_until(&mut second, "second").await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_eof_closes_session() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/finite").await;
    expect_connected(&mut client, "finite").await;

    send_json(&mut client, json!({ "type": "signal", "kind": "eof" })).await;

    let mut closed = None;
    while let Some(message) = next_json(&mut client).await {
        if message["type"] == "closed" {
            closed = Some(message);
        }
    }
    assert_eq!(closed, Some(json!({ "type": "closed", "exitCode": 0 })));
    assert_eq!(
        server.manager.state("finite").await,
        Some(termbridge_types::SessionState::Terminated)
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawn_failure_is_reported() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/missing-cmd").await;

    let error = next_json(&mut client).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "spawn_failed");
    assert_eq!(next_json(&mut client).await, None);
    assert!(server.manager.state("missing-cmd").await.is_none());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rest_routes() {
    let server = TestServer::start().await;
    let base = format!("http://{}", server.addr);

    let mut client = server.connect("/ws/listed").await;
    expect_connected(&mut client, "listed").await;

    let sessions = http_get_json(&format!("{}/api/sessions", base)).await;
    let listed = sessions["sessions"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["session_key"], "listed");
    assert_eq!(listed[0]["state"], "active");

    assert_eq!(http_request("DELETE", &format!("{}/api/sessions/nope", base)).await.0, 404);
    let (status, _) = http_request("DELETE", &format!("{}/api/sessions/listed", base)).await;
    assert_eq!(status, 200);

    let mut closed = false;
    while let Some(message) = next_json(&mut client).await {
        closed |= message["type"] == "closed";
    }
    assert!(closed);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_is_not_stuck_behind_input() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/raw").await;
    expect_connected(&mut client, "raw").await;
    read_output_until(&mut client, "ready").await;

    // More than the terminal will ever take from a process that never reads.
    client
        .send(Message::Binary(vec![b'x'; 2 * 1024 * 1024]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    send_json(&mut client, json!({ "type": "signal", "kind": "interrupt" })).await;

    let mut closed = false;
    while let Some(message) = next_json(&mut client).await {
        if message["type"] == "closed" {
            closed = true;
            break;
        }
    }
    assert!(closed, "interrupt never reached the process");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_utf8_output_arrives_as_binary() {
    let server = TestServer::start().await;
    let mut client = server.connect("/ws/bytes").await;
    expect_connected(&mut client, "bytes").await;

    let mut raw = Vec::new();
    while !raw.windows(2).any(|w| w == [0xff, 0xfe]) {
        match next_frame(&mut client).await {
            Some(Message::Binary(data)) => raw.extend_from_slice(&data),
            Some(Message::Text(text)) => {
                let message: Value = serde_json::from_str(&text).unwrap();
                if message["type"] == "output" {
                    raw.extend_from_slice(message["data"].as_str().unwrap().as_bytes());
                }
            }
            Some(_) => {}
            None => panic!("Socket closed before raw output; got {:?}", raw),
        }
    }
    assert!(raw.windows(2).any(|w| w == b"ok"));
    // Nothing was replaced on the way.
    assert!(!raw.windows(3).any(|w| w == "\u{fffd}".as_bytes()));

    server.stop().await;
}

async fn http_get_json(url: &str) -> Value {
    let (status, body) = http_request("GET", url).await;
    assert_eq!(status, 200);
    serde_json::from_str(&body).unwrap()
}

/// Minimal HTTP/1.1 client over a raw socket
async fn http_request(method: &str, url: &str) -> (u16, String) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let rest = url.strip_prefix("http://").unwrap();
    let (host, path) = rest.split_at(rest.find('/').unwrap());
    let mut stream = TcpStream::connect(host).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        method, path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let status = response[9..12].parse().unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}
