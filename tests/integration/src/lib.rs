//! Helpers for driving an in-process agent backed by a fake runtime

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use futures_util::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use node_exec_agent::domain::{ContainerSummary, ExecConfig, ExecInspect, TerminalSize};
use node_exec_agent::infra::container_index::{POD_CONTAINER_LABEL, POD_NAME_LABEL, POD_UID_LABEL};
use node_exec_agent::infra::spdy::codec::{SpdyDecoder, SpdyEncoder};
use node_exec_agent::infra::spdy::{Frame, HeaderBlock};
use node_exec_agent::infra::{
    AttachOptions, AttachedStreams, ContainerIndex, ResizeTarget, Runtime, RuntimeOutput,
};
use node_exec_agent::{api, AppState, Config, Error, Result};

pub const BASE_PATH: &str = "/dockin/opagent";
pub const TEST_POD: &str = "web-0";
pub const TEST_CONTAINER: &str = "c1";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Health check response
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Body of the prepare endpoints
#[derive(Debug, Deserialize)]
pub struct PrepareResponse {
    pub url: String,
}

/// Body of the legacy common exec endpoint
#[derive(Debug, Deserialize)]
pub struct AgentResult {
    pub code: i32,
    pub message: String,
    pub data: serde_json::Value,
}

/// Test configuration pointing at a running agent
pub struct TestConfig {
    pub addr: SocketAddr,
    pub base_url: String,
    pub client: reqwest::Client,
}

impl TestConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            base_url: format!("http://{}", addr),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, BASE_PATH, path)
    }

    /// WebSocket URL for a path that already carries the base prefix
    pub fn ws_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.replacen("http://", "ws://", 1), path)
    }

    pub fn api_ws_url(&self, path: &str) -> String {
        self.ws_url(&format!("{}{}", BASE_PATH, path))
    }
}

/// Runtime double that understands a few commands:
/// `echo ARGS..` prints its arguments, `cat` echoes stdin back,
/// `sh -c "exit N"` exits with N and anything else exits 0 silently
#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicUsize,
    execs: Mutex<HashMap<String, ExecConfig>>,
    resizes: Mutex<Vec<(ResizeTarget, TerminalSize)>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resizes(&self) -> Vec<(ResizeTarget, TerminalSize)> {
        self.resizes.lock().unwrap().clone()
    }

    fn exit_code(config: &ExecConfig) -> i64 {
        match config.cmd.as_slice() {
            [sh, flag, script] if sh == "sh" && flag == "-c" => script
                .strip_prefix("exit ")
                .and_then(|code| code.trim().parse().ok())
                .unwrap_or(0),
            _ => 0,
        }
    }
}

/// Streams of a process that writes back whatever it reads
fn echo_streams() -> AttachedStreams {
    let (input, mut reader) = tokio::io::duplex(4096);
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = RuntimeOutput::Stdout(Bytes::copy_from_slice(&buf[..n]));
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    let output = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    AttachedStreams {
        output: output.boxed(),
        input: Box::pin(input),
    }
}

fn canned_streams(chunks: Vec<RuntimeOutput>) -> AttachedStreams {
    AttachedStreams {
        output: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        input: Box::pin(tokio::io::sink()),
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create_exec(&self, container_id: &str, config: &ExecConfig) -> Result<String> {
        if container_id != TEST_CONTAINER {
            return Err(Error::DockerError(format!("No such container: {}", container_id)));
        }
        let id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.execs.lock().unwrap().insert(id.clone(), config.clone());
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, _tty: bool) -> Result<AttachedStreams> {
        let config = self
            .execs
            .lock()
            .unwrap()
            .get(exec_id)
            .cloned()
            .ok_or_else(|| Error::ExecFailed(format!("unknown exec {}", exec_id)))?;

        Ok(match config.cmd.first().map(String::as_str) {
            Some("cat") => echo_streams(),
            Some("echo") => canned_streams(vec![RuntimeOutput::Stdout(Bytes::from(format!(
                "{}\n",
                config.cmd[1..].join(" ")
            )))]),
            _ => canned_streams(Vec::new()),
        })
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect> {
        let execs = self.execs.lock().unwrap();
        let config = execs
            .get(exec_id)
            .ok_or_else(|| Error::ExecFailed(format!("unknown exec {}", exec_id)))?;
        Ok(ExecInspect {
            exit_code: Self::exit_code(config),
            running: false,
        })
    }

    async fn resize(&self, target: &ResizeTarget, size: TerminalSize) -> Result<()> {
        self.resizes.lock().unwrap().push((target.clone(), size));
        Ok(())
    }

    async fn attach(&self, container_id: &str, _options: AttachOptions) -> Result<AttachedStreams> {
        if container_id != TEST_CONTAINER {
            return Err(Error::DockerError(format!("No such container: {}", container_id)));
        }
        Ok(echo_streams())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(vec![ContainerSummary {
            id: TEST_CONTAINER.to_string(),
            image: "app:latest".to_string(),
            state: "running".to_string(),
            labels: HashMap::from([
                (POD_NAME_LABEL.to_string(), TEST_POD.to_string()),
                (POD_CONTAINER_LABEL.to_string(), "app".to_string()),
                (POD_UID_LABEL.to_string(), "uid-1".to_string()),
            ]),
        }])
    }
}

/// Agent configuration used by most tests
pub fn test_agent_config() -> Config {
    Config {
        access_token_enabled: false,
        exec_poll_interval: 10,
        ..Default::default()
    }
}

pub struct TestAgent {
    pub config: TestConfig,
    pub runtime: Arc<FakeRuntime>,
}

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Serve the full router on an ephemeral port
pub async fn spawn_agent(config: Config) -> TestAgent {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Failed to read local address");

    let runtime = Arc::new(FakeRuntime::new());
    let index = Arc::new(ContainerIndex::new());
    index
        .refresh(runtime.as_ref())
        .await
        .expect("Failed to load container index");

    let state = AppState::new(Arc::new(config), runtime.clone(), index);
    let app = api::http::create_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });

    TestAgent {
        config: TestConfig::new(addr),
        runtime,
    }
}

/// Open a WebSocket, optionally offering one sub-protocol
pub async fn connect_ws(url: &str, protocol: Option<&str>) -> WsClient {
    let mut request = url
        .into_client_request()
        .expect("Failed to build websocket request");
    if let Some(p) = protocol {
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(p).expect("Invalid protocol header"),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("Failed to connect websocket");
    ws
}

/// Next binary channel frame as `(channel, payload)`, `None` once the server closed
pub async fn next_frame(ws: &mut WsClient) -> Option<(u8, Vec<u8>)> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timed out waiting for a frame")?;
        match msg {
            Ok(Message::Binary(data)) => {
                let (channel, payload) = data.split_first()?;
                return Some((*channel, payload.to_vec()));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Drain the session and collect payloads per channel
pub async fn collect_channels(ws: &mut WsClient) -> HashMap<u8, Vec<u8>> {
    let mut channels: HashMap<u8, Vec<u8>> = HashMap::new();
    while let Some((channel, payload)) = next_frame(ws).await {
        channels.entry(channel).or_default().extend(payload);
    }
    channels
}

pub fn binary_frame(channel: u8, data: &[u8]) -> Message {
    let mut frame = Vec::with_capacity(data.len() + 1);
    frame.push(channel);
    frame.extend_from_slice(data);
    Message::Binary(frame.into())
}

/// Response head of a SPDY upgrade request; `stream` carries the session after a 101
pub struct SpdyUpgrade {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub stream: TcpStream,
}

impl SpdyUpgrade {
    pub fn header(&self, name: &str) -> Vec<String> {
        self.headers.get(name).cloned().unwrap_or_default()
    }
}

/// POST an upgrade to `path` offering `protocols` and read the response head
pub async fn spdy_upgrade(addr: SocketAddr, path: &str, protocols: &[&str]) -> SpdyUpgrade {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to agent");

    let mut request = format!(
        "POST {}{} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\nContent-Length: 0\r\n",
        BASE_PATH, path, addr
    );
    for protocol in protocols {
        request.push_str(&format!("X-Stream-Protocol-Version: {}\r\n", protocol));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to send upgrade request");

    // One byte at a time so no session bytes are consumed with the head
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("Timed out reading upgrade response")
            .expect("Failed to read upgrade response");
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head).into_owned();
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("Malformed status line");
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers
                .entry(name.trim().to_ascii_lowercase())
                .or_default()
                .push(value.trim().to_string());
        }
    }

    SpdyUpgrade {
        status,
        headers,
        stream,
    }
}

/// Client side of a SPDY/3.1 session
pub struct SpdyClient {
    reader: FramedRead<ReadHalf<TcpStream>, SpdyDecoder>,
    writer: FramedWrite<WriteHalf<TcpStream>, SpdyEncoder>,
    next_stream_id: u32,
}

impl SpdyClient {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(read_half, SpdyDecoder::new()),
            writer: FramedWrite::new(
                write_half,
                SpdyEncoder::new().expect("Failed to create header compressor"),
            ),
            next_stream_id: 1,
        }
    }

    /// Open a client stream of `stream_type` and return its id
    pub async fn open(&mut self, stream_type: &str) -> u32 {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        self.writer
            .send(Frame::SynStream {
                stream_id,
                associated_stream_id: 0,
                priority: 0,
                flags: 0,
                headers: HeaderBlock::new().with("streamType", stream_type),
            })
            .await
            .expect("Failed to open stream");
        stream_id
    }

    pub async fn send(&mut self, stream_id: u32, data: &[u8]) {
        self.writer
            .send(Frame::data(stream_id, Bytes::copy_from_slice(data)))
            .await
            .expect("Failed to send data");
    }

    /// Half-close a client stream
    pub async fn finish(&mut self, stream_id: u32) {
        self.writer
            .send(Frame::fin(stream_id))
            .await
            .expect("Failed to half-close stream");
    }

    /// Read until the agent ends the session; data per stream id and the
    /// ids that received a SYN_REPLY
    pub async fn collect(&mut self) -> (HashMap<u32, Vec<u8>>, Vec<u32>) {
        let mut data: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut replied = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.next())
                .await
                .expect("Timed out waiting for a spdy frame");
            match frame {
                Some(Ok(Frame::Data {
                    stream_id,
                    data: chunk,
                    ..
                })) => data.entry(stream_id).or_default().extend_from_slice(&chunk),
                Some(Ok(Frame::SynReply { stream_id, .. })) => replied.push(stream_id),
                Some(Ok(Frame::GoAway { .. })) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
        (data, replied)
    }
}
