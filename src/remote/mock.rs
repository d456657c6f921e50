//! Scripted loopback terminal server
//! Used for testing where no real build server or agent shell is reachable
//!
//! One listener serves both halves of a terminal session: `POST` requests get
//! a session descriptor (with a cookie and a routing header), everything else
//! is treated as a stream upgrade and driven by a script of [`ShellAction`]s.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

/// One step of the simulated shell
#[derive(Debug, Clone)]
pub enum ShellAction {
    /// Send text to the client
    Send(String),
    /// Do nothing for a while
    Pause(Duration),
    /// Wait for the next non-control frame from the client
    AwaitInput,
    /// Send the last received input back, like terminal echo
    EchoInput,
    /// Wait for a command line, echo it and run each `;`-separated segment
    /// the way a minimal shell would; `exit` closes the stream normally
    Interpret,
    /// Close the stream with a normal close frame
    Close,
    /// Close the stream with the given close code and reason
    CloseWith(u16, String),
    /// Drop the TCP connection without a close handshake
    Drop,
}

/// Behaviour knobs for [`MockShell`]
#[derive(Debug, Clone)]
pub struct MockShellOptions {
    pub script: Vec<ShellAction>,
    /// Token returned by the session endpoint
    pub token: String,
    /// Routing identifier returned in the response body
    pub body_route: Option<String>,
    /// Routing identifier returned in the routing header
    pub header_route: Option<String>,
    /// `Set-Cookie` value returned by the session endpoint
    pub session_cookie: Option<String>,
    /// Status for the session endpoint
    pub session_status: u16,
    /// Reject stream upgrades with this status and body
    pub reject_upgrade: Option<(u16, String)>,
    /// Canned output for commands run by [`ShellAction::Interpret`]
    pub commands: HashMap<String, String>,
    /// Split every outbound text into chunks of this many bytes
    pub chunk_size: Option<usize>,
}

impl Default for MockShellOptions {
    fn default() -> Self {
        Self {
            script: Vec::new(),
            token: "abc123".to_string(),
            body_route: None,
            header_route: None,
            session_cookie: None,
            session_status: 200,
            reject_upgrade: None,
            commands: HashMap::new(),
            chunk_size: None,
        }
    }
}

/// What the server saw during the stream upgrade
#[derive(Debug, Clone, Default)]
pub struct HandshakeRecord {
    pub path_and_query: String,
    pub origin: Option<String>,
    pub cookie: Option<String>,
}

/// What the server saw on the session endpoint
#[derive(Debug, Clone, Default)]
pub struct SessionRequestRecord {
    pub path: String,
    pub authorization: Option<String>,
    pub cookie: Option<String>,
}

#[derive(Default)]
struct Observed {
    frames: Mutex<Vec<String>>,
    handshakes: Mutex<Vec<HandshakeRecord>>,
    session_requests: Mutex<Vec<SessionRequestRecord>>,
    close_frames: AtomicUsize,
}

/// Loopback terminal server for tests
pub struct MockShell {
    addr: SocketAddr,
    observed: Arc<Observed>,
    task: JoinHandle<()>,
}

impl MockShell {
    /// Start a server that plays `script` on the first stream upgrade
    pub async fn start(script: Vec<ShellAction>) -> io::Result<Self> {
        Self::start_with(MockShellOptions {
            script,
            ..MockShellOptions::default()
        })
        .await
    }

    /// Start a server that rejects every stream upgrade
    pub async fn rejecting(status: u16, body: impl Into<String>) -> io::Result<Self> {
        Self::start_with(MockShellOptions {
            reject_upgrade: Some((status, body.into())),
            ..MockShellOptions::default()
        })
        .await
    }

    pub async fn start_with(options: MockShellOptions) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let observed = Arc::new(Observed::default());
        let task = tokio::spawn(serve(listener, options, observed.clone()));

        Ok(Self {
            addr,
            observed,
            task,
        })
    }

    /// HTTP base URL of the server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL for an arbitrary path on the server
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Every text frame received from the client, in order
    pub fn received(&self) -> Vec<String> {
        lock(&self.observed.frames).clone()
    }

    /// Received frames that are not control messages
    pub fn received_input(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|frame| !is_control_frame(frame))
            .collect()
    }

    /// First stream upgrade seen
    pub fn handshake(&self) -> Option<HandshakeRecord> {
        lock(&self.observed.handshakes).first().cloned()
    }

    pub fn handshakes(&self) -> Vec<HandshakeRecord> {
        lock(&self.observed.handshakes).clone()
    }

    pub fn session_requests(&self) -> Vec<SessionRequestRecord> {
        lock(&self.observed.session_requests).clone()
    }

    pub fn close_frames(&self) -> usize {
        self.observed.close_frames.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` close frames arrived or `limit` elapsed
    pub async fn wait_for_close_frames(&self, count: usize, limit: Duration) {
        let _ = tokio::time::timeout(limit, async {
            while self.close_frames() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    }

    /// Wait until a received frame satisfies `predicate` or `limit` elapsed
    pub async fn wait_for_frame<F>(&self, limit: Duration, predicate: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        tokio::time::timeout(limit, async {
            loop {
                if let Some(frame) = self.received().into_iter().find(|f| predicate(f)) {
                    return frame;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .ok()
    }
}

impl Drop for MockShell {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn is_control_frame(frame: &str) -> bool {
    serde_json::from_str::<crate::remote::types::ControlMessage>(frame).is_ok()
}

async fn serve(listener: TcpListener, options: MockShellOptions, observed: Arc<Observed>) {
    let options = Arc::new(options);
    let mut script_played = false;

    while let Ok((stream, _)) = listener.accept().await {
        if is_session_request(&stream).await {
            let options = options.clone();
            let observed = observed.clone();
            tokio::spawn(async move {
                if let Err(e) = answer_session_request(stream, &options, &observed).await {
                    debug!("Mock session request failed: {}", e);
                }
            });
        } else {
            let script = if script_played {
                Vec::new()
            } else {
                script_played = true;
                options.script.clone()
            };
            let options = options.clone();
            let observed = observed.clone();
            tokio::spawn(run_stream(stream, script, options, observed));
        }
    }
}

async fn is_session_request(stream: &TcpStream) -> bool {
    let mut head = [0u8; 5];
    loop {
        match stream.peek(&mut head).await {
            Ok(n) if n >= 5 => return &head == b"POST ",
            Ok(0) | Err(_) => return false,
            Ok(_) => tokio::task::yield_now().await,
        }
    }
}

async fn answer_session_request(
    mut stream: TcpStream,
    options: &MockShellOptions,
    observed: &Observed,
) -> io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&head);
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default()
        .to_string();
    let headers: Vec<(&str, &str)> = lines.filter_map(|line| line.split_once(':')).collect();
    let header = |wanted: &str| {
        headers
            .iter()
            .find(|(name, _)| name.trim().eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.trim().to_string())
    };
    lock(&observed.session_requests).push(SessionRequestRecord {
        path,
        authorization: header("authorization"),
        cookie: header("cookie"),
    });

    let body = match &options.body_route {
        Some(route) => serde_json::json!({"token": options.token, "routeId": route}),
        None => serde_json::json!({"token": options.token}),
    }
    .to_string();

    let reason = StatusCode::from_u16(options.session_status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown");
    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        options.session_status,
        reason,
        body.len()
    );
    if let Some(cookie) = &options.session_cookie {
        response.push_str(&format!("Set-Cookie: {}\r\n", cookie));
    }
    if let Some(route) = &options.header_route {
        response.push_str(&format!(
            "{}: {}\r\n",
            crate::remote::negotiator::ROUTE_HEADER,
            route
        ));
    }
    response.push_str("\r\n");
    response.push_str(&body);

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn run_stream(
    stream: TcpStream,
    script: Vec<ShellAction>,
    options: Arc<MockShellOptions>,
    observed: Arc<Observed>,
) {
    let record = observed.clone();
    let reject = options.reject_upgrade.clone();
    let callback = move |request: &Request, response: Response| {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        lock(&record.handshakes).push(HandshakeRecord {
            path_and_query: request
                .uri()
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_default(),
            origin: header("origin"),
            cookie: header("cookie"),
        });

        match reject {
            Some((status, body)) => {
                let mut rejection = ErrorResponse::new(Some(body));
                *rejection.status_mut() =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
                Err(rejection)
            }
            None => Ok(response),
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Mock upgrade ended: {}", e);
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();

    let reader_observed = observed.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = source.next().await {
            match message {
                Message::Text(text) => {
                    lock(&reader_observed.frames).push(text.clone());
                    if !is_control_frame(&text) {
                        let _ = input_tx.send(text);
                    }
                }
                Message::Close(_) => {
                    reader_observed.close_frames.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    });

    let mut shell = ScriptedShell {
        sink: &mut sink,
        options: &options,
        last_input: String::new(),
    };

    for action in script {
        match action {
            ShellAction::Send(text) => shell.send(&text).await,
            ShellAction::Pause(duration) => tokio::time::sleep(duration).await,
            ShellAction::AwaitInput => {
                if let Some(input) = input_rx.recv().await {
                    shell.last_input = input;
                }
            }
            ShellAction::EchoInput => {
                let echo = shell.last_input.clone();
                shell.send(&echo).await;
            }
            ShellAction::Interpret => {
                let Some(line) = input_rx.recv().await else {
                    break;
                };
                if shell.interpret(&line).await {
                    shell.close().await;
                }
            }
            ShellAction::Close => shell.close().await,
            ShellAction::CloseWith(code, reason) => {
                shell.close_with(CloseCode::from(code), &reason).await
            }
            ShellAction::Drop => {
                reader.abort();
                return;
            }
        }
    }

    let _ = reader.await;
}

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct ScriptedShell<'a> {
    sink: &'a mut ServerSink,
    options: &'a MockShellOptions,
    last_input: String,
}

impl ScriptedShell<'_> {
    async fn send(&mut self, text: &str) {
        let chunks = match self.options.chunk_size {
            Some(size) if size > 0 => split_chunks(text, size),
            _ => vec![text.to_string()],
        };
        for chunk in chunks {
            if self.sink.send(Message::Text(chunk)).await.is_err() {
                return;
            }
        }
    }

    async fn close(&mut self) {
        self.close_with(CloseCode::Normal, "").await;
    }

    async fn close_with(&mut self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
    }

    /// Returns true when the line asked the shell to exit
    async fn interpret(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        self.send(&format!("{}\r\n", line)).await;

        for segment in line.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if segment == "exit" {
                return true;
            }
            let output = match segment.strip_prefix("echo") {
                Some(args) if args.is_empty() || args.starts_with(' ') => {
                    format!("{}\r\n", args.trim())
                }
                _ => match self.options.commands.get(segment) {
                    Some(output) => output.replace('\n', "\r\n"),
                    None => format!("sh: {}: command not found\r\n", segment),
                },
            };
            self.send(&output).await;
        }

        self.send("$ ").await;
        false
    }
}

fn split_chunks(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
