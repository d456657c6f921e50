//! Live terminal stream and its close lifecycle
//!
//! A [`Connection`] is shared between the tasks of one session. Field access:
//!
//! - `sink`: write half, every outbound frame is serialized under this lock and
//!   bounded by the per-write deadline.
//! - `reader`: read half, handed out once through [`Connection::take_reader`].
//! - `closing` / `shutdown`: one-shot close gate and the notification every
//!   waiting task selects on.
//! - `error`: terminal error slot, first writer wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{ControlMessage, TerminalError};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default bound on a single outbound write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One inbound event from the remote stream
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Terminal payload bytes
    Data(Vec<u8>),
    /// The remote side closed the stream normally
    Closed,
}

pub struct Connection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    reader: StdMutex<Option<SplitStream<WsStream>>>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    error: StdMutex<Option<TerminalError>>,
    write_timeout: Duration,
}

impl Connection {
    pub fn new(stream: WsStream, write_timeout: Duration) -> Self {
        let (sink, reader) = stream.split();
        Self {
            sink: Mutex::new(sink),
            reader: StdMutex::new(Some(reader)),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            error: StdMutex::new(None),
            write_timeout,
        }
    }

    /// Hand out the read half. Returns `None` once it has been taken.
    pub fn take_reader(&self) -> Option<FrameReader> {
        lock(&self.reader).take().map(|stream| FrameReader {
            stream,
            shutdown: self.shutdown.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once closure has begun
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Record a terminal error. Only the first one is kept.
    pub fn fail(&self, error: TerminalError) {
        let mut slot = lock(&self.error);
        match slot.as_ref() {
            None => {
                debug!("Recording terminal error: {}", error);
                *slot = Some(error);
            }
            Some(first) => debug!("Ignoring secondary error {} after {}", error, first),
        }
    }

    pub fn take_error(&self) -> Option<TerminalError> {
        lock(&self.error).take()
    }

    /// Send terminal bytes as a text frame
    pub async fn send_text(&self, text: String) -> Result<(), TerminalError> {
        self.send(Message::Text(text)).await
    }

    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), TerminalError> {
        self.send(Message::Text(message.to_json()?)).await
    }

    async fn send(&self, message: Message) -> Result<(), TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::Closed);
        }

        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TerminalError::Closed),
            result = timeout(self.write_timeout, write) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Err(TerminalError::Closed),
                Ok(Err(e)) => Err(TerminalError::Connection(format!("Write failed: {}", e))),
                Err(_) => Err(TerminalError::Connection(format!(
                    "Write stalled for more than {:?}",
                    self.write_timeout
                ))),
            },
        }
    }

    /// Shut the stream down. Safe to call any number of times from any task;
    /// only the first call performs the close handshake.
    pub async fn close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Wake every waiter before touching the sink so nobody blocks on us.
        self.shutdown.cancel();

        let shutdown = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) => info!("Terminal stream closed"),
            Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                info!("Terminal stream already closed by remote")
            }
            Ok(Err(e)) => debug!("Close handshake failed: {}", e),
            Err(_) => warn!(
                "Close handshake did not finish within {:?}",
                self.write_timeout
            ),
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read half of a [`Connection`]
pub struct FrameReader {
    stream: SplitStream<WsStream>,
    shutdown: CancellationToken,
}

impl FrameReader {
    /// Next payload from the remote side.
    ///
    /// Returns `Err(TerminalError::Closed)` without waiting once the owning
    /// connection has begun closing.
    pub async fn next(&mut self) -> Result<Inbound, TerminalError> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(TerminalError::Closed),
                message = self.stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Data(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Inbound::Data(data)),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame)
                            if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) =>
                        {
                            Err(TerminalError::Connection(format!(
                                "Stream closed by remote with code {}: {}",
                                frame.code, frame.reason
                            )))
                        }
                        _ => Ok(Inbound::Closed),
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed)) | None => return Ok(Inbound::Closed),
                Some(Err(e)) => {
                    return Err(TerminalError::Connection(format!("Stream read failed: {}", e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{MockShell, ShellAction};
    use std::sync::Arc;

    async fn connect(shell: &MockShell) -> Connection {
        let (stream, _) = tokio_tungstenite::connect_async(shell.ws_url("/terminal/ws/test"))
            .await
            .unwrap();
        Connection::new(stream, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_close_twice_sends_one_close_frame() {
        let shell = MockShell::start(vec![]).await.unwrap();
        let connection = connect(&shell).await;

        connection.close().await;
        connection.close().await;

        assert!(connection.is_closed());
        shell.wait_for_close_frames(1, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shell.close_frames(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let shell = MockShell::start(vec![]).await.unwrap();
        let connection = Arc::new(connect(&shell).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let connection = connection.clone();
            handles.push(tokio::spawn(async move { connection.close().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        shell.wait_for_close_frames(1, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shell.close_frames(), 1);
    }

    #[tokio::test]
    async fn test_io_after_close_fails_fast() {
        let shell = MockShell::start(vec![ShellAction::Pause(Duration::from_secs(30))])
            .await
            .unwrap();
        let connection = connect(&shell).await;
        let mut reader = connection.take_reader().unwrap();

        connection.close().await;

        let started = std::time::Instant::now();
        assert!(matches!(reader.next().await, Err(TerminalError::Closed)));
        assert!(matches!(
            connection.send_text("ls\n".to_string()).await,
            Err(TerminalError::Closed)
        ));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_closed_unblocks_waiters() {
        let shell = MockShell::start(vec![]).await.unwrap();
        let connection = Arc::new(connect(&shell).await);

        let waiter = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.closed().await })
        };

        connection.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released by close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let shell = MockShell::start(vec![]).await.unwrap();
        let connection = connect(&shell).await;

        connection.fail(TerminalError::Connection("first".to_string()));
        connection.fail(TerminalError::Input("second".to_string()));

        match connection.take_error() {
            Some(TerminalError::Connection(message)) => assert_eq!(message, "first"),
            other => panic!("unexpected error slot: {:?}", other),
        }
        assert!(connection.take_error().is_none());
    }

    #[tokio::test]
    async fn test_reader_handed_out_once() {
        let shell = MockShell::start(vec![]).await.unwrap();
        let connection = connect(&shell).await;

        assert!(connection.take_reader().is_some());
        assert!(connection.take_reader().is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_normal_and_abnormal_closure() {
        let shell = MockShell::start(vec![
            ShellAction::Send("banner\r\n".to_string()),
            ShellAction::Close,
        ])
        .await
        .unwrap();
        let connection = connect(&shell).await;
        let mut reader = connection.take_reader().unwrap();

        assert_eq!(
            reader.next().await.unwrap(),
            Inbound::Data(b"banner\r\n".to_vec())
        );
        assert_eq!(reader.next().await.unwrap(), Inbound::Closed);

        let shell = MockShell::start(vec![ShellAction::Drop]).await.unwrap();
        let connection = connect(&shell).await;
        let mut reader = connection.take_reader().unwrap();
        assert!(matches!(
            reader.next().await,
            Err(TerminalError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_server_error_close_code() {
        let shell = MockShell::start(vec![ShellAction::CloseWith(
            1011,
            "agent crashed".to_string(),
        )])
        .await
        .unwrap();
        let connection = connect(&shell).await;
        let mut reader = connection.take_reader().unwrap();

        match reader.next().await {
            Err(TerminalError::Connection(message)) => {
                assert!(message.contains("1011"), "message: {}", message);
                assert!(message.contains("agent crashed"), "message: {}", message);
            }
            other => panic!("expected a connection error, got {:?}", other),
        }
    }
}
