//! Interactive pass-through between a local terminal and the remote shell

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::connection::{Connection, FrameReader, Inbound};
use crate::remote::types::{ControlMessage, TerminalError};
use crate::terminal::ResizeSource;

/// Default interval between keepalive pings
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

const INPUT_BUFFER_SIZE: usize = 4096;

/// Bidirectional byte pump with keepalive and resize forwarding
pub struct DuplexRelay {
    connection: Arc<Connection>,
    keepalive_interval: Duration,
}

impl DuplexRelay {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Arc::new(connection),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Shared handle to the underlying connection, e.g. to close it from elsewhere
    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    /// Relay until the first terminal condition: remote closure, local input
    /// EOF or failure, a transport error, or `cancel` firing.
    ///
    /// Normal closure, local EOF and cancellation return `Ok(())`. The
    /// connection is closed on every exit path.
    pub async fn run<I, O, R>(
        self,
        input: I,
        output: O,
        mut resize: R,
        cancel: CancellationToken,
    ) -> Result<(), TerminalError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        R: ResizeSource,
    {
        let Some(reader) = self.connection.take_reader() else {
            self.connection.close().await;
            return Err(TerminalError::Connection(
                "Stream reader already in use".to_string(),
            ));
        };

        let (error_tx, mut error_rx) = mpsc::channel(2);
        let inbound = tokio::spawn(inbound_pump(self.connection.clone(), reader, output));
        let outbound = tokio::spawn(outbound_pump(self.connection.clone(), input, error_tx));

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resize_open = true;

        info!("Interactive relay running");
        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Relay cancelled");
                    break Ok(());
                }

                _ = self.connection.closed() => {
                    break match self.connection.take_error() {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }

                Some(error) = error_rx.recv() => {
                    warn!("Outbound pump failed: {}", error);
                    self.connection.fail(error);
                    self.connection.close().await;
                }

                size = resize.next_resize(), if resize_open => match size {
                    Some(size) => {
                        debug!("Forwarding resize to {}x{}", size.cols, size.rows);
                        self.send_control(ControlMessage::resize(size)).await;
                    }
                    None => {
                        debug!("Resize source exhausted");
                        resize_open = false;
                    }
                },

                _ = keepalive.tick() => {
                    debug!("Sending keepalive ping");
                    self.send_control(ControlMessage::ping()).await;
                }
            }
        };

        self.connection.close().await;
        inbound.abort();
        outbound.abort();
        info!("Interactive relay stopped");

        outcome
    }

    async fn send_control(&self, message: ControlMessage) {
        match self.connection.send_control(&message).await {
            Ok(()) => {}
            Err(TerminalError::Closed) => {}
            Err(error) => {
                warn!("Failed to send control message: {}", error);
                self.connection.fail(error);
                self.connection.close().await;
            }
        }
    }
}

/// Remote stream to local output. Normal closure ends silently; anything
/// else is recorded as the connection's terminal error.
async fn inbound_pump<O>(connection: Arc<Connection>, mut reader: FrameReader, mut output: O)
where
    O: AsyncWrite + Unpin,
{
    loop {
        match reader.next().await {
            Ok(Inbound::Data(payload)) => {
                let written = async {
                    output.write_all(&payload).await?;
                    output.flush().await
                };
                if let Err(e) = written.await {
                    connection.fail(TerminalError::Input(format!(
                        "Failed to write local output: {}",
                        e
                    )));
                    break;
                }
            }
            Ok(Inbound::Closed) => {
                info!("Remote shell closed the stream");
                break;
            }
            Err(TerminalError::Closed) => break,
            Err(error) => {
                warn!("Inbound stream failed: {}", error);
                connection.fail(error);
                break;
            }
        }
    }

    connection.close().await;
}

/// Local input to remote stream
async fn outbound_pump<I>(
    connection: Arc<Connection>,
    mut input: I,
    errors: mpsc::Sender<TerminalError>,
) where
    I: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; INPUT_BUFFER_SIZE];
    let mut decoder = Utf8Carry::default();

    loop {
        let read = tokio::select! {
            biased;
            _ = connection.closed() => break,
            read = input.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!("Local input reached EOF");
                connection.close().await;
                break;
            }
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                match connection.send_text(text).await {
                    Ok(()) => {}
                    Err(TerminalError::Closed) => break,
                    Err(error) => {
                        let _ = errors.send(error).await;
                        break;
                    }
                }
            }
            Err(e) => {
                let _ = errors
                    .send(TerminalError::Input(format!("Failed to read local input: {}", e)))
                    .await;
                break;
            }
        }
    }
}

/// Turns byte chunks into text without splitting multi-byte characters that
/// straddle two reads.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        // Incomplete sequence at the end: keep it for the next read.
                        None => {
                            self.pending.drain(..valid_up_to);
                            return text;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }
    }
}
