//! Session Manager tying negotiation, stream upgrade and the two usage modes together

use std::time::Duration;

use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::remote::connection::Connection;
use crate::remote::types::{ExecResult, TerminalError, TerminalSize};
use crate::remote::{SessionNegotiator, TransportConnector};
use crate::terminal::{self, RawModeGuard, ResizeSource};

use super::exec::FramedExec;
use super::relay::DuplexRelay;

/// Timing knobs derived from configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
    pub default_size: TerminalSize,
    pub resize_poll_interval: Duration,
    pub ready_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(config.terminal.keepalive_interval_secs),
            write_timeout: Duration::from_secs(config.terminal.write_timeout_secs),
            default_size: TerminalSize::new(
                config.terminal.default_cols,
                config.terminal.default_rows,
            ),
            resize_poll_interval: Duration::from_millis(config.terminal.resize_poll_interval_ms),
            ready_timeout: Duration::from_millis(config.exec.ready_timeout_ms),
            settle_delay: Duration::from_millis(config.exec.settle_delay_ms),
        }
    }
}

/// Entry point for remote terminal sessions
pub struct SessionManager {
    config: SessionConfig,
    negotiator: SessionNegotiator,
    connector: TransportConnector,
}

impl SessionManager {
    /// Create a new SessionManager
    pub fn new(app_config: &Config) -> Result<Self, TerminalError> {
        let base_url = Url::parse(&app_config.server.url).map_err(|e| {
            TerminalError::Config(format!("Invalid server URL {}: {}", app_config.server.url, e))
        })?;
        let config = SessionConfig::from(app_config);

        let negotiator = SessionNegotiator::new(
            base_url.clone(),
            app_config.server.credentials(),
            Duration::from_secs(app_config.server.request_timeout_seconds),
        )?;
        let connector = TransportConnector::new(base_url, config.write_timeout);

        Ok(Self {
            config,
            negotiator,
            connector,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Negotiate a session on `agent` and upgrade it to a live stream.
    ///
    /// Nothing carries over between calls: each stream is upgraded with the
    /// cookies its own negotiation returned.
    pub async fn open(&self, agent: &str, size: TerminalSize) -> Result<Connection, TerminalError> {
        let descriptor = self.negotiator.create_session(agent).await?;
        self.connector.connect(descriptor, size).await
    }

    /// Run an interactive shell on `agent` using the process's own terminal.
    ///
    /// The local terminal is in raw mode for the whole session and restored
    /// on every exit path.
    pub async fn run_shell(
        &self,
        agent: &str,
        size: Option<TerminalSize>,
        cancel: CancellationToken,
    ) -> Result<(), TerminalError> {
        let size = size
            .or_else(terminal::current_size)
            .unwrap_or(self.config.default_size);
        let connection = self.open(agent, size).await?;

        let _raw_mode = RawModeGuard::acquire()?;
        let resize = terminal::default_resize_source(self.config.resize_poll_interval);
        self.relay(
            connection,
            tokio::io::stdin(),
            tokio::io::stdout(),
            resize,
            cancel,
        )
        .await
    }

    /// Relay an already open connection over arbitrary local streams
    pub async fn relay<I, O, R>(
        &self,
        connection: Connection,
        input: I,
        output: O,
        resize: R,
        cancel: CancellationToken,
    ) -> Result<(), TerminalError>
    where
        I: tokio::io::AsyncRead + Unpin + Send + 'static,
        O: tokio::io::AsyncWrite + Unpin + Send + 'static,
        R: ResizeSource,
    {
        DuplexRelay::new(connection)
            .with_keepalive_interval(self.config.keepalive_interval)
            .run(input, output, resize, cancel)
            .await
    }

    /// Run one command on `agent` and return its output. A fresh session is
    /// negotiated for every call.
    pub async fn exec(&self, agent: &str, command: &str, deadline: Duration) -> ExecResult {
        info!("Running framed command on {}", agent);
        let connection = match self.open(agent, self.config.default_size).await {
            Ok(connection) => connection,
            Err(error) => {
                warn!("Could not open terminal on {}: {}", agent, error);
                return ExecResult::failure(String::new(), error);
            }
        };

        FramedExec::new(connection)
            .with_ready_timeout(self.config.ready_timeout)
            .with_settle_delay(self.config.settle_delay)
            .run(command, deadline)
            .await
    }
}
