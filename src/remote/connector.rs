//! Stream upgrade from a negotiated session to a live connection

use std::time::Duration;

use reqwest::Url;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN};
use tracing::{debug, error, info};

use super::connection::Connection;
use super::types::{SessionDescriptor, TerminalError, TerminalSize, redact};

/// Cookie name used to forward the routing identifier
pub const ROUTE_COOKIE: &str = "TERMINAL_ROUTE";

/// Upgrades session descriptors into live terminal streams
pub struct TransportConnector {
    base_url: Url,
    write_timeout: Duration,
}

impl TransportConnector {
    pub fn new(base_url: Url, write_timeout: Duration) -> Self {
        Self {
            base_url,
            write_timeout,
        }
    }

    /// Stream endpoint for a session: the base URL with its scheme switched to
    /// the WebSocket equivalent, the token as a path segment and the terminal
    /// size as query parameters.
    pub fn stream_url(
        &self,
        descriptor: &SessionDescriptor,
        size: TerminalSize,
    ) -> Result<Url, TerminalError> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(TerminalError::Config(format!(
                    "Unsupported server URL scheme: {}",
                    other
                )));
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            TerminalError::Config(format!("Cannot derive stream URL from {}", self.base_url))
        })?;

        url.path_segments_mut()
            .map_err(|_| {
                TerminalError::Config(format!("Base URL cannot carry a path: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(["terminal", "ws", descriptor.token()]);

        url.query_pairs_mut()
            .clear()
            .append_pair("cols", &size.cols.to_string())
            .append_pair("rows", &size.rows.to_string());

        Ok(url)
    }

    /// Value of the `Origin` header: the base URL without a trailing slash
    pub fn origin(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }

    /// Cookies captured during negotiation plus the routing cookie, if any.
    /// The routing cookie wins over a captured cookie of the same name.
    pub fn cookie_header(&self, descriptor: &SessionDescriptor) -> Option<String> {
        let route = descriptor.route_id();
        let mut pairs: Vec<String> = descriptor
            .cookies()
            .iter()
            .filter(|(name, _)| route.is_none() || name != ROUTE_COOKIE)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();

        if let Some(route) = route {
            pairs.push(format!("{}={}", ROUTE_COOKIE, route));
        }

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Build the upgrade request with `Origin` and `Cookie` headers attached
    pub fn upgrade_request(
        &self,
        descriptor: &SessionDescriptor,
        size: TerminalSize,
    ) -> Result<Request, TerminalError> {
        let url = self.stream_url(descriptor, size)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TerminalError::Protocol(format!("Invalid stream URL: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(ORIGIN, header_value(&self.origin())?);
        if let Some(cookie) = self.cookie_header(descriptor) {
            headers.insert(COOKIE, header_value(&cookie)?);
        }

        Ok(request)
    }

    /// Upgrade to a live stream. The descriptor is consumed; a session token
    /// authorizes exactly one upgrade.
    pub async fn connect(
        &self,
        descriptor: SessionDescriptor,
        size: TerminalSize,
    ) -> Result<Connection, TerminalError> {
        let request = self.upgrade_request(&descriptor, size)?;
        let display_url = request
            .uri()
            .to_string()
            .replace(descriptor.token(), &redact(descriptor.token()));
        debug!("Upgrading terminal stream at {}", display_url);

        match connect_async(request).await {
            Ok((stream, response)) => {
                info!(
                    "Terminal stream open ({} cols x {} rows, status {})",
                    size.cols,
                    size.rows,
                    response.status()
                );
                Ok(Connection::new(stream, self.write_timeout))
            }
            Err(WsError::Http(response)) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body).trim().to_string())
                    .unwrap_or_default();
                error!("Stream upgrade rejected with HTTP {}", status);
                Err(TerminalError::UpgradeRejected { status, body })
            }
            Err(e) => Err(TerminalError::Connection(format!(
                "Failed to connect to {}: {}",
                display_url, e
            ))),
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TerminalError> {
    HeaderValue::from_str(value)
        .map_err(|e| TerminalError::Protocol(format!("Invalid header value: {}", e)))
}
