//! Session negotiation against the server's terminal endpoint

use std::time::Duration;

use reqwest::{StatusCode, Url};
use tracing::{debug, info, warn};

use super::types::{Credentials, SessionDescriptor, TerminalError};

/// Response header carrying the routing identifier when the body omits it
pub const ROUTE_HEADER: &str = "X-Terminal-Route";

/// Obtains session descriptors with one authenticated request per session.
///
/// The HTTP client keeps no cookie store. Cookies from each response are
/// handed back on that session's descriptor and never reused.
pub struct SessionNegotiator {
    base_url: Url,
    client: reqwest::Client,
    credentials: Credentials,
}

impl SessionNegotiator {
    pub fn new(
        base_url: Url,
        credentials: Credentials,
        request_timeout: Duration,
    ) -> Result<Self, TerminalError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TerminalError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            client,
            credentials,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Session-creation URL for an agent
    pub fn session_url(&self, agent: &str) -> Result<Url, TerminalError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TerminalError::Config(format!("Base URL cannot carry a path: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(["computer", agent, "terminal", "session"]);
        Ok(url)
    }

    /// Create a terminal session on the given agent
    pub async fn create_session(&self, agent: &str) -> Result<SessionDescriptor, TerminalError> {
        let url = self.session_url(agent)?;
        debug!("Requesting terminal session from: {}", url);

        let request = match &self.credentials {
            Credentials::Anonymous => self.client.post(url.clone()),
            Credentials::Basic { username, token } => self
                .client
                .post(url.clone())
                .basic_auth(username, Some(token)),
            Credentials::Bearer(token) => self.client.post(url.clone()).bearer_auth(token),
        };

        let response = request
            .send()
            .await
            .map_err(|e| TerminalError::Http(format!("Failed to send HTTP request: {}", e)))?;

        let status = response.status();
        match status {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(TerminalError::Authentication),
            StatusCode::FORBIDDEN => return Err(TerminalError::PermissionDenied),
            _ => {
                let body = response.text().await.unwrap_or_default();
                warn!("Terminal session request for {} failed with {}", agent, status);
                return Err(TerminalError::FeatureUnavailable {
                    status: status.as_u16(),
                    body,
                });
            }
        }

        let header_route = response
            .headers()
            .get(ROUTE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let cookies: Vec<(String, String)> = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();
        debug!("Session response set {} cookie(s)", cookies.len());

        let descriptor: SessionDescriptor = response
            .json()
            .await
            .map_err(|e| TerminalError::Protocol(format!("Failed to parse session response: {}", e)))?;
        let descriptor = descriptor
            .with_route_fallback(header_route)
            .with_cookies(cookies);

        info!(
            "Created terminal session on {}: token={}, route={:?}",
            agent,
            descriptor.redacted_token(),
            descriptor.route_id()
        );

        Ok(descriptor)
    }
}
