//! Session negotiation tests against a mock HTTP server

use std::time::Duration;

use agentsh::remote::{
    Credentials, ErrorCategory, SessionNegotiator, TerminalError, TerminalSize,
    TransportConnector,
};
use reqwest::Url;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION_PATH: &str = "/computer/agent-1/terminal/session";

fn negotiator(server: &MockServer, credentials: Credentials) -> SessionNegotiator {
    SessionNegotiator::new(
        Url::parse(&server.uri()).unwrap(),
        credentials,
        Duration::from_secs(5),
    )
    .unwrap()
}

async fn mount_status(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_token_only_body_builds_stream_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc123"})))
        .expect(1)
        .mount(&server)
        .await;

    let negotiator = negotiator(&server, Credentials::Anonymous);
    let descriptor = negotiator.create_session("agent-1").await.unwrap();
    assert_eq!(descriptor.token(), "abc123");
    assert_eq!(descriptor.route_id(), None);

    let connector = TransportConnector::new(negotiator.base_url().clone(), Duration::from_secs(10));
    let url = connector
        .stream_url(&descriptor, TerminalSize::new(80, 24))
        .unwrap();
    assert!(url.as_str().contains("/abc123"));
    assert!(url.as_str().contains("cols=80&rows=24"));
    assert!(url.as_str().starts_with("ws://"));
}

#[tokio::test]
async fn test_route_falls_back_to_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "abc123"}))
                .insert_header("X-Terminal-Route", "node-7"),
        )
        .mount(&server)
        .await;

    let descriptor = negotiator(&server, Credentials::Anonymous)
        .create_session("agent-1")
        .await
        .unwrap();
    assert_eq!(descriptor.route_id(), Some("node-7"));
}

#[tokio::test]
async fn test_body_route_wins_over_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "abc123", "routeId": "node-1"}))
                .insert_header("X-Terminal-Route", "node-7"),
        )
        .mount(&server)
        .await;

    let descriptor = negotiator(&server, Credentials::Anonymous)
        .create_session("agent-1")
        .await
        .unwrap();
    assert_eq!(descriptor.route_id(), Some("node-1"));
}

#[tokio::test]
async fn test_status_codes_map_to_categories() {
    let cases = [
        (401, ErrorCategory::Authentication),
        (403, ErrorCategory::PermissionDenied),
        (404, ErrorCategory::Unavailable),
        (500, ErrorCategory::Unavailable),
    ];

    for (status, expected) in cases {
        let server = MockServer::start().await;
        mount_status(&server, status).await;

        let error = negotiator(&server, Credentials::Anonymous)
            .create_session("agent-1")
            .await
            .unwrap_err();
        assert_eq!(error.category(), expected, "status {}", status);
    }
}

#[tokio::test]
async fn test_unavailable_error_mentions_status_and_plugin() {
    let server = MockServer::start().await;
    mount_status(&server, 404).await;

    let error = negotiator(&server, Credentials::Anonymous)
        .create_session("agent-1")
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        TerminalError::FeatureUnavailable { status: 404, .. }
    ));
    let message = error.to_string();
    assert!(message.contains("404"));
    assert!(message.contains("plugin"));
}

#[tokio::test]
async fn test_basic_credentials_are_attached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc123"})))
        .expect(1)
        .mount(&server)
        .await;

    let credentials = Credentials::Basic {
        username: "alice".to_string(),
        token: "secret".to_string(),
    };
    negotiator(&server, credentials)
        .create_session("agent-1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bearer_credentials_are_attached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .and(header("authorization", "Bearer tkn"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc123"})))
        .expect(1)
        .mount(&server)
        .await;

    negotiator(&server, Credentials::Bearer("tkn".to_string()))
        .create_session("agent-1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_captured_cookies_reach_the_connector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "abc123", "routeId": "node-3"}))
                .insert_header("set-cookie", "JSESSIONID=xyz; Path=/"),
        )
        .mount(&server)
        .await;

    let negotiator = negotiator(&server, Credentials::Anonymous);
    let descriptor = negotiator.create_session("agent-1").await.unwrap();

    let connector = TransportConnector::new(negotiator.base_url().clone(), Duration::from_secs(10));
    assert_eq!(
        connector.cookie_header(&descriptor).as_deref(),
        Some("JSESSIONID=xyz; TERMINAL_ROUTE=node-3")
    );
}

#[tokio::test]
async fn test_cookie_without_path_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "abc123"}))
                .insert_header("set-cookie", "ROUTEID=xyz"),
        )
        .mount(&server)
        .await;

    let negotiator = negotiator(&server, Credentials::Anonymous);
    let descriptor = negotiator.create_session("agent-1").await.unwrap();
    assert_eq!(
        descriptor.cookies(),
        &[("ROUTEID".to_string(), "xyz".to_string())]
    );

    let connector = TransportConnector::new(negotiator.base_url().clone(), Duration::from_secs(10));
    assert_eq!(
        connector.cookie_header(&descriptor).as_deref(),
        Some("ROUTEID=xyz")
    );
}

#[tokio::test]
async fn test_cookies_are_scoped_to_one_negotiation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "first"}))
                .insert_header("set-cookie", "JSESSIONID=one; Path=/"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "second"})))
        .mount(&server)
        .await;

    let negotiator = negotiator(&server, Credentials::Anonymous);
    let first = negotiator.create_session("agent-1").await.unwrap();
    let second = negotiator.create_session("agent-1").await.unwrap();

    assert_eq!(first.cookies().len(), 1);
    assert!(second.cookies().is_empty());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(
        !requests[1]
            .headers
            .keys()
            .any(|name| name.as_str().eq_ignore_ascii_case("cookie"))
    );
}

#[tokio::test]
async fn test_malformed_body_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let error = negotiator(&server, Credentials::Anonymous)
        .create_session("agent-1")
        .await
        .unwrap_err();
    assert!(matches!(error, TerminalError::Protocol(_)));
}
